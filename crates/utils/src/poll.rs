//! Bounded polling.
//!
//! Every wait on hardware state (reset completion, queue reset, config
//! generation) goes through [`poll_until`] so no loop can spin forever on a
//! device that stopped responding.

/// The poll bound was reached before the probe succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exhausted {
    /// Number of probe calls made.
    pub attempts: u32,
}

/// Call `probe` until it yields a value, at most `limit` times.
///
/// A `limit` of zero still probes once. A spin-loop hint is issued between
/// attempts.
pub fn poll_until<T, F>(limit: u32, mut probe: F) -> Result<T, Exhausted>
where
    F: FnMut() -> Option<T>,
{
    let limit = limit.max(1);
    for attempt in 1..=limit {
        if let Some(value) = probe() {
            return Ok(value);
        }
        if attempt < limit {
            core::hint::spin_loop();
        }
    }
    Err(Exhausted { attempts: limit })
}
