//! Error handling infrastructure for the virtio-pci transport.
//!
//! Provides the `define_transport_error!` macro so every error enum in the
//! workspace carries a subsystem code, a per-variant code, a static
//! description and a stable `Display` format.
//!
//! ## Usage
//!
//! ### Simple errors (no inner data)
//! ```ignore
//! define_transport_error! {
//!     pub enum RingError(0x0C) {
//!         QueueFull = 0x01 => "No free descriptors",
//!         NotReady = 0x02 => "Queue not enabled",
//!     }
//! }
//! ```
//!
//! ### Nested errors (with inner error type)
//! ```ignore
//! define_transport_error! {
//!     pub enum AttachError(0x0D) {
//!         Ring(RingError) = 0x01 => "Virtqueue setup failed",
//!     }
//! }
//! ```
//!
//! ### Recoverable variants
//! Variants listed after `recoverable:` are reported by `is_recoverable()`.
//! Callers retry or back off on those; everything else aborts the operation.
//! ```ignore
//! define_transport_error! {
//!     pub enum RingError(0x0C) {
//!         QueueFull = 0x01 => "No free descriptors",
//!         NotReady = 0x02 => "Queue not enabled",
//!     }
//!     recoverable: [QueueFull]
//! }
//! ```

#![no_std]

/// Macro to define a transport error type with consistent handling.
///
/// Supports both simple variants and nested variants containing inner errors.
#[macro_export]
macro_rules! define_transport_error {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident($subsystem:literal) {
            $(
                $(#[$variant_meta:meta])*
                $variant:ident $(($inner:ty))? = $code:literal => $desc:literal
            ),* $(,)?
        }
        $(recoverable: [$($recoverable:ident),* $(,)?])?
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis enum $name {
            $(
                $(#[$variant_meta])*
                $variant $(($inner))?,
            )*
        }

        impl $name {
            /// Subsystem identifier for this error type.
            pub const SUBSYSTEM: u8 = $subsystem;

            /// Numeric error code: subsystem in the high byte, variant in the low byte.
            pub const fn code(&self) -> u16 {
                match self {
                    $(
                        $crate::define_transport_error!(@pattern $variant $(($inner))? _unused) => {
                            (($subsystem as u16) << 8) | $code
                        }
                    )*
                }
            }

            /// Static description for logging.
            pub const fn name(&self) -> &'static str {
                match self {
                    $(
                        $crate::define_transport_error!(@pattern $variant $(($inner))? _unused) => {
                            $desc
                        }
                    )*
                }
            }

            /// True when the caller is expected to retry instead of aborting.
            #[allow(unreachable_patterns)]
            pub const fn is_recoverable(&self) -> bool {
                match self {
                    $($(Self::$recoverable => true,)*)?
                    _ => false,
                }
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                match self {
                    $(
                        $crate::define_transport_error!(@pattern $variant $(($inner))? inner) => {
                            $crate::define_transport_error!(@display_body self f $desc $(($inner))? inner)
                        }
                    )*
                }
            }
        }

        impl core::error::Error for $name {}
    };

    // Helper to generate patterns
    (@pattern $variant:ident ($inner:ty) $bind:ident) => { Self::$variant($bind) };
    (@pattern $variant:ident $bind:ident) => { Self::$variant };

    // Helper to generate display bodies
    (@display_body $self:ident $f:ident $desc:literal ($inner:ty) $bind:ident) => {
        write!($f, "E{:04X}: {} ({})", $self.code(), $desc, $bind)
    };
    (@display_body $self:ident $f:ident $desc:literal $bind:ident) => {
        write!($f, "E{:04X}: {}", $self.code(), $desc)
    };
}
