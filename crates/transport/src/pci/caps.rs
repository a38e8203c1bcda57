//! Register Region Mapper.
//!
//! Walks the PCI capability list, classifies each virtio vendor capability
//! once into a [`CfgType`], validates the four mappable roles and maps them
//! into [`MappedRegion`]s owned by a [`RegionSet`].

use alloc::vec::Vec;

use super::PciPlatform;
use crate::TransportError;
use crate::mmio::RegisterIo;
use crate::regs::{PCI_CAP_LEN, PCI_NOTIFY_CAP_LEN, RawPciCap, cap, common_cfg, pci};

/// `cfg_type` of a virtio vendor capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfgType {
    Common,
    Notify,
    Isr,
    Device,
    PciAccess,
    SharedMemory,
    Vendor,
    Unknown(u8),
}

impl From<u8> for CfgType {
    fn from(value: u8) -> Self {
        match value {
            cap::COMMON_CFG => CfgType::Common,
            cap::NOTIFY_CFG => CfgType::Notify,
            cap::ISR_CFG => CfgType::Isr,
            cap::DEVICE_CFG => CfgType::Device,
            cap::PCI_CFG => CfgType::PciAccess,
            cap::SHARED_MEMORY_CFG => CfgType::SharedMemory,
            cap::VENDOR_CFG => CfgType::Vendor,
            other => CfgType::Unknown(other),
        }
    }
}

/// Logical role of a mapped region. One active region per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionRole {
    Common,
    Notify,
    Isr,
    Device,
}

impl RegionRole {
    /// Roles this transport maps; every other `cfg_type` is skipped.
    pub fn from_cfg_type(cfg_type: CfgType) -> Option<Self> {
        match cfg_type {
            CfgType::Common => Some(RegionRole::Common),
            CfgType::Notify => Some(RegionRole::Notify),
            CfgType::Isr => Some(RegionRole::Isr),
            CfgType::Device => Some(RegionRole::Device),
            _ => None,
        }
    }

    /// Smallest `length` a capability for this role may declare.
    pub const fn min_length(self) -> u32 {
        match self {
            RegionRole::Common => common_cfg::SIZE as u32,
            RegionRole::Notify => 2,
            RegionRole::Isr => 4,
            RegionRole::Device => 1,
        }
    }

    /// Smallest `cap_len` for this role's capability structure.
    pub const fn min_cap_len(self) -> u8 {
        match self {
            RegionRole::Notify => PCI_NOTIFY_CAP_LEN,
            _ => PCI_CAP_LEN,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            RegionRole::Common => "common",
            RegionRole::Notify => "notify",
            RegionRole::Isr => "isr",
            RegionRole::Device => "device",
        }
    }
}

/// One virtio vendor capability as read from config space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtioCapability {
    /// Config-space offset of the capability.
    pub position: u16,
    pub cap_len: u8,
    pub cfg_type: CfgType,
    pub bar: u8,
    pub offset: u32,
    pub length: u32,
    /// Present for notify capabilities that are long enough to carry it.
    pub notify_off_multiplier: Option<u32>,
}

/// A capability region mapped into addressable memory.
pub struct MappedRegion<W: RegisterIo> {
    pub role: RegionRole,
    pub bar: u8,
    pub offset: u32,
    pub length: u32,
    pub window: W,
}

/// Every mapped region of one device, in acquisition order.
///
/// Only [`map_regions`] builds a set, and only returns one holding a common
/// region. Dropping the set releases regions in reverse acquisition order.
pub struct RegionSet<W: RegisterIo> {
    regions: Vec<MappedRegion<W>>,
    notify_off_multiplier: u32,
    common: usize,
}

impl<W: RegisterIo> RegionSet<W> {
    fn new() -> Self {
        Self {
            regions: Vec::new(),
            notify_off_multiplier: 0,
            common: 0,
        }
    }

    /// The common configuration window.
    pub fn common(&self) -> &W {
        &self.regions[self.common].window
    }

    pub fn get(&self, role: RegionRole) -> Option<&MappedRegion<W>> {
        self.regions.iter().find(|r| r.role == role)
    }

    pub fn window(&self, role: RegionRole) -> Option<&W> {
        self.get(role).map(|r| &r.window)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn notify_off_multiplier(&self) -> u32 {
        self.notify_off_multiplier
    }

    /// Roles in acquisition order.
    pub fn roles(&self) -> impl Iterator<Item = RegionRole> + '_ {
        self.regions.iter().map(|r| r.role)
    }

    /// Take out the region holding `role`, if any.
    fn release(&mut self, role: RegionRole) -> Option<MappedRegion<W>> {
        let pos = self.regions.iter().position(|r| r.role == role)?;
        Some(self.regions.remove(pos))
    }

    fn install(&mut self, region: MappedRegion<W>, notify_off_multiplier: Option<u32>) {
        if let Some(multiplier) = notify_off_multiplier {
            self.notify_off_multiplier = multiplier;
        }
        self.regions.push(region);
    }
}

impl<W: RegisterIo> Drop for RegionSet<W> {
    fn drop(&mut self) {
        while let Some(region) = self.regions.pop() {
            log::trace!(
                "[VIRTIO-PCI] Unmapping {} region (bar {})",
                region.role.name(),
                region.bar
            );
        }
    }
}

fn config_dword<P: PciPlatform>(platform: &P, offset: u16) -> Result<u32, TransportError> {
    platform.read_config_dword(offset & !3).ok_or_else(|| {
        log::error!("[VIRTIO-PCI] Config space read at {:#x} failed", offset);
        TransportError::IoError
    })
}

fn config_byte<P: PciPlatform>(platform: &P, offset: u16) -> Result<u8, TransportError> {
    let dword = config_dword(platform, offset)?;
    Ok((dword >> ((offset & 3) * 8)) as u8)
}

/// Read the capability structure at `position`.
pub fn read_capability<P: PciPlatform>(
    platform: &P,
    position: u16,
) -> Result<VirtioCapability, TransportError> {
    let mut raw = [0u8; PCI_CAP_LEN as usize];
    for (i, chunk) in raw.chunks_exact_mut(4).enumerate() {
        let dword = config_dword(platform, position + (i as u16) * 4)?;
        chunk.copy_from_slice(&dword.to_le_bytes());
    }
    let raw: RawPciCap = bytemuck::pod_read_unaligned(&raw);
    let cfg_type = CfgType::from(raw.cfg_type);

    let notify_off_multiplier = if cfg_type == CfgType::Notify && raw.cap_len >= PCI_NOTIFY_CAP_LEN
    {
        Some(config_dword(platform, position + cap::NOTIFY_OFF_MULTIPLIER)?)
    } else {
        None
    };

    Ok(VirtioCapability {
        position,
        cap_len: raw.cap_len,
        cfg_type,
        bar: raw.bar,
        offset: u32::from_le(raw.offset),
        length: u32::from_le(raw.length),
        notify_off_multiplier,
    })
}

/// Collect the virtio vendor capabilities that describe a mappable region.
///
/// Other vendor capabilities are identified from their header alone and
/// skipped whatever their length.
pub fn walk_capabilities<P: PciPlatform>(
    platform: &P,
) -> Result<Vec<VirtioCapability>, TransportError> {
    let status = (config_dword(platform, pci::COMMAND_STATUS_OFFSET)? >> 16) as u16;
    if status & pci::STATUS_CAP_LIST == 0 {
        log::error!("[VIRTIO-PCI] Device has no capability list");
        return Err(TransportError::ConfigurationError);
    }

    let mut caps = Vec::new();
    let mut position = u16::from(config_byte(platform, pci::CAPABILITY_LIST)? & !3);
    let mut visited = 0;

    while position != 0 {
        if visited == pci::MAX_CAPABILITIES {
            log::error!("[VIRTIO-PCI] Capability list does not terminate");
            return Err(TransportError::ConfigurationError);
        }
        visited += 1;

        let header = config_dword(platform, position + cap::VNDR)?;
        let id = header as u8;
        let next = u16::from((header >> 8) as u8 & !3);

        if id == pci::CAP_ID_VNDR {
            let cap_len = (header >> 16) as u8;
            let cfg_type = CfgType::from((header >> 24) as u8);
            if RegionRole::from_cfg_type(cfg_type).is_some() {
                caps.push(read_capability(platform, position)?);
            } else {
                // Vendor data and friends may be shorter than a full header.
                log::debug!(
                    "[VIRTIO-PCI] Skipping capability type {:?} at {:#x} (cap_len {})",
                    cfg_type,
                    position,
                    cap_len
                );
            }
        }
        position = next;
    }

    Ok(caps)
}

/// Check a capability against its role's minimums and the BAR size.
pub fn validate(
    capability: &VirtioCapability,
    role: RegionRole,
    bar_len: u64,
) -> Result<(), TransportError> {
    if capability.cap_len < role.min_cap_len() {
        log::error!(
            "[VIRTIO-PCI] {} capability at {:#x}: cap_len {} below {}",
            role.name(),
            capability.position,
            capability.cap_len,
            role.min_cap_len()
        );
        return Err(TransportError::ConfigurationError);
    }
    if capability.bar >= pci::STD_NUM_BARS {
        log::error!(
            "[VIRTIO-PCI] Invalid BAR index {} for {} capability",
            capability.bar,
            role.name()
        );
        return Err(TransportError::ConfigurationError);
    }
    if capability.length < role.min_length() {
        log::error!(
            "[VIRTIO-PCI] {} capability length {} too small (need {})",
            role.name(),
            capability.length,
            role.min_length()
        );
        return Err(TransportError::ConfigurationError);
    }
    let end = u64::from(capability.offset) + u64::from(capability.length);
    if end > bar_len {
        log::error!(
            "[VIRTIO-PCI] {} region {:#x}+{:#x} exceeds BAR {} size {:#x}",
            role.name(),
            capability.offset,
            capability.length,
            capability.bar,
            bar_len
        );
        return Err(TransportError::ConfigurationError);
    }
    Ok(())
}

/// Read the role's probe register and report whether it reads all-ones.
fn reads_sentinel<W: RegisterIo>(role: RegionRole, window: &W) -> bool {
    match role {
        RegionRole::Common => window.read8(common_cfg::DEVICE_STATUS) == u8::MAX,
        RegionRole::Notify => window.read16(0) == u16::MAX,
        RegionRole::Isr => window.read32(0) == u32::MAX,
        RegionRole::Device => match window.len() {
            4.. => window.read32(0) == u32::MAX,
            2..=3 => window.read16(0) == u16::MAX,
            _ => window.read8(0) == u8::MAX,
        },
    }
}

fn map_one<P: PciPlatform>(
    platform: &mut P,
    capability: &VirtioCapability,
    role: RegionRole,
) -> Result<MappedRegion<P::Window>, TransportError> {
    validate(capability, role, platform.bar_len(capability.bar))?;

    let Some(window) = platform.map_bar(
        capability.bar,
        u64::from(capability.offset),
        capability.length as usize,
    ) else {
        log::error!(
            "[VIRTIO-PCI] Failed to map BAR {} for {} region",
            capability.bar,
            role.name()
        );
        return Err(TransportError::ResourceExhaustion);
    };

    if reads_sentinel(role, &window) {
        log::error!(
            "[VIRTIO-PCI] {} region at BAR {} offset {:#x} reads all-ones",
            role.name(),
            capability.bar,
            capability.offset
        );
        // Unmapped by dropping the window.
        return Err(TransportError::IoError);
    }

    log::trace!(
        "[VIRTIO-PCI] Mapped {} region: BAR {} offset {:#x} length {:#x}",
        role.name(),
        capability.bar,
        capability.offset,
        capability.length
    );
    Ok(MappedRegion {
        role,
        bar: capability.bar,
        offset: capability.offset,
        length: capability.length,
        window,
    })
}

/// Map every known-role capability. The common region is mandatory.
///
/// On failure every region mapped so far is released in reverse order.
pub fn map_regions<P: PciPlatform>(
    platform: &mut P,
    caps: &[VirtioCapability],
) -> Result<RegionSet<P::Window>, TransportError> {
    let mut regions = RegionSet::new();

    for capability in caps {
        let Some(role) = RegionRole::from_cfg_type(capability.cfg_type) else {
            log::debug!(
                "[VIRTIO-PCI] Skipping capability type {:?} at {:#x}",
                capability.cfg_type,
                capability.position
            );
            continue;
        };
        if let Some(previous) = regions.release(role) {
            log::warn!(
                "[VIRTIO-PCI] Replacing existing {} region (bar {}, offset {:#x})",
                role.name(),
                previous.bar,
                previous.offset
            );
            drop(previous);
        }
        let region = map_one(platform, capability, role)?;
        regions.install(region, capability.notify_off_multiplier);
    }

    let Some(common) = regions.regions.iter().position(|r| r.role == RegionRole::Common) else {
        log::error!("[VIRTIO-PCI] Common config capability not found");
        return Err(TransportError::ConfigurationError);
    };
    regions.common = common;
    Ok(regions)
}
