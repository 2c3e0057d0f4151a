//! AVR part descriptions
//!
//! A [`PartDescription`] carries everything the programmer needs to know about
//! a chip: its signature, the ISP timing handed to the bootloader, the
//! part-wide instructions and one [`RegionDescriptor`] per memory.

pub mod builtin;

#[cfg(feature = "std")]
mod database;

#[cfg(feature = "std")]
pub use database::*;

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::isp::InstructionTemplate;
use crate::memory::{MemoryKind, MemoryRegion, RegionDescriptor};

/// ISP timing handed to the bootloader when entering programming mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(serde::Deserialize), serde(default))]
pub struct IspTiming {
    /// Command timeout in ms
    pub timeout: u8,
    /// Delay after driving reset, in ms
    pub stab_delay: u8,
    /// Command execution delay, in ms
    pub cmd_exe_delay: u8,
    /// Number of synchronisation attempts
    pub synch_loops: u8,
    /// Delay between ISP bytes, in ms
    pub byte_delay: u8,
    /// Byte echoed back when the target accepts programming enable
    pub poll_value: u8,
    /// Position of `poll_value` in the echo (1-based)
    pub poll_index: u8,
    /// How long a chip erase takes, in µs
    pub chip_erase_delay_us: u32,
}

impl Default for IspTiming {
    fn default() -> Self {
        Self {
            timeout: 200,
            stab_delay: 100,
            cmd_exe_delay: 25,
            synch_loops: 32,
            byte_delay: 0,
            poll_value: 0x53,
            poll_index: 3,
            chip_erase_delay_us: 9000,
        }
    }
}

/// Complete description of one AVR part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartDescription {
    /// Human readable name, e.g. "ATmega2560"
    pub name: String,
    /// Short identifier, e.g. "m2560"
    pub id: String,
    /// Expected device signature
    pub signature: [u8; 3],
    /// Programming mode timing
    pub timing: IspTiming,
    /// Serial programming enable instruction
    pub pgm_enable: InstructionTemplate,
    /// Chip erase instruction
    pub chip_erase: InstructionTemplate,
    /// Memories of this part
    pub regions: Vec<RegionDescriptor>,
}

impl PartDescription {
    /// Descriptor of memory `kind`
    pub fn region(&self, kind: MemoryKind) -> Option<&RegionDescriptor> {
        self.regions.iter().find(|r| r.kind == kind)
    }

    /// Descriptor of memory `kind`, or [`Error::NoSuchRegion`]
    pub fn require_region(&self, kind: MemoryKind) -> Result<&RegionDescriptor> {
        self.region(kind).ok_or(Error::NoSuchRegion(kind))
    }

    /// Whether `name` matches the name or id (case-insensitive)
    pub fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name) || self.id.eq_ignore_ascii_case(name)
    }

    /// Check every region's geometry and that no kind appears twice
    pub fn validate(&self) -> Result<()> {
        for (i, region) in self.regions.iter().enumerate() {
            region.validate()?;
            if self.regions[..i].iter().any(|r| r.kind == region.kind) {
                return Err(Error::InvalidRegion(region.kind));
            }
        }
        Ok(())
    }

    /// Fresh, unallocated memory regions for a session
    pub fn memory_regions(&self) -> Vec<MemoryRegion> {
        self.regions.iter().cloned().map(MemoryRegion::new).collect()
    }
}
