//! Memory kinds

use core::fmt;
use core::str::FromStr;

/// One addressable memory of an AVR target
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "std", derive(serde::Deserialize))]
pub enum MemoryKind {
    /// Program flash
    Flash,
    /// Data EEPROM
    Eeprom,
    /// Low fuse byte
    LFuse,
    /// High fuse byte
    HFuse,
    /// Extended fuse byte
    EFuse,
    /// Lock bits
    Lock,
    /// Oscillator calibration byte (read-only)
    Calibration,
    /// Device signature bytes (read-only)
    Signature,
}

impl MemoryKind {
    /// Every kind, in display order
    pub const ALL: [MemoryKind; 8] = [
        Self::Flash,
        Self::Eeprom,
        Self::LFuse,
        Self::HFuse,
        Self::EFuse,
        Self::Lock,
        Self::Calibration,
        Self::Signature,
    ];

    /// Short lowercase name, as used on the command line
    pub const fn name(self) -> &'static str {
        match self {
            Self::Flash => "flash",
            Self::Eeprom => "eeprom",
            Self::LFuse => "lfuse",
            Self::HFuse => "hfuse",
            Self::EFuse => "efuse",
            Self::Lock => "lock",
            Self::Calibration => "calibration",
            Self::Signature => "signature",
        }
    }

    /// Look a kind up by its short name (case-insensitive)
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.name().eq_ignore_ascii_case(name))
    }

    /// Configuration bytes written one at a time (fuses and lock)
    pub const fn is_config_byte(self) -> bool {
        matches!(self, Self::LFuse | Self::HFuse | Self::EFuse | Self::Lock)
    }

    /// Memories the target never lets us write
    pub const fn is_read_only(self) -> bool {
        matches!(self, Self::Calibration | Self::Signature)
    }
}

/// Name that is not a [`MemoryKind`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownMemoryKind;

impl fmt::Display for UnknownMemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("unknown memory (expected flash, eeprom, lfuse, hfuse, efuse, lock, calibration or signature)")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for UnknownMemoryKind {}

impl FromStr for MemoryKind {
    type Err = UnknownMemoryKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or(UnknownMemoryKind)
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for kind in MemoryKind::ALL {
            assert_eq!(kind.name().parse::<MemoryKind>(), Ok(kind));
        }
        assert_eq!("EEPROM".parse::<MemoryKind>(), Ok(MemoryKind::Eeprom));
        assert_eq!("fuse".parse::<MemoryKind>(), Err(UnknownMemoryKind));
    }
}
