//! Named instruction slots

use core::fmt;

/// Low-level operation an instruction template implements
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "std", derive(serde::Deserialize))]
pub enum Operation {
    /// Read one byte (unpaged memories, EEPROM)
    Read,
    /// Write one byte (unpaged memories, EEPROM)
    Write,
    /// Read low byte of a flash word
    ReadLo,
    /// Read high byte of a flash word
    ReadHi,
    /// Write low byte of a flash word
    WriteLo,
    /// Write high byte of a flash word
    WriteHi,
    /// Load low byte into the page buffer
    LoadPageLo,
    /// Load high byte into the page buffer
    LoadPageHi,
    /// Commit the page buffer
    WritePage,
    /// Load the extended (above 64K words) address byte
    LoadExtAddr,
    /// Enter serial programming mode
    ProgramEnable,
    /// Erase flash and EEPROM
    ChipErase,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::ReadLo => "read_lo",
            Self::ReadHi => "read_hi",
            Self::WriteLo => "write_lo",
            Self::WriteHi => "write_hi",
            Self::LoadPageLo => "loadpage_lo",
            Self::LoadPageHi => "loadpage_hi",
            Self::WritePage => "writepage",
            Self::LoadExtAddr => "load_ext_addr",
            Self::ProgramEnable => "pgm_enable",
            Self::ChipErase => "chip_erase",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeMap;
    use alloc::string::ToString;
    use alloc::vec::Vec;

    #[test]
    fn test_operations_key_a_map() {
        let mut ops = BTreeMap::new();
        ops.insert(Operation::WritePage, 3);
        ops.insert(Operation::Read, 1);
        ops.insert(Operation::LoadPageLo, 2);
        ops.insert(Operation::Read, 4);
        assert_eq!(
            ops.into_iter().collect::<Vec<_>>(),
            [
                (Operation::Read, 4),
                (Operation::LoadPageLo, 2),
                (Operation::WritePage, 3)
            ]
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Operation::ReadLo.to_string(), "read_lo");
        assert_eq!(Operation::LoadPageHi.to_string(), "loadpage_hi");
        assert_eq!(Operation::ProgramEnable.to_string(), "pgm_enable");
    }
}
