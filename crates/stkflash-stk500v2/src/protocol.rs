//! STK500v2 protocol constants and types
//!
//! Based on Atmel application note AVR068, restricted to the ISP command set
//! that bootloaders implement.

use std::fmt;

/// First byte of every frame
pub const MESSAGE_START: u8 = 0x1B;
/// Fixed byte between the header and the body
pub const TOKEN: u8 = 0x0E;
/// Start marker, sequence, two length bytes and token
pub const HEADER_LEN: usize = 5;
/// Largest body the protocol allows (PROGRAM_FLASH with a 256 byte page)
pub const MAX_BODY_LEN: usize = 275;

// General commands
/// Ask the programmer to identify itself
pub const CMD_SIGN_ON: u8 = 0x01;
/// Set a programmer parameter
pub const CMD_SET_PARAMETER: u8 = 0x02;
/// Read a programmer parameter
pub const CMD_GET_PARAMETER: u8 = 0x03;
/// Set the address for the next read/program command
pub const CMD_LOAD_ADDRESS: u8 = 0x06;

// ISP commands
/// Enter serial programming mode
pub const CMD_ENTER_PROGMODE_ISP: u8 = 0x10;
/// Leave serial programming mode
pub const CMD_LEAVE_PROGMODE_ISP: u8 = 0x11;
/// Erase the whole chip
pub const CMD_CHIP_ERASE_ISP: u8 = 0x12;
/// Program a block of flash
pub const CMD_PROGRAM_FLASH_ISP: u8 = 0x13;
/// Read a block of flash
pub const CMD_READ_FLASH_ISP: u8 = 0x14;
/// Program a block of EEPROM
pub const CMD_PROGRAM_EEPROM_ISP: u8 = 0x15;
/// Read a block of EEPROM
pub const CMD_READ_EEPROM_ISP: u8 = 0x16;
/// Program one fuse byte
pub const CMD_PROGRAM_FUSE_ISP: u8 = 0x17;
/// Read one fuse byte
pub const CMD_READ_FUSE_ISP: u8 = 0x18;
/// Program the lock byte
pub const CMD_PROGRAM_LOCK_ISP: u8 = 0x19;
/// Read the lock byte
pub const CMD_READ_LOCK_ISP: u8 = 0x1A;
/// Read one signature byte
pub const CMD_READ_SIGNATURE_ISP: u8 = 0x1B;
/// Read the oscillator calibration byte
pub const CMD_READ_OSCCAL_ISP: u8 = 0x1C;

/// First body byte of a frame the peer could not checksum
pub const ANSWER_CKSUM_ERROR: u8 = 0xB0;

// Parameters
/// Hardware version
pub const PARAM_HW_VER: u8 = 0x90;
/// Firmware major version
pub const PARAM_SW_MAJOR: u8 = 0x91;
/// Firmware minor version
pub const PARAM_SW_MINOR: u8 = 0x92;

/// Bit 7 of the mode byte: write the page once the buffer is loaded
pub const MODE_WRITE_PAGE: u8 = 0x80;
/// Bit 0 of the mode byte: page mode
pub const MODE_PAGED: u8 = 0x01;
/// Bit 31 of LOAD_ADDRESS: target needs the extended address byte
pub const LOAD_EXTENDED_ADDRESS: u32 = 1 << 31;

/// Sign-on reply of the Arduino Mega 2560 bootloader
pub const SIGNATURE_AVRISP_2: &str = "AVRISP_2";
/// Sign-on reply of a genuine STK500v2 compatible programmer
pub const SIGNATURE_STK500_2: &str = "STK500_2";

/// Answer status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Command executed
    Ok,
    /// Command timed out
    CmdTimeout,
    /// Target stayed busy too long
    RdyBsyTimeout,
    /// A required parameter was never set
    SetParamMissing,
    /// Command failed
    Failed,
    /// Our frame had a bad checksum
    ChecksumError,
    /// Command not understood
    UnknownCommand,
    /// Parameter out of range
    IllegalParameter,
    /// Anything else
    Other(u8),
}

impl Status {
    /// Decode a status byte
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Self::Ok,
            0x80 => Self::CmdTimeout,
            0x81 => Self::RdyBsyTimeout,
            0x82 => Self::SetParamMissing,
            0xC0 => Self::Failed,
            0xC1 => Self::ChecksumError,
            0xC9 => Self::UnknownCommand,
            0xCA => Self::IllegalParameter,
            other => Self::Other(other),
        }
    }

    /// Status byte value
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Ok => 0x00,
            Self::CmdTimeout => 0x80,
            Self::RdyBsyTimeout => 0x81,
            Self::SetParamMissing => 0x82,
            Self::Failed => 0xC0,
            Self::ChecksumError => 0xC1,
            Self::UnknownCommand => 0xC9,
            Self::IllegalParameter => 0xCA,
            Self::Other(v) => v,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::CmdTimeout => write!(f, "command timeout"),
            Self::RdyBsyTimeout => write!(f, "RDY/BSY timeout"),
            Self::SetParamMissing => write!(f, "parameter missing"),
            Self::Failed => write!(f, "command failed"),
            Self::ChecksumError => write!(f, "checksum error"),
            Self::UnknownCommand => write!(f, "unknown command"),
            Self::IllegalParameter => write!(f, "illegal parameter"),
            Self::Other(v) => write!(f, "status 0x{:02X}", v),
        }
    }
}

/// Human readable command name for log output
pub fn command_name(command: u8) -> &'static str {
    match command {
        CMD_SIGN_ON => "SIGN_ON",
        CMD_SET_PARAMETER => "SET_PARAMETER",
        CMD_GET_PARAMETER => "GET_PARAMETER",
        CMD_LOAD_ADDRESS => "LOAD_ADDRESS",
        CMD_ENTER_PROGMODE_ISP => "ENTER_PROGMODE",
        CMD_LEAVE_PROGMODE_ISP => "LEAVE_PROGMODE",
        CMD_CHIP_ERASE_ISP => "CHIP_ERASE",
        CMD_PROGRAM_FLASH_ISP => "PROGRAM_FLASH",
        CMD_READ_FLASH_ISP => "READ_FLASH",
        CMD_PROGRAM_EEPROM_ISP => "PROGRAM_EEPROM",
        CMD_READ_EEPROM_ISP => "READ_EEPROM",
        CMD_PROGRAM_FUSE_ISP => "PROGRAM_FUSE",
        CMD_READ_FUSE_ISP => "READ_FUSE",
        CMD_PROGRAM_LOCK_ISP => "PROGRAM_LOCK",
        CMD_READ_LOCK_ISP => "READ_LOCK",
        CMD_READ_SIGNATURE_ISP => "READ_SIGNATURE",
        CMD_READ_OSCCAL_ISP => "READ_OSCCAL",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        for byte in [0x00, 0x80, 0x81, 0x82, 0xC0, 0xC1, 0xC9, 0xCA, 0x42] {
            assert_eq!(Status::from_u8(byte).to_u8(), byte);
        }
        assert_eq!(Status::from_u8(0xC0), Status::Failed);
        assert_eq!(Status::from_u8(0x42), Status::Other(0x42));
    }
}
