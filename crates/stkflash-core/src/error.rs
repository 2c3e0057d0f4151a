//! Error types for stkflash-core
//!
//! This module provides a no_std compatible error type that can be used
//! throughout the crate.

use core::fmt;

use crate::isp::Operation;
use crate::memory::MemoryKind;

/// Why an instruction template was refused at construction time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateError {
    /// Template did not describe exactly 32 bits
    WrongLength {
        /// Number of bit roles supplied
        found: usize,
    },
    /// A token in the textual notation was not understood
    UnknownToken {
        /// Zero-based token position (0 = MSB of instruction byte 0)
        position: usize,
    },
    /// Address bit index above 31, or data bit index above 7
    IndexOutOfRange {
        /// Zero-based token position
        position: usize,
        /// The offending index
        index: u8,
    },
}

/// What was wrong with a firmware image line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HexErrorKind {
    /// Line does not start with ':'
    MissingMarker,
    /// Line is shorter than its byte count requires
    Truncated,
    /// Line carries characters after the checksum
    TrailingData,
    /// A field contains something other than two hex digits per byte
    InvalidDigit,
    /// Sum of all record bytes is not zero modulo 256
    ChecksumMismatch {
        /// Checksum carried by the record
        found: u8,
        /// Checksum that would have made the record valid
        expected: u8,
    },
    /// Record type this tool does not understand
    UnsupportedRecordType(u8),
    /// Address record with a payload of the wrong size
    BadAddressRecord,
    /// Data lands outside the target memory
    AddressOutOfRange {
        /// First absolute address that does not fit
        address: u32,
    },
    /// Input ended without an end-of-file record
    MissingEndOfFile,
}

/// A rejected firmware image: where and why
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HexError {
    /// 1-based line number of the offending line
    pub line: usize,
    /// What went wrong
    pub kind: HexErrorKind,
}

/// Core error type - no_std compatible, Copy for efficiency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Instruction template failed validation
    InvalidTemplate(TemplateError),
    /// Memory region has no template for the requested operation
    MissingOperation {
        /// Region that lacks the operation
        kind: MemoryKind,
        /// The missing operation
        op: Operation,
    },
    /// Part description has no region of this kind
    NoSuchRegion(MemoryKind),
    /// Address is beyond the region size
    AddressOutOfBounds {
        /// Region that was addressed
        kind: MemoryKind,
        /// Offending address
        addr: u32,
    },
    /// Region buffers have not been allocated (session not started)
    RegionNotInitialized(MemoryKind),
    /// Region descriptor is inconsistent (e.g. size not a multiple of page size)
    InvalidRegion(MemoryKind),
    /// Firmware image was rejected
    Hex(HexError),
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongLength { found } => {
                write!(f, "instruction template has {} bit roles, expected 32", found)
            }
            Self::UnknownToken { position } => {
                write!(f, "unknown bit role at position {}", position)
            }
            Self::IndexOutOfRange { position, index } => {
                write!(f, "bit index {} out of range at position {}", index, position)
            }
        }
    }
}

impl fmt::Display for HexErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingMarker => write!(f, "missing ':' record marker"),
            Self::Truncated => write!(f, "record is truncated"),
            Self::TrailingData => write!(f, "unexpected characters after checksum"),
            Self::InvalidDigit => write!(f, "invalid hex digit"),
            Self::ChecksumMismatch { found, expected } => write!(
                f,
                "checksum mismatch: record has 0x{:02X}, computed 0x{:02X}",
                found, expected
            ),
            Self::UnsupportedRecordType(t) => write!(f, "unsupported record type 0x{:02X}", t),
            Self::BadAddressRecord => write!(f, "malformed address record"),
            Self::AddressOutOfRange { address } => {
                write!(f, "address 0x{:06X} is outside the target memory", address)
            }
            Self::MissingEndOfFile => write!(f, "no end-of-file record"),
        }
    }
}

impl fmt::Display for HexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.kind)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTemplate(e) => write!(f, "{}", e),
            Self::MissingOperation { kind, op } => {
                write!(f, "{} memory has no {} instruction", kind, op)
            }
            Self::NoSuchRegion(kind) => write!(f, "part has no {} memory", kind),
            Self::AddressOutOfBounds { kind, addr } => {
                write!(f, "address 0x{:06X} out of bounds for {} memory", addr, kind)
            }
            Self::RegionNotInitialized(kind) => {
                write!(f, "{} memory buffers are not allocated", kind)
            }
            Self::InvalidRegion(kind) => write!(f, "{} memory description is inconsistent", kind),
            Self::Hex(e) => write!(f, "{}", e),
        }
    }
}

impl From<TemplateError> for Error {
    fn from(e: TemplateError) -> Self {
        Error::InvalidTemplate(e)
    }
}

impl From<HexError> for Error {
    fn from(e: HexError) -> Self {
        Error::Hex(e)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for TemplateError {}

#[cfg(feature = "std")]
impl std::error::Error for HexError {}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Result type alias using the core Error type
pub type Result<T> = core::result::Result<T, Error>;
