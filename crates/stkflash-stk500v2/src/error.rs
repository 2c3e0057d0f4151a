//! Error types for STK500v2 operations

use stkflash_core::memory::MemoryKind;
use thiserror::Error;

use crate::protocol::Status;

/// Broad category of an error, used to decide whether to retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Lost or garbled bytes on the wire; retrying the exchange may help
    Transport,
    /// The bootloader answered, but not with what we asked for
    Protocol,
    /// The session lost contact with the bootloader and must sync again
    SyncLoss,
    /// Bad input data (firmware image, addresses)
    Data,
    /// The device does not hold what we wrote
    Verification,
    /// Bad part description or request
    Configuration,
    /// Operating system level failure
    Io,
}

/// STK500v2-specific errors
#[derive(Debug, Error)]
pub enum Stk500Error {
    /// No complete frame arrived in time
    #[error("Timed out waiting for the bootloader")]
    Timeout,

    /// A frame arrived but its checksum did not resolve to zero
    #[error("Frame checksum mismatch")]
    ChecksumMismatch,

    /// The bootloader could not checksum our request
    #[error("Bootloader reported a checksum error in our request")]
    PeerChecksumError,

    /// Frame body larger than the caller accepts
    #[error("Frame body of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    /// Answer does not belong to the command or is malformed
    #[error("Unexpected answer to command 0x{command:02X}")]
    UnexpectedResponse { command: u8 },

    /// Bootloader answered with a non-OK status
    #[error("Command 0x{command:02X} failed: {status}")]
    Status { command: u8, status: Status },

    /// Sign-on retries exhausted
    #[error("Device not responding")]
    NotResponding,

    /// Sign-on answered with an unknown programmer id
    #[error("Unsupported bootloader: {0}")]
    UnsupportedBootloader(String),

    /// Programming mode could not be entered
    #[error("Failed to enter programming mode after {0} attempts")]
    ProgramModeFailed(u32),

    /// Too many consecutive low-level failures
    #[error("Giving up after {failures} consecutive failures (last: {last})")]
    RetryBudgetExhausted { failures: u32, last: String },

    /// An earlier failure aborted the session
    #[error("Session aborted, sync again before issuing commands")]
    Aborted,

    /// Read back data differs from what was written
    #[error(
        "Verification failed for {kind} at 0x{addr:06X}: expected 0x{expected:02X}, read 0x{found:02X}"
    )]
    VerifyFailed {
        kind: MemoryKind,
        addr: u32,
        expected: u8,
        found: u8,
    },

    /// The target is not the part we were told it is
    #[error("Signature mismatch: expected {expected:02X?}, read {found:02X?}")]
    SignatureMismatch { expected: [u8; 3], found: [u8; 3] },

    /// Write attempted on a read-only memory
    #[error("{0} memory is read-only")]
    ReadOnly(MemoryKind),

    /// Operation does not apply to this memory
    #[error("{op} is not supported for {kind} memory")]
    Unsupported { kind: MemoryKind, op: &'static str },

    /// Core library error (templates, regions, firmware images)
    #[error(transparent)]
    Core(#[from] stkflash_core::Error),

    /// Failed to connect to device
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// I/O error during communication
    #[error("I/O error: {0}")]
    IoError(String),

    /// Serial port error
    #[cfg(feature = "serial")]
    #[error("Serial port error: {0}")]
    SerialError(#[from] serialport::Error),
}

impl Stk500Error {
    /// Category of this error
    pub fn class(&self) -> ErrorClass {
        use stkflash_core::Error as CoreError;

        match self {
            Self::Timeout
            | Self::ChecksumMismatch
            | Self::PeerChecksumError
            | Self::FrameTooLarge { .. } => ErrorClass::Transport,
            Self::UnexpectedResponse { .. } | Self::Status { .. } => ErrorClass::Protocol,
            Self::NotResponding
            | Self::ProgramModeFailed(_)
            | Self::RetryBudgetExhausted { .. }
            | Self::Aborted => ErrorClass::SyncLoss,
            Self::VerifyFailed { .. } | Self::SignatureMismatch { .. } => {
                ErrorClass::Verification
            }
            Self::Core(CoreError::Hex(_)) | Self::Core(CoreError::AddressOutOfBounds { .. }) => {
                ErrorClass::Data
            }
            Self::Core(_)
            | Self::UnsupportedBootloader(_)
            | Self::ReadOnly(_)
            | Self::Unsupported { .. }
            | Self::InvalidParameter(_) => ErrorClass::Configuration,
            Self::ConnectionFailed(_) | Self::IoError(_) => ErrorClass::Io,
            #[cfg(feature = "serial")]
            Self::SerialError(_) => ErrorClass::Io,
        }
    }

    /// Whether repeating the same exchange may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transport | ErrorClass::Protocol)
    }
}

/// Result type for STK500v2 operations
pub type Result<T> = std::result::Result<T, Stk500Error>;

impl From<std::io::Error> for Stk500Error {
    fn from(e: std::io::Error) -> Self {
        Stk500Error::IoError(e.to_string())
    }
}

impl From<stkflash_core::error::HexError> for Stk500Error {
    fn from(e: stkflash_core::error::HexError) -> Self {
        Stk500Error::Core(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classes() {
        assert_eq!(Stk500Error::Timeout.class(), ErrorClass::Transport);
        assert!(Stk500Error::ChecksumMismatch.is_retryable());
        assert_eq!(
            Stk500Error::Status {
                command: 0x13,
                status: Status::Failed
            }
            .class(),
            ErrorClass::Protocol
        );
        assert_eq!(Stk500Error::NotResponding.class(), ErrorClass::SyncLoss);
        assert!(!Stk500Error::NotResponding.is_retryable());
        assert_eq!(
            Stk500Error::Core(stkflash_core::Error::NoSuchRegion(MemoryKind::Eeprom)).class(),
            ErrorClass::Configuration
        );
    }
}
