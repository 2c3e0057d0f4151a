//! Error types for the GPIO reset line

use stkflash_stk500v2::Stk500Error;
use thiserror::Error;

/// Linux GPIO reset line errors
#[derive(Debug, Error)]
pub enum GpioResetError {
    /// Failed to request the GPIO line
    #[error("Failed to request GPIO line {line} on '{path}': {source}")]
    LineRequestFailed {
        path: String,
        line: u32,
        #[source]
        source: gpiocdev::Error,
    },

    /// Failed to set GPIO line value
    #[error("Failed to set GPIO line value: {0}")]
    SetValueFailed(#[source] gpiocdev::Error),

    /// GPIO chip not specified
    #[error("No GPIO chip specified. Use gpiochip=/dev/gpiochipN or gpiochip=N")]
    NoDevice,
}

impl From<GpioResetError> for Stk500Error {
    fn from(e: GpioResetError) -> Self {
        Stk500Error::IoError(e.to_string())
    }
}

/// Result type for GPIO reset line operations
pub type Result<T> = std::result::Result<T, GpioResetError>;
