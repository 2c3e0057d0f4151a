//! stkflash-linux-gpio - Reset line on a Linux GPIO
//!
//! Boards wired to a UART without DTR (a Raspberry Pi header, for example)
//! can still reset the target into its bootloader when its reset pin is
//! connected to a spare GPIO. This crate drives that GPIO through the Linux
//! character device interface (gpiocdev).
//!
//! # Example
//!
//! ```no_run
//! use stkflash_linux_gpio::{GpioResetConfig, GpioResetLine};
//! use stkflash_stk500v2::ResetLine;
//!
//! let config = GpioResetConfig::new("/dev/gpiochip0", 17);
//! let mut reset = GpioResetLine::open(&config)?;
//! reset.set_level(false)?;
//! reset.set_level(true)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Usage with stkflash CLI
//!
//! ```bash
//! stkflash info -p serial:dev=/dev/ttyAMA0,reset=gpio,gpiochip=/dev/gpiochip0,line=17
//! ```
//!
//! The line idles high (target running) and is pulled low to reset.

pub mod device;
pub mod error;

// Re-exports
pub use device::{parse_options, GpioResetConfig, GpioResetLine};
pub use error::{GpioResetError, Result};
