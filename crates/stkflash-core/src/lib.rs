//! stkflash-core - Core library for AVR ISP memory programming
//!
//! This crate holds everything about an AVR target's non-volatile memories
//! that does not depend on how bytes reach the chip:
//!
//! - [`isp`] - the 32-bit serial programming instruction codec, driven by
//!   declarative bit-role templates
//! - [`memory`] - in-memory images of flash, EEPROM, fuses and friends,
//!   with byte and page dirty tracking
//! - [`part`] - chip descriptions (geometry, timing, instruction tables)
//! - [`hex`] - Intel HEX parsing, ingestion and encoding
//!
//! It is designed to be `no_std` compatible (with `alloc`).
//!
//! # Features
//!
//! - `std` - Enable standard library support and the RON part database
//!
//! # Example
//!
//! ```
//! use stkflash_core::{hex, memory::MemoryKind, part::builtin};
//!
//! let part = builtin::atmega2560()?;
//! let mut regions = part.memory_regions();
//! let flash = regions
//!     .iter_mut()
//!     .find(|r| r.kind() == MemoryKind::Flash)
//!     .ok_or(stkflash_core::Error::NoSuchRegion(MemoryKind::Flash))?;
//! flash.init();
//! let stats = hex::ingest(flash, ":0100000055AA\n:00000001FF\n")?;
//! assert_eq!(stats.bytes, 1);
//! # Ok::<(), stkflash_core::Error>(())
//! ```

#![no_std]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod error;
pub mod hex;
pub mod isp;
pub mod memory;
pub mod part;

pub use error::{Error, Result};
