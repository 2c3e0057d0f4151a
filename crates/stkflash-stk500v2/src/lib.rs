//! stkflash-stk500v2 - STK500v2 bootloader protocol support
//!
//! This crate talks to AVR targets running an STK500v2 compatible
//! bootloader, such as the one shipped on the Arduino Mega 2560.
//!
//! # Layers
//!
//! - [`transport`] - a raw duplex byte stream (serial port, TCP socket) and
//!   the target's reset line
//! - [`frame`] - checksummed, sequence-numbered framing on top of the stream
//! - [`session`] - the programming state machine: sync, program mode,
//!   erase, page and byte reads and writes, verify
//!
//! # Example
//!
//! ```no_run
//! use stkflash_core::memory::MemoryKind;
//! use stkflash_core::part::builtin;
//! use stkflash_stk500v2::{ProgrammingSession, SerialTransport, SessionConfig};
//!
//! let transport = SerialTransport::open("/dev/ttyACM0", Some(115200))?;
//! let reset = transport.reset_line()?;
//! let part = builtin::atmega2560()?;
//! let mut session = ProgrammingSession::new(transport, reset, part, SessionConfig::default());
//!
//! session.sync()?;
//! session.enter_program_mode()?;
//! let signature = session.read_signature()?;
//! println!("Signature: {:02X?}", signature);
//! session.load_hex(MemoryKind::Flash, &std::fs::read_to_string("blink.hex")?)?;
//! session.write_region(MemoryKind::Flash, true)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod error;
pub mod frame;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports
pub use error::{ErrorClass, Result, Stk500Error};
pub use frame::{FrameParser, Framer};
pub use protocol::Status;
pub use session::{
    Bootloader, EraseQuirk, NoProgress, ProgrammerInfo, ProgrammingSession, SessionConfig,
    SessionFlags, SessionProgress, SessionState,
};
pub use transport::tcp::TcpTransport;
pub use transport::{NoReset, ResetLine, Transport};

#[cfg(feature = "serial")]
pub use transport::serial::{DtrResetLine, SerialTransport};
