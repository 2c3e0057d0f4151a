//! Transport layer abstraction for STK500v2 communication
//!
//! This module provides a unified interface for serial and TCP transports,
//! plus the reset line used to restart the target into its bootloader.

use std::time::Duration;

use crate::error::Result;

/// Transport trait for reading and writing bytes
pub trait Transport {
    /// Write all of `data`
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Read one byte, waiting at most `timeout`
    ///
    /// Returns `None` on timeout.
    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>>;

    /// Drop everything received but not yet read
    fn discard_input(&mut self) -> Result<()>;

    /// Flush any buffered data
    fn flush(&mut self) -> Result<()>;

    /// Block for `us` microseconds
    fn delay_us(&mut self, us: u32) {
        std::thread::sleep(Duration::from_micros(us as u64));
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        (**self).write(data)
    }

    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>> {
        (**self).read_byte(timeout)
    }

    fn discard_input(&mut self) -> Result<()> {
        (**self).discard_input()
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn delay_us(&mut self, us: u32) {
        (**self).delay_us(us)
    }
}

/// The target's active-low reset input
pub trait ResetLine {
    /// Drive the line high (`true`, running) or low (`false`, held in reset)
    fn set_level(&mut self, high: bool) -> Result<()>;
}

impl<R: ResetLine + ?Sized> ResetLine for Box<R> {
    fn set_level(&mut self, high: bool) -> Result<()> {
        (**self).set_level(high)
    }
}

/// Reset line for setups where the target cannot be reset
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReset;

impl ResetLine for NoReset {
    fn set_level(&mut self, _high: bool) -> Result<()> {
        Ok(())
    }
}

#[cfg(feature = "serial")]
pub mod serial {
    //! Serial port transport implementation

    use super::*;
    use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
    use std::io::{Read, Write};

    const READ_CHUNK: usize = 64;

    /// Serial port transport
    pub struct SerialTransport {
        port: Box<dyn SerialPort>,
        rx: [u8; READ_CHUNK],
        rx_pos: usize,
        rx_len: usize,
    }

    impl SerialTransport {
        /// Open a serial port with the specified baud rate (default 115200)
        pub fn open(device: &str, baud: Option<u32>) -> Result<Self> {
            let baud_rate = baud.unwrap_or(115200);

            let port = serialport::new(device, baud_rate)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .flow_control(FlowControl::None)
                .timeout(Duration::from_millis(200))
                .open()?;

            log::info!("Opened serial port {} at {} baud", device, baud_rate);

            Ok(Self {
                port,
                rx: [0; READ_CHUNK],
                rx_pos: 0,
                rx_len: 0,
            })
        }

        /// Reset line driven through the port's DTR and RTS signals
        pub fn reset_line(&self) -> Result<DtrResetLine> {
            Ok(DtrResetLine {
                port: self.port.try_clone()?,
            })
        }
    }

    impl Transport for SerialTransport {
        fn write(&mut self, data: &[u8]) -> Result<()> {
            self.port.write_all(data)?;
            Ok(())
        }

        fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>> {
            if self.rx_pos < self.rx_len {
                let b = self.rx[self.rx_pos];
                self.rx_pos += 1;
                return Ok(Some(b));
            }

            if self.port.timeout() != timeout {
                self.port.set_timeout(timeout)?;
            }
            match self.port.read(&mut self.rx) {
                Ok(0) => Ok(None),
                Ok(n) => {
                    self.rx_pos = 1;
                    self.rx_len = n;
                    Ok(Some(self.rx[0]))
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
                Err(e) => Err(e.into()),
            }
        }

        fn discard_input(&mut self) -> Result<()> {
            self.rx_pos = 0;
            self.rx_len = 0;
            self.port.clear(ClearBuffer::Input)?;
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            self.port.flush()?;
            Ok(())
        }
    }

    /// Reset through DTR/RTS, as wired on Arduino boards
    ///
    /// DTR and RTS are active low, so asserting them pulls reset low.
    pub struct DtrResetLine {
        port: Box<dyn SerialPort>,
    }

    impl ResetLine for DtrResetLine {
        fn set_level(&mut self, high: bool) -> Result<()> {
            self.port.write_data_terminal_ready(!high)?;
            self.port.write_request_to_send(!high)?;
            Ok(())
        }
    }
}

pub mod tcp {
    //! TCP socket transport implementation
    //!
    //! Useful with a serial-to-network bridge (ser2net, ESP-Link) in front
    //! of the target. Such bridges cannot toggle reset, pair with
    //! [`NoReset`](super::NoReset) or a GPIO reset line.

    use super::*;
    use crate::error::Stk500Error;
    use std::io::{ErrorKind, Read, Write};
    use std::net::TcpStream;

    /// TCP socket transport
    pub struct TcpTransport {
        stream: TcpStream,
        timeout: Option<Duration>,
    }

    impl TcpTransport {
        /// Connect to a bridge at the specified host and port
        pub fn connect(host: &str, port: u16) -> Result<Self> {
            let addr = format!("{}:{}", host, port);
            log::info!("Connecting to serial bridge at {}", addr);

            let stream = TcpStream::connect(&addr)
                .map_err(|e| Stk500Error::ConnectionFailed(e.to_string()))?;

            stream.set_nodelay(true).map_err(|e| {
                Stk500Error::ConnectionFailed(format!("Failed to set TCP_NODELAY: {}", e))
            })?;
            stream
                .set_write_timeout(Some(Duration::from_secs(5)))
                .map_err(|e| {
                    Stk500Error::ConnectionFailed(format!("Failed to set write timeout: {}", e))
                })?;

            log::info!("Connected to serial bridge at {}", addr);

            Ok(Self {
                stream,
                timeout: None,
            })
        }
    }

    impl Transport for TcpTransport {
        fn write(&mut self, data: &[u8]) -> Result<()> {
            self.stream.write_all(data)?;
            Ok(())
        }

        fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>> {
            // A zero timeout means "block forever" to the socket API
            let timeout = timeout.max(Duration::from_millis(1));
            if self.timeout != Some(timeout) {
                self.stream.set_read_timeout(Some(timeout))?;
                self.timeout = Some(timeout);
            }

            let mut byte = [0u8; 1];
            match self.stream.read(&mut byte) {
                Ok(0) => Err(Stk500Error::ConnectionFailed(
                    "connection closed by peer".into(),
                )),
                Ok(_) => Ok(Some(byte[0])),
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    Ok(None)
                }
                Err(e) => Err(e.into()),
            }
        }

        fn discard_input(&mut self) -> Result<()> {
            self.stream.set_nonblocking(true)?;
            let mut buf = [0u8; 256];
            let result = loop {
                match self.stream.read(&mut buf) {
                    Ok(0) => break Ok(()),
                    Ok(_) => continue,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break Ok(()),
                    Err(e) => break Err(e.into()),
                }
            };
            self.stream.set_nonblocking(false)?;
            result
        }

        fn flush(&mut self) -> Result<()> {
            self.stream.flush()?;
            Ok(())
        }
    }
}
