//! GPIO reset line implementation
//!
//! Implements the [`ResetLine`] trait on one output line requested through
//! gpiocdev.

use crate::error::{GpioResetError, Result};
use gpiocdev::line::{Offset, Value};
use gpiocdev::request::{Config, Request};
use stkflash_stk500v2::ResetLine;

/// Configuration for a GPIO reset line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpioResetConfig {
    /// GPIO chip device path (e.g. "/dev/gpiochip0")
    pub device: String,
    /// Line offset wired to the target's reset pin
    pub line: Offset,
}

impl GpioResetConfig {
    /// Create a new configuration
    pub fn new(device: &str, line: Offset) -> Self {
        Self {
            device: device.to_string(),
            line,
        }
    }
}

/// Reset line driven by a GPIO output
pub struct GpioResetLine {
    request: Request,
    line: Offset,
}

impl GpioResetLine {
    /// Request the line as an output, initially high
    pub fn open(config: &GpioResetConfig) -> Result<Self> {
        if config.device.is_empty() {
            return Err(GpioResetError::NoDevice);
        }

        log::debug!(
            "gpio reset: requesting line {} on {}",
            config.line,
            config.device
        );

        let mut req_config = Config::default();
        req_config.with_line(config.line).as_output(Value::Active);

        let request = Request::from_config(req_config)
            .on_chip(&config.device)
            .with_consumer("stkflash")
            .request()
            .map_err(|source| GpioResetError::LineRequestFailed {
                path: config.device.clone(),
                line: config.line,
                source,
            })?;

        log::info!(
            "gpio reset: using line {} on {}",
            config.line,
            config.device
        );

        Ok(Self {
            request,
            line: config.line,
        })
    }
}

impl ResetLine for GpioResetLine {
    fn set_level(&mut self, high: bool) -> stkflash_stk500v2::Result<()> {
        let value = if high { Value::Active } else { Value::Inactive };
        self.request
            .set_value(self.line, value)
            .map_err(GpioResetError::SetValueFailed)?;
        Ok(())
    }
}

/// Parse reset line options from the programmer string
///
/// Recognized keys are `gpiochip` (a device path or chip number) and
/// `line`. Other keys belong to the transport and are ignored.
pub fn parse_options(options: &[(&str, &str)]) -> std::result::Result<GpioResetConfig, String> {
    let mut device = None;
    let mut line = None;

    for (key, value) in options {
        match *key {
            "gpiochip" => {
                device = Some(if value.starts_with('/') {
                    value.to_string()
                } else {
                    let n: u32 = value
                        .parse()
                        .map_err(|_| format!("Invalid gpiochip value: {}", value))?;
                    format!("/dev/gpiochip{}", n)
                });
            }
            "line" => {
                line = Some(
                    value
                        .parse::<Offset>()
                        .map_err(|_| format!("Invalid line value: {}", value))?,
                );
            }
            _ => {}
        }
    }

    let device = device.ok_or_else(|| {
        "GPIO reset needs 'gpiochip', e.g. reset=gpio,gpiochip=/dev/gpiochip0,line=17".to_string()
    })?;
    let line = line.ok_or_else(|| "Missing required parameter: line".to_string())?;
    Ok(GpioResetConfig { device, line })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_options_path() {
        let config =
            parse_options(&[("dev", "/dev/ttyAMA0"), ("gpiochip", "/dev/gpiochip1"), ("line", "17")])
                .unwrap();
        assert_eq!(config, GpioResetConfig::new("/dev/gpiochip1", 17));
    }

    #[test]
    fn test_parse_options_number() {
        let config = parse_options(&[("gpiochip", "0"), ("line", "4")]).unwrap();
        assert_eq!(config.device, "/dev/gpiochip0");
        assert_eq!(config.line, 4);
    }

    #[test]
    fn test_parse_options_errors() {
        assert!(parse_options(&[("line", "4")]).is_err());
        assert!(parse_options(&[("gpiochip", "0")]).is_err());
        assert!(parse_options(&[("gpiochip", "zero"), ("line", "4")]).is_err());
        assert!(parse_options(&[("gpiochip", "0"), ("line", "-1")]).is_err());
    }
}
