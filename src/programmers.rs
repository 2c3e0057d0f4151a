//! Programmer registration and dispatch
//!
//! This module provides a centralized registry for all programmers, with support
//! for feature-gated inclusion and dynamic help text generation.

use stkflash_core::part::PartDescription;
use stkflash_stk500v2::{
    NoReset, ProgrammingSession, ResetLine, SessionConfig, TcpTransport, Transport,
};

/// Session over whichever transport and reset line the user picked
pub type Session = ProgrammingSession<Box<dyn Transport>, Box<dyn ResetLine>>;

/// Default TCP port of serial bridges (ser2net, ESP-Link)
const DEFAULT_TCP_PORT: u16 = 23;

/// Information about a programmer
pub struct ProgrammerInfo {
    /// Primary name (used for matching)
    pub name: &'static str,
    /// Alternative names/aliases
    pub aliases: &'static [&'static str],
    /// Short description
    pub description: &'static str,
}

/// Get information about all available programmers (enabled at compile time)
#[allow(clippy::vec_init_then_push)]
pub fn available_programmers() -> Vec<ProgrammerInfo> {
    let mut programmers = Vec::new();

    #[cfg(feature = "serial")]
    programmers.push(ProgrammerInfo {
        name: "serial",
        aliases: &["stk500v2", "arduino"],
        description: "STK500v2 bootloader on a serial port (dev=<port>,baud=<rate>,reset=dtr|none|gpio)",
    });

    programmers.push(ProgrammerInfo {
        name: "tcp",
        aliases: &["net"],
        description: "STK500v2 bootloader behind a serial bridge (host=<addr>,port=<port>,reset=none|gpio)",
    });

    #[cfg(feature = "dummy")]
    programmers.push(ProgrammerInfo {
        name: "dummy",
        aliases: &["sim"],
        description: "In-memory simulated bootloader for testing (bootloader=arduino|stk500v2)",
    });

    programmers
}

/// Generate help text listing all available programmers
pub fn programmer_help() -> String {
    let programmers = available_programmers();

    let mut help = String::from("Available programmers:\n");
    for p in &programmers {
        help.push_str(&format!("  {:8} - {}\n", p.name, p.description));
    }
    if cfg!(feature = "linux-gpio") {
        help.push_str("\nreset=gpio takes gpiochip=<path|number>,line=<offset>\n");
    }
    help
}

/// Resolve a name or alias to its programmer's primary name
pub fn find_programmer(name: &str) -> Option<&'static str> {
    available_programmers()
        .into_iter()
        .find(|p| p.name == name || p.aliases.contains(&name))
        .map(|p| p.name)
}

/// Parse a programmer string into name and options
///
/// Format: "name" or "name:option1=value1,option2=value2"
pub fn parse_programmer_string(s: &str) -> (&str, Vec<(&str, &str)>) {
    if let Some((name, opts)) = s.split_once(':') {
        let options: Vec<_> = opts
            .split(',')
            .filter_map(|opt| opt.split_once('='))
            .collect();
        (name, options)
    } else {
        (s, Vec::new())
    }
}

fn option<'a>(options: &[(&str, &'a str)], key: &str) -> Option<&'a str> {
    options.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

/// Open a programming session on the programmer named by `programmer`
///
/// The programmer string can be just the name (e.g., "dummy") or include
/// parameters (e.g., "serial:dev=/dev/ttyACM0,baud=115200").
pub fn open_session(
    programmer: &str,
    part: PartDescription,
    config: SessionConfig,
) -> Result<Session, Box<dyn std::error::Error>> {
    let (name, options) = parse_programmer_string(programmer);

    let canonical_name = match find_programmer(name) {
        Some(n) => n,
        None => return Err(unknown_programmer_error(name)),
    };

    let (transport, reset): (Box<dyn Transport>, Box<dyn ResetLine>) = match canonical_name {
        #[cfg(feature = "serial")]
        "serial" => {
            use stkflash_stk500v2::SerialTransport;

            let device = option(&options, "dev").ok_or(
                "serial requires a device.\n\
                 Usage: serial:dev=/dev/ttyACM0[,baud=115200][,reset=dtr|none|gpio]",
            )?;
            let baud = option(&options, "baud")
                .map(|b| b.parse::<u32>())
                .transpose()
                .map_err(|e| format!("Invalid baud rate: {}", e))?;

            log::info!("Opening serial port {}...", device);
            let transport = SerialTransport::open(device, baud)
                .map_err(|e| format!("Failed to open serial port {}: {}", device, e))?;
            let reset: Box<dyn ResetLine> = match option(&options, "reset").unwrap_or("dtr") {
                "dtr" => Box::new(transport.reset_line()?),
                other => open_reset_line(other, &options)?,
            };
            (Box::new(transport), reset)
        }

        "tcp" => {
            let host = option(&options, "host").ok_or(
                "tcp requires a host.\n\
                 Usage: tcp:host=<addr>[,port=23][,reset=none|gpio]",
            )?;
            let port = match option(&options, "port") {
                Some(p) => p.parse::<u16>().map_err(|e| format!("Invalid port: {}", e))?,
                None => DEFAULT_TCP_PORT,
            };

            let transport = TcpTransport::connect(host, port)
                .map_err(|e| format!("Failed to connect to {}:{}: {}", host, port, e))?;
            let reset = open_reset_line(option(&options, "reset").unwrap_or("none"), &options)?;
            (Box::new(transport), reset)
        }

        #[cfg(feature = "dummy")]
        "dummy" => {
            use stkflash_dummy::{SimConfig, SimulatedBootloader};

            let mut sim = match option(&options, "bootloader").unwrap_or("arduino") {
                "arduino" => SimConfig::default(),
                "stk500v2" => SimConfig::stk500v2(),
                other => {
                    return Err(format!(
                        "Invalid dummy bootloader '{}' (expected arduino or stk500v2)",
                        other
                    )
                    .into())
                }
            };
            sim.signature = part.signature;

            log::info!("Using simulated {} bootloader", sim.sign_on);
            let target = SimulatedBootloader::new(sim);
            (Box::new(target.transport()), Box::new(target.reset_line()))
        }

        _ => return Err(unknown_programmer_error(name)),
    };

    Ok(ProgrammingSession::new(transport, reset, part, config))
}

/// Reset line named by the `reset=` option, for transports without their own
fn open_reset_line(
    kind: &str,
    options: &[(&str, &str)],
) -> Result<Box<dyn ResetLine>, Box<dyn std::error::Error>> {
    match kind {
        "none" => {
            log::warn!("No reset line: start the bootloader by hand before each command");
            Ok(Box::new(NoReset))
        }
        #[cfg(feature = "linux-gpio")]
        "gpio" => {
            use stkflash_linux_gpio::{parse_options, GpioResetLine};

            let config =
                parse_options(options).map_err(|e| format!("Invalid GPIO reset parameters: {}", e))?;
            let line = GpioResetLine::open(&config).map_err(|e| {
                format!(
                    "Failed to open GPIO reset line: {}\n\
                     Make sure the GPIO chip exists and you have read/write permissions.",
                    e
                )
            })?;
            Ok(Box::new(line))
        }
        #[cfg(not(feature = "linux-gpio"))]
        "gpio" => {
            let _ = options;
            Err("GPIO reset is not available (recompile with the linux-gpio feature)".into())
        }
        other => Err(format!("Unknown reset line '{}'", other).into()),
    }
}

fn unknown_programmer_error(name: &str) -> Box<dyn std::error::Error> {
    let mut msg = format!("Unknown programmer: {}\n\n", name);
    msg.push_str(&programmer_help());
    msg.push_str("\nUse 'stkflash list-programmers' for more details");
    msg.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_programmer_string() {
        let (name, options) = parse_programmer_string("serial:dev=/dev/ttyACM0,baud=57600");
        assert_eq!(name, "serial");
        assert_eq!(options, vec![("dev", "/dev/ttyACM0"), ("baud", "57600")]);
        assert_eq!(option(&options, "baud"), Some("57600"));
        assert_eq!(option(&options, "reset"), None);

        let (name, options) = parse_programmer_string("dummy");
        assert_eq!(name, "dummy");
        assert!(options.is_empty());
    }

    #[test]
    fn test_find_programmer_aliases() {
        assert_eq!(find_programmer("tcp"), Some("tcp"));
        assert_eq!(find_programmer("net"), Some("tcp"));
        assert_eq!(find_programmer("ch341a"), None);
    }

    #[test]
    fn test_unknown_reset_line() {
        assert!(open_reset_line("rts", &[]).is_err());
        assert!(open_reset_line("none", &[]).is_ok());
    }

    #[cfg(feature = "dummy")]
    #[test]
    fn test_open_dummy_session() {
        use stkflash_core::part::builtin;

        let part = builtin::atmega2560().unwrap();
        let mut session = open_session("sim:bootloader=stk500v2", part, SessionConfig::default())
            .unwrap();
        session.sync().unwrap();
        assert_eq!(
            session.bootloader(),
            stkflash_stk500v2::Bootloader::Stk500v2
        );
        assert_eq!(session.read_signature().unwrap(), [0x1E, 0x98, 0x01]);

        let part = builtin::atmega2560().unwrap();
        assert!(open_session("dummy:bootloader=optiboot", part, SessionConfig::default()).is_err());
    }
}
