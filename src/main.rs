//! stkflash - AVR programmer for STK500v2 bootloaders
//!
//! Reads, writes and verifies the flash, EEPROM, fuses and lock bits of AVR
//! microcontrollers through an STK500v2 bootloader, such as the one on the
//! Arduino Mega 2560.
//!
//! # Architecture
//!
//! - `stkflash-core` knows the chips: instruction templates, memory
//!   regions with dirty tracking, part descriptions, Intel HEX
//! - `stkflash-stk500v2` talks to the bootloader: transports, framing and
//!   the programming session
//! - programmers (serial, tcp, dummy) pick the transport and reset line
//!   the session runs over

mod cli;
mod commands;
mod programmers;

use clap::Parser;
use cli::{Cli, Commands};
use std::path::{Path, PathBuf};
use stkflash_core::part::{PartDatabase, PartDescription};
use stkflash_stk500v2::SessionConfig;

fn main() {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Set log level based on verbosity
    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    // Load part database
    let db = load_part_database(cli.parts_dir.as_deref())
        .map_err(|e| format!("Failed to load part database: {}", e))?;

    log::debug!("Loaded {} part definitions", db.len());

    let mut config = SessionConfig::default();

    match cli.command {
        Commands::Info { programmer } => {
            let part = find_part(&db, &cli.part)?;
            let mut session = programmers::open_session(&programmer, part, config)?;
            commands::run_info(&mut session)
        }
        Commands::Read {
            programmer,
            memory,
            output,
        } => {
            let part = find_part(&db, &cli.part)?;
            let mut session = programmers::open_session(&programmer, part, config)?;
            commands::run_read(&mut session, memory, &output)
        }
        Commands::Write {
            programmer,
            memory,
            input,
            no_verify,
            erase_quirk,
        } => {
            config.erase_quirk = erase_quirk;
            let part = find_part(&db, &cli.part)?;
            let mut session = programmers::open_session(&programmer, part, config)?;
            commands::run_write(&mut session, memory, &input, !no_verify)
        }
        Commands::Verify {
            programmer,
            memory,
            input,
        } => {
            let part = find_part(&db, &cli.part)?;
            let mut session = programmers::open_session(&programmer, part, config)?;
            commands::run_verify(&mut session, memory, &input)
        }
        Commands::Erase { programmer } => {
            let part = find_part(&db, &cli.part)?;
            let mut session = programmers::open_session(&programmer, part, config)?;
            commands::run_erase(&mut session)
        }
        Commands::Set {
            programmer,
            memory,
            address,
            value,
        } => {
            let part = find_part(&db, &cli.part)?;
            let mut session = programmers::open_session(&programmer, part, config)?;
            commands::run_set(&mut session, memory, address, value)
        }
        Commands::ListParts => {
            commands::list_parts(&db);
            Ok(())
        }
        Commands::ListProgrammers => {
            commands::list_programmers();
            Ok(())
        }
    }
}

/// Look up the part to program
fn find_part(
    db: &PartDatabase,
    name: &str,
) -> Result<PartDescription, Box<dyn std::error::Error>> {
    match db.find(name) {
        Some(part) => {
            log::info!("Target part: {} ({})", part.name, part.id);
            Ok(part.clone())
        }
        None => Err(format!(
            "Unknown part: {}\nUse 'stkflash list-parts' to see the known parts",
            name
        )
        .into()),
    }
}

/// Load the part database from the specified path or default locations
///
/// The built-in parts are always present; files loaded later replace
/// built-in entries with the same id.
fn load_part_database(path: Option<&Path>) -> Result<PartDatabase, Box<dyn std::error::Error>> {
    let mut db = PartDatabase::with_builtin();

    if let Some(path) = path {
        // User specified a path
        if path.is_dir() {
            db.load_dir(path)?;
        } else if path.is_file() {
            db.load_file(path)?;
        } else {
            return Err(format!("Part database path not found: {}", path.display()).into());
        }
    } else {
        // Try default locations
        let default_paths = [
            PathBuf::from("parts"),
            PathBuf::from("/usr/share/stkflash/parts"),
            PathBuf::from("/usr/local/share/stkflash/parts"),
        ];

        for dir in &default_paths {
            if dir.is_dir() {
                match db.load_dir(dir) {
                    Ok(count) => {
                        log::debug!("Loaded {} parts from {}", count, dir.display());
                    }
                    Err(e) => {
                        log::warn!("Failed to load parts from {}: {}", dir.display(), e);
                    }
                }
            }
        }
    }

    Ok(db)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_part() {
        let db = PartDatabase::with_builtin();
        assert_eq!(find_part(&db, "m2560").unwrap().name, "ATmega2560");
        assert!(find_part(&db, "m328p").is_err());
    }

    #[test]
    fn test_missing_parts_dir() {
        assert!(load_part_database(Some(Path::new("/nonexistent/stkflash/parts"))).is_err());
    }
}
