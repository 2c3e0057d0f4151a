//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use stkflash_core::memory::MemoryKind;
use stkflash_stk500v2::EraseQuirk;

/// Parse a string as a hex or decimal u32
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex value: {}", e))
    } else {
        s.parse::<u32>().map_err(|e| format!("Invalid number: {}", e))
    }
}

/// Parse a string as a hex or decimal byte
fn parse_hex_u8(s: &str) -> Result<u8, String> {
    let value = parse_hex_u32(s)?;
    u8::try_from(value).map_err(|_| format!("Value 0x{:X} does not fit in a byte", value))
}

fn parse_memory(s: &str) -> Result<MemoryKind, String> {
    s.parse().map_err(|e| format!("{}", e))
}

const PROGRAMMER_HELP: &str =
    "Programmer to use, as name[:key=value,...] (see list-programmers)";

#[derive(Parser)]
#[command(name = "stkflash")]
#[command(author, version, about = "AVR programmer for STK500v2 bootloaders", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to part database directory (contains .ron files)
    /// Defaults to looking in ./parts/ and /usr/share/stkflash/parts/
    #[arg(long, global = true)]
    pub parts_dir: Option<PathBuf>,

    /// Target part name or id
    #[arg(long, global = true, default_value = "m2560")]
    pub part: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sign on and show programmer, signature, fuse and lock information
    Info {
        #[arg(short, long, help = PROGRAMMER_HELP)]
        programmer: String,
    },

    /// Read a memory to a file (.hex files are written as Intel HEX)
    Read {
        #[arg(short, long, help = PROGRAMMER_HELP)]
        programmer: String,

        /// Memory to read
        #[arg(short, long, default_value = "flash", value_parser = parse_memory)]
        memory: MemoryKind,

        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Write a file to a memory
    Write {
        #[arg(short, long, help = PROGRAMMER_HELP)]
        programmer: String,

        /// Memory to write
        #[arg(short, long, default_value = "flash", value_parser = parse_memory)]
        memory: MemoryKind,

        /// Input file (Intel HEX, or raw binary loaded at address 0)
        #[arg(short, long)]
        input: PathBuf,

        /// Skip reading back each page after writing it
        #[arg(long)]
        no_verify: bool,

        /// Erase-pointer workaround: auto, always or never
        #[arg(long, default_value = "auto")]
        erase_quirk: EraseQuirk,
    },

    /// Compare a memory against a file
    Verify {
        #[arg(short, long, help = PROGRAMMER_HELP)]
        programmer: String,

        /// Memory to verify
        #[arg(short, long, default_value = "flash", value_parser = parse_memory)]
        memory: MemoryKind,

        /// Input file (Intel HEX, or raw binary loaded at address 0)
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Erase flash and EEPROM
    Erase {
        #[arg(short, long, help = PROGRAMMER_HELP)]
        programmer: String,
    },

    /// Write a single byte (fuses, lock bits)
    Set {
        #[arg(short, long, help = PROGRAMMER_HELP)]
        programmer: String,

        /// Memory to write
        #[arg(short, long, value_parser = parse_memory)]
        memory: MemoryKind,

        /// Address inside the memory (hex, e.g., 0x10)
        #[arg(short, long, default_value = "0", value_parser = parse_hex_u32)]
        address: u32,

        /// Byte value (hex, e.g., 0xDE)
        #[arg(value_parser = parse_hex_u8)]
        value: u8,
    },

    /// List known parts
    ListParts,

    /// List supported programmers
    ListProgrammers,
}
