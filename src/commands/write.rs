//! Write and set command implementations

use super::load_image_file;
use super::progress::IndicatifProgress;
use crate::programmers::Session;
use std::path::Path;
use stkflash_core::memory::MemoryKind;

/// Write a firmware file into a memory, sending only changed pages
pub fn run_write(
    session: &mut Session,
    kind: MemoryKind,
    input: &Path,
    verify: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let image = load_image_file(input)?;
    if image.is_empty() {
        println!("Input contains no data - nothing to write");
        return Ok(());
    }

    session.set_progress(Box::new(IndicatifProgress::new()));
    let stats = session.load_image(kind, &image)?;
    if let (Some(lowest), Some(highest)) = (stats.lowest, stats.highest) {
        println!(
            "Image covers 0x{:06X} - 0x{:06X}, {} of {} bytes differ from the device",
            lowest, highest, stats.changed, stats.bytes
        );
    }

    let written = session.write_region(kind, verify)?;
    if written == 0 {
        println!("{} already contains the desired data - no changes needed", kind);
    } else if verify {
        println!("Wrote and verified {} page(s) of {}", written, kind);
    } else {
        println!("Wrote {} page(s) of {}", written, kind);
    }

    session.close()?;
    Ok(())
}

/// Write a single byte, reading it back to confirm
pub fn run_set(
    session: &mut Session,
    kind: MemoryKind,
    address: u32,
    value: u8,
) -> Result<(), Box<dyn std::error::Error>> {
    let old = session.read_byte(kind, address)?;
    if old == value {
        println!("{} 0x{:X} already 0x{:02X}", kind, address, value);
        session.close()?;
        return Ok(());
    }

    session.write_byte(kind, address, value)?;
    let found = session.read_byte(kind, address)?;
    session.close()?;

    if found != value {
        return Err(format!(
            "{} 0x{:X} reads back 0x{:02X} after writing 0x{:02X}",
            kind, address, found, value
        )
        .into());
    }
    println!("{} 0x{:X}: 0x{:02X} -> 0x{:02X}", kind, address, old, value);
    Ok(())
}
