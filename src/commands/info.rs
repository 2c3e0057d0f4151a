//! Info command implementation

use super::format_size;
use crate::programmers::Session;
use stkflash_core::memory::MemoryKind;

/// Memories shown by `info`, one byte each
const CONFIG_BYTES: [MemoryKind; 5] = [
    MemoryKind::LFuse,
    MemoryKind::HFuse,
    MemoryKind::EFuse,
    MemoryKind::Lock,
    MemoryKind::Calibration,
];

/// Sign on and print what the programmer and target report
pub fn run_info(session: &mut Session) -> Result<(), Box<dyn std::error::Error>> {
    session.sync()?;
    let info = session.programmer_info()?;

    println!("Programmer Information");
    println!("======================");
    println!();
    println!("Bootloader:      {}", info.bootloader);
    println!("Hardware:        {}", info.hw_version);
    println!("Firmware:        {}.{}", info.sw_major, info.sw_minor);
    println!(
        "Erase quirk:     {}",
        if info.bootloader.has_erase_pointer_defect() {
            "needed"
        } else {
            "not needed"
        }
    );

    let signature = session.read_signature()?;
    let part = session.part();
    println!();
    println!("Target Information");
    println!("==================");
    println!();
    println!("Part:            {} ({})", part.name, part.id);
    println!(
        "Signature:       {:02X} {:02X} {:02X}",
        signature[0], signature[1], signature[2]
    );
    for kind in [MemoryKind::Flash, MemoryKind::Eeprom] {
        if let Some(region) = part.region(kind) {
            println!(
                "{:<16} {} (page size {} bytes)",
                format!("{}:", kind),
                format_size(region.size),
                region.page_size
            );
        }
    }

    println!();
    for kind in CONFIG_BYTES {
        if session.part().region(kind).is_none() {
            continue;
        }
        let value = session.read_byte(kind, 0)?;
        println!("{:<16} 0x{:02X}", format!("{}:", kind), value);
    }

    session.close()?;
    Ok(())
}
