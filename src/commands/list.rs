//! List commands implementation

use super::format_size;
use crate::programmers;
use stkflash_core::memory::MemoryKind;
use stkflash_core::part::PartDatabase;

/// List all supported programmers
pub fn list_programmers() {
    println!("Supported programmers:");
    println!();
    for p in programmers::available_programmers() {
        let aliases = if p.aliases.is_empty() {
            String::new()
        } else {
            format!(" (aliases: {})", p.aliases.join(", "))
        };
        println!("  {:8} - {}{}", p.name, p.description, aliases);
    }
    if cfg!(feature = "linux-gpio") {
        println!();
        println!("  reset=gpio takes gpiochip=<path|number>,line=<offset>");
    }
}

/// List all known parts
pub fn list_parts(db: &PartDatabase) {
    println!("Known parts:");
    println!();
    println!(
        "{:<8} {:<16} {:>10} {:>8} {:>10}",
        "Id", "Name", "Flash", "EEPROM", "Signature"
    );
    println!("{}", "-".repeat(56));

    for part in db.iter() {
        let size = |kind| part.region(kind).map_or(0, |r| r.size);
        println!(
            "{:<8} {:<16} {:>10} {:>8} {:>10}",
            part.id,
            part.name,
            format_size(size(MemoryKind::Flash)),
            format_size(size(MemoryKind::Eeprom)),
            format!(
                "{:02X}{:02X}{:02X}",
                part.signature[0], part.signature[1], part.signature[2]
            )
        );
    }
}
