//! Parts known without a part database

use alloc::collections::BTreeMap;
use alloc::string::ToString;
use alloc::vec;

use super::{IspTiming, PartDescription};
use crate::error::Result;
use crate::isp::{InstructionTemplate, Operation};
use crate::memory::{MemoryKind, RegionDescriptor};

/// Names of all built-in parts
pub const NAMES: &[&str] = &["ATmega2560"];

/// Look up a built-in part by name or id
pub fn find(name: &str) -> Option<PartDescription> {
    let part = atmega2560().ok()?;
    part.matches(name).then_some(part)
}

fn ops(list: &[(Operation, &str)]) -> Result<BTreeMap<Operation, InstructionTemplate>> {
    let mut map = BTreeMap::new();
    for (op, text) in list {
        map.insert(*op, text.parse::<InstructionTemplate>()?);
    }
    Ok(map)
}

fn single_byte(
    kind: MemoryKind,
    delay_us: u32,
    list: &[(Operation, &str)],
) -> Result<RegionDescriptor> {
    let mut desc = RegionDescriptor::new(kind, 1, 0);
    desc.min_write_delay_us = delay_us;
    desc.max_write_delay_us = delay_us;
    desc.ops = ops(list)?;
    Ok(desc)
}

/// ATmega2560, as found on the Arduino Mega 2560
pub fn atmega2560() -> Result<PartDescription> {
    use Operation::*;

    let mut flash = RegionDescriptor::new(MemoryKind::Flash, 256 * 1024, 256);
    flash.min_write_delay_us = 4500;
    flash.max_write_delay_us = 4500;
    flash.mode = 0x41;
    flash.delay = 10;
    flash.ops = ops(&[
        (ReadLo, "0 0 1 0 0 0 0 0  a15 a14 a13 a12 a11 a10 a9 a8  a7 a6 a5 a4 a3 a2 a1 a0  o o o o o o o o"),
        (ReadHi, "0 0 1 0 1 0 0 0  a15 a14 a13 a12 a11 a10 a9 a8  a7 a6 a5 a4 a3 a2 a1 a0  o o o o o o o o"),
        (LoadPageLo, "0 1 0 0 0 0 0 0  x x x x x x x x  x a6 a5 a4 a3 a2 a1 a0  i i i i i i i i"),
        (LoadPageHi, "0 1 0 0 1 0 0 0  x x x x x x x x  x a6 a5 a4 a3 a2 a1 a0  i i i i i i i i"),
        (WritePage, "0 1 0 0 1 1 0 0  a15 a14 a13 a12 a11 a10 a9 a8  a7 x x x x x x x  x x x x x x x x"),
        (LoadExtAddr, "0 1 0 0 1 1 0 1  0 0 0 0 0 0 0 0  0 0 0 0 0 0 0 a16  0 0 0 0 0 0 0 0"),
    ])?;

    let mut eeprom = RegionDescriptor::new(MemoryKind::Eeprom, 4096, 8);
    eeprom.min_write_delay_us = 9000;
    eeprom.max_write_delay_us = 9000;
    eeprom.mode = 0x41;
    eeprom.delay = 10;
    eeprom.ops = ops(&[
        (Read, "1 0 1 0 0 0 0 0  x x x x a11 a10 a9 a8  a7 a6 a5 a4 a3 a2 a1 a0  o o o o o o o o"),
        (Write, "1 1 0 0 0 0 0 0  x x x x a11 a10 a9 a8  a7 a6 a5 a4 a3 a2 a1 a0  i i i i i i i i"),
        (LoadPageLo, "1 1 0 0 0 0 0 1  0 0 0 0 0 0 0 0  0 0 0 0 0 a2 a1 a0  i i i i i i i i"),
        (WritePage, "1 1 0 0 0 0 1 0  0 0 x x a11 a10 a9 a8  a7 a6 a5 a4 a3 0 0 0  x x x x x x x x"),
    ])?;

    let lfuse = single_byte(
        MemoryKind::LFuse,
        9000,
        &[
            (Write, "1 0 1 0 1 1 0 0  1 0 1 0 0 0 0 0  x x x x x x x x  i i i i i i i i"),
            (Read, "0 1 0 1 0 0 0 0  0 0 0 0 0 0 0 0  x x x x x x x x  o o o o o o o o"),
        ],
    )?;
    let hfuse = single_byte(
        MemoryKind::HFuse,
        9000,
        &[
            (Write, "1 0 1 0 1 1 0 0  1 0 1 0 1 0 0 0  x x x x x x x x  i i i i i i i i"),
            (Read, "0 1 0 1 1 0 0 0  0 0 0 0 1 0 0 0  x x x x x x x x  o o o o o o o o"),
        ],
    )?;
    let efuse = single_byte(
        MemoryKind::EFuse,
        9000,
        &[
            (Write, "1 0 1 0 1 1 0 0  1 0 1 0 0 1 0 0  x x x x x x x x  x x x x x i i i"),
            (Read, "0 1 0 1 0 0 0 0  0 0 0 0 1 0 0 0  x x x x x x x x  o o o o o o o o"),
        ],
    )?;
    let lock = single_byte(
        MemoryKind::Lock,
        9000,
        &[
            (Read, "0 1 0 1 1 0 0 0  0 0 0 0 0 0 0 0  x x x x x x x x  x x o o o o o o"),
            (Write, "1 0 1 0 1 1 0 0  1 1 1 x x x x x  x x x x x x x x  1 1 i i i i i i"),
        ],
    )?;
    let calibration = single_byte(
        MemoryKind::Calibration,
        0,
        &[(Read, "0 0 1 1 1 0 0 0  x x x x x x x x  0 0 0 0 0 0 0 0  o o o o o o o o")],
    )?;

    let mut signature = RegionDescriptor::new(MemoryKind::Signature, 3, 0);
    signature.ops = ops(&[(
        Read,
        "0 0 1 1 0 0 0 0  x x x x x x x x  x x x x x x a1 a0  o o o o o o o o",
    )])?;

    Ok(PartDescription {
        name: "ATmega2560".to_string(),
        id: "m2560".to_string(),
        signature: [0x1E, 0x98, 0x01],
        timing: IspTiming::default(),
        pgm_enable: "1 0 1 0 1 1 0 0  0 1 0 1 0 0 1 1  x x x x x x x x  x x x x x x x x"
            .parse()?,
        chip_erase: "1 0 1 0 1 1 0 0  1 0 0 0 0 0 0 0  x x x x x x x x  x x x x x x x x"
            .parse()?,
        regions: vec![
            flash,
            eeprom,
            lfuse,
            hfuse,
            efuse,
            lock,
            calibration,
            signature,
        ],
    })
}
