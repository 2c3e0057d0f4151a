//! Part database for runtime loading and lookup
//!
//! Part definitions live in RON files, one vendor per file, so new chips
//! can be added without rebuilding.

use alloc::collections::BTreeMap;
use alloc::{string::String, vec::Vec};
use std::fs;
use std::io;
use std::path::Path;

use super::{IspTiming, PartDescription};
use crate::isp::{InstructionTemplate, Operation};
use crate::memory::{MemoryKind, RegionDescriptor};

/// Error type for part database operations
#[derive(Debug)]
pub enum PartDbError {
    /// I/O error reading files
    Io(io::Error),
    /// RON parsing error
    Parse(ron::error::SpannedError),
    /// Validation error
    Validation(String),
}

impl From<io::Error> for PartDbError {
    fn from(e: io::Error) -> Self {
        PartDbError::Io(e)
    }
}

impl From<ron::error::SpannedError> for PartDbError {
    fn from(e: ron::error::SpannedError) -> Self {
        PartDbError::Parse(e)
    }
}

impl std::fmt::Display for PartDbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartDbError::Io(e) => write!(f, "I/O error: {}", e),
            PartDbError::Parse(e) => write!(f, "Parse error: {}", e),
            PartDbError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for PartDbError {}

// ============================================================================
// RON deserialization types (intermediate format)
// ============================================================================

/// Size specification with human-readable units (for RON parsing)
#[derive(Debug, Clone, Copy, serde::Deserialize)]
pub enum Size {
    /// Size in bytes
    B(u32),
    /// Size in kibibytes (1024 bytes)
    KiB(u32),
}

impl Size {
    /// Convert to bytes, or `None` if the size does not fit in 32 bits
    pub fn to_bytes(self) -> Option<u32> {
        match self {
            Size::B(n) => Some(n),
            Size::KiB(n) => n.checked_mul(1024),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
struct RegionDef {
    kind: MemoryKind,
    size: Size,
    #[serde(default)]
    page_size: u32,
    #[serde(default)]
    min_write_delay: u32,
    #[serde(default)]
    max_write_delay: u32,
    #[serde(default)]
    mode: u8,
    #[serde(default)]
    delay: u8,
    #[serde(default)]
    readback: [u8; 2],
    #[serde(default)]
    ops: BTreeMap<Operation, InstructionTemplate>,
}

impl TryFrom<RegionDef> for RegionDescriptor {
    type Error = PartDbError;

    fn try_from(def: RegionDef) -> Result<Self, PartDbError> {
        let size = def.size.to_bytes().ok_or_else(|| {
            PartDbError::Validation(alloc::format!("{} size {:?} is too large", def.kind, def.size))
        })?;
        Ok(RegionDescriptor {
            kind: def.kind,
            size,
            page_size: def.page_size,
            min_write_delay_us: def.min_write_delay,
            max_write_delay_us: def.max_write_delay.max(def.min_write_delay),
            mode: def.mode,
            delay: def.delay,
            readback: def.readback,
            ops: def.ops,
        })
    }
}

/// Single part definition in RON format
#[derive(Debug, Clone, serde::Deserialize)]
struct PartDef {
    name: String,
    id: String,
    signature: [u8; 3],
    #[serde(default)]
    timing: IspTiming,
    pgm_enable: InstructionTemplate,
    chip_erase: InstructionTemplate,
    memories: Vec<RegionDef>,
}

/// Vendor definition containing multiple parts
#[derive(Debug, Clone, serde::Deserialize)]
struct VendorDef {
    #[allow(dead_code)]
    vendor: String,
    parts: Vec<PartDef>,
}

// ============================================================================
// Part database
// ============================================================================

/// Runtime part database
///
/// Holds a collection of part definitions that can be loaded from RON files.
#[derive(Debug, Clone, Default)]
pub struct PartDatabase {
    parts: Vec<PartDescription>,
}

impl PartDatabase {
    /// Create an empty part database
    pub fn new() -> Self {
        Self { parts: Vec::new() }
    }

    /// Create a database holding the built-in parts
    pub fn with_builtin() -> Self {
        let parts = super::builtin::NAMES
            .iter()
            .filter_map(|name| super::builtin::find(name))
            .collect();
        Self { parts }
    }

    /// Load part definitions from a single RON file
    pub fn load_file(&mut self, path: &Path) -> Result<usize, PartDbError> {
        let content = fs::read_to_string(path)?;
        self.load_ron(&content)
    }

    /// Load part definitions from a RON string
    ///
    /// A part with the same id as one already loaded replaces it.
    pub fn load_ron(&mut self, content: &str) -> Result<usize, PartDbError> {
        let vendor_def: VendorDef = ron::from_str(content)?;
        let count = vendor_def.parts.len();

        for part_def in vendor_def.parts {
            let regions = part_def
                .memories
                .into_iter()
                .map(RegionDescriptor::try_from)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| match e {
                    PartDbError::Validation(msg) => {
                        PartDbError::Validation(alloc::format!("{}: {}", part_def.name, msg))
                    }
                    other => other,
                })?;
            let part = PartDescription {
                name: part_def.name,
                id: part_def.id,
                signature: part_def.signature,
                timing: part_def.timing,
                pgm_enable: part_def.pgm_enable,
                chip_erase: part_def.chip_erase,
                regions,
            };
            part.validate()
                .map_err(|e| PartDbError::Validation(alloc::format!("{}: {}", part.name, e)))?;

            self.parts.retain(|p| !p.id.eq_ignore_ascii_case(&part.id));
            self.parts.push(part);
        }

        Ok(count)
    }

    /// Load all RON files from a directory
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, PartDbError> {
        let mut total = 0;

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.extension().is_some_and(|ext| ext == "ron") {
                total += self.load_file(&path)?;
            }
        }

        Ok(total)
    }

    /// Get all parts in the database
    pub fn parts(&self) -> &[PartDescription] {
        &self.parts
    }

    /// Get the number of parts in the database
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Check if the database is empty
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Find a part by name or id (case-insensitive, exact)
    pub fn find(&self, name: &str) -> Option<&PartDescription> {
        self.parts.iter().find(|p| p.matches(name))
    }

    /// Find a part by its device signature
    pub fn find_by_signature(&self, signature: [u8; 3]) -> Option<&PartDescription> {
        self.parts.iter().find(|p| p.signature == signature)
    }

    /// Iterate over all parts
    pub fn iter(&self) -> impl Iterator<Item = &PartDescription> {
        self.parts.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ATMEGA328P: &str = r#"
    (
        vendor: "Microchip",
        parts: [
            (
                name: "ATmega328P",
                id: "m328p",
                signature: (0x1E, 0x95, 0x0F),
                timing: (chip_erase_delay_us: 9000),
                pgm_enable: "1 0 1 0 1 1 0 0  0 1 0 1 0 0 1 1  x x x x x x x x  x x x x x x x x",
                chip_erase: "1 0 1 0 1 1 0 0  1 0 0 0 0 0 0 0  x x x x x x x x  x x x x x x x x",
                memories: [
                    (
                        kind: Flash,
                        size: KiB(32),
                        page_size: 128,
                        min_write_delay: 4500,
                        max_write_delay: 4500,
                        mode: 0x41,
                        delay: 6,
                        ops: {
                            ReadLo: "0 0 1 0 0 0 0 0  0 0 a13 a12 a11 a10 a9 a8  a7 a6 a5 a4 a3 a2 a1 a0  o o o o o o o o",
                            ReadHi: "0 0 1 0 1 0 0 0  0 0 a13 a12 a11 a10 a9 a8  a7 a6 a5 a4 a3 a2 a1 a0  o o o o o o o o",
                        },
                    ),
                    (
                        kind: LFuse,
                        size: B(1),
                        min_write_delay: 4500,
                        ops: {
                            Read: "0 1 0 1 0 0 0 0  0 0 0 0 0 0 0 0  x x x x x x x x  o o o o o o o o",
                        },
                    ),
                ],
            ),
        ],
    )
    "#;

    #[test]
    fn test_load_ron() {
        let mut db = PartDatabase::new();
        let count = db.load_ron(ATMEGA328P).unwrap();
        assert_eq!(count, 1);
        assert_eq!(db.len(), 1);

        let part = db.find("m328p").unwrap();
        assert_eq!(part.name, "ATmega328P");
        assert_eq!(part.timing.stab_delay, 100);
        assert_eq!(part.timing.chip_erase_delay_us, 9000);

        let flash = part.region(MemoryKind::Flash).unwrap();
        assert_eq!(flash.size, 32 * 1024);
        assert_eq!(flash.unit_count(), 256);
        assert!(flash.op(Operation::ReadHi).is_some());
        assert!(flash.op(Operation::LoadExtAddr).is_none());

        let lfuse = part.region(MemoryKind::LFuse).unwrap();
        assert!(!lfuse.is_paged());
        assert_eq!(lfuse.max_write_delay_us, 4500);

        assert!(db.find_by_signature([0x1E, 0x95, 0x0F]).is_some());
    }

    #[test]
    fn test_reload_replaces() {
        let mut db = PartDatabase::with_builtin();
        let before = db.len();
        db.load_ron(ATMEGA328P).unwrap();
        db.load_ron(ATMEGA328P).unwrap();
        assert_eq!(db.len(), before + 1);
        assert!(db.find("ATmega2560").is_some());
    }

    #[test]
    fn test_bad_template_is_parse_error() {
        let bad = ATMEGA328P.replacen("0 0 1 0 0 0 0 0  0 0 a13", "0 0 1 0 0 0 0 0  0 0 q13", 1);
        let mut db = PartDatabase::new();
        assert!(matches!(db.load_ron(&bad), Err(PartDbError::Parse(_))));
    }

    #[test]
    fn test_bad_geometry_is_validation_error() {
        let bad = ATMEGA328P.replacen("page_size: 128", "page_size: 100", 1);
        let mut db = PartDatabase::new();
        assert!(matches!(db.load_ron(&bad), Err(PartDbError::Validation(_))));
    }

    #[test]
    fn test_shipped_parts_load() {
        let mut db = PartDatabase::with_builtin();
        let count = db
            .load_ron(include_str!("../../../../parts/microchip.ron"))
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(db.len(), 3);

        let m1280 = db.find_by_signature([0x1E, 0x97, 0x03]).unwrap();
        assert_eq!(m1280.id, "m1280");
        assert_eq!(m1280.region(MemoryKind::Flash).unwrap().unit_count(), 512);

        let m328p = db.find("ATmega328P").unwrap();
        let eeprom = m328p.region(MemoryKind::Eeprom).unwrap();
        assert_eq!(
            eeprom.require(Operation::WritePage).unwrap().build(0x3FC, 0),
            [0xC2, 0x03, 0xFC, 0x00]
        );
    }

    #[test]
    fn test_size_conversion() {
        assert_eq!(Size::B(3).to_bytes(), Some(3));
        assert_eq!(Size::KiB(256).to_bytes(), Some(262144));
        assert_eq!(Size::KiB(4 * 1024 * 1024 - 1).to_bytes(), Some(u32::MAX - 1023));
        assert_eq!(Size::KiB(4 * 1024 * 1024).to_bytes(), None);
        assert_eq!(Size::KiB(u32::MAX).to_bytes(), None);
    }

    #[test]
    fn test_oversized_region_is_validation_error() {
        let bad = ATMEGA328P.replacen("KiB(32)", "KiB(4194304)", 1);
        let mut db = PartDatabase::new();
        match db.load_ron(&bad) {
            Err(PartDbError::Validation(msg)) => assert!(msg.starts_with("ATmega328P: ")),
            other => panic!("expected a validation error, got {:?}", other),
        }
        assert!(db.is_empty());
    }
}
