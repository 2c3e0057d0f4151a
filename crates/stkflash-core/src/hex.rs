//! Intel HEX firmware images
//!
//! Images are parsed completely before anything touches a [`MemoryRegion`],
//! so a bad line late in a file never leaves a half-applied image behind.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt::Write as _;

use crate::error::{HexError, HexErrorKind, Result};
use crate::memory::{MemoryRegion, ERASED};

/// Bytes per data record written by [`encode`]
pub const RECORD_DATA_LEN: usize = 16;

/// Intel HEX record types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// 00: payload bytes at the record address
    Data,
    /// 01: end of file
    EndOfFile,
    /// 02: segment base for following records (value << 4)
    ExtendedSegmentAddress,
    /// 03: CS:IP start address (ignored)
    StartSegmentAddress,
    /// 04: upper 16 address bits for following records
    ExtendedLinearAddress,
    /// 05: EIP start address (ignored)
    StartLinearAddress,
}

impl RecordType {
    /// Decode a record type byte
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => Self::Data,
            0x01 => Self::EndOfFile,
            0x02 => Self::ExtendedSegmentAddress,
            0x03 => Self::StartSegmentAddress,
            0x04 => Self::ExtendedLinearAddress,
            0x05 => Self::StartLinearAddress,
            _ => return None,
        })
    }

    /// Record type byte
    pub fn code(self) -> u8 {
        match self {
            Self::Data => 0x00,
            Self::EndOfFile => 0x01,
            Self::ExtendedSegmentAddress => 0x02,
            Self::StartSegmentAddress => 0x03,
            Self::ExtendedLinearAddress => 0x04,
            Self::StartLinearAddress => 0x05,
        }
    }
}

/// One parsed line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRecord {
    /// 16-bit load offset
    pub address: u16,
    /// What the record means
    pub record_type: RecordType,
    /// Payload bytes
    pub data: Vec<u8>,
    /// Checksum byte as carried by the line
    pub checksum: u8,
}

impl HexRecord {
    /// Number of payload bytes
    pub fn byte_count(&self) -> usize {
        self.data.len()
    }

    /// Value of an address record's 16-bit payload
    fn address_value(&self) -> core::result::Result<u32, HexErrorKind> {
        match self.data.as_slice() {
            [hi, lo] => Ok(u32::from(*hi) << 8 | u32::from(*lo)),
            _ => Err(HexErrorKind::BadAddressRecord),
        }
    }
}

fn hex_byte(pair: &[u8]) -> core::result::Result<u8, HexErrorKind> {
    let digit = |c: u8| (c as char).to_digit(16).ok_or(HexErrorKind::InvalidDigit);
    Ok((digit(pair[0])? << 4 | digit(pair[1])?) as u8)
}

/// Parse a single record line
///
/// Trailing whitespace (including a CR from CRLF files) is ignored.
pub fn parse_line(line: &str) -> core::result::Result<HexRecord, HexErrorKind> {
    let line = line.trim_end();
    let digits = line
        .strip_prefix(':')
        .ok_or(HexErrorKind::MissingMarker)?
        .as_bytes();

    // count, address (2), type and checksum
    if digits.len() < 10 {
        return Err(HexErrorKind::Truncated);
    }
    let count = hex_byte(&digits[0..2])? as usize;
    let expected_len = (count + 5) * 2;
    if digits.len() < expected_len {
        return Err(HexErrorKind::Truncated);
    }
    if digits.len() > expected_len {
        return Err(HexErrorKind::TrailingData);
    }

    let bytes = digits
        .chunks_exact(2)
        .map(hex_byte)
        .collect::<core::result::Result<Vec<u8>, _>>()?;

    let (checksum, body) = bytes.split_last().ok_or(HexErrorKind::Truncated)?;
    let sum = body.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    if sum.wrapping_add(*checksum) != 0 {
        return Err(HexErrorKind::ChecksumMismatch {
            found: *checksum,
            expected: sum.wrapping_neg(),
        });
    }

    let record_type =
        RecordType::from_u8(body[3]).ok_or(HexErrorKind::UnsupportedRecordType(body[3]))?;

    Ok(HexRecord {
        address: u16::from_be_bytes([body[1], body[2]]),
        record_type,
        data: body[4..].to_vec(),
        checksum: *checksum,
    })
}

/// Contiguous bytes from one data record, at an absolute address
///
/// A segment never extends past the 32-bit address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// 1-based source line
    pub line: usize,
    /// Absolute address of the first byte
    pub address: u32,
    /// Payload
    pub data: Vec<u8>,
}

impl Segment {
    /// One past the last address
    pub fn end(&self) -> u64 {
        u64::from(self.address) + self.data.len() as u64
    }

    fn new(line: usize, address: u32, data: Vec<u8>) -> core::result::Result<Self, HexError> {
        let segment = Segment {
            line,
            address,
            data,
        };
        if segment.end() > ADDRESS_SPACE {
            return Err(HexError {
                line,
                kind: HexErrorKind::AddressOutOfRange { address },
            });
        }
        Ok(segment)
    }
}

/// One past the highest 32-bit address
const ADDRESS_SPACE: u64 = 1 << 32;

/// A fully parsed firmware image
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HexImage {
    segments: Vec<Segment>,
    records: usize,
}

impl HexImage {
    /// Parse a whole image
    ///
    /// Blank lines are skipped. Parsing stops at the end-of-file record; an
    /// image without one is rejected.
    pub fn parse(text: &str) -> core::result::Result<Self, HexError> {
        let mut image = HexImage::default();
        let mut base = 0u32;
        let mut last_line = 0;

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            last_line = line;
            if raw.trim().is_empty() {
                continue;
            }
            let at = |kind| HexError { line, kind };
            let record = parse_line(raw).map_err(at)?;
            image.records += 1;

            match record.record_type {
                RecordType::Data => {
                    if !record.data.is_empty() {
                        let address = base + u32::from(record.address);
                        image.segments.push(Segment::new(line, address, record.data)?);
                    }
                }
                RecordType::EndOfFile => return Ok(image),
                RecordType::ExtendedSegmentAddress => {
                    base = record.address_value().map_err(at)? << 4;
                }
                RecordType::ExtendedLinearAddress => {
                    base = record.address_value().map_err(at)? << 16;
                }
                RecordType::StartSegmentAddress | RecordType::StartLinearAddress => {
                    log::debug!("line {}: ignoring start address record", line);
                }
            }
        }

        Err(HexError {
            line: last_line.max(1),
            kind: HexErrorKind::MissingEndOfFile,
        })
    }

    /// Image of a raw binary placed at `address`
    ///
    /// Fails when the data runs past the 32-bit address space.
    pub fn from_binary(address: u32, data: &[u8]) -> core::result::Result<Self, HexError> {
        let segments = if data.is_empty() {
            Vec::new()
        } else {
            vec![Segment::new(0, address, data.to_vec())?]
        };
        Ok(Self {
            segments,
            records: 0,
        })
    }

    /// Data segments in file order
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Number of records up to and including end-of-file
    pub fn record_count(&self) -> usize {
        self.records
    }

    /// Total payload bytes
    pub fn byte_count(&self) -> usize {
        self.segments.iter().map(|s| s.data.len()).sum()
    }

    /// Whether the image carries no data at all
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Every (address, byte) pair, in file order
    pub fn bytes(&self) -> impl Iterator<Item = (u32, u8)> + '_ {
        self.segments.iter().flat_map(|s| {
            s.data
                .iter()
                .enumerate()
                .map(move |(i, b)| (s.address + i as u32, *b))
        })
    }

    /// Check every byte lands below `size`
    pub fn check_fits(&self, size: u32) -> core::result::Result<(), HexError> {
        match self.segments.iter().find(|s| s.end() > u64::from(size)) {
            Some(s) => Err(HexError {
                line: s.line,
                kind: HexErrorKind::AddressOutOfRange {
                    address: s.address.max(size),
                },
            }),
            None => Ok(()),
        }
    }

    /// Store the image into `region`, marking changed bytes dirty
    ///
    /// The region is allocated if needed. Nothing is stored unless the whole
    /// image fits.
    pub fn apply(&self, region: &mut MemoryRegion) -> Result<IngestStats> {
        self.check_fits(region.size())?;
        region.init();

        let mut stats = IngestStats {
            records: self.records,
            ..IngestStats::default()
        };
        for (addr, value) in self.bytes() {
            if region.set(addr, value)? {
                stats.changed += 1;
            }
            stats.bytes += 1;
            stats.lowest = Some(stats.lowest.map_or(addr, |l| l.min(addr)));
            stats.highest = Some(stats.highest.map_or(addr, |h| h.max(addr)));
        }
        Ok(stats)
    }
}

/// Summary of one ingestion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Records read, including the end-of-file record
    pub records: usize,
    /// Data bytes stored
    pub bytes: usize,
    /// Bytes whose buffered value changed
    pub changed: usize,
    /// Lowest address written
    pub lowest: Option<u32>,
    /// Highest address written
    pub highest: Option<u32>,
}

/// Parse `text` and store it into `region`
pub fn ingest(region: &mut MemoryRegion, text: &str) -> Result<IngestStats> {
    HexImage::parse(text)?.apply(region)
}

fn push_record(out: &mut String, address: u16, record_type: RecordType, data: &[u8]) {
    let [hi, lo] = address.to_be_bytes();
    let mut sum = (data.len() as u8)
        .wrapping_add(hi)
        .wrapping_add(lo)
        .wrapping_add(record_type.code());
    let _ = write!(out, ":{:02X}{:04X}{:02X}", data.len(), address, record_type.code());
    for b in data {
        sum = sum.wrapping_add(*b);
        let _ = write!(out, "{:02X}", b);
    }
    let _ = writeln!(out, "{:02X}", sum.wrapping_neg());
}

/// Encode `data` (starting at address 0) as Intel HEX
///
/// With `skip_erased`, records holding only [`ERASED`] bytes are left out.
pub fn encode(data: &[u8], skip_erased: bool) -> String {
    let mut out = String::new();
    let mut upper = 0u16;

    for (index, chunk) in data.chunks(RECORD_DATA_LEN).enumerate() {
        if skip_erased && chunk.iter().all(|&b| b == ERASED) {
            continue;
        }
        let addr = (index * RECORD_DATA_LEN) as u32;
        let chunk_upper = (addr >> 16) as u16;
        if chunk_upper != upper {
            push_record(
                &mut out,
                0,
                RecordType::ExtendedLinearAddress,
                &chunk_upper.to_be_bytes(),
            );
            upper = chunk_upper;
        }
        push_record(&mut out, addr as u16, RecordType::Data, chunk);
    }
    push_record(&mut out, 0, RecordType::EndOfFile, &[]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryKind, RegionDescriptor};
    use crate::Error;

    fn region(size: u32) -> MemoryRegion {
        let mut r = MemoryRegion::new(RegionDescriptor::new(MemoryKind::Flash, size, 256));
        r.init();
        r
    }

    #[test]
    fn test_parse_data_line() {
        let record = parse_line(":10010000214601360121470136007EFE09D2190140").unwrap();
        assert_eq!(record.byte_count(), 16);
        assert_eq!(record.address, 0x0100);
        assert_eq!(record.record_type, RecordType::Data);
        assert_eq!(&record.data[..4], &[0x21, 0x46, 0x01, 0x36]);
        assert_eq!(record.checksum, 0x40);
    }

    #[test]
    fn test_parse_tolerates_crlf_and_lowercase() {
        let record = parse_line(":0300300002337a1e\r").unwrap();
        assert_eq!(record.data, vec![0x02, 0x33, 0x7A]);
    }

    #[test]
    fn test_parse_rejects() {
        assert_eq!(parse_line("10010000"), Err(HexErrorKind::MissingMarker));
        assert_eq!(parse_line(":1001"), Err(HexErrorKind::Truncated));
        assert_eq!(
            parse_line(":10010000214601360121470136007EFE09D21901"),
            Err(HexErrorKind::Truncated)
        );
        assert_eq!(
            parse_line(":10010000214601360121470136007EFE09D219014000"),
            Err(HexErrorKind::TrailingData)
        );
        assert_eq!(
            parse_line(":1001000021460136012147013600GEFE09D2190140"),
            Err(HexErrorKind::InvalidDigit)
        );
        assert_eq!(
            parse_line(":10010000214601360121470136007EFE09D2190141"),
            Err(HexErrorKind::ChecksumMismatch {
                found: 0x41,
                expected: 0x40
            })
        );
        assert_eq!(
            parse_line(":00000006FA"),
            Err(HexErrorKind::UnsupportedRecordType(0x06))
        );
    }

    #[test]
    fn test_image_address_records() {
        let text = "\
:020000040001F9
:02000000AABB99
:020000021000EC
:02000400CCDD51
:0400000500000000F7
:00000001FF
";
        let image = HexImage::parse(text).unwrap();
        assert_eq!(image.record_count(), 6);
        let bytes: Vec<_> = image.bytes().collect();
        assert_eq!(
            bytes,
            vec![
                (0x1_0000, 0xAA),
                (0x1_0001, 0xBB),
                (0x1_0004, 0xCC),
                (0x1_0005, 0xDD)
            ]
        );
    }

    #[test]
    fn test_image_errors_carry_line() {
        let err = HexImage::parse("\n:02000000AABB98\n:00000001FF\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(matches!(err.kind, HexErrorKind::ChecksumMismatch { .. }));

        let err = HexImage::parse(":02000000AABB99\n").unwrap_err();
        assert_eq!(
            err,
            HexError {
                line: 1,
                kind: HexErrorKind::MissingEndOfFile
            }
        );

        let err = HexImage::parse(":0100000402F9\n:00000001FF\n").unwrap_err();
        assert_eq!(err.kind, HexErrorKind::BadAddressRecord);
    }

    #[test]
    fn test_lines_after_eof_are_ignored() {
        let image = HexImage::parse(":02000000AABB99\n:00000001FF\ngarbage\n").unwrap();
        assert_eq!(image.byte_count(), 2);
    }

    #[test]
    fn test_ingest_marks_dirty() {
        let mut r = region(512);
        let stats = ingest(&mut r, ":10010000214601360121470136007EFE09D2190140\n:00000001FF\n").unwrap();
        assert_eq!(stats.bytes, 16);
        assert_eq!(stats.changed, 16);
        assert_eq!(stats.lowest, Some(0x100));
        assert_eq!(stats.highest, Some(0x10F));
        assert_eq!(r.get(0x100), Ok(0x21));
        assert!(r.is_byte_dirty(0x100).unwrap());
        assert!(r.is_page_dirty(0x100).unwrap());
        assert!(!r.is_page_dirty(0).unwrap());
    }

    #[test]
    fn test_ingest_out_of_range_applies_nothing() {
        let mut r = region(256);
        let text = ":02000000AABB99\n:0200FF00CCDD56\n:00000001FF\n";
        let err = ingest(&mut r, text).unwrap_err();
        assert_eq!(
            err,
            Error::Hex(HexError {
                line: 2,
                kind: HexErrorKind::AddressOutOfRange { address: 0x100 }
            })
        );
        assert!(!r.has_changes());
    }

    #[test]
    fn test_from_binary() {
        let image = HexImage::from_binary(0x10, &[1, 2, 3]).unwrap();
        assert_eq!(image.record_count(), 0);
        assert_eq!(image.byte_count(), 3);
        assert_eq!(image.check_fits(0x12).unwrap_err().line, 0);

        let mut r = region(256);
        let stats = image.apply(&mut r).unwrap();
        assert_eq!(stats.lowest, Some(0x10));
        assert_eq!(stats.highest, Some(0x12));
        assert!(HexImage::from_binary(0, &[]).unwrap().is_empty());

        let err = HexImage::from_binary(u32::MAX, &[1, 2]).unwrap_err();
        assert_eq!(err.kind, HexErrorKind::AddressOutOfRange { address: u32::MAX });
        assert!(HexImage::from_binary(u32::MAX, &[1]).is_ok());
    }

    #[test]
    fn test_segment_past_address_space() {
        let text = ":02000004FFFFFC\n:02FFFF00AABB9B\n:00000001FF\n";
        let err = HexImage::parse(text).unwrap_err();
        assert_eq!(
            err,
            HexError {
                line: 2,
                kind: HexErrorKind::AddressOutOfRange {
                    address: 0xFFFF_FFFF
                }
            }
        );

        // the last byte of the address space is still reachable
        let image = HexImage::parse(":02000004FFFFFC\n:01FFFF00AA57\n:00000001FF\n").unwrap();
        assert_eq!(image.bytes().collect::<Vec<_>>(), [(0xFFFF_FFFF, 0xAA)]);
        let err = image.check_fits(0x4_0000).unwrap_err();
        assert_eq!(err.kind, HexErrorKind::AddressOutOfRange { address: 0xFFFF_FFFF });
    }

    #[test]
    fn test_encode_round_trip() {
        let mut data = vec![ERASED; 0x1_0000 + 64];
        for (i, b) in data.iter_mut().enumerate().step_by(7) {
            *b = (i % 251) as u8;
        }
        let text = encode(&data, false);
        assert!(text.contains(":020000040001F9"));
        assert!(text.ends_with(":00000001FF\n"));

        let mut r = region(data.len() as u32);
        ingest(&mut r, &text).unwrap();
        assert_eq!(r.data().unwrap(), &data[..]);
    }

    #[test]
    fn test_encode_skip_erased() {
        let mut data = vec![ERASED; 64];
        data[40] = 0;
        let text = encode(&data, true);
        assert_eq!(text.lines().count(), 2);
        assert!(text.starts_with(":10002000"));
    }
}
