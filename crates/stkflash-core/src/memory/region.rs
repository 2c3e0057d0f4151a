//! Memory region buffers with byte and page dirty tracking

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use core::ops::Range;

use super::{BitSet, MemoryKind};
use crate::error::{Error, Result};
use crate::isp::{InstructionTemplate, Operation};

/// Value of an erased flash/EEPROM cell
pub const ERASED: u8 = 0xFF;

/// Fixed description of one memory of a part
///
/// A `page_size` of 0 means the memory is written one byte at a time.
/// Write delays are in microseconds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionDescriptor {
    /// Which memory this is
    pub kind: MemoryKind,
    /// Capacity in bytes
    pub size: u32,
    /// Page size in bytes, 0 if unpaged
    pub page_size: u32,
    /// Shortest time a write needs to complete
    pub min_write_delay_us: u32,
    /// Longest time a write may need to complete
    pub max_write_delay_us: u32,
    /// STK500 programming mode byte (bit 0 = page mode)
    pub mode: u8,
    /// STK500 write delay byte, in milliseconds
    pub delay: u8,
    /// Values read back while a cell is still busy
    pub readback: [u8; 2],
    /// Instruction templates this memory supports
    pub ops: BTreeMap<Operation, InstructionTemplate>,
}

impl RegionDescriptor {
    /// Descriptor with no timing, poll or instruction data
    pub fn new(kind: MemoryKind, size: u32, page_size: u32) -> Self {
        Self {
            kind,
            size,
            page_size,
            min_write_delay_us: 0,
            max_write_delay_us: 0,
            mode: 0,
            delay: 0,
            readback: [0, 0],
            ops: BTreeMap::new(),
        }
    }

    /// Whether writes go through the page buffer
    pub fn is_paged(&self) -> bool {
        self.page_size > 0
    }

    /// Bytes per write unit: the page size, or 1 for unpaged memories
    pub fn unit_size(&self) -> u32 {
        self.page_size.max(1)
    }

    /// Number of write units (pages, or bytes when unpaged)
    pub fn unit_count(&self) -> u32 {
        self.size.div_ceil(self.unit_size())
    }

    /// Write unit that contains `addr`
    pub fn unit_of(&self, addr: u32) -> u32 {
        addr / self.unit_size()
    }

    /// Byte range covered by write unit `unit`, clipped to the memory size
    pub fn unit_range(&self, unit: u32) -> Range<usize> {
        let start = unit.saturating_mul(self.unit_size()).min(self.size);
        let end = start.saturating_add(self.unit_size()).min(self.size);
        start as usize..end as usize
    }

    /// Template for `op`, if this memory has one
    pub fn op(&self, op: Operation) -> Option<&InstructionTemplate> {
        self.ops.get(&op)
    }

    /// Template for `op`, or a [`Error::MissingOperation`]
    pub fn require(&self, op: Operation) -> Result<&InstructionTemplate> {
        self.op(op)
            .ok_or(Error::MissingOperation { kind: self.kind, op })
    }

    /// Check the geometry is usable
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 || (self.is_paged() && self.size % self.page_size != 0) {
            return Err(Error::InvalidRegion(self.kind));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct RegionBuffers {
    data: Vec<u8>,
    dirty: BitSet,
    page_dirty: Option<BitSet>,
    /// Units the device has confirmed writing this session
    written: BitSet,
    /// Units whose clean bytes are known to match the device
    loaded: BitSet,
}

/// In-memory image of one target memory
///
/// Buffers exist only between [`init`](Self::init) and
/// [`dispose`](Self::dispose). Every buffer access before `init` fails with
/// [`Error::RegionNotInitialized`].
#[derive(Debug)]
pub struct MemoryRegion {
    desc: RegionDescriptor,
    buffers: Option<RegionBuffers>,
}

impl MemoryRegion {
    /// Create a region without buffers
    pub fn new(desc: RegionDescriptor) -> Self {
        Self { desc, buffers: None }
    }

    /// The fixed description
    pub fn descriptor(&self) -> &RegionDescriptor {
        &self.desc
    }

    /// Which memory this is
    pub fn kind(&self) -> MemoryKind {
        self.desc.kind
    }

    /// Capacity in bytes
    pub fn size(&self) -> u32 {
        self.desc.size
    }

    /// Page size in bytes, 0 if unpaged
    pub fn page_size(&self) -> u32 {
        self.desc.page_size
    }

    /// Whether writes go through the page buffer
    pub fn is_paged(&self) -> bool {
        self.desc.is_paged()
    }

    /// Allocate buffers, filled with [`ERASED`]. Does nothing if allocated.
    pub fn init(&mut self) {
        if self.buffers.is_some() {
            return;
        }
        let size = self.desc.size as usize;
        let units = self.desc.unit_count() as usize;
        self.buffers = Some(RegionBuffers {
            data: vec![ERASED; size],
            dirty: BitSet::new(size),
            page_dirty: self.desc.is_paged().then(|| BitSet::new(units)),
            written: BitSet::new(units),
            loaded: BitSet::new(units),
        });
    }

    /// Release buffers. Does nothing if not allocated.
    pub fn dispose(&mut self) {
        self.buffers = None;
    }

    /// Whether buffers are allocated
    pub fn is_initialized(&self) -> bool {
        self.buffers.is_some()
    }

    fn buffers(&self) -> Result<&RegionBuffers> {
        self.buffers
            .as_ref()
            .ok_or(Error::RegionNotInitialized(self.desc.kind))
    }

    fn buffers_mut(&mut self) -> Result<&mut RegionBuffers> {
        self.buffers
            .as_mut()
            .ok_or(Error::RegionNotInitialized(self.desc.kind))
    }

    fn check(&self, addr: u32) -> Result<usize> {
        if addr >= self.desc.size {
            return Err(Error::AddressOutOfBounds {
                kind: self.desc.kind,
                addr,
            });
        }
        Ok(addr as usize)
    }

    fn check_unit(&self, unit: u32) -> Result<usize> {
        if unit >= self.desc.unit_count() {
            return Err(Error::AddressOutOfBounds {
                kind: self.desc.kind,
                addr: unit.saturating_mul(self.desc.unit_size()),
            });
        }
        Ok(unit as usize)
    }

    /// Address of the first byte of write unit `unit`
    pub fn unit_address(&self, unit: u32) -> Result<u32> {
        let unit = self.check_unit(unit)?;
        Ok(unit as u32 * self.desc.unit_size())
    }

    /// Buffered byte at `addr`
    pub fn get(&self, addr: u32) -> Result<u8> {
        let index = self.check(addr)?;
        Ok(self.buffers()?.data[index])
    }

    /// Store `value` at `addr`
    ///
    /// Returns whether the buffer changed. An unchanged value leaves every
    /// dirty bit alone.
    pub fn set(&mut self, addr: u32, value: u8) -> Result<bool> {
        let index = self.check(addr)?;
        let unit = self.desc.unit_of(addr) as usize;
        let bufs = self.buffers_mut()?;
        if bufs.data[index] == value {
            return Ok(false);
        }
        bufs.data[index] = value;
        bufs.dirty.set(index);
        if let Some(pages) = bufs.page_dirty.as_mut() {
            pages.set(unit);
        }
        Ok(true)
    }

    /// Whether the byte at `addr` awaits writing
    pub fn is_byte_dirty(&self, addr: u32) -> Result<bool> {
        let index = self.check(addr)?;
        Ok(self.buffers()?.dirty.get(index))
    }

    /// Whether the page holding `addr` awaits writing
    ///
    /// For unpaged memories this is the byte's own dirty bit.
    pub fn is_page_dirty(&self, addr: u32) -> Result<bool> {
        let index = self.check(addr)?;
        let bufs = self.buffers()?;
        Ok(match bufs.page_dirty.as_ref() {
            Some(pages) => pages.get(self.desc.unit_of(addr) as usize),
            None => bufs.dirty.get(index),
        })
    }

    /// Force write unit `unit` to be rewritten even if unchanged
    pub fn mark_page_dirty(&mut self, unit: u32) -> Result<()> {
        let unit = self.check_unit(unit)?;
        let bufs = self.buffers_mut()?;
        match bufs.page_dirty.as_mut() {
            Some(pages) => pages.set(unit),
            None => bufs.dirty.set(unit),
        }
        Ok(())
    }

    /// Merge bytes read from the device starting at `addr`
    ///
    /// Clean bytes take the device value. Dirty bytes keep the pending value
    /// and lose their dirty bit if the device already holds it. Units fully
    /// covered by `bytes` are marked loaded.
    pub fn load(&mut self, addr: u32, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let start = self.check(addr)?;
        self.check(addr + bytes.len() as u32 - 1)?;
        let desc = &self.desc;
        let bufs = self
            .buffers
            .as_mut()
            .ok_or(Error::RegionNotInitialized(desc.kind))?;

        for (offset, &device) in bytes.iter().enumerate() {
            let index = start + offset;
            if !bufs.dirty.get(index) {
                bufs.data[index] = device;
            } else if bufs.data[index] == device {
                bufs.dirty.clear(index);
            }
        }

        let end = start + bytes.len();
        let first = desc.unit_of(start as u32);
        let last = desc.unit_of(end as u32 - 1);
        for unit in first..=last {
            let range = desc.unit_range(unit);
            if range.start >= start && range.end <= end {
                bufs.loaded.set(unit as usize);
            }
            if let Some(pages) = bufs.page_dirty.as_mut() {
                if !bufs.dirty.any_in(range.start, range.end) {
                    pages.clear(unit as usize);
                }
            }
        }
        Ok(())
    }

    /// Record that the device confirmed writing page `unit`
    pub fn confirm_page(&mut self, unit: u32) -> Result<()> {
        let unit = self.check_unit(unit)?;
        let range = self.desc.unit_range(unit as u32);
        let bufs = self.buffers_mut()?;
        bufs.dirty.clear_range(range.start, range.end);
        if let Some(pages) = bufs.page_dirty.as_mut() {
            pages.clear(unit);
        }
        bufs.written.set(unit);
        bufs.loaded.set(unit);
        Ok(())
    }

    /// Record that the device confirmed writing the byte at `addr`
    pub fn confirm_byte(&mut self, addr: u32) -> Result<()> {
        let index = self.check(addr)?;
        if self.desc.is_paged() {
            let unit = self.desc.unit_of(addr) as usize;
            let range = self.desc.unit_range(unit as u32);
            let bufs = self.buffers_mut()?;
            bufs.dirty.clear(index);
            if let Some(pages) = bufs.page_dirty.as_mut() {
                if !bufs.dirty.any_in(range.start, range.end) {
                    pages.clear(unit);
                }
            }
            return Ok(());
        }
        let bufs = self.buffers_mut()?;
        bufs.dirty.clear(index);
        bufs.written.set(index);
        bufs.loaded.set(index);
        Ok(())
    }

    /// Write units that need writing, ascending
    pub fn dirty_pages(&self) -> Result<Vec<u32>> {
        let bufs = self.buffers()?;
        let set = bufs.page_dirty.as_ref().unwrap_or(&bufs.dirty);
        Ok(set.iter_ones().map(|u| u as u32).collect())
    }

    /// Number of bytes whose buffered value differs from the device
    pub fn dirty_bytes(&self) -> Result<usize> {
        Ok(self.buffers()?.dirty.count())
    }

    /// Whether anything awaits writing
    pub fn has_changes(&self) -> bool {
        self.buffers.as_ref().is_some_and(|bufs| {
            bufs.dirty.any() || bufs.page_dirty.as_ref().is_some_and(BitSet::any)
        })
    }

    /// Highest write unit that awaits writing
    pub fn max_dirty_page(&self) -> Option<u32> {
        let bufs = self.buffers.as_ref()?;
        let set = bufs.page_dirty.as_ref().unwrap_or(&bufs.dirty);
        set.last_one().map(|u| u as u32)
    }

    /// Write units confirmed written this session, ascending
    pub fn written_pages(&self) -> Result<Vec<u32>> {
        Ok(self
            .buffers()?
            .written
            .iter_ones()
            .map(|u| u as u32)
            .collect())
    }

    /// Whether write unit `unit` mirrors the device
    pub fn is_loaded(&self, unit: u32) -> Result<bool> {
        let unit = self.check_unit(unit)?;
        Ok(self.buffers()?.loaded.get(unit))
    }

    /// Forget what is known about the device content
    pub fn invalidate(&mut self) {
        if let Some(bufs) = self.buffers.as_mut() {
            bufs.loaded.clear_all();
        }
    }

    /// Account for the device having been erased
    ///
    /// Every byte that is not [`ERASED`] in the buffer becomes dirty and
    /// every unit is known to match the device otherwise.
    pub fn note_erased(&mut self) {
        let desc = &self.desc;
        let Some(bufs) = self.buffers.as_mut() else {
            return;
        };
        for (index, &value) in bufs.data.iter().enumerate() {
            if value != ERASED {
                bufs.dirty.set(index);
            }
        }
        for unit in 0..desc.unit_count() {
            bufs.loaded.set(unit as usize);
            if let Some(pages) = bufs.page_dirty.as_mut() {
                let range = desc.unit_range(unit);
                if bufs.dirty.any_in(range.start, range.end) {
                    pages.set(unit as usize);
                }
            }
        }
        bufs.written.clear_all();
    }

    /// The buffered image
    pub fn data(&self) -> Result<&[u8]> {
        Ok(&self.buffers()?.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paged() -> MemoryRegion {
        let mut region = MemoryRegion::new(RegionDescriptor::new(MemoryKind::Flash, 32, 8));
        region.init();
        region
    }

    fn fuse() -> MemoryRegion {
        let mut region = MemoryRegion::new(RegionDescriptor::new(MemoryKind::LFuse, 1, 0));
        region.init();
        region
    }

    #[test]
    fn test_uninitialized() {
        let region = MemoryRegion::new(RegionDescriptor::new(MemoryKind::Flash, 32, 8));
        assert_eq!(
            region.get(0),
            Err(Error::RegionNotInitialized(MemoryKind::Flash))
        );
        assert!(!region.has_changes());
    }

    #[test]
    fn test_init_dispose_idempotent() {
        let mut region = paged();
        region.set(3, 0x12).unwrap();
        region.init();
        assert_eq!(region.get(3), Ok(0x12));
        region.dispose();
        region.dispose();
        assert!(!region.is_initialized());
        region.init();
        assert_eq!(region.get(3), Ok(ERASED));
    }

    #[test]
    fn test_set_unchanged_is_noop() {
        let mut region = paged();
        assert_eq!(region.set(9, ERASED), Ok(false));
        assert!(!region.is_byte_dirty(9).unwrap());
        assert!(!region.is_page_dirty(9).unwrap());
        assert!(!region.has_changes());
    }

    #[test]
    fn test_set_marks_byte_and_page() {
        let mut region = paged();
        assert_eq!(region.set(9, 0x42), Ok(true));
        assert!(region.is_byte_dirty(9).unwrap());
        assert!(!region.is_byte_dirty(8).unwrap());
        assert!(region.is_page_dirty(15).unwrap());
        assert!(!region.is_page_dirty(16).unwrap());
        assert_eq!(region.dirty_pages().unwrap(), vec![1]);
        assert_eq!(region.max_dirty_page(), Some(1));

        // Setting the same value again changes nothing
        assert_eq!(region.set(9, 0x42), Ok(false));
        assert_eq!(region.dirty_bytes().unwrap(), 1);
    }

    #[test]
    fn test_bounds() {
        let mut region = paged();
        assert_eq!(
            region.set(32, 0),
            Err(Error::AddressOutOfBounds {
                kind: MemoryKind::Flash,
                addr: 32
            })
        );
        assert!(region.get(32).is_err());
        assert!(region.mark_page_dirty(4).is_err());
        assert!(region.load(30, &[0, 0, 0]).is_err());
    }

    #[test]
    fn test_unit_address() {
        let region = MemoryRegion::new(RegionDescriptor::new(MemoryKind::Flash, 32, 8));
        assert_eq!(region.unit_address(3), Ok(24));
        assert_eq!(
            region.unit_address(4),
            Err(Error::AddressOutOfBounds {
                kind: MemoryKind::Flash,
                addr: 32
            })
        );
        assert_eq!(
            region.unit_address(u32::MAX / 2),
            Err(Error::AddressOutOfBounds {
                kind: MemoryKind::Flash,
                addr: u32::MAX
            })
        );
    }

    #[test]
    fn test_load_merges_device_content() {
        let mut region = paged();
        region.set(1, 0x11).unwrap();
        region.set(2, 0x22).unwrap();
        region.load(0, &[0xA0, 0x11, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7]).unwrap();

        // Clean byte takes the device value
        assert_eq!(region.get(0), Ok(0xA0));
        // Pending byte that the device already holds is no longer dirty
        assert!(!region.is_byte_dirty(1).unwrap());
        // Pending byte that differs stays pending
        assert_eq!(region.get(2), Ok(0x22));
        assert!(region.is_byte_dirty(2).unwrap());
        assert!(region.is_loaded(0).unwrap());
        assert!(!region.is_loaded(1).unwrap());
    }

    #[test]
    fn test_load_clears_page_when_nothing_differs() {
        let mut region = paged();
        region.set(4, 0x44).unwrap();
        let mut device = [ERASED; 8];
        device[4] = 0x44;
        region.load(0, &device).unwrap();
        assert!(!region.has_changes());
    }

    #[test]
    fn test_confirm_page() {
        let mut region = paged();
        region.set(17, 1).unwrap();
        region.set(18, 2).unwrap();
        region.confirm_page(2).unwrap();
        assert!(!region.has_changes());
        assert_eq!(region.written_pages().unwrap(), vec![2]);
        assert!(region.is_loaded(2).unwrap());
    }

    #[test]
    fn test_forced_page_dirty() {
        let mut region = paged();
        region.set(25, 0).unwrap();
        for page in 0..=region.max_dirty_page().unwrap() {
            region.mark_page_dirty(page).unwrap();
        }
        assert_eq!(region.dirty_pages().unwrap(), vec![0, 1, 2, 3]);
        // Byte-level state is untouched
        assert_eq!(region.dirty_bytes().unwrap(), 1);
    }

    #[test]
    fn test_unpaged_region() {
        let mut region = fuse();
        assert!(!region.is_paged());
        region.set(0, 0xE2).unwrap();
        assert!(region.is_page_dirty(0).unwrap());
        assert_eq!(region.dirty_pages().unwrap(), vec![0]);
        region.confirm_byte(0).unwrap();
        assert!(!region.has_changes());
        assert_eq!(region.written_pages().unwrap(), vec![0]);
    }

    #[test]
    fn test_note_erased() {
        let mut region = paged();
        region.load(0, &[0u8; 32]).unwrap();
        region.set(0, 0x55).unwrap();
        region.confirm_page(0).unwrap();

        region.note_erased();
        // Page 0 holds 0x55 and zeros which are now gone from the device
        assert!(region.is_page_dirty(0).unwrap());
        assert!(region.is_byte_dirty(0).unwrap());
        assert!(region.written_pages().unwrap().is_empty());
        assert!(region.is_loaded(3).unwrap());
    }

    #[test]
    fn test_descriptor_geometry() {
        let desc = RegionDescriptor::new(MemoryKind::Eeprom, 4096, 8);
        assert_eq!(desc.unit_count(), 512);
        assert_eq!(desc.unit_of(17), 2);
        assert_eq!(desc.unit_range(2), 16..24);
        assert!(desc.validate().is_ok());
        assert!(RegionDescriptor::new(MemoryKind::Eeprom, 100, 8)
            .validate()
            .is_err());
        assert_eq!(
            desc.require(Operation::Read),
            Err(Error::MissingOperation {
                kind: MemoryKind::Eeprom,
                op: Operation::Read
            })
        );
    }
}
