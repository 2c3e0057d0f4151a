//! In-memory images of the target's memories
//!
//! A [`MemoryRegion`] mirrors one addressable memory of the target. It owns a
//! byte buffer plus dirty tracking at byte granularity and, for paged
//! memories, at page granularity, so that only what actually changed is
//! retransmitted.

mod bitset;
mod kind;
mod region;

pub use bitset::BitSet;
pub use kind::{MemoryKind, UnknownMemoryKind};
pub use region::{MemoryRegion, RegionDescriptor, ERASED};
