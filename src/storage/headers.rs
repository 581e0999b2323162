//! # Window and Arena Headers
//!
//! This module defines the two fixed-size structures that live inside a mapped
//! window. Both are read and written in place through `zerocopy`, so a header is
//! never copied out of the mapping unless a caller asks for a snapshot.
//!
//! ## Window Header (12 bytes, offset 0 of every window)
//!
//! ```text
//! Offset  Size  Field                Description
//! ------  ----  -------------------  ---------------------------------------
//! 0       4     signature            WINDOW_SIGNATURE once formatted
//! 4       4     free_space           Sum of the capacities of Free arenas
//! 8       4     max_contiguous_free  Largest single Free capacity
//! ```
//!
//! ## Arena Header (13 bytes, packed, at the arena's offset)
//!
//! ```text
//! Offset  Size  Field        Description
//! ------  ----  -----------  ----------------------------------------
//! 0       1     status       0 = Free, 1 = Used
//! 1       4     capacity     Payload capacity, header excluded
//! 5       4     offset_next  Window offset of the next arena (0 = none)
//! 9       4     offset_prev  Window offset of the previous arena (0 = none)
//! ```
//!
//! All integers are little-endian. Offsets are relative to the window start;
//! since the window header occupies offset 0, no arena can ever live there and
//! 0 is free to mean "none".

use eyre::{ensure, Result};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{ARENA_HEADER_SIZE, WINDOW_HEADER_SIZE, WINDOW_SIGNATURE};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaStatus {
    Free = 0,
    Used = 1,
}

impl ArenaStatus {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(ArenaStatus::Free),
            1 => Some(ArenaStatus::Used),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct WindowHeader {
    signature: U32,
    free_space: U32,
    max_contiguous_free: U32,
}

const _: () = assert!(std::mem::size_of::<WindowHeader>() == WINDOW_HEADER_SIZE);

impl WindowHeader {
    pub fn formatted(free_space: u32) -> Self {
        Self {
            signature: U32::new(WINDOW_SIGNATURE),
            free_space: U32::new(free_space),
            max_contiguous_free: U32::new(free_space),
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= WINDOW_HEADER_SIZE,
            "buffer too small for WindowHeader: {} < {}",
            data.len(),
            WINDOW_HEADER_SIZE
        );

        Self::ref_from_bytes(&data[..WINDOW_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read WindowHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= WINDOW_HEADER_SIZE,
            "buffer too small for WindowHeader: {} < {}",
            data.len(),
            WINDOW_HEADER_SIZE
        );

        Self::mut_from_bytes(&mut data[..WINDOW_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read WindowHeader: {:?}", e))
    }

    pub fn is_valid(&self) -> bool {
        self.signature.get() == WINDOW_SIGNATURE
    }

    /// A window that was never formatted reads back as all zeroes, because
    /// growing the backing file zero-fills the new range.
    pub fn is_blank(&self) -> bool {
        self.as_bytes().iter().all(|&b| b == 0)
    }

    pub fn signature(&self) -> u32 {
        self.signature.get()
    }

    pub fn free_space(&self) -> u32 {
        self.free_space.get()
    }

    pub fn set_free_space(&mut self, bytes: u32) {
        self.free_space = U32::new(bytes);
    }

    pub fn max_contiguous_free(&self) -> u32 {
        self.max_contiguous_free.get()
    }

    pub fn set_max_contiguous_free(&mut self, bytes: u32) {
        self.max_contiguous_free = U32::new(bytes);
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ArenaHeader {
    status: u8,
    capacity: U32,
    offset_next: U32,
    offset_prev: U32,
}

const _: () = assert!(std::mem::size_of::<ArenaHeader>() == ARENA_HEADER_SIZE);

impl ArenaHeader {
    pub fn new(status: ArenaStatus, capacity: u32, offset_next: u32, offset_prev: u32) -> Self {
        Self {
            status: status as u8,
            capacity: U32::new(capacity),
            offset_next: U32::new(offset_next),
            offset_prev: U32::new(offset_prev),
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= ARENA_HEADER_SIZE,
            "buffer too small for ArenaHeader: {} < {}",
            data.len(),
            ARENA_HEADER_SIZE
        );

        Self::ref_from_bytes(&data[..ARENA_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read ArenaHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= ARENA_HEADER_SIZE,
            "buffer too small for ArenaHeader: {} < {}",
            data.len(),
            ARENA_HEADER_SIZE
        );

        Self::mut_from_bytes(&mut data[..ARENA_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read ArenaHeader: {:?}", e))
    }

    pub fn write_to(&self, data: &mut [u8]) -> Result<()> {
        ensure!(
            data.len() >= ARENA_HEADER_SIZE,
            "buffer too small for ArenaHeader: {} < {}",
            data.len(),
            ARENA_HEADER_SIZE
        );

        data[..ARENA_HEADER_SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn status(&self) -> Option<ArenaStatus> {
        ArenaStatus::from_byte(self.status)
    }

    pub fn raw_status(&self) -> u8 {
        self.status
    }

    pub fn is_free(&self) -> bool {
        self.status == ArenaStatus::Free as u8
    }

    pub fn is_used(&self) -> bool {
        self.status == ArenaStatus::Used as u8
    }

    pub fn set_status(&mut self, status: ArenaStatus) {
        self.status = status as u8;
    }

    pub fn capacity(&self) -> u32 {
        self.capacity.get()
    }

    pub fn set_capacity(&mut self, capacity: u32) {
        self.capacity = U32::new(capacity);
    }

    pub fn offset_next(&self) -> u32 {
        self.offset_next.get()
    }

    pub fn set_offset_next(&mut self, offset: u32) {
        self.offset_next = U32::new(offset);
    }

    pub fn offset_prev(&self) -> u32 {
        self.offset_prev.get()
    }

    pub fn set_offset_prev(&mut self, offset: u32) {
        self.offset_prev = U32::new(offset);
    }

    pub fn has_next(&self) -> bool {
        self.offset_next.get() != 0
    }

    pub fn has_prev(&self) -> bool {
        self.offset_prev.get() != 0
    }

    /// Bytes the arena occupies in the window, header included.
    pub fn total_len(&self) -> u32 {
        self.capacity.get().saturating_add(ARENA_HEADER_SIZE as u32)
    }
}
