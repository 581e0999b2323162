//! # Mapped Windows
//!
//! A `MappedWindow` is one fixed-size mapping of the backing file. Its bytes
//! start with a `WindowHeader` followed by a chain of arenas that tiles the
//! rest of the window exactly:
//!
//! ```text
//! +----------------+-----------+-----------+-----+-----------+
//! | WindowHeader   | Arena 0   | Arena 1   | ... | Arena n   |
//! | (12 bytes)     | hdr+cap   | hdr+cap   |     | hdr+cap   |
//! +----------------+-----------+-----------+-----+-----------+
//! 0               12                                   window_size
//! ```
//!
//! All raw access goes through [`MappedWindow::bytes`] and
//! [`MappedWindow::bytes_mut`], which bounds-check the requested range against
//! the mapping. No raw address ever leaves this type.
//!
//! ## Aggregate Counters
//!
//! The header caches `free_space` (sum of Free capacities) and
//! `max_contiguous_free` (largest Free capacity). `free_space` is maintained
//! incrementally by allocate/deallocate. `max_contiguous_free` goes stale as
//! soon as the largest Free arena is consumed; it is then recomputed by a full
//! chain scan the next time it is read, before the window is unmapped, and
//! after every defragmentation pass. Defragmentation always recomputes both
//! counters from scratch, which is where any drift is corrected.
//!
//! ## Free Arena Hint
//!
//! The window remembers the Free arena left over by its last split. Sequential
//! allocation then takes the hint without walking the chain. The hint is only
//! a guess: it is verified to still be a chain boundary before use.

use std::fmt;

use eyre::{ensure, eyre, Result, WrapErr};
use memmap2::MmapMut;
use smallvec::SmallVec;

use super::arena::{coalesce, split, swap_adjacent, Arena, Coalesced};
use super::headers::{ArenaHeader, ArenaStatus, WindowHeader};
use crate::config::{
    ARENA_HEADER_SIZE, CONTENT_PREFIX_SIZE, FIRST_ARENA_OFFSET, MIN_ARENA_CAPACITY,
    WINDOW_HEADER_SIZE,
};

const HEADER: u32 = ARENA_HEADER_SIZE as u32;

/// Capacity an arena needs to hold `payload_len` bytes.
pub fn required_capacity(payload_len: usize) -> u32 {
    ((payload_len + CONTENT_PREFIX_SIZE) as u32).max(MIN_ARENA_CAPACITY)
}

/// A Used arena moved from one offset to another within the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaMove {
    pub from: u32,
    pub to: u32,
}

pub type Moves = SmallVec<[ArenaMove; 4]>;

#[derive(Debug, Default)]
pub struct WindowAllocation {
    /// `None` when the window cannot hold the payload even after compaction.
    pub arena: Option<Arena>,
    pub moves: Moves,
}

#[derive(Debug, Default)]
pub struct Defragmented {
    /// The single Free arena at the end of the window, if any space is left.
    pub trailing: Option<Arena>,
    pub moves: Moves,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChainSummary {
    pub arenas: u32,
    pub used: u32,
    pub free: u32,
    pub free_bytes: u32,
    pub used_bytes: u32,
    pub max_free: u32,
    pub adjacent_free_pairs: u32,
}

pub struct MappedWindow {
    id: u32,
    mmap: MmapMut,
    last_free: Option<Arena>,
    max_stale: bool,
}

impl MappedWindow {
    pub fn new(id: u32, mmap: MmapMut) -> Self {
        Self {
            id,
            mmap,
            last_free: None,
            max_stale: false,
        }
    }

    /// A window over private anonymous memory, not backed by any file.
    pub fn anonymous(id: u32, size: u32) -> Result<Self> {
        let mmap = MmapMut::map_anon(size as usize)
            .wrap_err_with(|| format!("failed to map {} anonymous bytes", size))?;
        Ok(Self::new(id, mmap))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn len(&self) -> u32 {
        self.mmap.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn bytes(&self, offset: u32, len: usize) -> Result<&[u8]> {
        let start = offset as usize;
        let end = start.saturating_add(len);
        ensure!(
            end <= self.mmap.len(),
            "range {}..{} out of bounds for window {} of {} bytes",
            start,
            end,
            self.id,
            self.mmap.len()
        );
        Ok(&self.mmap[start..end])
    }

    pub fn bytes_mut(&mut self, offset: u32, len: usize) -> Result<&mut [u8]> {
        let start = offset as usize;
        let end = start.saturating_add(len);
        ensure!(
            end <= self.mmap.len(),
            "range {}..{} out of bounds for window {} of {} bytes",
            start,
            end,
            self.id,
            self.mmap.len()
        );
        Ok(&mut self.mmap[start..end])
    }

    pub fn read_u32(&self, offset: u32) -> Result<u32> {
        let b = self.bytes(offset, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn write_u32(&mut self, offset: u32, value: u32) -> Result<()> {
        self.bytes_mut(offset, 4)?
            .copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn header(&self) -> Result<&WindowHeader> {
        WindowHeader::from_bytes(&self.mmap)
    }

    fn header_mut(&mut self) -> Result<&mut WindowHeader> {
        WindowHeader::from_bytes_mut(&mut self.mmap)
    }

    pub fn is_formatted(&self) -> bool {
        self.header().map(WindowHeader::is_valid).unwrap_or(false)
    }

    pub fn is_blank(&self) -> bool {
        self.header().map(WindowHeader::is_blank).unwrap_or(false)
    }

    /// Writes a fresh header and a single Free arena spanning the whole body.
    pub fn format(&mut self) -> Result<()> {
        let capacity = self
            .len()
            .checked_sub(WINDOW_HEADER_SIZE as u32 + HEADER)
            .ok_or_else(|| eyre!("window {} too small to format", self.id))?;

        *self.header_mut()? = WindowHeader::formatted(capacity);

        let first = self.first_arena();
        first.write_header(self, &ArenaHeader::new(ArenaStatus::Free, capacity, 0, 0))?;

        self.last_free = Some(first);
        self.max_stale = false;

        tracing::debug!(window = self.id, capacity, "formatted window");
        Ok(())
    }

    pub fn free_space(&self) -> Result<u32> {
        Ok(self.header()?.free_space())
    }

    fn set_free_space(&mut self, bytes: u32) -> Result<()> {
        self.header_mut()?.set_free_space(bytes);
        Ok(())
    }

    pub fn max_contiguous_free(&mut self) -> Result<u32> {
        if self.max_stale {
            self.recompute_free_space()?;
        }
        Ok(self.header()?.max_contiguous_free())
    }

    pub fn first_arena(&self) -> Arena {
        Arena::at(FIRST_ARENA_OFFSET)
    }

    pub fn last_free_hint(&self) -> Option<Arena> {
        self.last_free
    }

    pub fn arenas(&self) -> Arenas<'_> {
        Arenas {
            window: self,
            next: Some(FIRST_ARENA_OFFSET),
            min_offset: FIRST_ARENA_OFFSET,
        }
    }

    /// True when `arena` starts an arena of the current chain.
    ///
    /// Walks the chain from the first arena, so header-like bytes inside a
    /// payload never qualify.
    pub fn is_arena_boundary(&self, arena: Arena) -> Result<bool> {
        let offset = arena.offset();
        if offset < FIRST_ARENA_OFFSET || offset >= self.len() {
            return Ok(false);
        }

        for item in self.arenas() {
            let (current, _) = item?;
            if current.offset() >= offset {
                return Ok(current.offset() == offset);
            }
        }
        Ok(false)
    }

    /// The Used arena at `offset`, or `None` if there is none.
    pub fn used_arena_at(&self, offset: u32) -> Result<Option<Arena>> {
        let arena = Arena::at(offset);
        if !self.is_arena_boundary(arena)? {
            return Ok(None);
        }
        Ok(arena.header(self)?.is_used().then_some(arena))
    }

    /// First Used arena whose offset is at or after `offset`.
    pub fn next_used_from(&self, offset: u32) -> Result<Option<Arena>> {
        for item in self.arenas() {
            let (arena, header) = item?;
            if arena.offset() >= offset && header.is_used() {
                return Ok(Some(arena));
            }
        }
        Ok(None)
    }

    fn find_free_arena(&mut self, required: u32) -> Result<Option<Arena>> {
        if let Some(hint) = self.last_free {
            if self.is_arena_boundary(hint)? {
                let header = hint.header(self)?;
                if header.is_free() && header.capacity() >= required {
                    return Ok(Some(hint));
                }
            } else {
                self.last_free = None;
            }
        }

        for item in self.arenas() {
            let (arena, header) = item?;
            if header.is_free() && header.capacity() >= required {
                return Ok(Some(arena));
            }
        }
        Ok(None)
    }

    /// Stores `payload` in this window.
    ///
    /// Tries the free-arena hint, then the first Free arena that fits, then
    /// compacts the window once and retries. Any arenas moved by compaction are
    /// reported even when the allocation still fails.
    pub fn allocate(&mut self, payload: &[u8]) -> Result<WindowAllocation> {
        self.allocate_with(payload, true)
    }

    /// Like [`allocate`](Self::allocate), but never moves a Used arena. Returns
    /// `None` when no single Free arena can hold the payload.
    pub fn allocate_in_place(&mut self, payload: &[u8]) -> Result<Option<Arena>> {
        Ok(self.allocate_with(payload, false)?.arena)
    }

    fn allocate_with(&mut self, payload: &[u8], compact: bool) -> Result<WindowAllocation> {
        let required = required_capacity(payload.len());
        let mut moves = Moves::new();

        if required > self.free_space()? {
            return Ok(WindowAllocation { arena: None, moves });
        }

        let arena = match self.find_free_arena(required)? {
            Some(arena) => arena,
            None if !compact => return Ok(WindowAllocation { arena: None, moves }),
            None => {
                let defragmented = self.defragment()?;
                moves = defragmented.moves;
                match defragmented.trailing {
                    Some(trailing) if trailing.capacity(self)? >= required => trailing,
                    _ => return Ok(WindowAllocation { arena: None, moves }),
                }
            }
        };

        let capacity = arena.capacity(self)?;
        let sibling = split(self, arena, required)?;
        arena.set_status(self, ArenaStatus::Used)?;
        arena.write_content(self, payload)?;

        let mut free_space = self.free_space()? - capacity;
        if sibling != arena {
            free_space += sibling.capacity(self)?;
            self.last_free = Some(sibling);
        } else if self.last_free == Some(arena) {
            self.last_free = None;
        }
        self.set_free_space(free_space)?;

        if capacity >= self.header()?.max_contiguous_free() {
            self.max_stale = true;
        }

        tracing::trace!(
            window = self.id,
            offset = arena.offset(),
            len = payload.len(),
            "allocated arena"
        );

        Ok(WindowAllocation {
            arena: Some(arena),
            moves,
        })
    }

    /// Frees a Used arena and merges it with its Free neighbors. Returns the
    /// Free arena covering the merged span; a Free arena is returned as is.
    pub fn deallocate(&mut self, arena: Arena) -> Result<Arena> {
        let header = arena.header(self)?;
        if header.is_free() {
            return Ok(arena);
        }

        arena.set_status(self, ArenaStatus::Free)?;
        let coalesced = coalesce(self, arena)?;
        self.absorb_free(header.capacity(), coalesced)?;

        tracing::trace!(
            window = self.id,
            offset = arena.offset(),
            merged = coalesced.merged,
            "deallocated arena"
        );

        Ok(coalesced.arena)
    }

    /// Rewrites a Used arena's payload in place. Returns `false` without
    /// touching anything when the payload does not fit. Excess capacity is
    /// split off and returned to the free space.
    pub fn overwrite(&mut self, arena: Arena, payload: &[u8]) -> Result<bool> {
        let header = arena.header(self)?;
        ensure!(header.is_used(), "cannot overwrite free {}", arena);

        let required = required_capacity(payload.len());
        if required > header.capacity() {
            return Ok(false);
        }

        arena.write_content(self, payload)?;

        let sibling = split(self, arena, required)?;
        if sibling != arena {
            let freed = sibling.capacity(self)?;
            let coalesced = coalesce(self, sibling)?;
            self.absorb_free(freed, coalesced)?;
        }

        Ok(true)
    }

    /// Accounts for `freed` capacity that became Free and was merged into
    /// `coalesced`, and refreshes the hint if it no longer names a Free arena.
    fn absorb_free(&mut self, freed: u32, coalesced: Coalesced) -> Result<()> {
        let free_space = self.free_space()? + freed + HEADER * coalesced.merged;
        self.set_free_space(free_space)?;

        let merged = coalesced.arena;
        let merged_capacity = merged.capacity(self)?;
        if !self.max_stale && merged_capacity > self.header()?.max_contiguous_free() {
            self.header_mut()?.set_max_contiguous_free(merged_capacity);
        }

        let span = merged.offset()..merged.offset() + HEADER + merged_capacity;
        let stale = match self.last_free {
            None => true,
            Some(hint) => {
                (span.contains(&hint.offset()) && hint != merged)
                    || !self.is_arena_boundary(hint)?
                    || !hint.is_free(self)?
            }
        };
        if stale {
            self.last_free = Some(merged);
        }
        Ok(())
    }

    /// Moves every Used arena to the front of the window, leaving one Free
    /// arena at the end, then recomputes both aggregate counters.
    pub fn defragment(&mut self) -> Result<Defragmented> {
        let mut moves = Moves::new();
        let mut last = self.first_arena();

        while let Some(current) = last.next(self)? {
            if !last.is_free(self)? {
                last = current;
                continue;
            }

            if current.is_free(self)? {
                last = coalesce(self, last)?.arena;
                continue;
            }

            let swapped = swap_adjacent(self, last, current)?;
            moves.push(ArenaMove {
                from: current.offset(),
                to: swapped.lo.offset(),
            });
            last = swapped.hi;
        }

        let trailing = if last.is_free(self)? { Some(last) } else { None };
        self.last_free = trailing;
        self.recompute_free_space()?;

        tracing::debug!(
            window = self.id,
            moved = moves.len(),
            free_space = self.header()?.free_space(),
            "defragmented window"
        );

        Ok(Defragmented { trailing, moves })
    }

    /// Full chain scan that rewrites both aggregate counters.
    pub fn recompute_free_space(&mut self) -> Result<()> {
        let mut total = 0u32;
        let mut max = 0u32;

        for item in self.arenas() {
            let (_, header) = item?;
            if header.is_free() {
                total += header.capacity();
                max = max.max(header.capacity());
            }
        }

        let header = self.header_mut()?;
        header.set_free_space(total);
        header.set_max_contiguous_free(max);
        self.max_stale = false;
        Ok(())
    }

    /// Walks the chain forwards and backwards and verifies that it tiles the
    /// window body exactly with consistent links.
    pub fn check_chain_links(&self) -> Result<ChainSummary> {
        let len = self.len() as u64;
        let mut summary = ChainSummary::default();
        let mut order = Vec::new();
        let mut expected = FIRST_ARENA_OFFSET;
        let mut prev = 0u32;
        let mut prev_free = false;

        loop {
            ensure!(
                expected as u64 + ARENA_HEADER_SIZE as u64 <= len,
                "window {}: arena header at {} overruns window of {} bytes",
                self.id,
                expected,
                len
            );

            let arena = Arena::at(expected);
            let header = arena.header(self)?;

            ensure!(
                header.status().is_some(),
                "window {}: arena at {} has invalid status byte {:#04x}",
                self.id,
                expected,
                header.raw_status()
            );
            ensure!(
                header.offset_prev() == prev,
                "window {}: arena at {} links prev to {} but follows {}",
                self.id,
                expected,
                header.offset_prev(),
                prev
            );

            let end = expected as u64 + header.total_len() as u64;
            ensure!(
                end <= len,
                "window {}: arena at {} with capacity {} overruns window of {} bytes",
                self.id,
                expected,
                header.capacity(),
                len
            );

            summary.arenas += 1;
            if header.is_free() {
                summary.free += 1;
                summary.free_bytes += header.capacity();
                summary.max_free = summary.max_free.max(header.capacity());
                if prev_free {
                    summary.adjacent_free_pairs += 1;
                }
            } else {
                summary.used += 1;
                summary.used_bytes += header.capacity();
            }
            prev_free = header.is_free();
            order.push(expected);

            if end == len {
                ensure!(
                    !header.has_next(),
                    "window {}: last arena at {} links next to {}",
                    self.id,
                    expected,
                    header.offset_next()
                );
                break;
            }

            ensure!(
                header.offset_next() as u64 == end,
                "window {}: arena at {} links next to {} but ends at {}",
                self.id,
                expected,
                header.offset_next(),
                end
            );

            prev = expected;
            expected = end as u32;
        }

        let mut cursor = Some(Arena::at(order[order.len() - 1]));
        for &offset in order.iter().rev() {
            let arena = cursor.ok_or_else(|| {
                eyre!(
                    "window {}: backward walk ended before arena at {}",
                    self.id,
                    offset
                )
            })?;
            ensure!(
                arena.offset() == offset,
                "window {}: backward walk reached {} instead of {}",
                self.id,
                arena.offset(),
                offset
            );
            cursor = arena.prev(self)?;
        }
        ensure!(
            cursor.is_none(),
            "window {}: backward walk did not stop at the first arena",
            self.id
        );

        Ok(summary)
    }

    /// [`check_chain_links`](Self::check_chain_links) plus the allocator
    /// invariants: valid signature, maximal coalescing and accurate counters.
    pub fn check_chain(&self) -> Result<ChainSummary> {
        let header = self.header()?;
        ensure!(
            header.is_valid(),
            "window {}: bad signature {:#010x}",
            self.id,
            header.signature()
        );

        let summary = self.check_chain_links()?;

        ensure!(
            summary.adjacent_free_pairs == 0,
            "window {}: {} pairs of adjacent free arenas",
            self.id,
            summary.adjacent_free_pairs
        );
        ensure!(
            header.free_space() == summary.free_bytes,
            "window {}: header free_space {} but chain holds {} free bytes",
            self.id,
            header.free_space(),
            summary.free_bytes
        );
        if !self.max_stale {
            ensure!(
                header.max_contiguous_free() == summary.max_free,
                "window {}: header max_contiguous_free {} but largest free arena is {}",
                self.id,
                header.max_contiguous_free(),
                summary.max_free
            );
        }

        Ok(summary)
    }

    /// Brings the counters up to date before the window is unmapped.
    pub fn prepare_unmap(&mut self) -> Result<()> {
        if self.max_stale {
            self.recompute_free_space()?;
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.mmap
            .flush()
            .wrap_err_with(|| format!("failed to flush window {}", self.id))
    }
}

impl fmt::Debug for MappedWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedWindow")
            .field("id", &self.id)
            .field("len", &self.mmap.len())
            .field("last_free", &self.last_free)
            .field("max_stale", &self.max_stale)
            .finish()
    }
}

impl fmt::Display for MappedWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = self.header().map_err(|_| fmt::Error)?;
        writeln!(
            f,
            "View, ID={}, maxFree={}, Free={}",
            self.id,
            header.max_contiguous_free(),
            header.free_space()
        )?;

        for item in self.arenas() {
            let (arena, _) = item.map_err(|_| fmt::Error)?;
            let line = arena.describe(self).map_err(|_| fmt::Error)?;
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}

/// Forward iterator over a window's arena chain.
pub struct Arenas<'a> {
    window: &'a MappedWindow,
    next: Option<u32>,
    min_offset: u32,
}

impl Iterator for Arenas<'_> {
    type Item = Result<(Arena, ArenaHeader)>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.next.take()?;

        if offset < self.min_offset {
            return Some(Err(eyre!(
                "window {}: chain loops back to {}",
                self.window.id,
                offset
            )));
        }

        let arena = Arena::at(offset);
        match arena.header(self.window) {
            Ok(header) => {
                self.min_offset = offset + 1;
                self.next = header.has_next().then(|| header.offset_next());
                Some(Ok((arena, header)))
            }
            Err(e) => Some(Err(e)),
        }
    }
}
