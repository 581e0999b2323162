//! # Arenas
//!
//! An arena is a variable-length block inside a window. It is identified by its
//! byte offset and nothing else: `Arena` is a `Copy` wrapper around that offset,
//! and every header field is read from (and written to) the mapped bytes on
//! each access. Nothing about an arena is cached in memory, so an `Arena` can
//! never hold a stale copy of a header that another operation rewrote; after a
//! window is unmapped and mapped again the same offset names the same arena.
//!
//! ## Layout
//!
//! ```text
//! arena.offset                 arena.data_offset()
//! |                            |
//! v                            v
//! +----------------------------+----------+-----------------------+
//! | ArenaHeader (13 bytes)     | len: u32 | payload (len bytes)   |
//! +----------------------------+----------+-----------------------+
//!                              |<-------- capacity bytes -------->|
//! ```
//!
//! The content prefix and payload are only meaningful while the arena is Used.
//!
//! ## Chain Operations
//!
//! The arenas of a window form a doubly linked list ordered by offset, and
//! `offset_next`/`offset_prev` always mirror physical adjacency. The three
//! structural operations keep that true:
//!
//! - [`split`]: carve a Free remainder off the tail of an arena
//! - [`coalesce`]: merge a Free arena with all Free neighbors on both sides
//! - [`swap_adjacent`]: exchange two neighbors so the Used one moves down
//!
//! None of them touch the window's aggregate counters; `MappedWindow` adjusts
//! those from the values these functions return.

use std::fmt;

use eyre::{ensure, Result};

use super::headers::{ArenaHeader, ArenaStatus};
use super::window::MappedWindow;
use crate::config::{ARENA_HEADER_SIZE, CONTENT_PREFIX_SIZE, SPLIT_THRESHOLD};

const HEADER: u32 = ARENA_HEADER_SIZE as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Arena {
    offset: u32,
}

impl Arena {
    pub fn at(offset: u32) -> Self {
        Self { offset }
    }

    pub fn offset(self) -> u32 {
        self.offset
    }

    pub fn data_offset(self) -> u32 {
        self.offset + HEADER
    }

    pub fn header(self, window: &MappedWindow) -> Result<ArenaHeader> {
        let bytes = window.bytes(self.offset, ARENA_HEADER_SIZE)?;
        Ok(*ArenaHeader::from_bytes(bytes)?)
    }

    fn header_mut(self, window: &mut MappedWindow) -> Result<&mut ArenaHeader> {
        let bytes = window.bytes_mut(self.offset, ARENA_HEADER_SIZE)?;
        ArenaHeader::from_bytes_mut(bytes)
    }

    pub fn write_header(self, window: &mut MappedWindow, header: &ArenaHeader) -> Result<()> {
        header.write_to(window.bytes_mut(self.offset, ARENA_HEADER_SIZE)?)
    }

    pub fn is_free(self, window: &MappedWindow) -> Result<bool> {
        Ok(self.header(window)?.is_free())
    }

    pub fn capacity(self, window: &MappedWindow) -> Result<u32> {
        Ok(self.header(window)?.capacity())
    }

    pub fn total_len(self, window: &MappedWindow) -> Result<u32> {
        Ok(self.header(window)?.total_len())
    }

    pub fn next(self, window: &MappedWindow) -> Result<Option<Arena>> {
        let header = self.header(window)?;
        Ok(header.has_next().then(|| Arena::at(header.offset_next())))
    }

    pub fn prev(self, window: &MappedWindow) -> Result<Option<Arena>> {
        let header = self.header(window)?;
        Ok(header.has_prev().then(|| Arena::at(header.offset_prev())))
    }

    pub fn set_status(self, window: &mut MappedWindow, status: ArenaStatus) -> Result<()> {
        self.header_mut(window)?.set_status(status);
        Ok(())
    }

    pub fn set_capacity(self, window: &mut MappedWindow, capacity: u32) -> Result<()> {
        self.header_mut(window)?.set_capacity(capacity);
        Ok(())
    }

    pub fn set_offset_next(self, window: &mut MappedWindow, offset: u32) -> Result<()> {
        self.header_mut(window)?.set_offset_next(offset);
        Ok(())
    }

    pub fn set_offset_prev(self, window: &mut MappedWindow, offset: u32) -> Result<()> {
        self.header_mut(window)?.set_offset_prev(offset);
        Ok(())
    }

    pub fn has_data_space(self, window: &MappedWindow, len: usize) -> Result<bool> {
        Ok(self.capacity(window)? as usize >= len + CONTENT_PREFIX_SIZE)
    }

    /// Length-prefixed payload of a Used arena.
    pub fn content(self, window: &MappedWindow) -> Result<&[u8]> {
        let capacity = self.capacity(window)? as usize;
        let len = window.read_u32(self.data_offset())? as usize;

        ensure!(
            len + CONTENT_PREFIX_SIZE <= capacity,
            "arena at offset {} claims {} payload bytes but has capacity {}",
            self.offset,
            len,
            capacity
        );

        window.bytes(self.data_offset() + CONTENT_PREFIX_SIZE as u32, len)
    }

    pub fn write_content(self, window: &mut MappedWindow, data: &[u8]) -> Result<()> {
        let capacity = self.capacity(window)? as usize;

        ensure!(
            data.len() + CONTENT_PREFIX_SIZE <= capacity,
            "payload of {} bytes does not fit arena at offset {} with capacity {}",
            data.len(),
            self.offset,
            capacity
        );

        window.write_u32(self.data_offset(), data.len() as u32)?;
        window
            .bytes_mut(self.data_offset() + CONTENT_PREFIX_SIZE as u32, data.len())?
            .copy_from_slice(data);
        Ok(())
    }

    /// Number of bytes that carry information: the header alone for a Free
    /// arena, header plus prefix and payload for a Used one.
    fn live_len(self, window: &MappedWindow) -> Result<u32> {
        let header = self.header(window)?;
        if header.is_free() {
            return Ok(HEADER);
        }
        let len = window.read_u32(self.data_offset())?;
        Ok((HEADER + CONTENT_PREFIX_SIZE as u32 + len).min(header.total_len()))
    }

    pub fn describe(self, window: &MappedWindow) -> Result<String> {
        let header = self.header(window)?;
        Ok(format!(
            " - Arena, {}, Cap.={}, Off.={}, N={}, P={}",
            if header.is_free() { "-" } else { "X" },
            header.capacity(),
            self.offset,
            header.offset_next(),
            header.offset_prev()
        ))
    }
}

impl fmt::Display for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "arena@{}", self.offset)
    }
}

/// Links `arena -> next` in both directions. `None` terminates the chain.
fn link(window: &mut MappedWindow, arena: Arena, next: Option<Arena>) -> Result<()> {
    match next {
        Some(next) => {
            debug_assert_ne!(arena, next, "arena linked to itself");
            arena.set_offset_next(window, next.offset())?;
            next.set_offset_prev(window, arena.offset())
        }
        None => arena.set_offset_next(window, 0),
    }
}

/// Splits `arena` so that it keeps exactly `required` bytes of capacity and a
/// new Free arena takes the rest.
///
/// Nothing is carved off when the remainder would be smaller than
/// `SPLIT_THRESHOLD`; the caller then gets the whole arena. Returns the new
/// Free sibling, or `arena` itself when no split happened.
pub fn split(window: &mut MappedWindow, arena: Arena, required: u32) -> Result<Arena> {
    let header = arena.header(window)?;
    let capacity = header.capacity();

    ensure!(
        required <= capacity,
        "cannot split {} of capacity {} for {} bytes",
        arena,
        capacity,
        required
    );

    let remainder = capacity - required;
    if remainder < HEADER || remainder - HEADER < SPLIT_THRESHOLD {
        return Ok(arena);
    }

    let sibling = Arena::at(arena.offset() + HEADER + required);
    let old_next = arena.next(window)?;

    arena.set_capacity(window, required)?;
    sibling.write_header(
        window,
        &ArenaHeader::new(ArenaStatus::Free, remainder - HEADER, 0, arena.offset()),
    )?;

    link(window, sibling, old_next)?;
    link(window, arena, Some(sibling))?;

    Ok(sibling)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Coalesced {
    /// The Free arena covering the merged span.
    pub arena: Arena,
    /// How many neighbors were absorbed (each one frees a header).
    pub merged: u32,
}

/// Merges a Free arena with every directly following and then every directly
/// preceding Free arena. A Used arena is returned untouched.
pub fn coalesce(window: &mut MappedWindow, arena: Arena) -> Result<Coalesced> {
    if !arena.is_free(window)? {
        return Ok(Coalesced { arena, merged: 0 });
    }

    let mut capacity = arena.capacity(window)?;
    let mut merged = 0;

    let mut after = arena.next(window)?;
    while let Some(next) = after {
        let header = next.header(window)?;
        if !header.is_free() {
            break;
        }
        capacity += header.total_len();
        merged += 1;
        after = next.next(window)?;
    }

    let mut start = arena;
    while let Some(prev) = start.prev(window)? {
        let header = prev.header(window)?;
        if !header.is_free() {
            break;
        }
        capacity += header.total_len();
        merged += 1;
        start = prev;
    }

    if merged > 0 {
        start.set_capacity(window, capacity)?;
        link(window, start, after)?;
    }

    debug_assert_eq!(
        start.offset() + HEADER + capacity,
        after.map_or(window.len(), Arena::offset),
        "coalesced span does not end at the next arena"
    );

    Ok(Coalesced {
        arena: start,
        merged,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Swapped {
    /// The lower offset, now holding what used to be the higher arena.
    pub lo: Arena,
    /// The new position of what used to be the lower arena.
    pub hi: Arena,
}

fn are_adjacent(window: &MappedWindow, a: Arena, b: Arena) -> Result<bool> {
    let a_header = a.header(window)?;
    let b_header = b.header(window)?;
    Ok(a_header.offset_next() == b.offset() || b_header.offset_next() == a.offset())
}

/// Exchanges two physically adjacent arenas, headers and live content
/// included. The lower offset keeps its place in the chain and receives the
/// higher arena; the former lower arena is rewritten right behind it. All links
/// of both arenas and of their outer neighbors are fixed up.
pub fn swap_adjacent(window: &mut MappedWindow, a: Arena, b: Arena) -> Result<Swapped> {
    ensure!(
        are_adjacent(window, a, b)?,
        "cannot swap {} and {}: not adjacent",
        a,
        b
    );

    let (lo, hi) = if a.offset() < b.offset() { (a, b) } else { (b, a) };
    let lo_header = lo.header(window)?;
    let hi_header = hi.header(window)?;

    debug_assert_eq!(lo.offset() + lo_header.total_len(), hi.offset());

    let lo_bytes = window.bytes(lo.offset(), lo.live_len(window)? as usize)?.to_vec();
    let hi_bytes = window.bytes(hi.offset(), hi.live_len(window)? as usize)?.to_vec();

    let new_hi = Arena::at(lo.offset() + hi_header.total_len());

    window.bytes_mut(lo.offset(), hi_bytes.len())?.copy_from_slice(&hi_bytes);
    window.bytes_mut(new_hi.offset(), lo_bytes.len())?.copy_from_slice(&lo_bytes);

    lo.header_mut(window)?.set_offset_prev(lo_header.offset_prev());
    link(window, lo, Some(new_hi))?;

    let outer = hi_header.has_next().then(|| Arena::at(hi_header.offset_next()));
    link(window, new_hi, outer)?;

    debug_assert_eq!(lo.capacity(window)?, hi_header.capacity());
    debug_assert_eq!(new_hi.capacity(window)?, lo_header.capacity());

    Ok(Swapped { lo, hi: new_hi })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FIRST_ARENA_OFFSET, WINDOW_HEADER_SIZE};

    fn formatted(size: u32) -> MappedWindow {
        let mut window = MappedWindow::anonymous(0, size).unwrap();
        window.format().unwrap();
        window
    }

    fn capacities(window: &MappedWindow) -> Vec<(bool, u32)> {
        window
            .arenas()
            .map(|a| {
                let (_, h) = a.unwrap();
                (h.is_free(), h.capacity())
            })
            .collect()
    }

    #[test]
    fn split_carves_free_remainder() {
        let mut window = formatted(1024);
        let first = window.first_arena();
        let initial = first.capacity(&window).unwrap();

        let sibling = split(&mut window, first, 104).unwrap();

        assert_ne!(sibling, first);
        assert_eq!(sibling.offset(), FIRST_ARENA_OFFSET + 13 + 104);
        assert_eq!(first.capacity(&window).unwrap(), 104);
        assert_eq!(sibling.capacity(&window).unwrap(), initial - 104 - 13);
        assert!(sibling.is_free(&window).unwrap());
        assert_eq!(first.next(&window).unwrap(), Some(sibling));
        assert_eq!(sibling.prev(&window).unwrap(), Some(first));
        assert_eq!(sibling.next(&window).unwrap(), None);
        window.check_chain_links().unwrap();
    }

    #[test]
    fn split_below_threshold_keeps_whole_arena() {
        let mut window = formatted(1024);
        let first = window.first_arena();
        let capacity = first.capacity(&window).unwrap();

        // remainder after the header would be SPLIT_THRESHOLD - 1
        let required = capacity - HEADER - (SPLIT_THRESHOLD - 1);
        let result = split(&mut window, first, required).unwrap();

        assert_eq!(result, first);
        assert_eq!(first.capacity(&window).unwrap(), capacity);
    }

    #[test]
    fn split_exactly_at_threshold_splits() {
        let mut window = formatted(1024);
        let first = window.first_arena();
        let capacity = first.capacity(&window).unwrap();

        let required = capacity - HEADER - SPLIT_THRESHOLD;
        let sibling = split(&mut window, first, required).unwrap();

        assert_ne!(sibling, first);
        assert_eq!(sibling.capacity(&window).unwrap(), SPLIT_THRESHOLD);
        assert_eq!(
            first.capacity(&window).unwrap() + sibling.capacity(&window).unwrap(),
            capacity - HEADER
        );
    }

    #[test]
    fn split_rejects_oversized_request() {
        let mut window = formatted(256);
        let first = window.first_arena();

        assert!(split(&mut window, first, 10_000).is_err());
    }

    #[test]
    fn split_middle_arena_relinks_successor() {
        let mut window = formatted(1024);
        let first = window.first_arena();
        let second = split(&mut window, first, 100).unwrap();
        let third = split(&mut window, second, 200).unwrap();

        let middle = split(&mut window, second, 50).unwrap();

        assert_eq!(second.next(&window).unwrap(), Some(middle));
        assert_eq!(middle.next(&window).unwrap(), Some(third));
        assert_eq!(third.prev(&window).unwrap(), Some(middle));
        assert_eq!(middle.capacity(&window).unwrap(), 200 - 50 - 13);
    }

    #[test]
    fn coalesce_merges_both_directions() {
        let mut window = formatted(1024);
        let a = window.first_arena();
        let b = split(&mut window, a, 100).unwrap();
        let c = split(&mut window, b, 100).unwrap();
        let d = split(&mut window, c, 100).unwrap();
        for arena in [a, b, c] {
            arena.set_status(&mut window, ArenaStatus::Used).unwrap();
        }
        // a, b, c used; d free (tail)
        a.set_status(&mut window, ArenaStatus::Free).unwrap();
        c.set_status(&mut window, ArenaStatus::Free).unwrap();
        b.set_status(&mut window, ArenaStatus::Free).unwrap();

        let result = coalesce(&mut window, b).unwrap();

        assert_eq!(result.arena, a);
        assert_eq!(result.merged, 3);
        assert_eq!(
            a.capacity(&window).unwrap(),
            window.len() - WINDOW_HEADER_SIZE as u32 - HEADER
        );
        assert_eq!(a.next(&window).unwrap(), None);
        assert_eq!(capacities(&window).len(), 1);
    }

    #[test]
    fn coalesce_stops_at_used_neighbors() {
        let mut window = formatted(1024);
        let a = window.first_arena();
        let b = split(&mut window, a, 100).unwrap();
        let c = split(&mut window, b, 100).unwrap();
        a.set_status(&mut window, ArenaStatus::Used).unwrap();
        c.set_status(&mut window, ArenaStatus::Used).unwrap();

        let result = coalesce(&mut window, b).unwrap();

        assert_eq!(result, Coalesced { arena: b, merged: 0 });
        assert_eq!(capacities(&window).len(), 3);
    }

    #[test]
    fn coalesce_ignores_used_arena() {
        let mut window = formatted(512);
        let a = window.first_arena();
        a.set_status(&mut window, ArenaStatus::Used).unwrap();

        let result = coalesce(&mut window, a).unwrap();

        assert_eq!(result.merged, 0);
        assert!(!a.is_free(&window).unwrap());
    }

    #[test]
    fn swap_moves_used_arena_down() {
        let mut window = formatted(1024);
        let a = window.first_arena();
        let b = split(&mut window, a, 40).unwrap();
        let c = split(&mut window, b, 100).unwrap();
        b.set_status(&mut window, ArenaStatus::Used).unwrap();
        b.write_content(&mut window, b"hello arena").unwrap();
        c.set_status(&mut window, ArenaStatus::Used).unwrap();
        c.write_content(&mut window, b"tail").unwrap();
        // a free (40), b used (100), c used (rest)

        let swapped = swap_adjacent(&mut window, a, b).unwrap();

        assert_eq!(swapped.lo, a);
        assert_eq!(swapped.hi.offset(), a.offset() + 13 + 100);
        assert!(!swapped.lo.is_free(&window).unwrap());
        assert_eq!(swapped.lo.capacity(&window).unwrap(), 100);
        assert_eq!(swapped.lo.content(&window).unwrap(), b"hello arena");
        assert!(swapped.hi.is_free(&window).unwrap());
        assert_eq!(swapped.hi.capacity(&window).unwrap(), 40);
        assert_eq!(swapped.hi.next(&window).unwrap(), Some(c));
        assert_eq!(c.prev(&window).unwrap(), Some(swapped.hi));
        assert_eq!(c.content(&window).unwrap(), b"tail");
        window.check_chain_links().unwrap();
    }

    #[test]
    fn swap_is_order_independent() {
        let mut window = formatted(1024);
        let a = window.first_arena();
        let b = split(&mut window, a, 40).unwrap();
        b.set_status(&mut window, ArenaStatus::Used).unwrap();
        b.write_content(&mut window, b"xyz").unwrap();
        let _c = split(&mut window, b, 60).unwrap();

        let swapped = swap_adjacent(&mut window, b, a).unwrap();

        assert_eq!(swapped.lo, a);
        assert_eq!(swapped.lo.content(&window).unwrap(), b"xyz");
    }

    #[test]
    fn swap_rejects_non_adjacent() {
        let mut window = formatted(1024);
        let a = window.first_arena();
        let b = split(&mut window, a, 40).unwrap();
        let c = split(&mut window, b, 40).unwrap();

        let result = swap_adjacent(&mut window, a, c);

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("not adjacent"));
    }

    #[test]
    fn content_roundtrip_and_bounds() {
        let mut window = formatted(256);
        let a = window.first_arena();
        a.set_status(&mut window, ArenaStatus::Used).unwrap();

        a.write_content(&mut window, &[7u8; 50]).unwrap();
        assert_eq!(a.content(&window).unwrap(), &[7u8; 50][..]);

        let capacity = a.capacity(&window).unwrap() as usize;
        assert!(a.has_data_space(&window, capacity - 4).unwrap());
        assert!(!a.has_data_space(&window, capacity - 3).unwrap());
        assert!(a.write_content(&mut window, &vec![0u8; capacity]).is_err());
    }
}
