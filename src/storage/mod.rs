//! # Storage Module
//!
//! This module implements the arena allocator that sits directly on top of a
//! memory-mapped file. Objects are stored as opaque byte payloads inside
//! variable-length arenas, and the only "pointer" handed out is an
//! `ObjectHandle`: a `(window id, byte offset)` pair.
//!
//! ## Architecture Overview
//!
//! ```text
//! ArenaStore (crate::store)
//!     |
//!     v
//! WindowManager ---- bounded open set, LRU by usage counter, pin counts
//!     |
//!     +-- MappedFile ---- backing file (named or anonymous), grows by whole windows
//!     |
//!     +-- MappedWindow -- one mapped window: header + arena chain
//!             |
//!             +-- Arena -- (offset) view of one block: split / coalesce / swap
//! ```
//!
//! ## Window Layout
//!
//! ```text
//! +------------------------------+
//! | WindowHeader (12 bytes)      |  signature, free_space, max_contiguous_free
//! +------------------------------+
//! | ArenaHeader (13 bytes)       |  status, capacity, offset_next, offset_prev
//! | len: u32 | payload ...       |
//! +------------------------------+
//! | ArenaHeader                  |
//! | ...                          |
//! +------------------------------+
//! ```
//!
//! All multi-byte fields are little-endian and all offsets are relative to the
//! start of the window. The arena chain tiles the window body exactly.
//!
//! ## Safety Model
//!
//! Header fields are never written through raw pointers. Every access goes
//! through `MappedWindow::bytes`/`bytes_mut`, which bounds-check the requested
//! range, and headers are reinterpreted with `zerocopy` on those checked
//! slices. The only `unsafe` is the mapping call itself in `MappedFile`.
//!
//! A `MappedWindow` is reachable only through the `WindowManager`, and every
//! mutation happens while the manager's lock is held. Unmapping a window
//! requires `&mut WindowManager`, so no borrowed slice can outlive its mapping.
//!
//! ## Module Organization
//!
//! - `headers`: zerocopy window and arena headers
//! - `arena`: arena value type and chain operations
//! - `window`: one mapped window and its allocator
//! - `mmap`: the backing file
//! - `manager`: open/closed window bookkeeping and pinning
//! - `handle`: object handles and relocation reporting
//! - `error`: `StorageError`

mod arena;
mod error;
mod handle;
mod headers;
mod manager;
mod mmap;
mod window;

pub use arena::{coalesce, split, swap_adjacent, Arena, Coalesced, Swapped};
pub use error::StorageError;
pub use handle::{ObjectHandle, Relocation, RelocationSink};
pub use headers::{ArenaHeader, ArenaStatus, WindowHeader};
pub use manager::{WindowManager, WindowPin};
pub use mmap::{Backing, MappedFile};
pub use window::{
    required_capacity, ArenaMove, Arenas, ChainSummary, Defragmented, MappedWindow, Moves,
    WindowAllocation,
};
