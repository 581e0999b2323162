//! # viewarena - Memory-Mapped Arena Allocator
//!
//! viewarena stores variable-length byte payloads inside a memory-mapped file
//! and hands back an `ObjectHandle` instead of a pointer. It is the storage core
//! of a cache: the caller keeps its own key to handle index, and the allocator
//! never looks inside a payload.
//!
//! - **Bounded working set**: the file is mapped one fixed-size window at a
//!   time, and at most `max_open_windows` windows are mapped at once
//! - **Persistent**: a named backing file survives restarts; `entries()`
//!   rebuilds the caller's index after reopening
//! - **Bounds-checked layout**: headers are `zerocopy` views over checked
//!   slices of the mapping, never raw pointer casts
//!
//! ## Quick Start
//!
//! ```ignore
//! use viewarena::ArenaStore;
//!
//! let store = ArenaStore::builder()
//!     .path("./cache.arena")
//!     .window_size(1024 * 1024)
//!     .max_open_windows(4)
//!     .open()?;
//!
//! let handle = store.allocate(b"cached bytes")?;
//! assert_eq!(store.fetch(handle)?, b"cached bytes");
//! store.free(handle)?;
//! ```
//!
//! ## Relocation
//!
//! Compacting a window moves objects and changes their handles. Plain
//! `allocate` only compacts when a [`RelocationSink`] was given to the builder;
//! `allocate_relocating` always may, and returns the moves it made:
//!
//! ```ignore
//! let allocation = store.allocate_relocating(&payload)?;
//! for moved in &allocation.relocations {
//!     index.retarget(moved.from, moved.to);
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │      Public API (ArenaStore)        │
//! ├─────────────────────────────────────┤
//! │  WindowManager (open set, pinning)  │
//! ├──────────────────┬──────────────────┤
//! │   MappedWindow   │    MappedFile    │
//! ├──────────────────┴──────────────────┤
//! │  Arena chain (split/coalesce/swap)  │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! cache.arena
//! ├── window 0   [header | arena | arena | ... ]
//! ├── window 1   [header | arena | ... ]
//! └── ...
//! ```
//!
//! ## Error Handling
//!
//! Every operation returns `eyre::Result`. Conditions callers act on are
//! carried as a [`StorageError`] inside the report:
//!
//! ```ignore
//! match store.fetch(handle) {
//!     Err(e) if e.downcast_ref::<StorageError>().is_some_and(|s| s.is_invalid_handle()) => {
//!         index.remove(key);
//!     }
//!     other => { other?; }
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`config`]: layout constants and defaults
//! - [`storage`]: backing file, windows, arenas, window manager
//! - [`store`]: the `ArenaStore` facade, builder and enumeration

pub mod config;
pub mod storage;
pub mod store;

pub use storage::{ObjectHandle, Relocation, RelocationSink, StorageError};
pub use store::{
    Allocation, ArenaStore, Entries, Overwritten, StoreBuilder, StoreConfig, StoreStats,
};
