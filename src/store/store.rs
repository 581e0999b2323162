//! # Arena Store
//!
//! `ArenaStore` is the public face of the allocator: hand it bytes, get an
//! `ObjectHandle` back; hand it the handle, get the bytes back.
//!
//! ## Operation Flow
//!
//! Every operation that touches a window first pins it through the
//! `WindowManager` (mapping it, and possibly evicting another window), then
//! runs against the window with the manager lock held, and releases the pin
//! when done:
//!
//! ```text
//! allocate(bytes)
//!   ├─ reject empty / oversized payloads      (before any mutation)
//!   ├─ window_with_free_space(required)       open windows first, then closed
//!   │    └─ none left: grow the file by GROWTH_WINDOWS
//!   ├─ pin window
//!   ├─ window.allocate()                      hint → first fit → defragment
//!   │                                         (compaction needs a sink)
//!   │    └─ full after all: try the next window
//!   └─ report relocations, unpin
//! ```
//!
//! ## Handle Lifecycle
//!
//! ```text
//! Unallocated ──allocate──> Used ──free──> Free ──allocate──> Used ...
//! ```
//!
//! Free arenas are recycled, never removed. A handle whose arena is freed
//! becomes invalid; fetching it fails with `StorageError::InvalidHandle` until
//! the same offset is handed out again, after which it reads the new content.
//!
//! ## Relocation
//!
//! Defragmentation moves Used arenas toward the front of their window, which
//! changes their handles. A handle is only ever moved where the caller hears
//! about it:
//!
//! - every move is reported to the `RelocationSink` given to the builder
//! - `defragment` and `allocate_relocating` return the moves they made
//! - `allocate` and `overwrite` compact a window only when a sink is
//!   configured; without one they look for a single hole large enough, and
//!   otherwise move on to another window or grow the file
//!
//! `overwrite` follows the old handle through any move its own allocation
//! caused, so the `previous` handle it returns always names the live old
//! object.

use std::fmt;
use std::sync::Arc;

use eyre::{bail, ensure, eyre, Result};
use parking_lot::Mutex;

use super::builder::{StoreBuilder, StoreConfig};
use super::entries::Entries;
use crate::config::GROWTH_WINDOWS;
use crate::storage::{
    required_capacity, Arena, ArenaMove, Backing, ChainSummary, MappedFile, MappedWindow,
    ObjectHandle, Relocation, RelocationSink, StorageError, WindowManager, WindowPin,
};

/// Outcome of [`ArenaStore::overwrite`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overwritten {
    /// The payload fit the existing arena; the handle is unchanged.
    InPlace(ObjectHandle),
    /// The payload was stored elsewhere. `previous` still holds the old
    /// content and must be freed by the caller once its index points at
    /// `handle`.
    Relocated {
        handle: ObjectHandle,
        previous: ObjectHandle,
    },
}

impl Overwritten {
    pub fn handle(&self) -> ObjectHandle {
        match self {
            Overwritten::InPlace(handle) => *handle,
            Overwritten::Relocated { handle, .. } => *handle,
        }
    }

    pub fn is_relocated(&self) -> bool {
        matches!(self, Overwritten::Relocated { .. })
    }
}

/// Outcome of [`ArenaStore::allocate_relocating`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub handle: ObjectHandle,
    /// Objects moved to make room, in the order they were moved.
    pub relocations: Vec<Relocation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub window_count: u32,
    pub open_windows: usize,
    pub file_len: u64,
    /// Free space of open windows plus the last recorded free space of closed
    /// ones. Closed windows never opened this session count as zero.
    pub known_free_bytes: u64,
}

pub struct ArenaStore {
    manager: Mutex<WindowManager>,
    config: StoreConfig,
    sink: Option<Arc<dyn RelocationSink>>,
    initial_windows: u32,
}

impl fmt::Debug for ArenaStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaStore")
            .field("config", &self.config)
            .field("relocation_sink", &self.sink.is_some())
            .finish()
    }
}

fn resolve(window: &MappedWindow, handle: ObjectHandle) -> Result<Arena> {
    window
        .used_arena_at(handle.offset())?
        .ok_or_else(|| eyre!(StorageError::InvalidHandle { handle }))
}

impl ArenaStore {
    pub fn builder() -> StoreBuilder {
        StoreBuilder::new()
    }

    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        Self::open_with_sink(config, None)
    }

    pub(crate) fn open_with_sink(
        config: StoreConfig,
        sink: Option<Arc<dyn RelocationSink>>,
    ) -> Result<Self> {
        let initial_windows = config.initial_window_count();

        let file = match &config.path {
            Some(path) => MappedFile::open_or_create(path, config.window_size, initial_windows)?,
            None => MappedFile::anonymous(config.window_size, initial_windows)?,
        };

        if let Some(max) = config.max_windows {
            ensure!(
                file.window_count() <= max,
                "backing file holds {} windows, more than the limit of {}",
                file.window_count(),
                max
            );
        }

        tracing::debug!(
            backing = ?file.backing(),
            windows = file.window_count(),
            window_size = config.window_size,
            max_open = config.max_open_windows,
            "opened arena store"
        );

        let manager = WindowManager::new(file, config.max_open_windows)?;

        Ok(Self {
            manager: Mutex::new(manager),
            config,
            sink,
            initial_windows,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn backing(&self) -> Backing {
        self.manager.lock().file().backing().clone()
    }

    /// Largest payload a single allocation can hold.
    pub fn max_payload_len(&self) -> usize {
        self.config.max_payload_len()
    }

    fn validate_payload(&self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            bail!(StorageError::EmptyPayload);
        }
        let max = self.max_payload_len();
        if payload.len() > max {
            bail!(StorageError::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }
        Ok(())
    }

    /// Pins the window a handle points into. A window id past the end of the
    /// file makes the handle invalid.
    fn pin_handle(&self, handle: ObjectHandle) -> Result<WindowPin<'_>> {
        let mut manager = self.manager.lock();
        if handle.window() >= manager.window_count() {
            bail!(StorageError::InvalidHandle { handle });
        }
        manager.acquire(handle.window())?;
        Ok(WindowPin::adopt(&self.manager, handle.window()))
    }

    fn pin_window(&self, id: u32) -> Result<WindowPin<'_>> {
        let mut manager = self.manager.lock();
        ensure!(
            id < manager.window_count(),
            "window {} out of bounds (window_count={})",
            id,
            manager.window_count()
        );
        manager.acquire(id)?;
        Ok(WindowPin::adopt(&self.manager, id))
    }

    fn relocate(&self, window: u32, moves: &[ArenaMove]) -> Vec<Relocation> {
        let relocations: Vec<Relocation> = moves
            .iter()
            .map(|m| Relocation {
                from: ObjectHandle::new(window, m.from),
                to: ObjectHandle::new(window, m.to),
            })
            .collect();

        if let Some(sink) = &self.sink {
            for relocation in &relocations {
                sink.relocated(*relocation);
            }
        }
        relocations
    }

    fn grow(&self, manager: &mut WindowManager, requested: usize) -> Result<u32> {
        let mut additional = GROWTH_WINDOWS;
        if let Some(max) = self.config.max_windows {
            let room = max.saturating_sub(manager.window_count());
            if room == 0 {
                bail!(StorageError::out_of_memory(
                    requested,
                    format!("window limit of {} reached", max)
                ));
            }
            additional = additional.min(room);
        }

        let first = manager.extend_by(additional)?;
        tracing::debug!(
            added = additional,
            windows = manager.window_count(),
            "grew arena store"
        );
        Ok(first)
    }

    /// Stores `payload` and returns its handle.
    ///
    /// Fails with `EmptyPayload` or `PayloadTooLarge` before touching any
    /// window, and with `OutOfMemory` when no window has room and the file
    /// cannot grow. Windows are compacted to make room only when a
    /// `RelocationSink` is configured.
    pub fn allocate(&self, payload: &[u8]) -> Result<ObjectHandle> {
        Ok(self.allocate_tracked(payload, self.sink.is_some())?.0)
    }

    /// Stores `payload`, compacting a window if no single hole is large
    /// enough, and returns every object that moved. The moves are also
    /// reported to the sink, if any.
    pub fn allocate_relocating(&self, payload: &[u8]) -> Result<Allocation> {
        let (handle, relocations) = self.allocate_tracked(payload, true)?;
        Ok(Allocation {
            handle,
            relocations,
        })
    }

    fn allocate_tracked(
        &self,
        payload: &[u8],
        compact: bool,
    ) -> Result<(ObjectHandle, Vec<Relocation>)> {
        self.validate_payload(payload)?;

        let required = required_capacity(payload.len());
        let mut relocations = Vec::new();
        let mut tried = Vec::new();

        loop {
            let pin = {
                let mut manager = self.manager.lock();
                let id = match manager.window_with_free_space(required, &tried)? {
                    Some(id) => id,
                    None => self.grow(&mut manager, payload.len())?,
                };
                manager.acquire(id)?;
                WindowPin::adopt(&self.manager, id)
            };
            let id = pin.id();
            tried.push(id);

            let arena = pin.with(|window| {
                if !compact {
                    return window.allocate_in_place(payload);
                }
                let allocation = window.allocate(payload)?;
                relocations.extend(self.relocate(id, &allocation.moves));
                Ok(allocation.arena)
            })?;

            if let Some(arena) = arena {
                return Ok((ObjectHandle::new(id, arena.offset()), relocations));
            }
        }
    }

    /// Returns a copy of the payload stored under `handle`.
    pub fn fetch(&self, handle: ObjectHandle) -> Result<Vec<u8>> {
        let pin = self.pin_handle(handle)?;
        pin.with(|window| {
            let arena = resolve(window, handle)?;
            Ok(arena.content(window)?.to_vec())
        })
    }

    /// Replaces the payload stored under `handle`.
    ///
    /// When the existing arena is large enough the payload is written in place
    /// and any excess capacity is returned to the window. Otherwise the payload
    /// is allocated elsewhere and the old object is left untouched for the
    /// caller to free.
    pub fn overwrite(&self, handle: ObjectHandle, payload: &[u8]) -> Result<Overwritten> {
        self.validate_payload(payload)?;

        let pin = self.pin_handle(handle)?;
        let in_place = pin.with(|window| {
            let arena = resolve(window, handle)?;
            window.overwrite(arena, payload)
        })?;
        drop(pin);

        if in_place {
            return Ok(Overwritten::InPlace(handle));
        }

        let (new_handle, relocations) = self.allocate_tracked(payload, self.sink.is_some())?;
        let previous = relocations
            .iter()
            .fold(handle, |current, r| if r.from == current { r.to } else { current });

        tracing::trace!(from = %previous, to = %new_handle, "relocated overwritten object");

        Ok(Overwritten::Relocated {
            handle: new_handle,
            previous,
        })
    }

    /// Releases the arena behind `handle`.
    pub fn free(&self, handle: ObjectHandle) -> Result<()> {
        let pin = self.pin_handle(handle)?;
        pin.with(|window| {
            let arena = resolve(window, handle)?;
            window.deallocate(arena)?;
            Ok(())
        })
    }

    /// Returns the payload stored under `handle` and frees it.
    pub fn remove(&self, handle: ObjectHandle) -> Result<Vec<u8>> {
        let pin = self.pin_handle(handle)?;
        pin.with(|window| {
            let arena = resolve(window, handle)?;
            let payload = arena.content(window)?.to_vec();
            window.deallocate(arena)?;
            Ok(payload)
        })
    }

    /// Lazily walks every live object in window order, then offset order.
    ///
    /// At most one window is pinned by the walk at any time. The walk is not a
    /// snapshot: objects freed ahead of the cursor are skipped and objects
    /// moved by a concurrent defragmentation may be missed or seen twice.
    pub fn entries(&self) -> Entries<'_> {
        Entries::new(&self.manager)
    }

    /// Compacts one window and returns the objects that moved.
    pub fn defragment(&self, window: u32) -> Result<Vec<Relocation>> {
        let pin = self.pin_window(window)?;
        pin.with(|w| {
            let defragmented = w.defragment()?;
            Ok(self.relocate(window, &defragmented.moves))
        })
    }

    /// Reformats every window. Every handle issued so far becomes invalid.
    pub fn clear(&self) -> Result<()> {
        self.manager.lock().clear()
    }

    pub fn flush(&self) -> Result<()> {
        self.manager.lock().flush()
    }

    /// Drops trailing windows that hold no objects, never going below the
    /// initial window count. Returns how many windows were removed.
    pub fn shrink(&self) -> Result<u32> {
        let removed = self.manager.lock().shrink(self.initial_windows)?;
        if removed > 0 {
            tracing::debug!(removed, "shrank arena store");
        }
        Ok(removed)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let manager = self.manager.lock();
        Ok(StoreStats {
            window_count: manager.window_count(),
            open_windows: manager.open_count(),
            file_len: manager.file().file_size(),
            known_free_bytes: manager.known_free_bytes()?,
        })
    }

    /// Verifies the arena chain and counters of every window, mapping each in
    /// turn within the open-window cap. Returns one summary per window.
    pub fn check_integrity(&self) -> Result<Vec<ChainSummary>> {
        let count = self.manager.lock().window_count();
        let mut summaries = Vec::with_capacity(count as usize);

        for id in 0..count {
            let pin = self.pin_window(id)?;
            summaries.push(pin.with(|window| window.check_chain())?);
        }
        Ok(summaries)
    }

    /// Chain dump of one window, one line per arena.
    pub fn describe_window(&self, window: u32) -> Result<String> {
        let pin = self.pin_window(window)?;
        pin.with(|w| Ok(w.to_string()))
    }
}

impl Drop for ArenaStore {
    fn drop(&mut self) {
        if let Err(e) = self.manager.get_mut().shutdown() {
            tracing::warn!(error = %e, "failed to close arena store cleanly");
        }
    }
}
