//! # Window Manager
//!
//! The `WindowManager` owns the backing `MappedFile` and one `WindowSlot` per
//! window in the file. At most `max_open` slots hold a live mapping at any time;
//! every other window is known but closed, and its bytes live only in the file.
//!
//! ## Eviction
//!
//! Each slot carries a usage counter that is incremented on every open and
//! every touch. When a window must be mapped and the open set is full, the
//! open window with the lowest counter (ties broken by lowest id) is unmapped.
//! The counter restarts at zero when a window is closed, so a window that was
//! just paged back in does not inherit its old popularity.
//!
//! ```text
//! open(C) with max_open = 2
//!
//!   before                     after
//!   A: open, usage 5           A: open, usage 5
//!   B: open, usage 2    --->   B: closed, usage 0
//!   C: closed                  C: open, usage 1
//! ```
//!
//! ## Pinning
//!
//! A pinned window is never chosen as a victim. Callers pin a window for the
//! duration of an operation through [`WindowPin`], which releases the pin when
//! dropped. If every open window is pinned and the open set is full, opening
//! another window fails with `OutOfMemory`.
//!
//! ## First Use and Corruption
//!
//! A window whose header is all zeroes has never been written; it is formatted
//! when first opened. A window with any other invalid header is corrupt, as is
//! a window that was formatted earlier in this session and has lost its
//! signature since. Corrupt windows are never reformatted.

use eyre::{bail, ensure, eyre, Result};
use parking_lot::Mutex;

use super::mmap::MappedFile;
use super::window::MappedWindow;
use super::StorageError;
use crate::config::{ARENA_HEADER_SIZE, WINDOW_HEADER_SIZE};

#[derive(Debug)]
struct WindowSlot {
    usage: u64,
    pins: u32,
    formatted: bool,
    /// Free space recorded when the window was last unmapped.
    free_space: Option<u32>,
    view: Option<MappedWindow>,
}

impl WindowSlot {
    fn new() -> Self {
        Self {
            usage: 0,
            pins: 0,
            formatted: false,
            free_space: None,
            view: None,
        }
    }

    fn is_open(&self) -> bool {
        self.view.is_some()
    }
}

#[derive(Debug)]
pub struct WindowManager {
    file: MappedFile,
    slots: Vec<WindowSlot>,
    max_open: usize,
    open_count: usize,
}

impl WindowManager {
    pub fn new(file: MappedFile, max_open: usize) -> Result<Self> {
        ensure!(max_open >= 1, "at least one window must be allowed open");

        let slots = (0..file.window_count()).map(|_| WindowSlot::new()).collect();

        Ok(Self {
            file,
            slots,
            max_open,
            open_count: 0,
        })
    }

    pub fn file(&self) -> &MappedFile {
        &self.file
    }

    pub fn window_count(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn open_count(&self) -> usize {
        self.open_count
    }

    pub fn max_open(&self) -> usize {
        self.max_open
    }

    /// Capacity of a freshly formatted window.
    pub fn empty_window_free_space(&self) -> u32 {
        self.file.window_size() - WINDOW_HEADER_SIZE as u32 - ARENA_HEADER_SIZE as u32
    }

    fn slot(&self, id: u32) -> Result<&WindowSlot> {
        self.slots.get(id as usize).ok_or_else(|| {
            eyre!(
                "window {} out of bounds (window_count={})",
                id,
                self.slots.len()
            )
        })
    }

    fn slot_mut(&mut self, id: u32) -> Result<&mut WindowSlot> {
        let count = self.slots.len();
        self.slots
            .get_mut(id as usize)
            .ok_or_else(|| eyre!("window {} out of bounds (window_count={})", id, count))
    }

    pub fn is_open(&self, id: u32) -> bool {
        self.slots.get(id as usize).is_some_and(WindowSlot::is_open)
    }

    pub fn usage(&self, id: u32) -> Option<u64> {
        self.slots.get(id as usize).map(|s| s.usage)
    }

    pub fn pins(&self, id: u32) -> Option<u32> {
        self.slots.get(id as usize).map(|s| s.pins)
    }

    pub fn open_windows(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_open())
            .map(|(id, _)| id as u32)
            .collect()
    }

    /// Maps window `id` if needed and counts the access.
    pub fn open(&mut self, id: u32) -> Result<&mut MappedWindow> {
        if !self.slot(id)?.is_open() {
            while self.open_count >= self.max_open {
                self.evict_one(id)?;
            }
            self.map(id)?;
        }

        let slot = self.slot_mut(id)?;
        slot.usage += 1;
        slot.view
            .as_mut()
            .ok_or_else(|| eyre!("window {} not open after mapping", id))
    }

    fn map(&mut self, id: u32) -> Result<()> {
        let mmap = self.file.map_window(id)?;
        let mut window = MappedWindow::new(id, mmap);

        let slot = self.slot_mut(id)?;
        if !window.is_formatted() {
            if window.is_blank() && !slot.formatted {
                window.format()?;
            } else {
                let signature = window.header()?.signature();
                tracing::warn!(
                    window = id,
                    signature = format_args!("{:#010x}", signature),
                    "refusing to open corrupt window"
                );
                bail!(StorageError::CorruptWindow {
                    window: id,
                    signature,
                });
            }
        }

        slot.formatted = true;
        slot.view = Some(window);
        self.open_count += 1;

        tracing::trace!(window = id, open = self.open_count, "mapped window");
        Ok(())
    }

    fn evict_one(&mut self, keep: u32) -> Result<()> {
        let victim = self
            .slots
            .iter()
            .enumerate()
            .filter(|(id, s)| s.is_open() && s.pins == 0 && *id as u32 != keep)
            .min_by_key(|(id, s)| (s.usage, *id))
            .map(|(id, _)| id as u32);

        let Some(victim) = victim else {
            bail!(StorageError::out_of_memory(
                self.file.window_size() as usize,
                format!(
                    "all {} open windows are pinned, cannot map window {}",
                    self.open_count, keep
                )
            ));
        };

        tracing::debug!(victim, usage = self.slots[victim as usize].usage, "evicting window");
        self.close(victim)
    }

    /// Unmaps window `id`. Closing a closed window is a no-op.
    pub fn close(&mut self, id: u32) -> Result<()> {
        let slot = self.slot_mut(id)?;
        ensure!(slot.pins == 0, "cannot close pinned window {}", id);

        let Some(window) = slot.view.as_mut() else {
            return Ok(());
        };

        window.prepare_unmap()?;
        slot.free_space = Some(window.free_space()?);
        slot.usage = 0;
        slot.view = None;

        self.open_count -= 1;
        Ok(())
    }

    pub fn close_all(&mut self) -> Result<()> {
        for id in 0..self.window_count() {
            if self.slots[id as usize].pins == 0 {
                self.close(id)?;
            }
        }
        Ok(())
    }

    pub fn pin(&mut self, id: u32) -> Result<()> {
        let slot = self.slot_mut(id)?;
        ensure!(slot.is_open(), "cannot pin closed window {}", id);
        slot.pins += 1;
        Ok(())
    }

    pub fn unpin(&mut self, id: u32) {
        if let Some(slot) = self.slots.get_mut(id as usize) {
            debug_assert!(slot.pins > 0, "unpin called on unpinned window {}", id);
            slot.pins = slot.pins.saturating_sub(1);
        }
    }

    /// Opens and pins window `id`.
    pub fn acquire(&mut self, id: u32) -> Result<()> {
        self.open(id)?;
        self.pin(id)
    }

    /// The mapping of an already open window. Does not count as a touch.
    pub fn window_mut(&mut self, id: u32) -> Result<&mut MappedWindow> {
        self.slot_mut(id)?
            .view
            .as_mut()
            .ok_or_else(|| eyre!("window {} is not open", id))
    }

    pub fn window(&self, id: u32) -> Result<&MappedWindow> {
        self.slot(id)?
            .view
            .as_ref()
            .ok_or_else(|| eyre!("window {} is not open", id))
    }

    /// Finds a window whose free space is at least `required`, skipping the
    /// ids in `skip`. Open windows are checked first; closed windows are then
    /// opened in id order if their recorded free space is sufficient or was
    /// never recorded. The returned window is open.
    pub fn window_with_free_space(&mut self, required: u32, skip: &[u32]) -> Result<Option<u32>> {
        for (id, slot) in self.slots.iter().enumerate() {
            let id = id as u32;
            if skip.contains(&id) {
                continue;
            }
            if let Some(window) = &slot.view {
                if window.free_space()? >= required {
                    return Ok(Some(id));
                }
            }
        }

        for id in 0..self.window_count() {
            let slot = &self.slots[id as usize];
            if skip.contains(&id) || slot.is_open() {
                continue;
            }
            if slot.free_space.is_some_and(|free| free < required) {
                continue;
            }

            if self.open(id)?.free_space()? >= required {
                return Ok(Some(id));
            }
        }

        Ok(None)
    }

    /// Grows the file by `additional` windows. Returns the id of the first
    /// new window; new windows start closed.
    pub fn extend_by(&mut self, additional: u32) -> Result<u32> {
        let first = self.window_count();
        self.file.grow(additional)?;

        let empty = self.empty_window_free_space();
        for _ in 0..additional {
            let mut slot = WindowSlot::new();
            slot.free_space = Some(empty);
            self.slots.push(slot);
        }

        Ok(first)
    }

    /// Drops trailing windows that hold no Used arena, keeping at least
    /// `min_windows`. Stops at the first trailing window that holds data or is
    /// pinned. Returns how many windows were removed.
    pub fn shrink(&mut self, min_windows: u32) -> Result<u32> {
        let min_windows = min_windows.max(1);
        let empty = self.empty_window_free_space();
        let mut keep = self.window_count();

        while keep > min_windows {
            let id = keep - 1;
            let slot = &self.slots[id as usize];
            if slot.pins > 0 {
                break;
            }

            let live = slot.view.as_ref().map(MappedWindow::free_space).transpose()?;
            let free = match live.or(slot.free_space) {
                Some(free) => free,
                None => self.open(id)?.free_space()?,
            };
            if free != empty {
                break;
            }

            self.close(id)?;
            keep -= 1;
        }

        let removed = self.window_count() - keep;
        if removed > 0 {
            self.slots.truncate(keep as usize);
            self.file.shrink_to(keep)?;
        }
        Ok(removed)
    }

    /// Reformats every window. All previously issued handles become invalid.
    pub fn clear(&mut self) -> Result<()> {
        for id in 0..self.window_count() {
            self.open(id)?.format()?;
        }
        tracing::debug!(windows = self.window_count(), "cleared all windows");
        Ok(())
    }

    /// Free space of every window as far as it is known without mapping:
    /// live headers for open windows, recorded values for closed ones.
    pub fn known_free_bytes(&self) -> Result<u64> {
        let mut total = 0u64;
        for slot in &self.slots {
            total += match &slot.view {
                Some(window) => window.free_space()? as u64,
                None => slot.free_space.unwrap_or(0) as u64,
            };
        }
        Ok(total)
    }

    pub fn flush(&self) -> Result<()> {
        for window in self.slots.iter().filter_map(|s| s.view.as_ref()) {
            window.flush()?;
        }
        self.file.sync()
    }

    /// Brings every open window's counters up to date, flushes and unmaps it,
    /// then syncs the file.
    pub fn shutdown(&mut self) -> Result<()> {
        for window in self.slots.iter_mut().filter_map(|s| s.view.as_mut()) {
            window.prepare_unmap()?;
            window.flush()?;
        }
        self.close_all()?;
        self.file.sync()?;

        tracing::debug!(windows = self.window_count(), "closed all windows");
        Ok(())
    }
}

/// Pin on one window, released on drop.
///
/// The window stays mapped while the pin is alive, so the manager lock can be
/// released between operations without the window being evicted.
pub struct WindowPin<'a> {
    manager: &'a Mutex<WindowManager>,
    id: u32,
}

impl<'a> WindowPin<'a> {
    /// Opens and pins window `id`.
    pub fn acquire(manager: &'a Mutex<WindowManager>, id: u32) -> Result<Self> {
        manager.lock().acquire(id)?;
        Ok(Self { manager, id })
    }

    /// Wraps a pin that `manager.acquire(id)` already took.
    pub fn adopt(manager: &'a Mutex<WindowManager>, id: u32) -> Self {
        Self { manager, id }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Runs `f` on the pinned window with the manager lock held.
    pub fn with<R>(&self, f: impl FnOnce(&mut MappedWindow) -> Result<R>) -> Result<R> {
        let mut manager = self.manager.lock();
        f(manager.window_mut(self.id)?)
    }
}

impl Drop for WindowPin<'_> {
    fn drop(&mut self) {
        self.manager.lock().unpin(self.id);
    }
}
