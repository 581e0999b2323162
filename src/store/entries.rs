//! Lazy enumeration of every live object in a store.

use eyre::Result;
use parking_lot::Mutex;

use crate::config::FIRST_ARENA_OFFSET;
use crate::storage::{ObjectHandle, WindowManager, WindowPin};

/// Single-pass iterator over `(handle, payload)` pairs, in window id order and
/// then offset order within a window. Free arenas are skipped.
///
/// The window being walked stays pinned until the iterator moves past it or is
/// dropped; the manager lock is only held while a single arena is read. After
/// the first error the iterator is exhausted.
pub struct Entries<'a> {
    manager: &'a Mutex<WindowManager>,
    pin: Option<WindowPin<'a>>,
    window: u32,
    cursor: u32,
    done: bool,
}

impl<'a> Entries<'a> {
    pub(crate) fn new(manager: &'a Mutex<WindowManager>) -> Self {
        Self {
            manager,
            pin: None,
            window: 0,
            cursor: FIRST_ARENA_OFFSET,
            done: false,
        }
    }

    fn step(&mut self) -> Result<Option<(ObjectHandle, Vec<u8>)>> {
        loop {
            if self.pin.is_none() {
                let count = self.manager.lock().window_count();
                if self.window >= count {
                    return Ok(None);
                }
                self.pin = Some(WindowPin::acquire(self.manager, self.window)?);
            }

            let cursor = self.cursor;
            let found = match &self.pin {
                Some(pin) => pin.with(|window| match window.next_used_from(cursor)? {
                    Some(arena) => Ok(Some((
                        arena,
                        arena.content(window)?.to_vec(),
                        arena.total_len(window)?,
                    ))),
                    None => Ok(None),
                })?,
                None => return Ok(None),
            };

            match found {
                Some((arena, payload, total_len)) => {
                    self.cursor = arena.offset() + total_len;
                    return Ok(Some((ObjectHandle::new(self.window, arena.offset()), payload)));
                }
                None => {
                    self.pin = None;
                    self.window += 1;
                    self.cursor = FIRST_ARENA_OFFSET;
                }
            }
        }
    }
}

impl Iterator for Entries<'_> {
    type Item = Result<(ObjectHandle, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.step() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                self.pin = None;
                None
            }
            Err(e) => {
                self.done = true;
                self.pin = None;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::store::ArenaStore;

    #[test]
    fn walks_windows_in_order_skipping_free() {
        let store = ArenaStore::builder()
            .window_size(1024)
            .initial_windows(1)
            .max_open_windows(1)
            .open()
            .unwrap();
        let a = store.allocate(&[1u8; 500]).unwrap();
        let b = store.allocate(&[2u8; 400]).unwrap();
        let c = store.allocate(&[3u8; 500]).unwrap();
        store.free(b).unwrap();

        let entries: Vec<_> = store.entries().map(|e| e.unwrap()).collect();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], (a, vec![1u8; 500]));
        assert_eq!(entries[1], (c, vec![3u8; 500]));
        assert!(a.window() < c.window());
    }

    #[test]
    fn dropping_iterator_releases_pin() {
        let store = ArenaStore::builder()
            .window_size(1024)
            .initial_windows(2)
            .max_open_windows(1)
            .open()
            .unwrap();
        store.allocate(&[1u8; 900]).unwrap();
        store.allocate(&[2u8; 900]).unwrap();

        {
            let mut entries = store.entries();
            entries.next().unwrap().unwrap();
            // window 0 is pinned and the cap is one window
            assert!(store.fetch(crate::storage::ObjectHandle::new(1, 12)).is_err());
        }

        assert_eq!(
            store.fetch(crate::storage::ObjectHandle::new(1, 12)).unwrap(),
            vec![2u8; 900]
        );
    }

    #[test]
    fn free_ahead_of_cursor_is_skipped() {
        let store = ArenaStore::builder()
            .window_size(4096)
            .initial_windows(1)
            .open()
            .unwrap();
        let handles: Vec<_> = (0..5).map(|i| store.allocate(&[i as u8; 50]).unwrap()).collect();

        let mut entries = store.entries();
        assert_eq!(entries.next().unwrap().unwrap().0, handles[0]);
        store.free(handles[1]).unwrap();
        store.free(handles[2]).unwrap();

        let rest: Vec<_> = entries.map(|e| e.unwrap().0).collect();
        assert_eq!(rest, vec![handles[3], handles[4]]);
    }
}
