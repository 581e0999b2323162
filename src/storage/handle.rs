//! # Object Handles
//!
//! An `ObjectHandle` is the only form of "pointer" that leaves the allocator:
//! a `(window id, arena offset)` pair. It does not keep its window mapped and
//! it does not own the arena. Once the arena is freed the handle is dead; if
//! the same offset is later handed out again, the new handle compares equal to
//! the old one, but fetching it only ever yields the new content.
//!
//! Defragmentation moves Used arenas toward the front of a window. Each move is
//! reported as a `Relocation` so the caller's key index can follow the object.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHandle {
    window: u32,
    offset: u32,
}

impl ObjectHandle {
    pub fn new(window: u32, offset: u32) -> Self {
        Self { window, offset }
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "window {}@{}", self.window, self.offset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub from: ObjectHandle,
    pub to: ObjectHandle,
}

/// Receives every handle move caused by defragmentation.
///
/// Called with the window manager lock held, so implementations must not call
/// back into the store.
pub trait RelocationSink: Send + Sync {
    fn relocated(&self, relocation: Relocation);
}

impl<F> RelocationSink for F
where
    F: Fn(Relocation) + Send + Sync,
{
    fn relocated(&self, relocation: Relocation) {
        self(relocation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn handles_order_by_window_then_offset() {
        let a = ObjectHandle::new(0, 500);
        let b = ObjectHandle::new(1, 12);
        let c = ObjectHandle::new(1, 40);

        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn closure_is_a_relocation_sink() {
        let seen = Mutex::new(Vec::new());
        let sink = |r: Relocation| seen.lock().push(r);

        sink.relocated(Relocation {
            from: ObjectHandle::new(0, 100),
            to: ObjectHandle::new(0, 12),
        });

        assert_eq!(seen.lock().len(), 1);
        assert_eq!(seen.lock()[0].to.offset(), 12);
    }

    #[test]
    fn display_names_window_and_offset() {
        assert_eq!(ObjectHandle::new(2, 77).to_string(), "window 2@77");
    }
}
