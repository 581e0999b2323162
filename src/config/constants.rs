//! # Storage Layout and Tuning Constants
//!
//! This module centralizes every constant that shapes the on-map layout of a
//! window and the default tuning of the store. Constants that depend on each
//! other are co-located and their relationships are enforced by compile-time
//! assertions.
//!
//! ## Dependency Graph
//!
//! ```text
//! WINDOW_HEADER_SIZE (12 bytes: signature, free_space, max_contiguous_free)
//!       │
//!       └─> FIRST_ARENA_OFFSET (the first arena starts right after it)
//!
//! ARENA_HEADER_SIZE (13 bytes: status, capacity, next, prev)
//!       │
//!       ├─> SPLIT_THRESHOLD (header + 8)
//!       │     A free remainder smaller than this is never carved off.
//!       │
//!       └─> MIN_ARENA_CAPACITY (== SPLIT_THRESHOLD)
//!             Every request is rounded up to this, so a freed arena can never
//!             be smaller than the split threshold.
//!
//! CONTENT_PREFIX_SIZE (4 bytes, length prefix of a Used arena)
//!
//! MIN_WINDOW_SIZE (64 bytes)
//!       │
//!       └─> must fit a window header, one arena header and one minimal arena
//! ```
//!
//! ## Overhead per Payload
//!
//! A window holding a single payload spends `WINDOW_HEADER_SIZE +
//! ARENA_HEADER_SIZE + CONTENT_PREFIX_SIZE` (29 bytes) on bookkeeping, so the
//! largest storable payload is `window_size - WINDOW_OVERHEAD`.
//!
//! ## Defaults
//!
//! The defaults match the cache provider this allocator was built for: 4 MiB
//! windows, a 32 MiB initial file and at most 8 windows mapped at once.

// ============================================================================
// WINDOW LAYOUT
// ============================================================================

/// Magic value written at offset 0 of every formatted window.
pub const WINDOW_SIGNATURE: u32 = 0x0fac_e0ff;

/// Size of the window header in bytes.
pub const WINDOW_HEADER_SIZE: usize = 12;

/// Byte offset of the first arena in every window.
pub const FIRST_ARENA_OFFSET: u32 = WINDOW_HEADER_SIZE as u32;

/// Smallest accepted window size.
pub const MIN_WINDOW_SIZE: u32 = 64;

// ============================================================================
// ARENA LAYOUT
// ============================================================================

/// Size of the packed arena header in bytes.
pub const ARENA_HEADER_SIZE: usize = 13;

/// Size of the length prefix stored in front of a Used arena's payload.
pub const CONTENT_PREFIX_SIZE: usize = 4;

/// Minimum capacity of a free remainder worth splitting off.
pub const SPLIT_THRESHOLD: u32 = ARENA_HEADER_SIZE as u32 + 8;

/// Requests are rounded up to this capacity.
pub const MIN_ARENA_CAPACITY: u32 = SPLIT_THRESHOLD;

/// Bytes of bookkeeping a window spends on its single largest payload.
pub const WINDOW_OVERHEAD: usize = WINDOW_HEADER_SIZE + ARENA_HEADER_SIZE + CONTENT_PREFIX_SIZE;

const _: () = assert!(
    (MIN_WINDOW_SIZE as usize) >= WINDOW_HEADER_SIZE + ARENA_HEADER_SIZE + MIN_ARENA_CAPACITY as usize,
    "MIN_WINDOW_SIZE must fit a header and one minimal arena"
);

const _: () = assert!(
    MIN_ARENA_CAPACITY as usize > CONTENT_PREFIX_SIZE,
    "a minimal arena must hold the content prefix"
);

// ============================================================================
// STORE DEFAULTS
// ============================================================================

/// One mebibyte.
pub const MB: u64 = 1024 * 1024;

/// Default window size (4 MiB).
pub const DEFAULT_WINDOW_SIZE: u32 = 4 * MB as u32;

/// Default initial size of the backing file in MiB.
pub const DEFAULT_INITIAL_SIZE_MB: u32 = 32;

/// Default cap on concurrently mapped windows.
pub const DEFAULT_MAX_OPEN_WINDOWS: usize = 8;

/// Number of windows added each time the file has to grow.
pub const GROWTH_WINDOWS: u32 = 1;
