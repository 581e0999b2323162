//! # Store Module
//!
//! The public allocator API on top of the storage layer:
//!
//! - `builder`: `StoreConfig` and the fluent `StoreBuilder`
//! - `store`: the `ArenaStore` facade (allocate, fetch, overwrite, free, ...)
//! - `entries`: the lazy `Entries` walk over every live object

mod builder;
mod entries;
mod store;

pub use builder::{StoreBuilder, StoreConfig};
pub use entries::Entries;
pub use store::{Allocation, ArenaStore, Overwritten, StoreStats};
