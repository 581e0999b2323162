//! # Configuration Constants
//!
//! Layout constants of the window and arena formats live next to the store's
//! tuning defaults so that interdependent values cannot drift apart.
//!
//! ## Module Organization
//!
//! - [`constants`]: All numeric configuration values with dependency documentation

pub mod constants;
pub use constants::*;
