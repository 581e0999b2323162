//! # Store Builder
//!
//! This module provides `StoreConfig`, the full set of options a store is opened
//! with, and `StoreBuilder`, the fluent API for assembling one.
//!
//! ## Configuration Options
//!
//! | Option           | Property key      | Default    | Description                          |
//! |------------------|-------------------|------------|--------------------------------------|
//! | path             | `file-name`       | anonymous  | Backing file; none means temporary   |
//! | max_open_windows | `num-views`       | 8          | Windows mapped at the same time      |
//! | window_size      | `view-size`       | 4 MiB      | Bytes per window                     |
//! | initial_size_mb  | `initial-size-mb` | 32         | Initial file size, rounded to windows|
//! | initial_windows  |                   | from size  | Overrides `initial_size_mb`          |
//! | max_windows      | `max-views`       | unbounded  | Growth limit; beyond it, OutOfMemory |
//!
//! The window size bounds the largest storable payload: payload and
//! bookkeeping must fit into a single window, see `WINDOW_OVERHEAD`.
//!
//! ## Usage Examples
//!
//! ```ignore
//! let store = ArenaStore::builder()
//!     .path("./cache.arena")
//!     .window_size(1024 * 1024)
//!     .max_open_windows(4)
//!     .open()?;
//! ```
//!
//! ```ignore
//! let store = ArenaStore::builder()
//!     .relocation_sink(|r: Relocation| index.rebind(r.from, r.to))
//!     .open()?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};

use super::ArenaStore;
use crate::config::{
    DEFAULT_INITIAL_SIZE_MB, DEFAULT_MAX_OPEN_WINDOWS, DEFAULT_WINDOW_SIZE, MB, MIN_WINDOW_SIZE,
    WINDOW_OVERHEAD,
};
use crate::storage::RelocationSink;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub path: Option<PathBuf>,
    pub window_size: u32,
    pub initial_size_mb: u32,
    pub initial_windows: Option<u32>,
    pub max_windows: Option<u32>,
    pub max_open_windows: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            window_size: DEFAULT_WINDOW_SIZE,
            initial_size_mb: DEFAULT_INITIAL_SIZE_MB,
            initial_windows: None,
            max_windows: None,
            max_open_windows: DEFAULT_MAX_OPEN_WINDOWS,
        }
    }
}

impl StoreConfig {
    /// Reads the provider property map. Unknown keys are ignored.
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(name) = properties.get("file-name") {
            if !name.trim().is_empty() {
                config.path = Some(PathBuf::from(name.trim()));
            }
        }
        if let Some(value) = properties.get("num-views") {
            config.max_open_windows = parse_property("num-views", value)?;
        }
        if let Some(value) = properties.get("view-size") {
            config.window_size = parse_property("view-size", value)?;
        }
        if let Some(value) = properties.get("initial-size-mb") {
            config.initial_size_mb = parse_property("initial-size-mb", value)?;
        }
        if let Some(value) = properties.get("max-views") {
            config.max_windows = Some(parse_property("max-views", value)?);
        }

        Ok(config)
    }

    /// Window count the file starts with: `initial_windows` if set, otherwise
    /// `initial_size_mb` rounded up to whole windows. Never zero.
    pub fn initial_window_count(&self) -> u32 {
        if let Some(count) = self.initial_windows {
            return count;
        }
        let bytes = self.initial_size_mb as u64 * MB;
        let windows = bytes.div_ceil(self.window_size.max(1) as u64).max(1);
        u32::try_from(windows).unwrap_or(u32::MAX)
    }

    pub fn max_payload_len(&self) -> usize {
        (self.window_size as usize).saturating_sub(WINDOW_OVERHEAD)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.window_size >= MIN_WINDOW_SIZE,
            "window size {} is below the minimum of {} bytes",
            self.window_size,
            MIN_WINDOW_SIZE
        );
        ensure!(
            self.max_open_windows >= 1,
            "at least one window must be allowed open"
        );

        let initial = self.initial_window_count();
        ensure!(initial >= 1, "initial window count must be at least 1");
        if let Some(max) = self.max_windows {
            ensure!(
                initial <= max,
                "initial window count {} exceeds the window limit of {}",
                initial,
                max
            );
        }
        Ok(())
    }
}

fn parse_property<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .wrap_err_with(|| format!("invalid value '{}' for property '{}'", value, key))
}

/// Builder for configuring and opening an [`ArenaStore`].
///
/// Use `ArenaStore::builder()` to create one, then chain configuration methods
/// before calling `open()`.
#[derive(Default)]
pub struct StoreBuilder {
    config: StoreConfig,
    sink: Option<Arc<dyn RelocationSink>>,
}

impl fmt::Debug for StoreBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreBuilder")
            .field("config", &self.config)
            .field("relocation_sink", &self.sink.is_some())
            .finish()
    }
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backs the store with the file at `path`. An existing non-empty file is
    /// opened and its windows adopted; otherwise the file is created.
    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Backs the store with an unlinked temporary file. This is the default.
    pub fn anonymous(mut self) -> Self {
        self.config.path = None;
        self
    }

    pub fn window_size(mut self, bytes: u32) -> Self {
        self.config.window_size = bytes;
        self
    }

    pub fn initial_size_mb(mut self, mb: u32) -> Self {
        self.config.initial_size_mb = mb;
        self
    }

    /// Sets the initial window count directly, overriding `initial_size_mb`.
    pub fn initial_windows(mut self, count: u32) -> Self {
        self.config.initial_windows = Some(count);
        self
    }

    /// Caps how many windows the file may grow to. Allocations that would
    /// need more fail with `StorageError::OutOfMemory`.
    pub fn max_windows(mut self, count: u32) -> Self {
        self.config.max_windows = Some(count);
        self
    }

    /// Bounds how many windows are mapped at once.
    pub fn max_open_windows(mut self, count: usize) -> Self {
        self.config.max_open_windows = count;
        self
    }

    /// Replaces every option with `config`. A sink set earlier is kept.
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Receives a `Relocation` for every object moved by defragmentation.
    pub fn relocation_sink<S>(mut self, sink: S) -> Self
    where
        S: RelocationSink + 'static,
    {
        self.sink = Some(Arc::new(sink));
        self
    }

    pub fn get_config(&self) -> &StoreConfig {
        &self.config
    }

    /// Validates the configuration and opens the store.
    pub fn open(self) -> Result<ArenaStore> {
        self.config.validate()?;
        ArenaStore::open_with_sink(self.config, self.sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_match_provider() {
        let config = StoreConfig::default();

        assert_eq!(config.window_size, 4 * 1024 * 1024);
        assert_eq!(config.initial_size_mb, 32);
        assert_eq!(config.max_open_windows, 8);
        assert_eq!(config.initial_window_count(), 8);
        assert!(config.path.is_none());
    }

    #[test]
    fn initial_size_rounds_up_to_whole_windows() {
        let config = StoreConfig {
            window_size: 3 * 1024 * 1024,
            initial_size_mb: 10,
            ..StoreConfig::default()
        };

        assert_eq!(config.initial_window_count(), 4);
    }

    #[test]
    fn zero_initial_size_still_gets_one_window() {
        let config = StoreConfig {
            initial_size_mb: 0,
            ..StoreConfig::default()
        };

        assert_eq!(config.initial_window_count(), 1);
        config.validate().unwrap();
    }

    #[test]
    fn from_properties_reads_provider_keys() {
        let config = StoreConfig::from_properties(&props(&[
            ("file-name", "/var/cache/store.arena"),
            ("num-views", "3"),
            ("view-size", "65536"),
            ("initial-size-mb", "1"),
            ("max-views", "64"),
            ("unrelated", "ignored"),
        ]))
        .unwrap();

        assert_eq!(config.path, Some(PathBuf::from("/var/cache/store.arena")));
        assert_eq!(config.max_open_windows, 3);
        assert_eq!(config.window_size, 65536);
        assert_eq!(config.initial_window_count(), 16);
        assert_eq!(config.max_windows, Some(64));
    }

    #[test]
    fn from_properties_rejects_malformed_numbers() {
        let err = StoreConfig::from_properties(&props(&[("view-size", "big")])).unwrap_err();

        assert!(err.to_string().contains("view-size"));
    }

    #[test]
    fn blank_file_name_means_anonymous() {
        let config = StoreConfig::from_properties(&props(&[("file-name", "  ")])).unwrap();

        assert!(config.path.is_none());
    }

    #[test]
    fn validate_rejects_bad_configs() {
        let tiny = StoreConfig {
            window_size: 32,
            ..StoreConfig::default()
        };
        assert!(tiny.validate().is_err());

        let closed = StoreConfig {
            max_open_windows: 0,
            ..StoreConfig::default()
        };
        assert!(closed.validate().is_err());

        let over = StoreConfig {
            initial_windows: Some(5),
            max_windows: Some(4),
            ..StoreConfig::default()
        };
        let err = over.validate().unwrap_err();
        assert!(err.to_string().contains("exceeds the window limit"));

        let none = StoreConfig {
            initial_windows: Some(0),
            ..StoreConfig::default()
        };
        assert!(none.validate().is_err());
    }

    #[test]
    fn builder_sets_values() {
        let builder = StoreBuilder::new()
            .path("/tmp/x.arena")
            .window_size(4096)
            .initial_windows(2)
            .max_windows(10)
            .max_open_windows(3);

        let config = builder.get_config();
        assert_eq!(config.path, Some(PathBuf::from("/tmp/x.arena")));
        assert_eq!(config.window_size, 4096);
        assert_eq!(config.initial_windows, Some(2));
        assert_eq!(config.max_windows, Some(10));
        assert_eq!(config.max_open_windows, 3);
        assert_eq!(config.max_payload_len(), 4096 - 29);
    }

    #[test]
    fn builder_open_validates() {
        let result = StoreBuilder::new().window_size(10).open();

        assert!(result.is_err());
    }
}
