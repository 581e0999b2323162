//! # Memory-Mapped Backing File
//!
//! `MappedFile` owns the file that backs every window of a store. Unlike a
//! single whole-file mapping, the file is never mapped as a whole: each window
//! is mapped on its own with `MmapOptions::offset`, so the number of bytes
//! committed to the process is bounded by the number of open windows, not by
//! the size of the file.
//!
//! ## File Format
//!
//! The file is simply a sequence of equally sized windows:
//!
//! ```text
//! Offset 0:                Window 0
//! Offset window_size:      Window 1
//! Offset 2 * window_size:  Window 2
//! ...
//! ```
//!
//! The file length is always a whole multiple of the window size. Growth adds
//! whole windows; the new range is zero-filled by the OS, which is how a
//! never-formatted window is recognized.
//!
//! ## Anonymous Backing
//!
//! Without a path the store is backed by an unlinked temporary file. It behaves
//! like a paging-file section: windows can be unmapped and remapped with their
//! content intact, and everything disappears when the file handle is dropped.
//!
//! ## Safety Considerations
//!
//! Mapping a file is unsafe because another process could truncate or modify
//! it underneath the mapping. Window mappings are owned by `MappedWindow`, and
//! the file is never shrunk below a window that is still mapped (the window
//! manager unmaps trailing windows before calling `shrink_to`).
//!
//! ## Error Handling
//!
//! Failures to grow the file or to map a window are reported as
//! `StorageError::OutOfMemory`: both mean the OS refused to commit more space.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result, WrapErr};
use memmap2::{MmapMut, MmapOptions};

use super::StorageError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backing {
    File(PathBuf),
    Anonymous,
}

#[derive(Debug)]
pub struct MappedFile {
    file: File,
    backing: Backing,
    window_size: u32,
    window_count: u32,
}

impl MappedFile {
    pub fn create<P: AsRef<Path>>(path: P, window_size: u32, window_count: u32) -> Result<Self> {
        let path = path.as_ref();

        ensure!(window_count > 0, "initial window count must be at least 1");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create backing file '{}'", path.display()))?;

        let mut mapped = Self {
            file,
            backing: Backing::File(path.to_path_buf()),
            window_size,
            window_count: 0,
        };
        mapped.grow(window_count)?;

        tracing::debug!(
            path = %path.display(),
            window_size,
            window_count,
            "created backing file"
        );

        Ok(mapped)
    }

    pub fn open<P: AsRef<Path>>(path: P, window_size: u32) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open backing file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to get metadata for '{}'", path.display()))?
            .len();

        ensure!(
            file_size > 0,
            "cannot open empty backing file '{}'",
            path.display()
        );

        ensure!(
            file_size % window_size as u64 == 0,
            "backing file '{}' size {} is not a multiple of window size {}",
            path.display(),
            file_size,
            window_size
        );

        let window_count = u32::try_from(file_size / window_size as u64)
            .wrap_err_with(|| format!("backing file '{}' has too many windows", path.display()))?;

        tracing::debug!(
            path = %path.display(),
            window_size,
            window_count,
            "opened backing file"
        );

        Ok(Self {
            file,
            backing: Backing::File(path.to_path_buf()),
            window_size,
            window_count,
        })
    }

    /// Opens `path` if it already holds windows, otherwise creates it.
    pub fn open_or_create<P: AsRef<Path>>(
        path: P,
        window_size: u32,
        initial_window_count: u32,
    ) -> Result<Self> {
        let path = path.as_ref();
        let has_content = std::fs::metadata(path)
            .map(|m| m.len() > 0)
            .unwrap_or(false);

        if has_content {
            Self::open(path, window_size)
        } else {
            Self::create(path, window_size, initial_window_count)
        }
    }

    pub fn anonymous(window_size: u32, window_count: u32) -> Result<Self> {
        ensure!(window_count > 0, "initial window count must be at least 1");

        let file = tempfile::tempfile().wrap_err("failed to create anonymous backing file")?;

        let mut mapped = Self {
            file,
            backing: Backing::Anonymous,
            window_size,
            window_count: 0,
        };
        mapped.grow(window_count)?;

        tracing::debug!(window_size, window_count, "created anonymous backing file");

        Ok(mapped)
    }

    /// Maps window `id`. The returned mapping stays valid until dropped.
    pub fn map_window(&self, id: u32) -> Result<MmapMut> {
        ensure!(
            id < self.window_count,
            "window {} out of bounds (window_count={})",
            id,
            self.window_count
        );

        let offset = id as u64 * self.window_size as u64;

        // SAFETY: MmapOptions::map_mut is unsafe because the file could be
        // modified or truncated externally. This is safe because:
        // 1. The backing file is private to this store (or unlinked when anonymous)
        // 2. offset + window_size <= file length, checked above
        // 3. shrink_to() is only called for windows that are no longer mapped
        let mmap = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(self.window_size as usize)
                .map_mut(&self.file)
        };

        match mmap {
            Ok(mmap) => {
                #[cfg(unix)]
                if let Err(e) = mmap.advise(memmap2::Advice::WillNeed) {
                    tracing::trace!(window = id, error = %e, "madvise(WILLNEED) failed");
                }
                Ok(mmap)
            }
            Err(e) => bail!(StorageError::out_of_memory(
                self.window_size as usize,
                format!("failed to map window {}: {}", id, e)
            )),
        }
    }

    /// Appends `additional` zero-filled windows to the file.
    pub fn grow(&mut self, additional: u32) -> Result<()> {
        if additional == 0 {
            return Ok(());
        }

        let Some(new_count) = self.window_count.checked_add(additional) else {
            bail!(StorageError::out_of_memory(
                additional as usize * self.window_size as usize,
                "window count overflow"
            ));
        };
        let new_size = new_count as u64 * self.window_size as u64;

        if let Err(e) = self.file.set_len(new_size) {
            bail!(StorageError::out_of_memory(
                additional as usize * self.window_size as usize,
                format!("failed to extend backing file to {} bytes: {}", new_size, e)
            ));
        }

        tracing::debug!(
            from = self.window_count,
            to = new_count,
            bytes = new_size,
            "grew backing file"
        );

        self.window_count = new_count;
        Ok(())
    }

    /// Truncates the file to `window_count` windows. Callers must have
    /// unmapped every window at or beyond `window_count`.
    pub fn shrink_to(&mut self, window_count: u32) -> Result<()> {
        ensure!(window_count > 0, "cannot shrink backing file to zero windows");

        if window_count >= self.window_count {
            return Ok(());
        }

        let new_size = window_count as u64 * self.window_size as u64;
        self.file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to truncate backing file to {} bytes", new_size))?;

        tracing::debug!(
            from = self.window_count,
            to = window_count,
            "shrank backing file"
        );

        self.window_count = window_count;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        if self.is_anonymous() {
            return Ok(());
        }
        self.file.sync_all().wrap_err("failed to sync backing file")
    }

    pub fn window_count(&self) -> u32 {
        self.window_count
    }

    pub fn window_size(&self) -> u32 {
        self.window_size
    }

    pub fn file_size(&self) -> u64 {
        self.window_count as u64 * self.window_size as u64
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    pub fn is_anonymous(&self) -> bool {
        self.backing == Backing::Anonymous
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const WINDOW: u32 = 4096;

    #[test]
    fn create_new_backing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.mmf");

        let file = MappedFile::create(&path, WINDOW, 3).unwrap();

        assert_eq!(file.window_count(), 3);
        assert_eq!(file.file_size(), 3 * WINDOW as u64);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 3 * WINDOW as u64);
    }

    #[test]
    fn create_fails_with_zero_windows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.mmf");

        let result = MappedFile::create(&path, WINDOW, 0);

        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("initial window count must be at least 1"));
    }

    #[test]
    fn open_rejects_partial_window() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.mmf");
        std::fs::write(&path, vec![0u8; WINDOW as usize + 10]).unwrap();

        let result = MappedFile::open(&path, WINDOW);

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("not a multiple"));
    }

    #[test]
    fn open_fails_for_nonexistent_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.mmf");

        assert!(MappedFile::open(&path, WINDOW).is_err());
    }

    #[test]
    fn window_mapping_persists_across_remap() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.mmf");
        let file = MappedFile::create(&path, WINDOW, 2).unwrap();

        {
            let mut w1 = file.map_window(1).unwrap();
            w1[0] = 0xCA;
            w1[WINDOW as usize - 1] = 0xFE;
        }

        let w1 = file.map_window(1).unwrap();
        let w0 = file.map_window(0).unwrap();
        assert_eq!(w1.len(), WINDOW as usize);
        assert_eq!(w1[0], 0xCA);
        assert_eq!(w1[WINDOW as usize - 1], 0xFE);
        assert_eq!(w0[0], 0);
    }

    #[test]
    fn map_window_out_of_bounds() {
        let file = MappedFile::anonymous(WINDOW, 2).unwrap();

        assert!(file.map_window(1).is_ok());
        assert!(file.map_window(2).is_err());
    }

    #[test]
    fn unaligned_window_size_maps_correctly() {
        let file = MappedFile::anonymous(1024, 8).unwrap();

        {
            let mut w5 = file.map_window(5).unwrap();
            w5[3] = 0x55;
        }

        assert_eq!(file.map_window(5).unwrap()[3], 0x55);
        assert_eq!(file.map_window(4).unwrap()[3], 0);
    }

    #[test]
    fn grow_appends_zeroed_windows_and_preserves_data() {
        let mut file = MappedFile::anonymous(WINDOW, 1).unwrap();
        {
            let mut w0 = file.map_window(0).unwrap();
            w0[7] = 0x77;
        }

        file.grow(2).unwrap();

        assert_eq!(file.window_count(), 3);
        assert_eq!(file.map_window(0).unwrap()[7], 0x77);
        assert!(file.map_window(2).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn shrink_truncates_trailing_windows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.mmf");
        let mut file = MappedFile::create(&path, WINDOW, 4).unwrap();

        file.shrink_to(2).unwrap();
        file.shrink_to(3).unwrap();

        assert_eq!(file.window_count(), 2);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 2 * WINDOW as u64);
        assert!(file.shrink_to(0).is_err());
    }

    #[test]
    fn open_or_create_adopts_existing_windows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.mmf");

        {
            let file = MappedFile::open_or_create(&path, WINDOW, 2).unwrap();
            let mut w = file.map_window(1).unwrap();
            w[0] = 0x42;
            w.flush().unwrap();
        }

        let file = MappedFile::open_or_create(&path, WINDOW, 5).unwrap();
        assert_eq!(file.window_count(), 2);
        assert_eq!(file.map_window(1).unwrap()[0], 0x42);
        assert_eq!(file.backing(), &Backing::File(path));
    }
}
