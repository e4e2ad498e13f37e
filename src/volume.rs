//! Volume trait abstracting the filesystem driver on the visible partition.
//!
//! The command protocol discovers, reads, renames and deletes the command
//! file through this trait, and writes the configuration report with it:
//! - FAT driver mounted on the visible partition (board glue)
//! - In-memory volume (for testing)

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Error types for filesystem operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VolumeError {
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("Mount failed")]
    MountFailed,
    #[error("Filesystem error: {0}")]
    Io(String),
}

/// Abstract filesystem operations on the root directory of the visible volume
pub trait Volume {
    /// (Re)mount the filesystem of the visible partition
    fn mount(&mut self) -> Result<(), VolumeError>;

    /// Modification stamp of a file, `None` when absent
    fn modified(&self, name: &str) -> Option<u32>;

    /// Read at most `max_len` bytes of a file
    fn read_file(&mut self, name: &str, max_len: usize) -> Result<Vec<u8>, VolumeError>;

    /// Create or truncate a file with `data`
    fn write_file(&mut self, name: &str, data: &[u8]) -> Result<(), VolumeError>;

    /// Delete a file
    fn remove(&mut self, name: &str) -> Result<(), VolumeError>;

    /// Rename a file, replacing any existing target
    fn rename(&mut self, from: &str, to: &str) -> Result<(), VolumeError>;

    /// Usable sectors reported by the filesystem, if it can tell
    fn free_sectors(&self) -> Option<u32>;
}

#[derive(Default)]
struct VolumeState {
    files: HashMap<String, (Vec<u8>, u32)>,
    clock: u32,
    mounts: usize,
    free_sectors: Option<u32>,
    fail_mount: bool,
}

/// In-memory volume for testing
/// Uses Rc<RefCell<...>> so clones share the same directory
#[derive(Clone, Default)]
pub struct InMemoryVolume {
    state: Rc<RefCell<VolumeState>>,
}

impl InMemoryVolume {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a file as the host would (bumps its modification stamp)
    pub fn put(&self, name: &str, data: &[u8]) {
        let mut state = self.state.borrow_mut();
        state.clock += 1;
        let stamp = state.clock;
        state.files.insert(name.to_string(), (data.to_vec(), stamp));
    }

    /// Get a copy of file contents (for testing)
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.state.borrow().files.get(name).map(|(data, _)| data.clone())
    }

    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.state.borrow().files.contains_key(name)
    }

    #[must_use]
    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.borrow().files.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of successful mounts (for testing)
    #[must_use]
    pub fn mount_count(&self) -> usize {
        self.state.borrow().mounts
    }

    pub fn set_free_sectors(&self, sectors: Option<u32>) {
        self.state.borrow_mut().free_sectors = sectors;
    }

    pub fn set_fail_mount(&self, fail: bool) {
        self.state.borrow_mut().fail_mount = fail;
    }
}

impl Volume for InMemoryVolume {
    fn mount(&mut self) -> Result<(), VolumeError> {
        let mut state = self.state.borrow_mut();
        if state.fail_mount {
            return Err(VolumeError::MountFailed);
        }
        state.mounts += 1;
        Ok(())
    }

    fn modified(&self, name: &str) -> Option<u32> {
        self.state.borrow().files.get(name).map(|(_, stamp)| *stamp)
    }

    fn read_file(&mut self, name: &str, max_len: usize) -> Result<Vec<u8>, VolumeError> {
        let state = self.state.borrow();
        let (data, _) = state
            .files
            .get(name)
            .ok_or_else(|| VolumeError::NotFound(name.to_string()))?;
        Ok(data[..data.len().min(max_len)].to_vec())
    }

    fn write_file(&mut self, name: &str, data: &[u8]) -> Result<(), VolumeError> {
        self.put(name, data);
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Result<(), VolumeError> {
        self.state
            .borrow_mut()
            .files
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| VolumeError::NotFound(name.to_string()))
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), VolumeError> {
        let mut state = self.state.borrow_mut();
        let entry = state
            .files
            .remove(from)
            .ok_or_else(|| VolumeError::NotFound(from.to_string()))?;
        state.files.insert(to.to_string(), entry);
        Ok(())
    }

    fn free_sectors(&self) -> Option<u32> {
        self.state.borrow().free_sectors
    }
}
