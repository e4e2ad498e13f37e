//! BlockDevice trait for the physical storage driver.
//!
//! The controller only ever talks to the card through this trait:
//! - SD card driver (board glue, DMA transfers awaited synchronously)
//! - In-memory device (for testing)
//!
//! # Security Notes
//!
//! - The trait has no security logic; translation and ciphering happen in
//!   the controller before a call ever reaches the driver
//! - `MemoryBlockDevice` is for testing only

use std::cell::RefCell;
use std::rc::Rc;

use crate::config::SECTOR_SIZE;

/// Driver status as reported by `status()`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiskStatus {
    Ready,
    NotInitialized,
    NoDisk,
}

/// Control requests understood by the driver
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ioctl {
    /// Number of sectors on the medium
    SectorCount,
    /// Bytes per sector
    SectorSize,
    /// Erase block size in sectors
    BlockSize,
    /// Flush pending writes
    Sync,
}

/// Error types for physical device operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("Device initialization failed")]
    InitFailed,
    #[error("Device not ready")]
    NotReady,
    #[error("Read of {count} sectors at {sector} failed")]
    Read { sector: u32, count: u32 },
    #[error("Write of {count} sectors at {sector} failed")]
    Write { sector: u32, count: u32 },
    #[error("Buffer holds {actual} bytes, transfer needs {expected}")]
    BufferSize { expected: usize, actual: usize },
    #[error("Unsupported control request")]
    Unsupported,
}

/// Abstract physical block driver
pub trait BlockDevice {
    /// Bring the medium up
    fn initialize(&mut self) -> Result<(), DeviceError>;

    /// Current driver status
    fn status(&self) -> DiskStatus;

    /// Read `count` sectors starting at physical `sector` into `buffer`
    fn read_blocks(
        &mut self,
        sector: u32,
        buffer: &mut [u8],
        count: u32,
    ) -> Result<(), DeviceError>;

    /// Write `count` sectors from `buffer` starting at physical `sector`
    fn write_blocks(&mut self, sector: u32, buffer: &[u8], count: u32) -> Result<(), DeviceError>;

    /// Control request; `Sync` answers 0
    fn ioctl(&mut self, request: Ioctl) -> Result<u32, DeviceError>;
}

/// Bytes a transfer of `count` sectors needs
#[must_use]
pub fn transfer_len(count: u32) -> usize {
    count as usize * SECTOR_SIZE
}

/// Medium size and sector size as queried from a driver
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub sector_count: u32,
    pub sector_size: u32,
    pub block_size: u32,
}

impl Geometry {
    /// Ask the driver for its geometry
    pub fn query<D: BlockDevice + ?Sized>(device: &mut D) -> Result<Self, DeviceError> {
        Ok(Self {
            sector_count: device.ioctl(Ioctl::SectorCount)?,
            sector_size: device.ioctl(Ioctl::SectorSize)?,
            block_size: device.ioctl(Ioctl::BlockSize)?,
        })
    }
}

// ============================================================
// IN-MEMORY DEVICE
// ============================================================

#[derive(Default)]
struct MemoryState {
    data: Vec<u8>,
    initialized: bool,
    fail_init: bool,
    fail_reads: bool,
    fail_writes: bool,
    /// (first sector, sector count) of every successful write
    writes: Vec<(u32, u32)>,
    reads: usize,
}

/// In-memory block device for testing
/// Uses Rc<RefCell<...>> so clones share the same underlying medium
#[derive(Clone, Default)]
pub struct MemoryBlockDevice {
    state: Rc<RefCell<MemoryState>>,
}

impl MemoryBlockDevice {
    /// Create a zero-filled device of `sector_count` sectors
    #[must_use]
    pub fn new(sector_count: u32) -> Self {
        let state = MemoryState {
            data: vec![0u8; transfer_len(sector_count)],
            ..MemoryState::default()
        };
        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    #[must_use]
    pub fn sector_count(&self) -> u32 {
        (self.state.borrow().data.len() / SECTOR_SIZE) as u32
    }

    /// Raw contents of one sector (for testing)
    #[must_use]
    pub fn raw_sector(&self, sector: u32) -> Vec<u8> {
        let start = transfer_len(sector);
        self.state.borrow().data[start..start + SECTOR_SIZE].to_vec()
    }

    /// Overwrite one sector bypassing the write log (for testing)
    pub fn poke_sector(&self, sector: u32, data: &[u8]) {
        let start = transfer_len(sector);
        let mut state = self.state.borrow_mut();
        let len = data.len().min(SECTOR_SIZE);
        state.data[start..start + len].copy_from_slice(&data[..len]);
    }

    /// Number of successful write calls
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.state.borrow().writes.len()
    }

    /// Number of successful write calls touching `first..=last`
    #[must_use]
    pub fn writes_touching(&self, first: u32, last: u32) -> usize {
        self.state
            .borrow()
            .writes
            .iter()
            .filter(|&&(sector, count)| {
                let end = sector as u64 + count as u64;
                (sector as u64) <= last as u64 && end > first as u64
            })
            .count()
    }

    #[must_use]
    pub fn read_count(&self) -> usize {
        self.state.borrow().reads
    }

    /// Reset read/write logs (for testing)
    pub fn reset_counters(&self) {
        let mut state = self.state.borrow_mut();
        state.writes.clear();
        state.reads = 0;
    }

    pub fn set_fail_init(&self, fail: bool) {
        self.state.borrow_mut().fail_init = fail;
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.state.borrow_mut().fail_reads = fail;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state.borrow_mut().fail_writes = fail;
    }

    fn range(
        &self,
        sector: u32,
        count: u32,
        buffer_len: usize,
    ) -> Result<core::ops::Range<usize>, ()> {
        let start = transfer_len(sector);
        let len = transfer_len(count);
        let end = start.checked_add(len).ok_or(())?;
        if end > self.state.borrow().data.len() || buffer_len < len {
            return Err(());
        }
        Ok(start..end)
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn initialize(&mut self) -> Result<(), DeviceError> {
        let mut state = self.state.borrow_mut();
        if state.fail_init {
            return Err(DeviceError::InitFailed);
        }
        state.initialized = true;
        Ok(())
    }

    fn status(&self) -> DiskStatus {
        if self.state.borrow().initialized {
            DiskStatus::Ready
        } else {
            DiskStatus::NotInitialized
        }
    }

    fn read_blocks(
        &mut self,
        sector: u32,
        buffer: &mut [u8],
        count: u32,
    ) -> Result<(), DeviceError> {
        let error = DeviceError::Read { sector, count };
        let range = self.range(sector, count, buffer.len()).map_err(|_| error.clone())?;
        let mut state = self.state.borrow_mut();
        if !state.initialized {
            return Err(DeviceError::NotReady);
        }
        if state.fail_reads {
            return Err(error);
        }
        let len = range.len();
        buffer[..len].copy_from_slice(&state.data[range]);
        state.reads += 1;
        Ok(())
    }

    fn write_blocks(&mut self, sector: u32, buffer: &[u8], count: u32) -> Result<(), DeviceError> {
        let error = DeviceError::Write { sector, count };
        let range = self.range(sector, count, buffer.len()).map_err(|_| error.clone())?;
        let mut state = self.state.borrow_mut();
        if !state.initialized {
            return Err(DeviceError::NotReady);
        }
        if state.fail_writes {
            return Err(error);
        }
        let len = range.len();
        state.data[range].copy_from_slice(&buffer[..len]);
        state.writes.push((sector, count));
        Ok(())
    }

    fn ioctl(&mut self, request: Ioctl) -> Result<u32, DeviceError> {
        if !self.state.borrow().initialized {
            return Err(DeviceError::NotReady);
        }
        match request {
            Ioctl::SectorCount => Ok(self.sector_count()),
            Ioctl::SectorSize | Ioctl::BlockSize => Ok(SECTOR_SIZE as u32),
            Ioctl::Sync => Ok(0),
        }
    }
}
