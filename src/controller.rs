//! Device controller: owner of the partition table, the active partition and
//! the live stream key.
//!
//! Serves every host-visible call (capacity, read, write) and the mutation
//! paths used by the command protocol. Host I/O flows:
//!
//! ```text
//! read/write(sector, count)
//!     ↓ translate against the active partition (OutOfRange stops here)
//!     ↓ stream cipher (private partitions only; write ciphers a copy)
//! BlockDevice::read_blocks/write_blocks at the physical sector
//! ```
//!
//! Nothing else holds the table or the key; callers bracket mutations with a
//! `TransportPause`.

use log::{error, info, warn};

use crate::block_device::{transfer_len, BlockDevice, DeviceError, DiskStatus, Geometry, Ioctl};
use crate::cipher::{CipherError, StreamKey};
use crate::config::{DeviceConfig, FactoryDefaults, SECTOR_SIZE};
use crate::partition::{Partition, PartitionError, PartitionIndex, PartitionTable};
use crate::store::{usable_sectors, StoreError, TableStore};
use crate::translate::{translate, OutOfRange};

/// Lifecycle of the controller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    /// `init` has not run yet
    Uninitialized,
    /// Serving I/O
    Ready,
    /// Physical driver failed to initialize; inert from now on
    Halted,
}

/// Error types for controller operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControllerError {
    #[error("Controller halted")]
    Halted,
    #[error("Controller not initialized")]
    NotInitialized,
    #[error("No partition named {0}")]
    UnknownPartition(String),
    #[error("Wrong partition key")]
    WrongKey,
    #[error("No partition at index {0}")]
    BadIndex(PartitionIndex),
    #[error(transparent)]
    OutOfRange(#[from] OutOfRange),
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),
    #[error("Partition error: {0}")]
    Partition(#[from] PartitionError),
}

/// Capacity reported to the host
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capacity {
    pub sectors: u32,
    pub sector_size: u16,
}

/// Find the partition `name` and check `key` against it (public ones need none)
pub fn resolve_partition(
    table: &PartitionTable,
    name: &str,
    key: &str,
) -> Result<PartitionIndex, ControllerError> {
    let (index, partition) = table
        .find_by_name(name)
        .ok_or_else(|| ControllerError::UnknownPartition(name.to_string()))?;
    if partition.is_private() && !crate::credentials_match(&partition.key, key) {
        return Err(ControllerError::WrongKey);
    }
    Ok(index)
}

/// Storage controller over a physical block device
pub struct DeviceController<D: BlockDevice> {
    device: D,
    store: TableStore,
    factory: FactoryDefaults,
    table: PartitionTable,
    active: PartitionIndex,
    /// Present iff the active partition is private (zeroized on drop)
    stream_key: Option<StreamKey>,
    geometry: Option<Geometry>,
    state: ControllerState,
}

impl<D: BlockDevice> DeviceController<D> {
    pub fn new(device: D, config: &DeviceConfig) -> Self {
        Self {
            device,
            store: TableStore::new(config.key_strength),
            factory: config.factory.clone(),
            table: PartitionTable::default(),
            active: PartitionIndex::FIRST,
            stream_key: None,
            geometry: None,
            state: ControllerState::Uninitialized,
        }
    }

    // ============================================================
    // ACCESSORS
    // ============================================================

    #[must_use]
    pub fn state(&self) -> ControllerState {
        self.state
    }

    #[must_use]
    pub fn table(&self) -> &PartitionTable {
        &self.table
    }

    #[must_use]
    pub fn active_index(&self) -> PartitionIndex {
        self.active
    }

    #[must_use]
    pub fn active_partition(&self) -> Option<&Partition> {
        self.table.get(self.active)
    }

    #[must_use]
    pub fn geometry(&self) -> Option<Geometry> {
        self.geometry
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Driver status; `NotInitialized` once halted
    #[must_use]
    pub fn status(&self) -> DiskStatus {
        match self.state {
            ControllerState::Ready => self.device.status(),
            _ => DiskStatus::NotInitialized,
        }
    }

    fn ready_geometry(&self) -> Result<Geometry, ControllerError> {
        match (self.state, self.geometry) {
            (ControllerState::Halted, _) => Err(ControllerError::Halted),
            (ControllerState::Ready, Some(geometry)) => Ok(geometry),
            _ => Err(ControllerError::NotInitialized),
        }
    }

    // ============================================================
    // LIFECYCLE
    // ============================================================

    /// Bring up the driver and expose the transient boot partition
    ///
    /// A driver failure halts the controller; it is reported once here and
    /// every later call answers `Halted`.
    pub fn init(&mut self) -> Result<(), ControllerError> {
        if self.state == ControllerState::Halted {
            return Err(ControllerError::Halted);
        }
        if let Err(e) = self.device.initialize() {
            error!("block device initialization failed: {}", e);
            self.state = ControllerState::Halted;
            return Err(e.into());
        }

        let geometry = Geometry::query(&mut self.device)?;
        let usable = usable_sectors(geometry.sector_count);
        if usable == 0 {
            return Err(StoreError::DeviceTooSmall.into());
        }

        self.table = PartitionTable::transient(&self.factory.boot_partition_name, usable)?;
        self.geometry = Some(geometry);
        self.state = ControllerState::Ready;
        self.activate(PartitionIndex::FIRST)?;
        info!("controller ready: {} sectors, {} usable", geometry.sector_count, usable);
        Ok(())
    }

    /// Sector count and size of the visible partition
    ///
    /// Before any table is installed the filesystem's own view of its size
    /// (`fs_sectors`) is used when available, bounded by the usable device
    /// area, and the transient partition is resized to match.
    pub fn capacity(&mut self, fs_sectors: Option<u32>) -> Result<Capacity, ControllerError> {
        let geometry = self.ready_geometry()?;

        if !self.table.is_initialized() {
            let usable = usable_sectors(geometry.sector_count);
            let sectors = match fs_sectors {
                Some(s) if s > 0 => s.min(usable),
                _ => usable,
            };
            let resized = Partition::public(&self.factory.boot_partition_name, 0, sectors)?;
            if let Some(boot) = self.table.get_mut(PartitionIndex::FIRST) {
                *boot = resized;
            }
        }

        let partition = self
            .active_partition()
            .ok_or(ControllerError::BadIndex(self.active))?;
        Ok(Capacity {
            sectors: partition.sector_number,
            sector_size: SECTOR_SIZE as u16,
        })
    }

    // ============================================================
    // PARTITION SELECTION AND CONFIGURATION
    // ============================================================

    /// Make `index` the visible partition and derive its stream key
    fn activate(&mut self, index: PartitionIndex) -> Result<(), ControllerError> {
        let partition = self.table.get(index).ok_or(ControllerError::BadIndex(index))?;
        self.stream_key = if partition.is_private() {
            Some(StreamKey::derive(&partition.key, self.table.root_key()))
        } else {
            None
        };
        self.active = index;
        info!("partition {} ({}) active", index, partition.name);
        Ok(())
    }

    /// Switch to partition `name`, unlocking it with `key` when private
    ///
    /// On failure the active partition is unchanged.
    pub fn change_partition(
        &mut self,
        name: &str,
        key: &str,
    ) -> Result<PartitionIndex, ControllerError> {
        self.ready_geometry()?;
        let index = resolve_partition(&self.table, name, key).map_err(|e| {
            warn!("partition change to {} rejected: {}", name, e);
            e
        })?;
        self.activate(index)?;
        Ok(index)
    }

    /// Make an already-authorized partition of the current table visible
    pub fn select(&mut self, index: PartitionIndex) -> Result<(), ControllerError> {
        self.ready_geometry()?;
        self.activate(index)
    }

    /// Read the table persisted under `root_key` without installing it
    pub fn load_table(&mut self, root_key: &str) -> Result<PartitionTable, ControllerError> {
        self.ready_geometry()?;
        Ok(self.store.load(&mut self.device, root_key)?)
    }

    /// Validate and persist `table` without installing it
    pub fn persist(&mut self, table: &PartitionTable) -> Result<(), ControllerError> {
        self.ready_geometry()?;
        Ok(self.store.save(&mut self.device, table)?)
    }

    /// Build and persist the factory layout without installing it
    pub fn persist_factory_default(&mut self) -> Result<PartitionTable, ControllerError> {
        self.ready_geometry()?;
        Ok(self.store.initialize_default(&mut self.device, &self.factory)?)
    }

    /// Replace the in-memory table (already persisted or loaded) and activate `active`
    pub fn install(
        &mut self,
        table: PartitionTable,
        active: PartitionIndex,
    ) -> Result<(), ControllerError> {
        self.ready_geometry()?;
        if table.get(active).is_none() {
            return Err(ControllerError::BadIndex(active));
        }
        self.table = table;
        self.activate(active)
    }

    /// Persist `table` and make it the active configuration, partition 0 visible
    ///
    /// Nothing changes in memory unless the write succeeded.
    pub fn apply_config(&mut self, mut table: PartitionTable) -> Result<(), ControllerError> {
        table.set_initialized(true);
        self.persist(&table)?;
        self.install(table, PartitionIndex::FIRST)
    }

    /// Replace the configuration with the persisted factory layout
    pub fn factory_reset(&mut self) -> Result<(), ControllerError> {
        let table = self.persist_factory_default()?;
        self.install(table, PartitionIndex::FIRST)
    }

    // ============================================================
    // HOST I/O
    // ============================================================

    fn physical_sector(
        &self,
        sector: u32,
        count: u32,
        buffer_len: usize,
    ) -> Result<u32, ControllerError> {
        let expected = transfer_len(count);
        if buffer_len != expected {
            return Err(DeviceError::BufferSize { expected, actual: buffer_len }.into());
        }
        let partition = self
            .active_partition()
            .ok_or(ControllerError::BadIndex(self.active))?;
        translate(partition, sector, count).map_err(|e| {
            warn!("rejected host access: {}", e);
            ControllerError::from(e)
        })
    }

    /// Read `count` sectors of the visible partition into `buffer`
    pub fn read(
        &mut self,
        sector: u32,
        count: u32,
        buffer: &mut [u8],
    ) -> Result<(), ControllerError> {
        self.ready_geometry()?;
        let physical = self.physical_sector(sector, count, buffer.len())?;
        if count == 0 {
            return Ok(());
        }
        self.device.read_blocks(physical, buffer, count)?;
        if let Some(key) = &self.stream_key {
            key.apply(buffer)?;
        }
        Ok(())
    }

    /// Write `count` sectors from `buffer` to the visible partition
    ///
    /// `buffer` is left untouched; private data is ciphered in a copy.
    pub fn write(&mut self, sector: u32, count: u32, buffer: &[u8]) -> Result<(), ControllerError> {
        self.ready_geometry()?;
        let physical = self.physical_sector(sector, count, buffer.len())?;
        if count == 0 {
            return Ok(());
        }
        match &self.stream_key {
            Some(key) => {
                let mut ciphered = buffer.to_vec();
                key.apply(&mut ciphered)?;
                self.device.write_blocks(physical, &ciphered, count)?;
            }
            None => self.device.write_blocks(physical, buffer, count)?,
        }
        Ok(())
    }

    /// Flush the physical driver
    pub fn sync(&mut self) -> Result<(), ControllerError> {
        self.ready_geometry()?;
        self.device.ioctl(Ioctl::Sync)?;
        Ok(())
    }
}
