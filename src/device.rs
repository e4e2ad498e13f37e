//! Device facade: the one value the board glue talks to.
//!
//! Owns the controller, the filesystem driver on the visible partition, the
//! mass-storage transport and the command watcher, so every mutation goes
//! through a single `&mut` path:
//! - Host callbacks: `capacity`, `read`, `write`, `status`
//! - Periodic scan: `poll`
//!
//! Every host transfer call restarts the watcher's idle window, so a command
//! file the host is still writing is not picked up mid-transfer.

use log::{info, warn};

use crate::block_device::{BlockDevice, DiskStatus};
use crate::command::{CommandWatcher, PollOutcome};
use crate::config::DeviceConfig;
use crate::controller::{Capacity, ControllerError, DeviceController};
use crate::transport::Transport;
use crate::volume::Volume;

/// Encrypted multi-partition storage device
pub struct Device<D: BlockDevice, V: Volume, T: Transport> {
    controller: DeviceController<D>,
    volume: V,
    transport: T,
    watcher: CommandWatcher,
    config: DeviceConfig,
}

impl<D: BlockDevice, V: Volume, T: Transport> Device<D, V, T> {
    /// Create a device with default config
    pub fn new(block_device: D, volume: V, transport: T) -> Self {
        Self::with_config(block_device, volume, transport, DeviceConfig::default())
    }

    /// Create a device with custom config
    pub fn with_config(block_device: D, volume: V, transport: T, config: DeviceConfig) -> Self {
        Self {
            controller: DeviceController::new(block_device, &config),
            volume,
            transport,
            watcher: CommandWatcher::new(),
            config,
        }
    }

    /// Bring up storage, mount the boot partition and attach the host
    ///
    /// A mount failure is not fatal: the host may still format the volume.
    pub fn init(&mut self) -> Result<(), ControllerError> {
        self.controller.init()?;
        if let Err(e) = self.volume.mount() {
            warn!("boot partition not mountable: {}", e);
        }
        self.watcher.mounted();
        self.transport.start();
        info!("device ready");
        Ok(())
    }

    #[must_use]
    pub fn controller(&self) -> &DeviceController<D> {
        &self.controller
    }

    #[must_use]
    pub fn volume(&self) -> &V {
        &self.volume
    }

    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    #[must_use]
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    #[must_use]
    pub fn status(&self) -> DiskStatus {
        self.controller.status()
    }

    /// Capacity of the visible partition
    pub fn capacity(&mut self) -> Result<Capacity, ControllerError> {
        self.watcher.host_activity();
        let fs_sectors = self.volume.free_sectors();
        self.controller.capacity(fs_sectors)
    }

    pub fn read(
        &mut self,
        sector: u32,
        count: u32,
        buffer: &mut [u8],
    ) -> Result<(), ControllerError> {
        self.watcher.host_activity();
        self.controller.read(sector, count, buffer)
    }

    pub fn write(&mut self, sector: u32, count: u32, buffer: &[u8]) -> Result<(), ControllerError> {
        self.watcher.host_activity();
        self.controller.write(sector, count, buffer)
    }

    /// One directory scan for the command file
    pub fn poll(&mut self) -> PollOutcome {
        self.watcher.poll(
            &mut self.controller,
            &mut self.volume,
            &mut self.transport,
            &self.config,
        )
    }
}
