//! SD Partition Storage - Encrypted multi-partition SD card controller
//!
//! This crate turns a single SD card into several logical volumes, exposed to
//! a USB host one at a time and reconfigured in the field through a text
//! command file dropped onto the visible volume. It provides:
//! - A partition table persisted encrypted (block cipher, root key) in the
//!   card's reserved tail sectors
//! - Virtual-to-physical sector translation confined to the visible partition
//! - Per-sector stream ciphering of private partitions
//! - An authenticated command-file protocol with a transport restart bracket
//!
//! ## Architecture
//!
//! ```text
//! Host (USB mass storage)
//!     ↓ capacity / read / write at partition-relative sectors
//! Device (facade)
//!     ├── DeviceController
//!     │     ├── PartitionTable + active PartitionIndex
//!     │     ├── translate()     (OutOfRange stops here)
//!     │     └── StreamKey        (private partitions only)
//!     │   ↓ read_blocks/write_blocks at physical sectors
//!     │ BlockDevice (SD driver)
//!     │     [partition 0][partition 1]...[free][reserved tail: table]
//!     │
//!     └── CommandWatcher (periodic scan)
//!           ↓ command.txt on the Volume
//!         tokenizer → parser → prepare → TransportPause { apply }
//! ```

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod block_device;
pub mod cipher;
pub mod command;
pub mod config;
pub mod controller;
pub mod device;
pub mod partition;
pub mod store;
pub mod translate;
pub mod transport;
pub mod volume;

pub use block_device::{
    transfer_len, BlockDevice, DeviceError, DiskStatus, Geometry, Ioctl, MemoryBlockDevice,
};
pub use cipher::{
    block_decrypt, block_encrypt, derive_key, xor_cipher, CipherError, KeyStrength, StreamKey,
    AES_BLOCK_SIZE,
};
pub use command::{
    parse, Command, CommandError, CommandKind, CommandWatcher, ParseError, Plan, PollOutcome,
};
pub use config::{
    DeviceConfig, FactoryDefaults, Timing, DEVICE_UNIQUE_ID, MAX_PARTITIONS, RESERVED_SECTORS,
    SECTOR_SIZE,
};
pub use controller::{Capacity, ControllerError, ControllerState, DeviceController};
pub use device::Device;
pub use partition::{
    EncryptionMode, Partition, PartitionError, PartitionIndex, PartitionTable, PUBLIC_PARTITION_KEY,
};
pub use store::{validate, StoreError, TableStore, ValidationError};
pub use translate::{translate, OutOfRange};
pub use transport::{RecordingTransport, Transport, TransportEvent, TransportPause};
pub use volume::{InMemoryVolume, Volume, VolumeError};

/// Compare two credentials over their full length
///
/// Runs over every byte of the longer operand whatever the first mismatch.
pub(crate) fn credentials_match(expected: &str, candidate: &str) -> bool {
    let (a, b) = (expected.as_bytes(), candidate.as_bytes());
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= usize::from(x ^ y);
    }
    diff == 0
}
