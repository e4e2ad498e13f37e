//! Partition table store: validation and encrypted persistence in the
//! reserved tail sectors of the device.
//!
//! # Security Properties
//!
//! - **Encrypted at rest**: the serialized table is AES-ECB encrypted under a
//!   key stretched from its own root key
//! - **Plaintext check only**: a load is accepted when the decrypted root key
//!   field equals the candidate root key. There is no authentication tag, so
//!   this detects a wrong key, not tampering
//! - **Validate before write**: an invalid table never reaches the device
//! - **Zeroize**: plaintext serialization buffers are cleared after use

use log::{debug, info, warn};
use zeroize::Zeroize;

use crate::block_device::{transfer_len, BlockDevice, DeviceError, Ioctl};
use crate::cipher::{block_decrypt, block_encrypt, CipherError, KeyStrength};
use crate::config::{FactoryDefaults, RESERVED_SECTORS};
use crate::partition::{
    EncryptionMode, Partition, PartitionError, PartitionIndex, PartitionTable,
    PUBLIC_PARTITION_KEY,
};

/// Bytes of the reserved tail holding the table
pub const RESERVED_BYTES: usize = RESERVED_SECTORS as usize * crate::config::SECTOR_SIZE;

/// Why a candidate table was rejected (first failing check only)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Conf key is empty")]
    MissingConfKey,
    #[error("Root key is empty")]
    MissingRootKey,
    #[error("Table holds {0} partitions, at least 2 required")]
    TooFewPartitions(usize),
    #[error("Partition {0} has no name")]
    MissingName(PartitionIndex),
    #[error("Partition {0} has no key")]
    MissingKey(PartitionIndex),
    #[error("Private partition {0} uses the public key")]
    PrivateWithPublicKey(PartitionIndex),
    #[error("Public partition {0} does not use the public key")]
    PublicWithoutPublicKey(PartitionIndex),
    #[error("Partition {0} extent does not match its sector count")]
    ExtentMismatch(PartitionIndex),
    #[error("Partition {0} does not start right after its predecessor")]
    NotContiguous(PartitionIndex),
    #[error("Partitions use {used} sectors, only {available} available")]
    CapacityExceeded { used: u64, available: u64 },
}

/// Error types for table persistence
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Wrong root key or corrupted configuration")]
    Authentication,
    #[error("Device has never been configured")]
    NotConfigured,
    #[error("Device too small for a partition table")]
    DeviceTooSmall,
    #[error("Invalid configuration: {0}")]
    Validation(#[from] ValidationError),
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),
    #[error("Partition error: {0}")]
    Partition(#[from] PartitionError),
}

/// Sectors left for partitions once the reserved tail is set aside
#[must_use]
pub fn usable_sectors(capacity_sectors: u32) -> u32 {
    capacity_sectors.saturating_sub(RESERVED_SECTORS)
}

/// Check a candidate table against a device of `capacity_sectors` sectors
pub fn validate(table: &PartitionTable, capacity_sectors: u32) -> Result<(), ValidationError> {
    if table.conf_key().is_empty() {
        return Err(ValidationError::MissingConfKey);
    }
    if table.root_key().is_empty() {
        return Err(ValidationError::MissingRootKey);
    }
    if table.len() < 2 {
        return Err(ValidationError::TooFewPartitions(table.len()));
    }

    let mut expected_start = 0u64;
    for (index, partition) in table.iter() {
        if partition.name.is_empty() {
            return Err(ValidationError::MissingName(index));
        }
        if partition.key.is_empty() {
            return Err(ValidationError::MissingKey(index));
        }
        let public_key = partition.key.as_str() == PUBLIC_PARTITION_KEY;
        match partition.mode {
            EncryptionMode::Private if public_key => {
                return Err(ValidationError::PrivateWithPublicKey(index));
            }
            EncryptionMode::Public if !public_key => {
                return Err(ValidationError::PublicWithoutPublicKey(index));
            }
            _ => {}
        }
        if !partition.extent_is_consistent() {
            return Err(ValidationError::ExtentMismatch(index));
        }
        if partition.start_sector as u64 != expected_start {
            return Err(ValidationError::NotContiguous(index));
        }
        expected_start = partition.next_sector();
    }

    let used = table.used_sectors();
    let available = usable_sectors(capacity_sectors) as u64;
    if used > available {
        return Err(ValidationError::CapacityExceeded { used, available });
    }
    Ok(())
}

/// Two-partition factory layout: public lower half, private remainder
pub fn factory_layout(
    capacity_sectors: u32,
    defaults: &FactoryDefaults,
) -> Result<PartitionTable, StoreError> {
    let half = capacity_sectors / 2;
    let usable = usable_sectors(capacity_sectors);
    // Partition 0 is [0, half]; partition 1 needs at least one sector after it
    if usable <= half + 1 {
        return Err(StoreError::DeviceTooSmall);
    }

    let mut table = PartitionTable::new(&defaults.root_key, &defaults.conf_key)?;
    table.push(Partition::public(&defaults.public_partition_name, 0, half + 1)?)?;
    table.push(Partition::private(
        &defaults.private_partition_name,
        &defaults.private_partition_key,
        half + 1,
        usable - (half + 1),
    )?)?;
    table.set_initialized(true);
    Ok(table)
}

/// Reads and writes the encrypted table in the reserved tail sectors
#[derive(Clone, Copy, Debug, Default)]
pub struct TableStore {
    strength: KeyStrength,
}

impl TableStore {
    pub fn new(strength: KeyStrength) -> Self {
        Self { strength }
    }

    #[must_use]
    pub fn strength(&self) -> KeyStrength {
        self.strength
    }

    fn tail_start<D: BlockDevice + ?Sized>(device: &mut D) -> Result<(u32, u32), StoreError> {
        let capacity = device.ioctl(Ioctl::SectorCount)?;
        if capacity <= RESERVED_SECTORS {
            return Err(StoreError::DeviceTooSmall);
        }
        Ok((capacity, capacity - RESERVED_SECTORS))
    }

    /// Load the table persisted under `root_key`
    ///
    /// Visible state is untouched on every failure path.
    pub fn load<D: BlockDevice + ?Sized>(
        &self,
        device: &mut D,
        root_key: &str,
    ) -> Result<PartitionTable, StoreError> {
        let (_, tail) = Self::tail_start(device)?;
        let mut buffer = vec![0u8; RESERVED_BYTES];
        device.read_blocks(tail, &mut buffer, RESERVED_SECTORS)?;

        if buffer.iter().all(|&b| b == 0x00) || buffer.iter().all(|&b| b == 0xFF) {
            return Err(StoreError::NotConfigured);
        }

        block_decrypt(&mut buffer, root_key.as_bytes(), self.strength)?;
        let decoded = PartitionTable::from_bytes(&buffer);
        buffer.zeroize();

        let table = match decoded {
            Ok(Some(table)) => table,
            // Wrong key and garbage are indistinguishable after decryption
            Ok(None) | Err(_) => {
                warn!("configuration load rejected");
                return Err(StoreError::Authentication);
            }
        };
        if !crate::credentials_match(table.root_key(), root_key) {
            warn!("configuration load rejected");
            return Err(StoreError::Authentication);
        }

        debug!("configuration loaded ({} partitions)", table.len());
        Ok(table)
    }

    /// Validate and persist `table` under its own root key
    pub fn save<D: BlockDevice + ?Sized>(
        &self,
        device: &mut D,
        table: &PartitionTable,
    ) -> Result<(), StoreError> {
        let (capacity, tail) = Self::tail_start(device)?;
        validate(table, capacity)?;

        let mut buffer = vec![0u8; RESERVED_BYTES];
        table.write_bytes(&mut buffer)?;
        let encrypted = block_encrypt(&mut buffer, table.root_key().as_bytes(), self.strength);
        if let Err(e) = encrypted {
            buffer.zeroize();
            return Err(e.into());
        }

        debug_assert_eq!(buffer.len(), transfer_len(RESERVED_SECTORS));
        device.write_blocks(tail, &buffer, RESERVED_SECTORS)?;
        device.ioctl(Ioctl::Sync)?;
        info!("configuration saved ({} partitions)", table.len());
        Ok(())
    }

    /// Build the factory layout for this device and persist it
    pub fn initialize_default<D: BlockDevice + ?Sized>(
        &self,
        device: &mut D,
        defaults: &FactoryDefaults,
    ) -> Result<PartitionTable, StoreError> {
        let (capacity, _) = Self::tail_start(device)?;
        let table = factory_layout(capacity, defaults)?;
        self.save(device, &table)?;
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_device::MemoryBlockDevice;

    const CAPACITY: u32 = 1000;

    fn device() -> MemoryBlockDevice {
        let mut device = MemoryBlockDevice::new(CAPACITY);
        device.initialize().unwrap();
        device
    }

    fn table(counts: &[u32]) -> PartitionTable {
        let mut table = PartitionTable::new("rootKey", "confKey").unwrap();
        let mut start = 0;
        for (i, &count) in counts.iter().enumerate() {
            let partition = if i == 0 {
                Partition::public("part0", start, count).unwrap()
            } else {
                let name = format!("part{}", i);
                Partition::private(&name, &format!("key{}", i), start, count).unwrap()
            };
            table.push(partition).unwrap();
            start += count;
        }
        table.set_initialized(true);
        table
    }

    #[test]
    fn test_validate_accepts_full_device() {
        assert_eq!(validate(&table(&[500, 498]), CAPACITY), Ok(()));
    }

    #[test]
    fn test_validate_rejects_capacity_overflow() {
        assert_eq!(
            validate(&table(&[500, 499]), CAPACITY),
            Err(ValidationError::CapacityExceeded { used: 999, available: 998 })
        );
    }

    #[test]
    fn test_validate_rejects_single_partition() {
        assert_eq!(validate(&table(&[10]), CAPACITY), Err(ValidationError::TooFewPartitions(1)));
    }

    #[test]
    fn test_validate_checks_keys_first() {
        let mut no_root = PartitionTable::new("", "confKey").unwrap();
        for p in table(&[10, 10]).partitions() {
            no_root.push(p.clone()).unwrap();
        }
        assert_eq!(validate(&no_root, CAPACITY), Err(ValidationError::MissingRootKey));

        let no_conf = PartitionTable::new("root", "").unwrap();
        assert_eq!(validate(&no_conf, CAPACITY), Err(ValidationError::MissingConfKey));
    }

    #[test]
    fn test_validate_public_key_rules() {
        let mut t = table(&[10, 10]);
        let secret = crate::partition::bounded("secret", "key").unwrap();
        t.get_mut(PartitionIndex::FIRST).unwrap().key = secret;
        assert_eq!(
            validate(&t, CAPACITY),
            Err(ValidationError::PublicWithoutPublicKey(PartitionIndex::FIRST))
        );

        let mut t = table(&[10, 10]);
        let second = PartitionIndex::new(1).unwrap();
        t.get_mut(second).unwrap().key = crate::partition::bounded("public", "key").unwrap();
        assert_eq!(validate(&t, CAPACITY), Err(ValidationError::PrivateWithPublicKey(second)));
    }

    #[test]
    fn test_validate_rejects_exclusive_last_sector() {
        let mut t = table(&[10, 10]);
        let second = PartitionIndex::new(1).unwrap();
        t.get_mut(second).unwrap().last_sector += 1;
        assert_eq!(validate(&t, CAPACITY), Err(ValidationError::ExtentMismatch(second)));
    }

    #[test]
    fn test_validate_rejects_gap_or_overlap() {
        let mut t = PartitionTable::new("r", "c").unwrap();
        t.push(Partition::public("a", 0, 10).unwrap()).unwrap();
        t.push(Partition::private("b", "k", 5, 10).unwrap()).unwrap();
        assert_eq!(
            validate(&t, CAPACITY),
            Err(ValidationError::NotContiguous(PartitionIndex::new(1).unwrap()))
        );
    }

    #[test]
    fn test_save_load_roundtrip() {
        let store = TableStore::default();
        let mut device = device();
        let original = table(&[400, 300, 200]);

        store.save(&mut device, &original).unwrap();
        let loaded = store.load(&mut device, "rootKey").unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn test_save_writes_only_reserved_tail() {
        let store = TableStore::default();
        let mut device = device();
        store.save(&mut device, &table(&[10, 10])).unwrap();

        assert_eq!(device.write_count(), 1);
        assert_eq!(device.writes_touching(CAPACITY - RESERVED_SECTORS, CAPACITY - 1), 1);
        assert_eq!(device.writes_touching(0, CAPACITY - RESERVED_SECTORS - 1), 0);
    }

    #[test]
    fn test_load_wrong_key_is_authentication_error() {
        let store = TableStore::default();
        let mut device = device();
        store.save(&mut device, &table(&[10, 10])).unwrap();
        assert_eq!(store.load(&mut device, "wrongKey"), Err(StoreError::Authentication));
    }

    #[test]
    fn test_load_blank_device_is_not_configured() {
        let store = TableStore::default();
        let mut device = device();
        assert_eq!(store.load(&mut device, "rootKey"), Err(StoreError::NotConfigured));
    }

    #[test]
    fn test_tail_is_not_plaintext() {
        let store = TableStore::default();
        let mut device = device();
        store.save(&mut device, &table(&[10, 10])).unwrap();

        let tail = device.raw_sector(CAPACITY - RESERVED_SECTORS);
        assert_ne!(&tail[..crate::partition::TABLE_MAGIC.len()], &crate::partition::TABLE_MAGIC);
        let text = String::from_utf8_lossy(&tail);
        assert!(!text.contains("rootKey"));
    }

    #[test]
    fn test_invalid_table_never_written() {
        let store = TableStore::default();
        let mut device = device();
        let result = store.save(&mut device, &table(&[600, 600]));
        assert!(matches!(
            result,
            Err(StoreError::Validation(ValidationError::CapacityExceeded { .. }))
        ));
        assert_eq!(device.write_count(), 0);
    }

    #[test]
    fn test_factory_layout_spans_device() {
        let t = factory_layout(CAPACITY, &FactoryDefaults::default()).unwrap();
        let p0 = &t.partitions()[0];
        let p1 = &t.partitions()[1];
        assert_eq!((p0.start_sector, p0.last_sector), (0, 500));
        assert_eq!(p0.mode, EncryptionMode::Public);
        assert_eq!(p1.start_sector, 501);
        assert_eq!(p1.last_sector, CAPACITY - RESERVED_SECTORS - 1);
        assert_eq!(p1.key.as_str(), "part1Key");
        assert!(t.is_initialized());
        assert_eq!(validate(&t, CAPACITY), Ok(()));
    }

    #[test]
    fn test_initialize_default_persists() {
        let store = TableStore::new(KeyStrength::Aes256);
        let mut device = device();
        let t = store.initialize_default(&mut device, &FactoryDefaults::default()).unwrap();
        assert_eq!(store.load(&mut device, "rootKey").unwrap(), t);
    }

    #[test]
    fn test_factory_layout_rejects_tiny_device() {
        assert_eq!(
            factory_layout(4, &FactoryDefaults::default()),
            Err(StoreError::DeviceTooSmall)
        );
    }
}
