//! Partition and partition-table data model.
//!
//! - `Partition`: one logical volume, an inclusive sector extent plus name,
//!   key and encryption mode
//! - `PartitionTable`: bounded ordered arena of partitions; the position of a
//!   partition is its stable identity (`PartitionIndex`)
//! - Fixed big-endian serialization stored (encrypted) in the reserved tail
//!
//! The active partition is not part of the table: it is transient state owned
//! by the device controller.

use heapless::String as BoundedString;
use heapless::Vec as BoundedVec;

use crate::config::MAX_PARTITIONS;

// ============================================================
// CONSTANTS
// ============================================================

/// Maximum partition name length in bytes
pub const NAME_LEN: usize = 20;

/// Maximum partition key length in bytes
pub const KEY_LEN: usize = 20;

/// Maximum conf key length in bytes
pub const CONF_KEY_LEN: usize = 20;

/// Maximum root key length in bytes
pub const ROOT_KEY_LEN: usize = 40;

/// Key every public partition must carry
pub const PUBLIC_PARTITION_KEY: &str = "public";

/// Check sequence at the start of a serialized table
pub const TABLE_MAGIC: [u8; 8] = *b"SDPART\x00\x01";

/// Serialized size of one partition record
pub const PARTITION_SERIALIZED_SIZE: usize = 4 + 4 + 4 + NAME_LEN + KEY_LEN + 1;

/// Serialized size of the table header (magic, count, flag, keys)
const TABLE_HEADER_SIZE: usize = TABLE_MAGIC.len() + 1 + 1 + CONF_KEY_LEN + ROOT_KEY_LEN;

/// Serialized size of a whole table (always holds `MAX_PARTITIONS` records)
pub const TABLE_SERIALIZED_SIZE: usize =
    TABLE_HEADER_SIZE + MAX_PARTITIONS * PARTITION_SERIALIZED_SIZE;

pub type PartitionName = BoundedString<NAME_LEN>;
pub type PartitionKey = BoundedString<KEY_LEN>;
pub type ConfKey = BoundedString<CONF_KEY_LEN>;
pub type RootKey = BoundedString<ROOT_KEY_LEN>;

/// Errors building or decoding partitions and tables
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartitionError {
    #[error("{field} longer than {max} bytes")]
    TooLong { field: &'static str, max: usize },
    #[error("Partition must span at least one sector")]
    EmptyExtent,
    #[error("Partition extent overflows the sector space")]
    ExtentOverflow,
    #[error("Partition table is full")]
    TableFull,
    #[error("Serialized table is malformed")]
    Malformed,
}

/// Copy `value` into a bounded string, failing if it does not fit
pub fn bounded<const N: usize>(
    value: &str,
    field: &'static str,
) -> Result<BoundedString<N>, PartitionError> {
    let mut out = BoundedString::new();
    out.push_str(value)
        .map_err(|_| PartitionError::TooLong { field, max: N })?;
    Ok(out)
}

// ============================================================
// PARTITION
// ============================================================

/// Whether partition payload is ciphered on the way to the device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncryptionMode {
    Public,
    Private,
}

impl EncryptionMode {
    /// Mode implied by a key: the sentinel means public
    #[must_use]
    pub fn for_key(key: &str) -> Self {
        if key == PUBLIC_PARTITION_KEY {
            Self::Public
        } else {
            Self::Private
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Self::Public => 0,
            Self::Private => 1,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Public),
            1 => Some(Self::Private),
            _ => None,
        }
    }
}

/// One logical volume (inclusive extent `start_sector..=last_sector`)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    pub start_sector: u32,
    /// Last valid sector, inclusive
    pub last_sector: u32,
    pub sector_number: u32,
    pub name: PartitionName,
    pub key: PartitionKey,
    pub mode: EncryptionMode,
}

impl Partition {
    /// Create a partition of `sector_count` sectors starting at `start_sector`
    pub fn new(
        name: &str,
        key: &str,
        start_sector: u32,
        sector_count: u32,
        mode: EncryptionMode,
    ) -> Result<Self, PartitionError> {
        if sector_count == 0 {
            return Err(PartitionError::EmptyExtent);
        }
        let last_sector = start_sector
            .checked_add(sector_count - 1)
            .ok_or(PartitionError::ExtentOverflow)?;
        Ok(Self {
            start_sector,
            last_sector,
            sector_number: sector_count,
            name: bounded(name, "name")?,
            key: bounded(key, "key")?,
            mode,
        })
    }

    /// Create a public partition (key is the public sentinel)
    pub fn public(
        name: &str,
        start_sector: u32,
        sector_count: u32,
    ) -> Result<Self, PartitionError> {
        Self::new(name, PUBLIC_PARTITION_KEY, start_sector, sector_count, EncryptionMode::Public)
    }

    /// Create a private partition
    pub fn private(
        name: &str,
        key: &str,
        start_sector: u32,
        sector_count: u32,
    ) -> Result<Self, PartitionError> {
        Self::new(name, key, start_sector, sector_count, EncryptionMode::Private)
    }

    /// Whether payload is ciphered
    #[must_use]
    pub fn is_private(&self) -> bool {
        self.mode == EncryptionMode::Private
    }

    /// Whether `last_sector == start_sector + sector_number - 1`
    #[must_use]
    pub fn extent_is_consistent(&self) -> bool {
        (self.start_sector as u64 + self.sector_number as u64)
            .checked_sub(1)
            .map_or(false, |last| last == self.last_sector as u64)
    }

    /// First sector after this partition
    #[must_use]
    pub fn next_sector(&self) -> u64 {
        self.last_sector as u64 + 1
    }

    fn write_bytes(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.start_sector.to_be_bytes());
        out[4..8].copy_from_slice(&self.last_sector.to_be_bytes());
        out[8..12].copy_from_slice(&self.sector_number.to_be_bytes());
        write_str_field(&mut out[12..12 + NAME_LEN], &self.name);
        write_str_field(&mut out[12 + NAME_LEN..12 + NAME_LEN + KEY_LEN], &self.key);
        out[PARTITION_SERIALIZED_SIZE - 1] = self.mode.to_byte();
    }

    fn read_bytes(bytes: &[u8]) -> Result<Self, PartitionError> {
        let word = |at: usize| -> Result<u32, PartitionError> {
            let raw: [u8; 4] = bytes[at..at + 4]
                .try_into()
                .map_err(|_| PartitionError::Malformed)?;
            Ok(u32::from_be_bytes(raw))
        };
        Ok(Self {
            start_sector: word(0)?,
            last_sector: word(4)?,
            sector_number: word(8)?,
            name: read_str_field(&bytes[12..12 + NAME_LEN])?,
            key: read_str_field(&bytes[12 + NAME_LEN..12 + NAME_LEN + KEY_LEN])?,
            mode: EncryptionMode::from_byte(bytes[PARTITION_SERIALIZED_SIZE - 1])
                .ok_or(PartitionError::Malformed)?,
        })
    }
}

/// NUL-padded fixed-width string field
fn write_str_field(out: &mut [u8], value: &str) {
    out.fill(0);
    out[..value.len()].copy_from_slice(value.as_bytes());
}

fn read_str_field<const N: usize>(field: &[u8]) -> Result<BoundedString<N>, PartitionError> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let text = core::str::from_utf8(&field[..end]).map_err(|_| PartitionError::Malformed)?;
    bounded(text, "field").map_err(|_| PartitionError::Malformed)
}

// ============================================================
// PARTITION TABLE
// ============================================================

/// Position of a partition in its table
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionIndex(u8);

impl PartitionIndex {
    /// Partition 0, always public and always present
    pub const FIRST: Self = Self(0);

    /// Index from a raw position, if it can address a table slot
    #[must_use]
    pub fn new(index: usize) -> Option<Self> {
        if index < MAX_PARTITIONS {
            u8::try_from(index).ok().map(Self)
        } else {
            None
        }
    }

    #[must_use]
    pub fn get(self) -> usize {
        self.0 as usize
    }
}

impl core::fmt::Display for PartitionIndex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Device configuration: the ordered set of partitions plus credentials
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartitionTable {
    partitions: BoundedVec<Partition, MAX_PARTITIONS>,
    conf_key: ConfKey,
    root_key: RootKey,
    initialized: bool,
}

impl PartitionTable {
    /// Create an empty table carrying the given credentials
    pub fn new(root_key: &str, conf_key: &str) -> Result<Self, PartitionError> {
        Ok(Self {
            partitions: BoundedVec::new(),
            conf_key: bounded(conf_key, "conf key")?,
            root_key: bounded(root_key, "root key")?,
            initialized: false,
        })
    }

    /// Single public partition spanning `usable_sectors`; never persisted
    pub fn transient(name: &str, usable_sectors: u32) -> Result<Self, PartitionError> {
        let mut table = Self::default();
        table.push(Partition::public(name, 0, usable_sectors)?)?;
        Ok(table)
    }

    /// Append a partition; its index is its position
    pub fn push(&mut self, partition: Partition) -> Result<PartitionIndex, PartitionError> {
        let index = PartitionIndex::new(self.partitions.len()).ok_or(PartitionError::TableFull)?;
        self.partitions
            .push(partition)
            .map_err(|_| PartitionError::TableFull)?;
        Ok(index)
    }

    /// Get a partition by index (checked against the current length)
    #[must_use]
    pub fn get(&self, index: PartitionIndex) -> Option<&Partition> {
        self.partitions.get(index.get())
    }

    pub(crate) fn get_mut(&mut self, index: PartitionIndex) -> Option<&mut Partition> {
        self.partitions.get_mut(index.get())
    }

    /// Find a partition by exact name
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<(PartitionIndex, &Partition)> {
        self.partitions
            .iter()
            .enumerate()
            .find(|(_, p)| p.name.as_str() == name)
            .and_then(|(i, p)| PartitionIndex::new(i).map(|idx| (idx, p)))
    }

    #[must_use]
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    #[must_use]
    pub fn iter(&self) -> impl Iterator<Item = (PartitionIndex, &Partition)> {
        self.partitions
            .iter()
            .enumerate()
            .filter_map(|(i, p)| PartitionIndex::new(i).map(|idx| (idx, p)))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Sum of all partitions' sector counts
    #[must_use]
    pub fn used_sectors(&self) -> u64 {
        self.partitions.iter().map(|p| p.sector_number as u64).sum()
    }

    #[must_use]
    pub fn root_key(&self) -> &str {
        &self.root_key
    }

    #[must_use]
    pub fn conf_key(&self) -> &str {
        &self.conf_key
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn set_initialized(&mut self, initialized: bool) {
        self.initialized = initialized;
    }

    /// Serialize into `out` (at least `TABLE_SERIALIZED_SIZE` bytes)
    ///
    /// Format (big-endian):
    /// - magic: 8 bytes
    /// - partition count: u8, initialized flag: u8
    /// - conf key: 20 bytes, root key: 40 bytes (NUL padded)
    /// - MAX_PARTITIONS records of 61 bytes, unused records zeroed
    pub fn write_bytes(&self, out: &mut [u8]) -> Result<(), PartitionError> {
        if out.len() < TABLE_SERIALIZED_SIZE {
            return Err(PartitionError::Malformed);
        }
        out[..TABLE_SERIALIZED_SIZE].fill(0);

        let mut at = 0;
        out[at..at + TABLE_MAGIC.len()].copy_from_slice(&TABLE_MAGIC);
        at += TABLE_MAGIC.len();
        out[at] = self.partitions.len() as u8;
        out[at + 1] = u8::from(self.initialized);
        at += 2;
        write_str_field(&mut out[at..at + CONF_KEY_LEN], &self.conf_key);
        at += CONF_KEY_LEN;
        write_str_field(&mut out[at..at + ROOT_KEY_LEN], &self.root_key);
        at += ROOT_KEY_LEN;

        for partition in &self.partitions {
            partition.write_bytes(&mut out[at..at + PARTITION_SERIALIZED_SIZE]);
            at += PARTITION_SERIALIZED_SIZE;
        }
        Ok(())
    }

    /// Deserialize; `None` when the magic does not match
    pub fn from_bytes(bytes: &[u8]) -> Result<Option<Self>, PartitionError> {
        if bytes.len() < TABLE_SERIALIZED_SIZE {
            return Err(PartitionError::Malformed);
        }
        if bytes[..TABLE_MAGIC.len()] != TABLE_MAGIC {
            return Ok(None);
        }

        let mut at = TABLE_MAGIC.len();
        let count = bytes[at] as usize;
        let initialized = match bytes[at + 1] {
            0 => false,
            1 => true,
            _ => return Err(PartitionError::Malformed),
        };
        if count > MAX_PARTITIONS {
            return Err(PartitionError::Malformed);
        }
        at += 2;
        let conf_key = read_str_field(&bytes[at..at + CONF_KEY_LEN])?;
        at += CONF_KEY_LEN;
        let root_key = read_str_field(&bytes[at..at + ROOT_KEY_LEN])?;
        at += ROOT_KEY_LEN;

        let mut partitions = BoundedVec::new();
        for _ in 0..count {
            let partition = Partition::read_bytes(&bytes[at..at + PARTITION_SERIALIZED_SIZE])?;
            partitions
                .push(partition)
                .map_err(|_| PartitionError::Malformed)?;
            at += PARTITION_SERIALIZED_SIZE;
        }

        Ok(Some(Self {
            partitions,
            conf_key,
            root_key,
            initialized,
        }))
    }
}
