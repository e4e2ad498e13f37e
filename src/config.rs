//! Device configuration
//!
//! Geometry constants are fixed at compile time; everything a board may want
//! to tune (file names, key strength, factory credentials, restart timing)
//! lives in [`DeviceConfig`].

use std::time::Duration;

use crate::cipher::KeyStrength;

/// Bytes per physical and virtual sector
pub const SECTOR_SIZE: usize = 512;

/// Sectors at the end of the device holding the encrypted partition table
pub const RESERVED_SECTORS: u32 = 2;

/// Upper bound on the number of partitions in a table
pub const MAX_PARTITIONS: usize = 10;

/// Default device-unique identifier gating `InitConf`
pub const DEVICE_UNIQUE_ID: &str = "deviceUniqueID";

/// Transport restart and command-scan timing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timing {
    /// Pause between mutating the active partition and restarting the transport
    pub settle_delay: Duration,
    /// Host silence required before a scan may execute the command file
    pub host_idle: Duration,
}

impl Timing {
    /// Production timing (lets the host notice the medium went away)
    pub const PROD: Self = Self {
        settle_delay: Duration::from_millis(500),
        host_idle: Duration::from_secs(1),
    };

    /// No settling or idle wait for unit tests
    pub const TEST: Self = Self {
        settle_delay: Duration::ZERO,
        host_idle: Duration::ZERO,
    };
}

impl Default for Timing {
    fn default() -> Self {
        #[cfg(test)]
        {
            Self::TEST
        }
        #[cfg(not(test))]
        {
            Self::PROD
        }
    }
}

/// Credentials and names used when the device is (re)initialized
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FactoryDefaults {
    pub root_key: String,
    pub conf_key: String,
    /// Name of the transient boot partition before any table is loaded
    pub boot_partition_name: String,
    pub public_partition_name: String,
    pub private_partition_name: String,
    pub private_partition_key: String,
}

impl Default for FactoryDefaults {
    fn default() -> Self {
        Self {
            root_key: "rootKey".to_string(),
            conf_key: "confKey".to_string(),
            boot_partition_name: "partDefault".to_string(),
            public_partition_name: "part0".to_string(),
            private_partition_name: "part1".to_string(),
            private_partition_key: "part1Key".to_string(),
        }
    }
}

/// Runtime configuration of the storage controller
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    /// AES key size used for the persisted table
    pub key_strength: KeyStrength,
    /// Credential accepted by `InitConf` instead of the root key
    pub device_id: String,
    /// Command file polled at the root of the visible partition
    pub command_file: String,
    /// Suffix inserted before the extension of a rejected command file
    pub failed_suffix: String,
    /// File receiving the `ShowConf` rendering
    pub show_file: String,
    /// Longest command file that will be read
    pub max_command_len: usize,
    /// Keep processed command files instead of deleting them (debugging)
    pub retain_command_file: bool,
    pub timing: Timing,
    pub factory: FactoryDefaults,
}

impl DeviceConfig {
    /// Create config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Name a rejected command file is renamed to, e.g. `command-failed.txt`
    #[must_use]
    pub fn failed_command_file(&self) -> String {
        match self.command_file.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => {
                format!("{}{}.{}", stem, self.failed_suffix, ext)
            }
            _ => format!("{}{}", self.command_file, self.failed_suffix),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            key_strength: KeyStrength::default(),
            device_id: DEVICE_UNIQUE_ID.to_string(),
            command_file: "command.txt".to_string(),
            failed_suffix: "-failed".to_string(),
            show_file: "config_show.txt".to_string(),
            max_command_len: 1024,
            retain_command_file: false,
            timing: Timing::default(),
            factory: FactoryDefaults::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_uses_test_timing() {
        let config = DeviceConfig::default();
        assert_eq!(config.timing, Timing::TEST);
        assert_eq!(config.timing.settle_delay, Duration::ZERO);
        assert_eq!(config.timing.host_idle, Duration::ZERO);
    }

    #[test]
    fn test_failed_name_keeps_extension() {
        let config = DeviceConfig::default();
        assert_eq!(config.failed_command_file(), "command-failed.txt");
    }

    #[test]
    fn test_failed_name_without_extension() {
        let config = DeviceConfig {
            command_file: "COMMAND".to_string(),
            ..DeviceConfig::default()
        };
        assert_eq!(config.failed_command_file(), "COMMAND-failed");

        let dotfile = DeviceConfig {
            command_file: ".cmd".to_string(),
            ..DeviceConfig::default()
        };
        assert_eq!(dotfile.failed_command_file(), ".cmd-failed");
    }

    /// The table must fit in the reserved tail and stay AES-block aligned
    #[test]
    fn test_reserved_area_is_block_aligned() {
        let reserved = RESERVED_SECTORS as usize * SECTOR_SIZE;
        assert_eq!(reserved % crate::cipher::AES_BLOCK_SIZE, 0);
        assert!(crate::partition::TABLE_SERIALIZED_SIZE <= reserved);
    }

    #[test]
    fn test_factory_defaults_fit_bounds() {
        let factory = FactoryDefaults::default();
        assert!(factory.root_key.len() <= crate::partition::ROOT_KEY_LEN);
        assert!(factory.conf_key.len() <= crate::partition::CONF_KEY_LEN);
        assert!(factory.private_partition_key.len() <= crate::partition::KEY_LEN);
    }
}
