//! Two-phase command execution.
//!
//! `prepare` authenticates and checks a parsed command against the current
//! state and produces a `Plan` without mutating anything. `apply` carries the
//! plan out; the caller holds the transport bracket around it.

use log::{debug, info, warn};

use crate::block_device::BlockDevice;
use crate::config::DeviceConfig;
use crate::controller::{resolve_partition, ControllerError, DeviceController};
use crate::partition::{PartitionIndex, PartitionTable};
use crate::store::{validate, StoreError};
use crate::volume::Volume;

use super::parser::Command;
use super::report::render;
use super::CommandError;

/// Checked, ready-to-apply effect of a command
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Plan {
    /// Make `index` visible; `unlocked` carries the table read from media
    /// when none was installed yet
    Switch {
        index: PartitionIndex,
        unlocked: Option<PartitionTable>,
    },
    /// Persist and install a validated candidate table
    Replace(PartitionTable),
    /// Persist and install the factory layout
    FactoryReset,
    /// Write a rendered configuration report
    Show(String),
}

impl Plan {
    /// Whether applying the plan changes the visible volume
    #[must_use]
    pub fn switches_partition(&self) -> bool {
        !matches!(self, Self::Show(_))
    }
}

/// Table a root credential unlocked
struct Authorized {
    table: PartitionTable,
    from_media: bool,
}

/// Check the root credential
///
/// Before any table is installed, the credential is checked by decrypting
/// the persisted table with it.
fn authorize<D: BlockDevice>(
    controller: &mut DeviceController<D>,
    credential: &str,
) -> Result<Authorized, CommandError> {
    let current = controller.table();
    if current.is_initialized() {
        if !crate::credentials_match(current.root_key(), credential) {
            return Err(CommandError::Authentication);
        }
        return Ok(Authorized {
            table: current.clone(),
            from_media: false,
        });
    }

    match controller.load_table(credential) {
        Ok(table) => Ok(Authorized {
            table,
            from_media: true,
        }),
        Err(ControllerError::Store(StoreError::Authentication)) => {
            Err(CommandError::Authentication)
        }
        Err(e) => Err(e.into()),
    }
}

fn check_conf_key(table: &PartitionTable, credential: &str) -> Result<(), CommandError> {
    if crate::credentials_match(table.conf_key(), credential) {
        Ok(())
    } else {
        Err(CommandError::Authentication)
    }
}

/// Authenticate and check `command`; nothing is mutated
pub fn prepare<D: BlockDevice>(
    command: &Command<'_>,
    controller: &mut DeviceController<D>,
    config: &DeviceConfig,
) -> Result<Plan, CommandError> {
    match command {
        Command::NoCommand => Err(CommandError::UnknownCommand),

        Command::InitConf { device_id } => {
            if !crate::credentials_match(&config.device_id, device_id) {
                return Err(CommandError::Authentication);
            }
            Ok(Plan::FactoryReset)
        }

        Command::ChangePartition { credential, name, key } => {
            let authorized = authorize(controller, credential)?;
            let index = resolve_partition(&authorized.table, name, key).map_err(|e| match e {
                ControllerError::WrongKey => CommandError::Authentication,
                other => other.into(),
            })?;
            Ok(Plan::Switch {
                index,
                unlocked: authorized.from_media.then_some(authorized.table),
            })
        }

        Command::ShowConf { credential, conf_credential } => {
            let authorized = authorize(controller, credential)?;
            check_conf_key(&authorized.table, conf_credential)?;
            let geometry = controller.geometry().ok_or(ControllerError::NotInitialized)?;
            Ok(Plan::Show(render(&authorized.table, &geometry)))
        }

        Command::UpdateConf { credential, conf_credential, spec } => {
            let authorized = authorize(controller, credential)?;
            check_conf_key(&authorized.table, conf_credential)?;
            let geometry = controller.geometry().ok_or(ControllerError::NotInitialized)?;

            let mut candidate =
                spec.build(authorized.table.root_key(), authorized.table.conf_key())?;
            candidate.set_initialized(true);
            validate(&candidate, geometry.sector_count)?;
            Ok(Plan::Replace(candidate))
        }
    }
}

/// Carry out a prepared plan: persist, complete, then activate
///
/// The command file is completed while the old partition is still visible.
/// An error before completion leaves the in-memory state untouched.
pub fn apply<D: BlockDevice, V: Volume + ?Sized>(
    plan: Plan,
    controller: &mut DeviceController<D>,
    volume: &mut V,
    config: &DeviceConfig,
) -> Result<(), CommandError> {
    match plan {
        Plan::Show(report) => {
            volume.write_file(&config.show_file, report.as_bytes())?;
            complete(volume, config);
            info!("configuration written to {}", config.show_file);
        }
        Plan::Switch { index, unlocked } => {
            complete(volume, config);
            match unlocked {
                Some(table) => controller.install(table, index)?,
                None => controller.select(index)?,
            }
        }
        Plan::Replace(table) => {
            controller.persist(&table)?;
            complete(volume, config);
            controller.install(table, PartitionIndex::FIRST)?;
        }
        Plan::FactoryReset => {
            let table = controller.persist_factory_default()?;
            complete(volume, config);
            controller.install(table, PartitionIndex::FIRST)?;
        }
    }
    Ok(())
}

/// Record success: delete the command file unless retention is requested
pub fn complete<V: Volume + ?Sized>(volume: &mut V, config: &DeviceConfig) {
    if config.retain_command_file {
        debug!("keeping {} for inspection", config.command_file);
        return;
    }
    if let Err(e) = volume.remove(&config.command_file) {
        warn!("could not delete {}: {}", config.command_file, e);
    }
}

/// Record failure: rename the command file so it is not picked up again
pub fn reject<V: Volume + ?Sized>(volume: &mut V, config: &DeviceConfig) {
    let failed = config.failed_command_file();
    if let Err(e) = volume.rename(&config.command_file, &failed) {
        warn!("could not rename {} to {}: {}", config.command_file, failed, e);
    }
}
