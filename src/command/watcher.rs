//! Directory-scan state machine for the command file.
//!
//! ```text
//!            mount/remount
//!                 ↓            (host I/O within the idle window: deferred)
//!   [just mounted] --scan--> remember stamp, skip
//!                 ↓
//!   [watching] --scan, stamp unchanged--> nothing
//!              --scan, new stamp--> execute (transport stopped)
//!                                     ├─ ok:   file deleted, remount if switched
//!                                     └─ fail: file renamed to *-failed
//! ```
//!
//! A file is executed at most once per modification stamp, and never on the
//! first scan after a mount: a command whose effect remounts the volume
//! cannot retrigger itself.

use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::block_device::BlockDevice;
use crate::config::DeviceConfig;
use crate::controller::DeviceController;
use crate::transport::{Transport, TransportPause};
use crate::volume::Volume;

use super::dispatch::{apply, prepare, reject};
use super::parser::{parse_bytes, CommandKind, ParseError};
use super::CommandError;

/// Result of one directory scan
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// Host I/O too recent; nothing was looked at
    Deferred,
    /// No command file
    Idle,
    /// Command file already handled at this modification stamp
    Unchanged,
    /// First scan after a mount; the file was noted, not executed
    SkippedAfterMount,
    Executed(CommandKind),
    Failed(CommandError),
}

/// Tracks which command file revision was already seen
#[derive(Clone, Debug)]
pub struct CommandWatcher {
    just_mounted: bool,
    last_seen: Option<u32>,
    last_host_activity: Option<Instant>,
}

impl Default for CommandWatcher {
    fn default() -> Self {
        Self {
            just_mounted: true,
            last_seen: None,
            last_host_activity: None,
        }
    }
}

impl CommandWatcher {
    /// Watcher for a freshly mounted volume
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that the volume was (re)mounted
    pub fn mounted(&mut self) {
        self.just_mounted = true;
    }

    #[must_use]
    pub fn just_mounted(&self) -> bool {
        self.just_mounted
    }

    /// Restart the idle window on host I/O
    pub fn host_activity(&mut self) {
        self.last_host_activity = Some(Instant::now());
    }

    /// Whether the host touched the medium within `idle`
    #[must_use]
    pub fn host_busy(&self, idle: Duration) -> bool {
        self.last_host_activity.map_or(false, |at| at.elapsed() < idle)
    }

    /// Scan for the command file and run it if it is new
    pub fn poll<D, V, T>(
        &mut self,
        controller: &mut DeviceController<D>,
        volume: &mut V,
        transport: &mut T,
        config: &DeviceConfig,
    ) -> PollOutcome
    where
        D: BlockDevice,
        V: Volume + ?Sized,
        T: Transport + ?Sized,
    {
        if self.host_busy(config.timing.host_idle) {
            return PollOutcome::Deferred;
        }
        let Some(stamp) = volume.modified(&config.command_file) else {
            self.just_mounted = false;
            self.last_seen = None;
            return PollOutcome::Idle;
        };

        if std::mem::take(&mut self.just_mounted) {
            debug!("{} present right after mount, not executed", config.command_file);
            self.last_seen = Some(stamp);
            return PollOutcome::SkippedAfterMount;
        }
        if self.last_seen == Some(stamp) {
            return PollOutcome::Unchanged;
        }
        self.last_seen = Some(stamp);

        let _pause = TransportPause::acquire(transport, config.timing.settle_delay);
        match self.execute(controller, volume, config) {
            Ok(kind) => {
                info!("command {:?} executed", kind);
                PollOutcome::Executed(kind)
            }
            Err(e) => {
                warn!("command rejected: {}", e);
                reject(volume, config);
                PollOutcome::Failed(e)
            }
        }
    }

    fn execute<D, V>(
        &mut self,
        controller: &mut DeviceController<D>,
        volume: &mut V,
        config: &DeviceConfig,
    ) -> Result<CommandKind, CommandError>
    where
        D: BlockDevice,
        V: Volume + ?Sized,
    {
        // One byte past the limit tells a full file from a truncated one
        let limit = config.max_command_len;
        let raw = volume.read_file(&config.command_file, limit.saturating_add(1))?;
        if raw.len() > limit {
            return Err(ParseError::TooLong(limit).into());
        }
        let command = parse_bytes(&raw)?;
        let kind = command.kind();

        let plan = prepare(&command, controller, config)?;
        let switches = plan.switches_partition();
        apply(plan, controller, volume, config)?;

        if switches {
            if let Err(e) = volume.mount() {
                error!("remount after partition change failed: {}", e);
            }
            self.mounted();
        }
        Ok(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_device::MemoryBlockDevice;
    use crate::transport::RecordingTransport;
    use crate::volume::InMemoryVolume;

    struct Rig {
        controller: DeviceController<MemoryBlockDevice>,
        volume: InMemoryVolume,
        transport: RecordingTransport,
        watcher: CommandWatcher,
        config: DeviceConfig,
    }

    impl Rig {
        fn new() -> Self {
            let config = DeviceConfig::default();
            let mut controller = DeviceController::new(MemoryBlockDevice::new(1000), &config);
            controller.init().unwrap();
            controller.factory_reset().unwrap();
            let mut watcher = CommandWatcher::new();
            // Consume the boot-time guard on an empty volume
            let volume = InMemoryVolume::new();
            let mut transport = RecordingTransport::new();
            let mut probe = volume.clone();
            assert_eq!(
                watcher.poll(&mut controller, &mut probe, &mut transport, &config),
                PollOutcome::Idle
            );
            Self { controller, volume, transport, watcher, config }
        }

        fn poll(&mut self) -> PollOutcome {
            self.watcher
                .poll(&mut self.controller, &mut self.volume, &mut self.transport, &self.config)
        }
    }

    #[test]
    fn test_idle_without_command_file() {
        let mut rig = Rig::new();
        assert_eq!(rig.poll(), PollOutcome::Idle);
        assert!(rig.transport.events().is_empty());
    }

    #[test]
    fn test_recent_host_io_defers_scan() {
        let mut rig = Rig::new();
        rig.config.timing.host_idle = Duration::from_secs(3600);
        rig.volume.put("command.txt", b"ChangePart\nrootKey\npart1 part1Key\n");
        rig.watcher.host_activity();

        assert_eq!(rig.poll(), PollOutcome::Deferred);
        assert_eq!(rig.poll(), PollOutcome::Deferred);
        assert!(rig.volume.exists("command.txt"));
        assert_eq!(rig.controller.active_index().get(), 0);
        assert!(rig.transport.events().is_empty());
    }

    #[test]
    fn test_scan_runs_once_host_is_idle() {
        let mut rig = Rig::new();
        rig.config.timing.host_idle = Duration::from_millis(20);
        rig.volume.put("command.txt", b"ChangePart\nrootKey\npart1 part1Key\n");
        rig.watcher.host_activity();
        assert_eq!(rig.poll(), PollOutcome::Deferred);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(rig.poll(), PollOutcome::Executed(CommandKind::ChangePartition));
    }

    #[test]
    fn test_first_scan_after_mount_is_skipped() {
        let config = DeviceConfig::default();
        let mut controller = DeviceController::new(MemoryBlockDevice::new(1000), &config);
        controller.init().unwrap();
        let mut volume = InMemoryVolume::new();
        volume.put(&config.command_file, b"InitConf\ndeviceUniqueID\n");
        let mut transport = RecordingTransport::new();
        let mut watcher = CommandWatcher::new();

        assert_eq!(
            watcher.poll(&mut controller, &mut volume, &mut transport, &config),
            PollOutcome::SkippedAfterMount
        );
        assert_eq!(
            watcher.poll(&mut controller, &mut volume, &mut transport, &config),
            PollOutcome::Unchanged
        );
        assert!(volume.exists(&config.command_file));
        assert!(!controller.table().is_initialized());

        // Host rewrites the file: now it runs
        volume.put(&config.command_file, b"InitConf\ndeviceUniqueID\n");
        assert_eq!(
            watcher.poll(&mut controller, &mut volume, &mut transport, &config),
            PollOutcome::Executed(CommandKind::InitConf)
        );
        assert!(controller.table().is_initialized());
    }

    #[test]
    fn test_switch_remounts_and_arms_guard() {
        let mut rig = Rig::new();
        rig.volume.put("command.txt", b"ChangePart\nrootKey\npart1 part1Key\n");

        assert_eq!(rig.poll(), PollOutcome::Executed(CommandKind::ChangePartition));
        assert_eq!(rig.controller.active_index().get(), 1);
        assert!(!rig.volume.exists("command.txt"));
        assert_eq!(rig.volume.mount_count(), 1);
        assert!(rig.watcher.just_mounted());
        assert!(rig.transport.is_running());
        assert_eq!(rig.transport.restarts(), 1);
    }

    #[test]
    fn test_failure_renames_and_restarts_transport() {
        let mut rig = Rig::new();
        rig.volume.put("command.txt", b"ChangePart\nrootKey\npart1 wrong\n");

        assert_eq!(rig.poll(), PollOutcome::Failed(CommandError::Authentication));
        assert_eq!(rig.controller.active_index().get(), 0);
        assert_eq!(rig.volume.file_names(), vec!["command-failed.txt".to_string()]);
        assert!(rig.transport.is_running());
        assert_eq!(rig.volume.mount_count(), 0);
        assert!(!rig.watcher.just_mounted());
    }

    #[test]
    fn test_garbage_file_fails() {
        let mut rig = Rig::new();
        rig.volume.put("command.txt", &[0xff, 0x00, 0xfe]);
        assert_eq!(rig.poll(), PollOutcome::Failed(CommandError::Parse(ParseError::NotUtf8)));
        assert!(rig.volume.exists("command-failed.txt"));
    }

    #[test]
    fn test_file_at_length_limit_runs() {
        let mut rig = Rig::new();
        let mut input = b"ChangePart\nrootKey\npart1 part1Key\n".to_vec();
        rig.config.max_command_len = input.len();
        rig.volume.put("command.txt", &input);
        assert_eq!(rig.poll(), PollOutcome::Executed(CommandKind::ChangePartition));

        // One byte more and the same command is refused untouched
        let mut rig = Rig::new();
        input.push(b'\n');
        rig.config.max_command_len = input.len() - 1;
        rig.volume.put("command.txt", &input);
        assert_eq!(
            rig.poll(),
            PollOutcome::Failed(CommandError::Parse(ParseError::TooLong(input.len() - 1)))
        );
        assert_eq!(rig.controller.active_index().get(), 0);
        assert_eq!(rig.volume.file_names(), vec!["command-failed.txt".to_string()]);
        assert!(rig.transport.is_running());
    }

    #[test]
    fn test_show_conf_does_not_remount() {
        let mut rig = Rig::new();
        rig.volume.put("command.txt", b"ShowConf\nrootKey\nconfKey\n");

        assert_eq!(rig.poll(), PollOutcome::Executed(CommandKind::ShowConf));
        let report = String::from_utf8(rig.volume.get("config_show.txt").unwrap()).unwrap();
        assert!(report.contains("part1Key"));
        assert_eq!(rig.volume.mount_count(), 0);
        assert!(!rig.watcher.just_mounted());
        assert_eq!(rig.transport.restarts(), 1);
    }

    #[test]
    fn test_retained_file_not_rerun() {
        let mut rig = Rig::new();
        rig.config.retain_command_file = true;
        rig.volume.put("command.txt", b"ShowConf\nrootKey\nconfKey\n");

        assert_eq!(rig.poll(), PollOutcome::Executed(CommandKind::ShowConf));
        assert_eq!(rig.poll(), PollOutcome::Unchanged);
        assert_eq!(rig.transport.restarts(), 1);
    }
}
