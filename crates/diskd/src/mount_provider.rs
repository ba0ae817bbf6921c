use crate::provider::{ChangeNotifier, DiskMap, DiskProvider};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_config::DiskdConfig;
use fleet_ipc::DiskUuid;
use notify_debouncer_full::notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{DebounceEventResult, Debouncer, RecommendedCache, new_debouncer};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bursts of device events within this window trigger one rescan.
const DEBOUNCE: Duration = Duration::from_millis(250);

/// Undo the octal escapes (`\040` for a space) used in mount tables.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|digit| (b'0'..=b'7').contains(digit)) {
                let value = digits
                    .iter()
                    .fold(0u32, |value, digit| value * 8 + u32::from(digit - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Parse a mount table into `(device, mount point)` pairs.
#[must_use]
pub fn parse_mounts(contents: &str) -> Vec<(String, PathBuf)> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            Some((unescape(device), PathBuf::from(unescape(mount_point))))
        })
        .collect()
}

/// Reports filesystems that have a UUID and are mounted.
///
/// The by-uuid directory is watched for device events and the mount table
/// is re-read on every event and on a poll interval, since mounting does
/// not touch the directory.
#[derive(Debug)]
pub struct MountWatcherProvider {
    by_uuid_dir: PathBuf,
    disks: RwLock<DiskMap>,
    mounts_file: PathBuf,
    poll_interval: Duration,
}

impl MountWatcherProvider {
    /// Creates a new `MountWatcherProvider`.
    pub fn new(
        by_uuid_dir: impl Into<PathBuf>,
        mounts_file: impl Into<PathBuf>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            by_uuid_dir: by_uuid_dir.into(),
            disks: RwLock::new(DiskMap::new()),
            mounts_file: mounts_file.into(),
            poll_interval,
        }
    }

    /// Creates a provider from the `[diskd]` configuration section.
    #[must_use]
    pub fn from_config(config: &DiskdConfig) -> Self {
        Self::new(
            &config.by_uuid_dir,
            &config.mounts_file,
            config.poll_interval(),
        )
    }

    /// Whether the by-uuid directory exists on this machine.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.by_uuid_dir.is_dir()
    }

    /// Read the current mapping from the device directory and mount table.
    ///
    /// # Errors
    ///
    /// Returns an error if either cannot be read.
    pub fn scan(&self) -> io::Result<DiskMap> {
        let contents = std::fs::read_to_string(&self.mounts_file)?;

        let mut mount_points: HashMap<PathBuf, PathBuf> = HashMap::new();
        for (device, mount_point) in parse_mounts(&contents) {
            let device = std::fs::canonicalize(&device).unwrap_or_else(|_| PathBuf::from(device));
            mount_points.entry(device).or_insert(mount_point);
        }

        let mut disks = DiskMap::new();
        for entry in std::fs::read_dir(&self.by_uuid_dir)? {
            let entry = entry?;
            let Ok(device) = std::fs::canonicalize(entry.path()) else {
                continue;
            };

            if let Some(mount_point) = mount_points.get(&device) {
                let uuid = DiskUuid::new(entry.file_name().to_string_lossy().into_owned());
                disks.insert(uuid, mount_point.clone());
            }
        }

        Ok(disks)
    }

    fn refresh(&self, notifier: &ChangeNotifier) {
        match self.scan() {
            Ok(disks) => {
                let mut current = self.disks.write();
                if *current != disks {
                    debug!("mounted disks changed: {:?}", disks);
                    *current = disks;
                    drop(current);
                    notifier.notify();
                }
            }
            Err(e) => warn!("failed to read mounted disks: {}", e),
        }
    }

    fn watch(
        &self,
        events: mpsc::UnboundedSender<()>,
    ) -> notify_debouncer_full::notify::Result<Debouncer<RecommendedWatcher, RecommendedCache>> {
        let mut debouncer = new_debouncer(DEBOUNCE, None, move |result: DebounceEventResult| {
            match result {
                Ok(batch) if !batch.is_empty() => {
                    let _ = events.send(());
                }
                Ok(_) => {}
                Err(errors) => warn!("device watch errors: {:?}", errors),
            }
        })?;

        debouncer.watch(&self.by_uuid_dir, RecursiveMode::NonRecursive)?;

        Ok(debouncer)
    }
}

#[async_trait]
impl DiskProvider for MountWatcherProvider {
    fn name(&self) -> &'static str {
        "mounts"
    }

    fn disks(&self) -> DiskMap {
        self.disks.read().clone()
    }

    async fn run(self: Arc<Self>, notifier: ChangeNotifier, shutdown_token: CancellationToken) {
        self.refresh(&notifier);

        let (sender, mut events) = mpsc::unbounded_channel();
        let _debouncer = match self.watch(sender) {
            Ok(debouncer) => Some(debouncer),
            Err(e) => {
                warn!(
                    "failed to watch {}, polling only: {}",
                    self.by_uuid_dir.display(),
                    e
                );
                None
            }
        };

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown_token.cancelled() => break,
                Some(()) = events.recv() => self.refresh(&notifier),
                _ = ticker.tick() => self.refresh(&notifier),
            }
        }

        debug!("stopped watching {}", self.by_uuid_dir.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::os::unix::fs::symlink;

    use tempfile::{TempDir, tempdir};
    use tokio::time::timeout;

    struct Fixture {
        dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            fs::create_dir(dir.path().join("by-uuid")).unwrap();
            fs::create_dir(dir.path().join("dev")).unwrap();
            fs::write(dir.path().join("mounts"), "").unwrap();
            Self { dir }
        }

        fn device(&self, name: &str, uuid: &str) -> PathBuf {
            let device = self.dir.path().join("dev").join(name);
            fs::write(&device, "").unwrap();
            symlink(&device, self.dir.path().join("by-uuid").join(uuid)).unwrap();
            device
        }

        fn mounts(&self, lines: &[String]) {
            fs::write(self.dir.path().join("mounts"), lines.join("\n")).unwrap();
        }

        fn provider(&self, poll_interval: Duration) -> MountWatcherProvider {
            MountWatcherProvider::new(
                self.dir.path().join("by-uuid"),
                self.dir.path().join("mounts"),
                poll_interval,
            )
        }
    }

    #[test]
    fn test_parse_mounts() {
        let mounts = parse_mounts(
            "/dev/sda1 / ext4 rw,relatime 0 0\n\
             /dev/sdb1 /media/My\\040Disk vfat rw 0 0\n\
             \n\
             proc /proc proc rw 0 0\n",
        );

        assert_eq!(
            mounts,
            vec![
                ("/dev/sda1".to_string(), PathBuf::from("/")),
                ("/dev/sdb1".to_string(), PathBuf::from("/media/My Disk")),
                ("proc".to_string(), PathBuf::from("/proc")),
            ]
        );
    }

    #[test]
    fn test_unescape_leaves_plain_backslashes() {
        assert_eq!(unescape("a\\b"), "a\\b");
        assert_eq!(unescape("tail\\04"), "tail\\04");
        assert_eq!(unescape("tab\\011x"), "tab\tx");
    }

    #[test]
    fn test_scan_maps_uuid_to_mount_point() {
        let fixture = Fixture::new();
        let usb = fixture.device("sdb1", "1234-ABCD");
        fixture.device("sdc1", "5678-EF00");
        fixture.mounts(&[
            format!("{} /media/usb vfat rw 0 0", usb.display()),
            "tmpfs /tmp tmpfs rw 0 0".to_string(),
        ]);

        let provider = fixture.provider(Duration::from_secs(60));
        assert!(provider.is_available());

        let disks = provider.scan().unwrap();
        assert_eq!(
            disks,
            DiskMap::from([(DiskUuid::from("1234-ABCD"), PathBuf::from("/media/usb"))])
        );
    }

    #[tokio::test]
    async fn test_run_notifies_on_mount() {
        let fixture = Fixture::new();
        let usb = fixture.device("sdb1", "1234-ABCD");

        let provider = Arc::new(fixture.provider(Duration::from_millis(20)));
        let (notifier, mut changes) = ChangeNotifier::channel();
        let shutdown_token = CancellationToken::new();
        let task = tokio::spawn(provider.clone().run(notifier, shutdown_token.clone()));

        fixture.mounts(&[format!("{} /media/usb vfat rw 0 0", usb.display())]);

        timeout(Duration::from_secs(2), changes.recv())
            .await
            .expect("mount never noticed")
            .unwrap();
        assert_eq!(
            provider.disks().get(&DiskUuid::from("1234-ABCD")),
            Some(&PathBuf::from("/media/usb"))
        );

        shutdown_token.cancel();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_device_event_triggers_rescan() {
        let fixture = Fixture::new();
        let usb = fixture.dir.path().join("dev").join("sdb1");
        fixture.mounts(&[format!("{} /media/usb vfat rw 0 0", usb.display())]);

        let provider = Arc::new(fixture.provider(Duration::from_secs(3600)));
        let (notifier, mut changes) = ChangeNotifier::channel();
        let shutdown_token = CancellationToken::new();
        let task = tokio::spawn(provider.clone().run(notifier, shutdown_token.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(provider.disks().is_empty());

        fixture.device("sdb1", "1234-ABCD");

        timeout(Duration::from_secs(2), changes.recv())
            .await
            .expect("device event never noticed")
            .unwrap();
        assert_eq!(provider.disks().len(), 1);

        shutdown_token.cancel();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tracing_test::traced_test]
    #[test]
    fn test_read_failure_keeps_last_mapping() {
        let fixture = Fixture::new();
        let usb = fixture.device("sdb1", "1234-ABCD");
        fixture.mounts(&[format!("{} /media/usb vfat rw 0 0", usb.display())]);

        let provider = fixture.provider(Duration::from_secs(60));
        let (notifier, mut changes) = ChangeNotifier::channel();

        provider.refresh(&notifier);
        assert!(changes.try_recv().is_ok());

        fs::remove_file(fixture.dir.path().join("mounts")).unwrap();
        provider.refresh(&notifier);

        assert!(logs_contain("failed to read mounted disks"));
        assert!(changes.try_recv().is_err());
        assert_eq!(provider.disks().len(), 1);
    }
}
