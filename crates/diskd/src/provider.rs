use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use fleet_ipc::DiskUuid;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Disks by identifier, mapped to their mount paths.
pub type DiskMap = BTreeMap<DiskUuid, PathBuf>;

/// Wakes the disk manager after a provider's mapping changed.
#[derive(Clone, Debug)]
pub struct ChangeNotifier {
    sender: mpsc::UnboundedSender<()>,
}

impl ChangeNotifier {
    /// Creates a notifier and the receiver it wakes.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Signal a change. Notifications coalesce; the manager always re-reads
    /// every provider.
    pub fn notify(&self) {
        let _ = self.sender.send(());
    }
}

/// A source of mounted disks.
#[async_trait]
pub trait DiskProvider
where
    Self: Debug + Send + Sync + 'static,
{
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// The provider's current mapping.
    fn disks(&self) -> DiskMap;

    /// Keep the mapping current until `shutdown_token` is cancelled,
    /// calling `notifier.notify()` after each change. Errors stay inside
    /// the provider.
    async fn run(self: Arc<Self>, notifier: ChangeNotifier, shutdown_token: CancellationToken);
}
