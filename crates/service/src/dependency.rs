use crate::topics::state_topic;

use std::collections::BTreeSet;
use std::sync::Arc;

use fleet_bus::{BusClient, BusMessage};
use fleet_ipc::ServiceMessage;
use serde::de::IgnoredAny;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, Default)]
struct Snapshot {
    satisfied: BTreeSet<String>,
    lost: BTreeSet<String>,
}

#[derive(Debug)]
struct Inner {
    dependencies: Vec<String>,
    snapshot: watch::Sender<Snapshot>,
}

/// Tracks whether each dependency's last envelope reported it running.
#[derive(Clone, Debug)]
pub struct DependencyTracker {
    inner: Arc<Inner>,
}

impl DependencyTracker {
    /// Creates a tracker that has observed nothing yet. Duplicate names are
    /// dropped, keeping the first occurrence.
    #[must_use]
    pub fn new(mut dependencies: Vec<String>) -> Self {
        let mut seen = BTreeSet::new();
        dependencies.retain(|dependency| seen.insert(dependency.clone()));

        let (snapshot, _) = watch::channel(Snapshot::default());

        Self {
            inner: Arc::new(Inner {
                dependencies,
                snapshot,
            }),
        }
    }

    /// Create a tracker and subscribe to the state topic of every
    /// dependency.
    ///
    /// # Errors
    ///
    /// Returns the bus error if a subscription fails.
    pub async fn start<B>(
        bus: &B,
        dependencies: Vec<String>,
        topic_prefix: &str,
    ) -> Result<Self, B::Error>
    where
        B: BusClient,
    {
        let tracker = Self::new(dependencies);
        tracker.subscribe(bus, topic_prefix).await?;
        Ok(tracker)
    }

    /// Subscribe to the state topic of every dependency. Retained envelopes
    /// are observed as soon as they are delivered.
    ///
    /// # Errors
    ///
    /// Returns the bus error if a subscription fails.
    pub async fn subscribe<B>(&self, bus: &B, topic_prefix: &str) -> Result<(), B::Error>
    where
        B: BusClient,
    {
        for dependency in &self.inner.dependencies {
            let observer = self.clone();
            let name = dependency.clone();

            bus.subscribe(
                &state_topic(topic_prefix, dependency),
                move |message: BusMessage| {
                    let observer = observer.clone();
                    let name = name.clone();
                    async move {
                        observer.observe(&name, &message.payload);
                    }
                },
            )
            .await?;

            debug!("tracking dependency `{}`", dependency);
        }

        Ok(())
    }

    /// The tracked dependencies.
    #[must_use]
    pub fn dependencies(&self) -> &[String] {
        &self.inner.dependencies
    }

    /// Record an envelope published by `dependency`. An empty payload is a
    /// cleared retained message and counts as stopped. Anything that is not
    /// an envelope is ignored.
    pub fn observe(&self, dependency: &str, payload: &[u8]) {
        if !self.inner.dependencies.iter().any(|d| d == dependency) {
            return;
        }

        let running = if payload.is_empty() {
            false
        } else {
            match ServiceMessage::<IgnoredAny>::from_slice(payload) {
                Ok(message) => message.is_running(),
                Err(e) => {
                    warn!("ignoring unparseable state from `{}`: {}", dependency, e);
                    return;
                }
            }
        };

        self.inner.snapshot.send_if_modified(|snapshot| {
            if running {
                let lost = snapshot.lost.remove(dependency);
                let added = snapshot.satisfied.insert(dependency.to_string());
                if added {
                    info!("dependency `{}` is running", dependency);
                }
                added || lost
            } else if snapshot.satisfied.remove(dependency) {
                warn!("dependency `{}` stopped", dependency);
                snapshot.lost.insert(dependency.to_string());
                true
            } else {
                false
            }
        });
    }

    /// Whether every dependency is currently running.
    #[must_use]
    pub fn all_satisfied(&self) -> bool {
        self.inner.snapshot.borrow().satisfied.len() == self.inner.dependencies.len()
    }

    /// Dependencies not currently running, in declaration order.
    #[must_use]
    pub fn missing(&self) -> Vec<String> {
        let snapshot = self.inner.snapshot.borrow();
        self.inner
            .dependencies
            .iter()
            .filter(|dependency| !snapshot.satisfied.contains(*dependency))
            .cloned()
            .collect()
    }

    /// Dependencies that were running and have since stopped.
    #[must_use]
    pub fn lost_dependencies(&self) -> Vec<String> {
        self.inner.snapshot.borrow().lost.iter().cloned().collect()
    }

    /// Resolves once every dependency is running. Resolves immediately when
    /// there are none.
    pub async fn wait_all_satisfied(&self) {
        let expected = self.inner.dependencies.len();
        let mut receiver = self.inner.snapshot.subscribe();

        if receiver
            .wait_for(|snapshot| snapshot.satisfied.len() == expected)
            .await
            .is_err()
        {
            std::future::pending::<()>().await;
        }
    }

    /// Resolves once a dependency that was running stops.
    pub async fn wait_dependency_lost(&self) {
        let mut receiver = self.inner.snapshot.subscribe();

        if receiver
            .wait_for(|snapshot| !snapshot.lost.is_empty())
            .await
            .is_err()
        {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::time::timeout;

    const RUNNING: &[u8] = br#"{"status": "RUNNING", "state": {}}"#;
    const STOPPED: &[u8] = br#"{"status": "STOPPED", "state": null}"#;

    fn tracker(dependencies: &[&str]) -> DependencyTracker {
        DependencyTracker::new(dependencies.iter().map(ToString::to_string).collect())
    }

    #[tokio::test]
    async fn test_no_dependencies_is_satisfied() {
        let tracker = tracker(&[]);

        timeout(Duration::from_secs(1), tracker.wait_all_satisfied())
            .await
            .expect("empty dependency set should not block");
    }

    #[tokio::test]
    async fn test_waits_for_every_dependency() {
        let tracker = tracker(&["metad", "diskd"]);
        tracker.observe("diskd", RUNNING);

        assert_eq!(tracker.missing(), vec!["metad".to_string()]);
        assert!(
            timeout(Duration::from_millis(50), tracker.wait_all_satisfied())
                .await
                .is_err()
        );

        tracker.observe("metad", RUNNING);

        timeout(Duration::from_secs(1), tracker.wait_all_satisfied())
            .await
            .expect("all dependencies running");
        assert!(tracker.missing().is_empty());
    }

    #[tokio::test]
    async fn test_stopped_and_cleared_are_unsatisfied() {
        let tracker = tracker(&["diskd"]);
        tracker.observe("diskd", STOPPED);
        assert!(!tracker.all_satisfied());

        tracker.observe("diskd", RUNNING);
        assert!(tracker.all_satisfied());

        tracker.observe("diskd", b"");
        assert!(!tracker.all_satisfied());
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn test_garbage_is_ignored() {
        let tracker = tracker(&["diskd"]);
        tracker.observe("diskd", RUNNING);
        tracker.observe("diskd", b"not json");

        assert!(logs_contain("ignoring unparseable state"));
        assert!(tracker.all_satisfied());
        assert!(tracker.lost_dependencies().is_empty());
    }

    #[tokio::test]
    async fn test_dependency_lost() {
        let tracker = tracker(&["diskd"]);

        let waiter = tracker.clone();
        let lost = tokio::spawn(async move { waiter.wait_dependency_lost().await });

        tracker.observe("diskd", STOPPED);
        assert!(tracker.lost_dependencies().is_empty());

        tracker.observe("diskd", RUNNING);
        tracker.observe("diskd", STOPPED);

        timeout(Duration::from_secs(1), lost)
            .await
            .expect("loss should be reported")
            .unwrap();
        assert_eq!(tracker.lost_dependencies(), vec!["diskd".to_string()]);

        tracker.observe("diskd", RUNNING);
        assert!(tracker.lost_dependencies().is_empty());
    }

    #[tokio::test]
    async fn test_start_follows_retained_state() {
        use bytes::Bytes;
        use fleet_bus_memory::{MemoryBroker, MemoryBusClient, MemoryBusClientOptions};

        let broker = MemoryBroker::new();
        let client = |name: &str| {
            MemoryBusClient::new(
                broker.clone(),
                MemoryBusClientOptions {
                    name: name.to_string(),
                },
            )
        };

        let diskd = client("diskd");
        diskd.connect(None).await.unwrap();
        diskd
            .publish("fleet/diskd", Bytes::from_static(RUNNING), true)
            .await
            .unwrap();

        let bus = client("procd");
        bus.connect(None).await.unwrap();
        let tracker = DependencyTracker::start(&bus, vec!["diskd".to_string()], "fleet")
            .await
            .unwrap();

        timeout(Duration::from_secs(1), tracker.wait_all_satisfied())
            .await
            .expect("retained state should satisfy the dependency");

        diskd
            .publish("fleet/diskd", Bytes::from_static(STOPPED), true)
            .await
            .unwrap();

        timeout(Duration::from_secs(1), tracker.wait_dependency_lost())
            .await
            .expect("stop should be reported");
        assert_eq!(tracker.lost_dependencies(), vec!["diskd".to_string()]);
    }
}
