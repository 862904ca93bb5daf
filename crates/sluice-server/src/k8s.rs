//! Kubernetes StatefulSet integration.
//!
//! Inside a StatefulSet, the pod hostname ends in the pod's ordinal, which
//! maps directly onto the group member number (`ordinal + 1`). The replica
//! count can additionally be watched: membership is fixed for the lifetime
//! of a run, so any change presses the panic button and the operator is
//! expected to restart every peer with the new group size.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{info, warn};

use sluice_core::error::ConfigError;
use sluice_core::fatal::PanicButton;

/// Pod identity parsed from a StatefulSet hostname (`<set-name>-<ordinal>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatefulSetInfo {
    /// StatefulSet name.
    pub set_name: String,
    /// Zero-based pod ordinal.
    pub pod_ordinal: u16,
}

impl StatefulSetInfo {
    /// Parses a StatefulSet pod hostname.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` when the hostname has no trailing
    /// ordinal.
    pub fn parse(hostname: &str) -> Result<Self, ConfigError> {
        let (set_name, ordinal) = hostname.rsplit_once('-').ok_or_else(|| {
            ConfigError::Invalid(format!(
                "hostname '{hostname}' does not look like a StatefulSet pod name"
            ))
        })?;
        let pod_ordinal = ordinal.parse().map_err(|_| {
            ConfigError::Invalid(format!(
                "hostname '{hostname}' does not end in a numeric pod ordinal"
            ))
        })?;
        Ok(Self {
            set_name: set_name.to_string(),
            pod_ordinal,
        })
    }

    /// Reads the pod identity from the `HOSTNAME` environment variable.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` when the variable is missing or not
    /// a StatefulSet pod name.
    pub fn from_hostname() -> Result<Self, ConfigError> {
        let hostname = std::env::var("HOSTNAME")
            .map_err(|_| ConfigError::Invalid("HOSTNAME environment variable not set".into()))?;
        Self::parse(&hostname)
    }

    /// The group member number this pod should take (`ordinal + 1`).
    #[must_use]
    pub fn member_number(&self) -> u16 {
        self.pod_ordinal + 1
    }
}

/// Supplies the current replica count of the group's controller.
#[async_trait]
pub trait ReplicaSource: Send + Sync {
    /// Reads the current replica count.
    async fn replicas(&self) -> Result<u16, ConfigError>;
}

/// Reads the replica count from a file (for example, projected into the
/// pod by the operator). The file holds one integer.
#[derive(Debug, Clone)]
pub struct FileReplicaSource {
    path: PathBuf,
}

impl FileReplicaSource {
    /// Creates a source reading the given file.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ReplicaSource for FileReplicaSource {
    async fn replicas(&self) -> Result<u16, ConfigError> {
        let text = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            ConfigError::Invalid(format!(
                "cannot read replica count from {}: {e}",
                self.path.display()
            ))
        })?;
        text.trim().parse().map_err(|_| {
            ConfigError::Invalid(format!(
                "replica count file {} does not hold an integer",
                self.path.display()
            ))
        })
    }
}

/// Handle for stopping the replica watcher.
#[derive(Debug)]
pub struct ReplicaWatcher {
    stop: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl ReplicaWatcher {
    /// Stops the watcher.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
    }
}

/// Reads the replica count once, then watches it; any change presses the
/// panic button (membership is immutable for the lifetime of a run).
///
/// # Errors
///
/// Returns the source's error when the initial read fails.
pub async fn replicas_and_watch(
    source: Arc<dyn ReplicaSource>,
    panic_button: Arc<PanicButton>,
    poll_interval: Duration,
) -> Result<(u16, ReplicaWatcher), ConfigError> {
    let initial = source.replicas().await?;
    info!(replicas = initial, "watching replica count for changes");

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                _ = stop_rx.changed() => return,
                _ = ticker.tick() => {}
            }
            match source.replicas().await {
                Ok(current) if current != initial => {
                    panic_button.press(format!(
                        "group size changed from {initial} to {current}; \
                         restarting so all peers pick up the new membership"
                    ));
                    return;
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "replica count check failed; will retry"),
            }
        }
    });

    Ok((
        initial,
        ReplicaWatcher {
            stop: stop_tx,
            task,
        },
    ))
}

/// Quiet period before streaming when replica watching is active: long
/// enough for peers to observe a scale change and exit before this
/// instance starts writing.
#[must_use]
pub fn startup_quiet_period(poll_interval: Duration) -> Duration {
    poll_interval.saturating_mul(2) + Duration::from_secs(2)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU16, Ordering};

    use super::*;

    #[test]
    fn test_parse_pod_hostname() {
        let info = StatefulSetInfo::parse("sluice-worker-3").unwrap();
        assert_eq!(info.set_name, "sluice-worker");
        assert_eq!(info.pod_ordinal, 3);
        assert_eq!(info.member_number(), 4);
    }

    #[test]
    fn test_parse_rejects_non_pod_hostnames() {
        assert!(StatefulSetInfo::parse("not a pod").is_err());
        assert!(StatefulSetInfo::parse("worker-abc").is_err());
        assert!(StatefulSetInfo::parse("plainhost").is_err());
    }

    struct FakeSource {
        replicas: AtomicU16,
    }

    #[async_trait]
    impl ReplicaSource for FakeSource {
        async fn replicas(&self) -> Result<u16, ConfigError> {
            Ok(self.replicas.load(Ordering::Relaxed))
        }
    }

    #[tokio::test]
    async fn test_replica_change_presses_panic_button() {
        let source = Arc::new(FakeSource {
            replicas: AtomicU16::new(3),
        });
        let panic_button = Arc::new(PanicButton::new());
        let (initial, watcher) = replicas_and_watch(
            Arc::clone(&source) as Arc<dyn ReplicaSource>,
            Arc::clone(&panic_button),
            Duration::from_millis(10),
        )
        .await
        .unwrap();
        assert_eq!(initial, 3);
        assert!(!panic_button.is_pressed());

        source.replicas.store(4, Ordering::Relaxed);
        let fatal = tokio::time::timeout(Duration::from_secs(2), panic_button.wait())
            .await
            .unwrap();
        assert!(fatal.message().contains("3 to 4"));
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_stable_replicas_stay_quiet() {
        let source = Arc::new(FakeSource {
            replicas: AtomicU16::new(2),
        });
        let panic_button = Arc::new(PanicButton::new());
        let (_, watcher) = replicas_and_watch(
            source as Arc<dyn ReplicaSource>,
            Arc::clone(&panic_button),
            Duration::from_millis(5),
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!panic_button.is_pressed());
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_file_replica_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replicas");
        tokio::fs::write(&path, "5\n").await.unwrap();
        let source = FileReplicaSource::new(&path);
        assert_eq!(source.replicas().await.unwrap(), 5);

        tokio::fs::write(&path, "nope").await.unwrap();
        assert!(source.replicas().await.is_err());
    }

    #[test]
    fn test_quiet_period_scales_with_poll_interval() {
        assert_eq!(
            startup_quiet_period(Duration::from_secs(4)),
            Duration::from_secs(10)
        );
    }
}
