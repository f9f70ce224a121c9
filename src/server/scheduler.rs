use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::backup::{BackupOrchestrator, BackupTrigger};

/// Fires an automatic run every `interval` until `cancel` is triggered. The
/// first run happens one interval after startup.
pub fn start_backup_scheduler(
    orchestrator: Arc<BackupOrchestrator>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        tracing::info!(interval_secs = interval.as_secs(), "Backup scheduler started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match orchestrator.run_backup(BackupTrigger::Automatic).await {
                        Ok(outcome) => {
                            for diagnostic in &outcome.diagnostics {
                                tracing::warn!(run_id = %outcome.run_id, "{}", diagnostic);
                            }
                        }
                        Err(e) => {
                            tracing::error!(kind = e.kind(), "Scheduled backup failed: {}", e);
                        }
                    }
                }
            }
        }
        tracing::info!("Backup scheduler stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::logic::tests::{TestFactory, test_config};

    #[tokio::test]
    async fn test_scheduler_runs_until_cancelled() {
        let factory = TestFactory::healthy();
        let orchestrator = Arc::new(BackupOrchestrator::new(Arc::new(test_config()), factory.clone()));
        let cancel = CancellationToken::new();

        let handle = start_backup_scheduler(orchestrator.clone(), Duration::from_millis(40), cancel.clone());
        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();

        let runs = factory.store.put_count();
        assert!(runs >= 1, "expected at least one scheduled run, got {runs}");
        let state = orchestrator.progress().current().await;
        assert_eq!(state.trigger, Some(BackupTrigger::Automatic));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(factory.store.put_count(), runs);
    }

    #[tokio::test]
    async fn test_scheduler_does_not_fire_at_startup() {
        let factory = TestFactory::healthy();
        let orchestrator = Arc::new(BackupOrchestrator::new(Arc::new(test_config()), factory.clone()));
        let cancel = CancellationToken::new();

        let handle = start_backup_scheduler(orchestrator, Duration::from_secs(3600), cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(factory.store.put_count(), 0);
    }
}
