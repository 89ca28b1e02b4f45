//! Maintenance Task
//!
//! Background task that periodically prunes the classified error log to its
//! time window.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::engine::SyncEngine;

/// Spawns a task that prunes aged-out errors every `interval_secs`.
///
/// The returned handle is aborted during graceful shutdown.
///
/// # Example
/// ```ignore
/// let handle = spawn_maintenance_task(engine.clone(), 60);
/// // Later, during shutdown:
/// handle.abort();
/// ```
pub fn spawn_maintenance_task(engine: Arc<SyncEngine>, interval_secs: u64) -> JoinHandle<()> {
    let interval = Duration::from_secs(interval_secs.max(1));

    tokio::spawn(async move {
        info!("Starting maintenance task with interval of {} seconds", interval.as_secs());

        loop {
            tokio::time::sleep(interval).await;

            let pruned = engine.prune_errors();
            let stats = engine.stats();
            if pruned > 0 {
                info!(pruned, entries = stats.total_entries, "Maintenance: pruned aged errors");
            } else {
                debug!(
                    entries = stats.total_entries,
                    pending = engine.pending_mutations(),
                    state = %engine.connection_state(),
                    "Maintenance: nothing to prune"
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::backend::mock::MockBackend;
    use crate::config::Config;
    use crate::error::{Result, SyncError};
    use crate::realtime::{Connection, Connector};
    use crate::recovery::ErrorContext;

    struct Offline;

    #[async_trait]
    impl Connector for Offline {
        async fn connect(&self) -> Result<Connection> {
            Err(SyncError::Channel("offline".into()))
        }
    }

    fn engine(window_secs: u64) -> Arc<SyncEngine> {
        let config = Config {
            error_log_window_secs: window_secs,
            ..Config::default()
        };
        let engine = SyncEngine::builder(config)
            .backend(Arc::new(MockBackend::new()))
            .connector(Arc::new(Offline))
            .build()
            .unwrap();
        Arc::new(engine)
    }

    fn validation_error() -> SyncError {
        SyncError::Http {
            status: 400,
            message: "bad price".to_string(),
        }
    }

    #[tokio::test]
    async fn test_maintenance_prunes_aged_errors() {
        let engine = engine(0);
        engine.report_error(&validation_error(), ErrorContext::new("test"));

        let handle = spawn_maintenance_task(engine.clone(), 1);
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(engine.prune_errors(), 0, "Task should already have pruned the error");
        handle.abort();
    }

    #[tokio::test]
    async fn test_maintenance_keeps_errors_inside_window() {
        let engine = engine(3600);
        engine.report_error(&validation_error(), ErrorContext::new("test"));

        let handle = spawn_maintenance_task(engine.clone(), 1);
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(engine.recent_errors().len(), 1);
        handle.abort();
    }

    #[tokio::test]
    async fn test_maintenance_task_can_be_aborted() {
        let handle = spawn_maintenance_task(engine(3600), 1);
        handle.abort();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.is_finished(), "Task should be finished after abort");
    }
}
