//! Recovery Engine
//!
//! Funnel for every classified failure: logs it, keeps it in the rolling
//! [`ErrorLog`], notifies the user when severe enough and drives the
//! per-kind recovery action.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::classify::{ClassifiedError, ErrorContext, ErrorKind, Severity};
use super::log::ErrorLog;
use super::notify::{Authenticator, Notice, Notifier, SIGN_IN_PATH};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::SyncError;
use crate::keys::CacheKey;

/// What the engine does about one failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Wait, then refetch the key that failed
    Refetch { key: CacheKey, after: Duration },
    /// Silent credential refresh; redirect to sign-in when it fails
    Reauthenticate { key: Option<CacheKey> },
    /// Mark the key stale, optionally reloading it
    Invalidate { key: CacheKey, refetch: bool },
    /// Show a blocking message, never retry
    Block,
    /// Retries already exhausted; tell the user
    GiveUp,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Recovered,
    Redirected,
    Invalidated(usize),
    Blocked,
    Surfaced,
    Skipped,
}

pub struct RecoveryEngine {
    log: Mutex<ErrorLog>,
    notifier: Arc<dyn Notifier>,
    authenticator: Arc<dyn Authenticator>,
    dispatcher: Arc<Dispatcher>,
    network_delay: Duration,
    surface_threshold: Severity,
}

impl RecoveryEngine {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        notifier: Arc<dyn Notifier>,
        authenticator: Arc<dyn Authenticator>,
        config: &Config,
    ) -> Self {
        let window = chrono::Duration::seconds(config.error_log_window_secs as i64);
        Self {
            log: Mutex::new(ErrorLog::new(config.error_log_capacity, window)),
            notifier,
            authenticator,
            dispatcher,
            network_delay: config.network_retry_delay(),
            surface_threshold: Severity::High,
        }
    }

    /// Lowest severity that produces a user notice on report.
    pub fn with_surface_threshold(mut self, threshold: Severity) -> Self {
        self.surface_threshold = threshold;
        self
    }

    fn lock_log(&self) -> MutexGuard<'_, ErrorLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // == Reporting ==
    /// Classifies, records and surfaces a failure, then starts its recovery
    /// on a background task.
    pub fn report(self: &Arc<Self>, err: &SyncError, context: ErrorContext) -> ClassifiedError {
        let classified = ClassifiedError::from_error(err, context);
        self.record(classified.clone());
        if classified.severity() >= self.surface_threshold && !classified.is_terminal() {
            self.surface(&classified);
        }

        if tokio::runtime::Handle::try_current().is_ok() {
            let engine = Arc::clone(self);
            let job = classified.clone();
            tokio::spawn(async move {
                let outcome = engine.recover(&job).await;
                debug!(kind = %job.kind(), ?outcome, "Recovery finished");
            });
        } else {
            debug!(kind = %classified.kind(), "No runtime, skipping recovery");
        }
        classified
    }

    /// Logs at a level matching severity and appends to the error log.
    pub fn record(&self, err: ClassifiedError) {
        let ctx = err.context();
        match err.severity() {
            Severity::Low => debug!(kind = %err.kind(), operation = %ctx.operation, key = ?ctx.key, "{}", err),
            Severity::Medium => warn!(kind = %err.kind(), operation = %ctx.operation, key = ?ctx.key, "{}", err),
            Severity::High | Severity::Critical => {
                error!(kind = %err.kind(), operation = %ctx.operation, key = ?ctx.key, "{}", err)
            }
        }
        self.lock_log().push(err);
    }

    fn surface(&self, err: &ClassifiedError) {
        self.notifier.notify(Notice::Error {
            kind: err.kind(),
            severity: err.severity(),
            message: err.context().message.clone(),
        });
    }

    /// Surfaces errors the report step kept silent.
    fn surface_if_silent(&self, err: &ClassifiedError) {
        if err.severity() < self.surface_threshold {
            self.surface(err);
        }
    }

    // == Recovery ==
    pub fn plan(&self, err: &ClassifiedError) -> RecoveryAction {
        let key = err.context().key.as_deref().map(CacheKey::parse);
        match (err.kind(), key) {
            (ErrorKind::Maintenance, _) => RecoveryAction::Block,
            (ErrorKind::Network, Some(key)) => RecoveryAction::Refetch {
                key,
                after: self.network_delay,
            },
            (ErrorKind::Authentication, key) => RecoveryAction::Reauthenticate { key },
            (ErrorKind::Timeout | ErrorKind::RateLimit, _) => RecoveryAction::GiveUp,
            (ErrorKind::Server, Some(key)) => RecoveryAction::Invalidate { key, refetch: true },
            (ErrorKind::Client, Some(key)) => RecoveryAction::Invalidate { key, refetch: false },
            _ => RecoveryAction::None,
        }
    }

    /// Runs the recovery action for `err`. A failed recovery is recorded and
    /// surfaced, never recovered again.
    pub async fn recover(&self, err: &ClassifiedError) -> RecoveryOutcome {
        match self.plan(err) {
            RecoveryAction::Refetch { key, after } => {
                tokio::time::sleep(after).await;
                match self.dispatcher.refetch(&key).await {
                    Ok(_) => {
                        info!(key = %key, "Recovered after network failure");
                        RecoveryOutcome::Recovered
                    }
                    Err(e) => {
                        let failed = ClassifiedError::from_error(
                            &e,
                            ErrorContext::new("recovery:refetch").with_key(&key),
                        );
                        self.record(failed.clone());
                        self.surface_if_silent(&failed);
                        RecoveryOutcome::Surfaced
                    }
                }
            }
            RecoveryAction::Reauthenticate { key } => match self.authenticator.refresh().await {
                Ok(()) => {
                    if let Some(key) = key {
                        self.dispatcher.invalidate(&key, true);
                    }
                    info!("Credentials refreshed");
                    RecoveryOutcome::Recovered
                }
                Err(e) => {
                    warn!(error = %e, "Silent re-authentication failed, redirecting");
                    self.notifier.notify(Notice::Redirect {
                        path: SIGN_IN_PATH.to_string(),
                    });
                    RecoveryOutcome::Redirected
                }
            },
            RecoveryAction::Invalidate { key, refetch } => {
                RecoveryOutcome::Invalidated(self.dispatcher.invalidate(&key, refetch))
            }
            RecoveryAction::Block => {
                self.notifier.notify(Notice::Blocking {
                    message: err.context().message.clone(),
                });
                RecoveryOutcome::Blocked
            }
            RecoveryAction::GiveUp => {
                self.surface_if_silent(err);
                RecoveryOutcome::Surfaced
            }
            RecoveryAction::None => RecoveryOutcome::Skipped,
        }
    }

    // == Diagnostics ==
    /// Errors inside the time window, newest first.
    pub fn recent_errors(&self) -> Vec<ClassifiedError> {
        self.lock_log().recent(Utc::now())
    }

    pub fn count_of(&self, kind: ErrorKind) -> usize {
        self.lock_log().count_of(kind)
    }

    /// Drops errors older than the window. Returns how many were dropped.
    pub fn prune(&self) -> usize {
        self.lock_log().prune(Utc::now())
    }
}
