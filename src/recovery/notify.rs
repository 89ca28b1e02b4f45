//! User notifications and silent re-authentication seams.
//!
//! The UI layer (toasts, blocking banners, navigation) and the auth flow live
//! outside this crate; they plug in through [`Notifier`] and [`Authenticator`].

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

use super::classify::{ErrorKind, Severity};
use crate::cache::MutationId;
use crate::error::{Result, SyncError};

/// Path the UI navigates to when silent re-authentication fails.
pub const SIGN_IN_PATH: &str = "/sign-in";

// == Notice ==
/// Something the user should see.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    /// Transient error toast
    Error {
        kind: ErrorKind,
        severity: Severity,
        message: String,
    },
    /// Blocking message, shown instead of retrying (maintenance)
    Blocking { message: String },
    /// An optimistic write was rejected and rolled back
    MutationFailed {
        mutation_id: MutationId,
        message: String,
    },
    /// Navigate away, e.g. to sign-in
    Redirect { path: String },
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Fans notices out over a broadcast channel the UI subscribes to.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: broadcast::Sender<Notice>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }
}

impl Default for ChannelNotifier {
    fn default() -> Self {
        Self::new(64)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notice: Notice) {
        info!(?notice, "User notice");
        let _ = self.tx.send(notice);
    }
}

// == Authenticator ==
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Attempts to refresh credentials without user interaction.
    async fn refresh(&self) -> Result<()>;
}

/// Used when no silent refresh flow is configured; always fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuthenticator;

#[async_trait]
impl Authenticator for NoAuthenticator {
    async fn refresh(&self) -> Result<()> {
        Err(SyncError::Internal(
            "silent re-authentication is not configured".to_string(),
        ))
    }
}
