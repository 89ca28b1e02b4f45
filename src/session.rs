//! Session markers
//!
//! The client id and a few session markers, read at startup and written
//! once per session. The entity cache itself is never persisted.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub client_id: Uuid,
    pub first_seen: DateTime<Utc>,
    pub last_started: DateTime<Utc>,
    pub session_count: u64,
}

impl SessionState {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            first_seen: now,
            last_started: now,
            session_count: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.session_path.clone())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the stored markers. A missing or unreadable file yields `None`.
    pub async fn load(&self) -> Result<Option<SessionState>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(state) => Ok(Some(state)),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "Session file is corrupt, starting over");
                Ok(None)
            }
        }
    }

    /// Starts a session: loads (or creates) the markers, bumps them and
    /// writes them back.
    pub async fn begin(&self) -> Result<SessionState> {
        let now = Utc::now();
        let mut state = self
            .load()
            .await?
            .unwrap_or_else(|| SessionState::fresh(now));
        state.last_started = now;
        state.session_count += 1;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, serde_json::to_vec_pretty(&state)?).await?;
        info!(client_id = %state.client_id, session = state.session_count, "Session started");
        Ok(state)
    }
}
