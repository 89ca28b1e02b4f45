//! Error Classification
//!
//! Pure mapping from (status code, message) to a kind, severity and
//! retry/recovery verdict. Every failure is classified before it is surfaced.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::error::SyncError;

// == Error Kind ==
/// Failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Authentication,
    Authorization,
    Validation,
    Client,
    RateLimit,
    Server,
    Timeout,
    Maintenance,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Network => "network",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Authorization => "authorization",
            ErrorKind::Validation => "validation",
            ErrorKind::Client => "client",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Server => "server",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Maintenance => "maintenance",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

// == Severity ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

// == Classification ==
/// Verdict produced by [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub retryable: bool,
    pub recoverable: bool,
}

impl Classification {
    const fn new(kind: ErrorKind, severity: Severity, retryable: bool, recoverable: bool) -> Self {
        Self {
            kind,
            severity,
            retryable,
            recoverable,
        }
    }
}

/// Classifies a failure from its HTTP status (if any) and message.
///
/// A message mentioning "maintenance" overrides every status.
pub fn classify(status: Option<u16>, message: &str) -> Classification {
    use ErrorKind::*;
    use Severity::*;

    let lowered = message.to_lowercase();
    if lowered.contains("maintenance") {
        return Classification::new(Maintenance, Critical, false, false);
    }

    match status {
        Some(400) => Classification::new(Validation, Low, false, false),
        Some(401) => Classification::new(Authentication, High, false, true),
        Some(403) => Classification::new(Authorization, High, false, false),
        Some(404) => Classification::new(Client, Medium, false, true),
        Some(408) | Some(504) => Classification::new(Timeout, Medium, true, true),
        Some(429) => Classification::new(RateLimit, Medium, true, true),
        Some(500..=599) => Classification::new(Server, High, true, true),
        Some(400..=499) => Classification::new(Client, Medium, false, false),
        Some(_) => Classification::new(Unknown, Medium, false, false),
        None if lowered.contains("network") => Classification::new(Network, Medium, true, true),
        None if lowered.contains("timeout") || lowered.contains("timed out") => {
            Classification::new(Timeout, Medium, true, true)
        }
        None => Classification::new(Unknown, Medium, false, false),
    }
}

// == Error Context ==
/// Where a failure happened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorContext {
    /// Logical operation, e.g. `fetch` or `mutation:update products`
    pub operation: String,
    /// Cache key the failure relates to
    pub key: Option<String>,
    /// HTTP status, when the backend answered
    pub status: Option<u16>,
    /// Raw message of the underlying failure
    pub message: String,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Self::default()
        }
    }

    pub fn with_key(mut self, key: impl ToString) -> Self {
        self.key = Some(key.to_string());
        self
    }
}

// == Classified Error ==
/// Immutable, classified failure.
#[derive(Debug, Clone, PartialEq, Serialize, Error)]
#[error("{kind} error ({severity:?}): {}", .context.message)]
pub struct ClassifiedError {
    kind: ErrorKind,
    severity: Severity,
    retryable: bool,
    recoverable: bool,
    context: ErrorContext,
    timestamp: DateTime<Utc>,
}

impl ClassifiedError {
    /// Classifies a raw failure. Already-classified errors keep their verdict
    /// and only gain the context fields they were missing.
    pub fn from_error(error: &SyncError, context: ErrorContext) -> Self {
        if let SyncError::Classified(existing) = error {
            let mut merged = existing.clone();
            if merged.context.key.is_none() {
                merged.context.key = context.key;
            }
            return merged;
        }
        let status = error.status();
        let message = error.to_string();
        Self::from_parts(status, message, context)
    }

    pub fn from_parts(status: Option<u16>, message: String, context: ErrorContext) -> Self {
        let verdict = classify(status, &message);
        Self {
            kind: verdict.kind,
            severity: verdict.severity,
            retryable: verdict.retryable,
            recoverable: verdict.recoverable,
            context: ErrorContext {
                status,
                message,
                ..context
            },
            timestamp: Utc::now(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn retryable(&self) -> bool {
        self.retryable
    }

    pub fn recoverable(&self) -> bool {
        self.recoverable
    }

    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Maintenance errors stop all retry and recovery.
    pub fn is_terminal(&self) -> bool {
        self.kind == ErrorKind::Maintenance
    }
}
