//! Error Classification & Recovery
//!
//! Classification of raw failures, the rolling error log, retry with backoff
//! and the recovery engine that acts on classified errors.

mod classify;
mod engine;
mod log;
mod notify;
mod retry;

pub use classify::{classify, Classification, ClassifiedError, ErrorContext, ErrorKind, Severity};
pub use engine::{RecoveryAction, RecoveryEngine, RecoveryOutcome};
pub use log::ErrorLog;
pub use notify::{Authenticator, ChannelNotifier, NoAuthenticator, Notice, Notifier, SIGN_IN_PATH};
pub use retry::RetryPolicy;
