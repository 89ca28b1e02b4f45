//! Storefront Sync - client-side cache synchronization engine
//!
//! Keyed cache of server-owned storefront entities with optimistic
//! mutations, realtime invalidation and classified error recovery.

pub mod api;
pub mod backend;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod keys;
pub mod models;
pub mod mutation;
pub mod realtime;
pub mod recovery;
pub mod session;
pub mod tasks;

pub use api::{create_router, AppState};
pub use config::Config;
pub use engine::{EngineBuilder, SyncEngine};
pub use error::{Result, SyncError};
pub use tasks::spawn_maintenance_task;
