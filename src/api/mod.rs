//! API Module
//!
//! Local diagnostics surface over a running [`SyncEngine`](crate::engine::SyncEngine).

pub mod handlers;
pub mod routes;

pub use handlers::*;
pub use routes::create_router;
