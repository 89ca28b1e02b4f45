//! Request and Response models for the diagnostics API
//!
//! DTOs serialized to and from the local diagnostics HTTP surface.

pub mod requests;
pub mod responses;

pub use requests::{CacheQuery, InvalidateRequest};
pub use responses::{
    CacheEntriesResponse, ErrorsResponse, HealthResponse, InvalidateResponse,
    RealtimeResponse, StatsResponse,
};
