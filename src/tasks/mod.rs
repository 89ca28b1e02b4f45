//! Background Tasks Module
//!
//! Periodic housekeeping while the engine runs.

mod maintenance;

pub use maintenance::spawn_maintenance_task;
