//! Mutation Module
//!
//! Optimistic writes with snapshot rollback and ownership-checked reconciliation.

mod builder;
mod context;
mod coordinator;
mod phase;

pub use builder::Mutation;
pub use context::{OptimisticContext, RollbackReport};
pub use coordinator::{MutationCoordinator, MutationHandle, MutationStatus};
pub use phase::MutationPhase;
