//! Mutation Coordinator
//!
//! Drives optimistic writes: snapshot, speculative apply, network write,
//! then reconcile or roll back. Every speculative write is stamped with the
//! mutation id, so a rollback never overwrites a newer mutation's value.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::builder::Mutation;
use super::context::OptimisticContext;
use super::phase::MutationPhase;
use crate::backend::Backend;
use crate::cache::{CacheStore, MutationId, OwnerStamp};
use crate::dispatch::{entity_id, Dispatcher, DomainEvent, EventAction};
use crate::error::{Result, SyncError};
use crate::recovery::{ClassifiedError, ErrorContext, Notice, Notifier, RecoveryEngine, RetryPolicy};

type ActiveSet = Arc<Mutex<BTreeSet<MutationId>>>;

fn is_active(active: &ActiveSet, id: MutationId) -> bool {
    active
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .contains(&id)
}

// == Mutation Status ==
#[derive(Debug, Clone, PartialEq)]
pub enum MutationStatus {
    Pending,
    Success(Value),
    Error(ClassifiedError),
}

impl MutationStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, MutationStatus::Pending)
    }
}

/// Observes a triggered mutation.
#[derive(Debug, Clone)]
pub struct MutationHandle {
    id: MutationId,
    rx: watch::Receiver<MutationStatus>,
}

impl MutationHandle {
    pub fn id(&self) -> MutationId {
        self.id
    }

    pub fn status(&self) -> MutationStatus {
        self.rx.borrow().clone()
    }

    /// Waits until the mutation has settled.
    pub async fn settled(mut self) -> MutationStatus {
        let settled = self
            .rx
            .wait_for(|status| !status.is_pending())
            .await
            .map(|status| status.clone());
        match settled {
            Ok(status) => status,
            Err(_) => self.rx.borrow().clone(),
        }
    }
}

// == In-Flight Mutation ==
/// A started mutation. Dropping it before it settles rolls it back.
struct InFlight {
    id: MutationId,
    mutation: Mutation,
    phase: MutationPhase,
    context: Option<OptimisticContext>,
    store: CacheStore,
    active: ActiveSet,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
        if let Some(context) = self.context.take() {
            warn!(mutation = self.id, phase = %self.phase, "Mutation abandoned before settling, rolling back");
            let active = self.active.clone();
            context.rollback(&self.store, |other| is_active(&active, other));
        }
    }
}

// == Coordinator ==
pub struct MutationCoordinator {
    dispatcher: Arc<Dispatcher>,
    backend: Arc<dyn Backend>,
    recovery: Arc<RecoveryEngine>,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
    client_id: String,
    next_id: AtomicU64,
    active: ActiveSet,
}

impl MutationCoordinator {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        backend: Arc<dyn Backend>,
        recovery: Arc<RecoveryEngine>,
        notifier: Arc<dyn Notifier>,
        retry: RetryPolicy,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            dispatcher,
            backend,
            recovery,
            notifier,
            retry,
            client_id: client_id.into(),
            next_id: AtomicU64::new(1),
            active: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    fn store(&self) -> &CacheStore {
        self.dispatcher.store()
    }

    pub fn is_active(&self, id: MutationId) -> bool {
        is_active(&self.active, id)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Runs a mutation to completion.
    pub async fn run(&self, mutation: Mutation) -> Result<Value> {
        let inflight = self.begin(mutation)?;
        self.settle(inflight).await
    }

    /// Applies the speculative change now and settles it in the background.
    /// Must be called from within a tokio runtime.
    pub fn trigger(self: &Arc<Self>, mutation: Mutation) -> Result<MutationHandle> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(SyncError::Internal(format!(
                "mutation {} triggered outside a tokio runtime",
                mutation.label()
            )));
        }
        let inflight = self.begin(mutation)?;
        let id = inflight.id;
        let (tx, rx) = watch::channel(MutationStatus::Pending);
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let label = inflight.mutation.label();
            let status = match coordinator.settle(inflight).await {
                Ok(value) => MutationStatus::Success(value),
                Err(SyncError::Classified(classified)) => MutationStatus::Error(classified),
                Err(other) => MutationStatus::Error(ClassifiedError::from_error(
                    &other,
                    ErrorContext::new(format!("mutation:{}", label)),
                )),
            };
            let _ = tx.send(status);
        });
        Ok(MutationHandle { id, rx })
    }

    // == Phases ==
    fn begin(&self, mutation: Mutation) -> Result<InFlight> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let event = mutation.speculative_event();
        let context = OptimisticContext::capture(
            self.store(),
            id,
            mutation.affected_prefixes(),
            event.payload.clone(),
        );
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);

        let mut inflight = InFlight {
            id,
            mutation,
            phase: MutationPhase::Idle,
            context: Some(context),
            store: self.store().clone(),
            active: self.active.clone(),
        };
        let touched = self.dispatcher.apply_with(&event, OwnerStamp::Owner(id));
        inflight.phase.transition(MutationPhase::Optimistic)?;
        debug!(mutation = id, label = %inflight.mutation.label(), touched, "Speculative change applied");
        Ok(inflight)
    }

    async fn settle(&self, mut inflight: InFlight) -> Result<Value> {
        let id = inflight.id;
        let mut request = inflight.mutation.request.clone();
        request.idempotency_key = Some(format!("{}-{}", self.client_id, id));

        let backend = &self.backend;
        let outcome = self.retry.run("write", || backend.write(&request)).await;

        match outcome {
            Ok(response) => {
                inflight.phase.transition(MutationPhase::Committing)?;
                self.reconcile(id, &inflight.mutation, &response);
                if let Some(context) = inflight.context.take() {
                    context.commit(self.store());
                }
                self.refetch_repairs();
                inflight.phase.transition(MutationPhase::Settled)?;
                let derived = inflight.mutation.derived_keys();
                drop(inflight);

                let invalidated = self.dispatcher.invalidate_aggregates(&derived);
                info!(mutation = id, invalidated, "Mutation committed");
                Ok(response)
            }
            Err(err) => {
                inflight.phase.transition(MutationPhase::RollingBack)?;
                if let Some(context) = inflight.context.take() {
                    let report = context.rollback(self.store(), |other| self.is_active(other));
                    debug!(mutation = id, restored = report.restored, "Rolled back");
                    for key in &report.refetch {
                        self.dispatcher.invalidate(key, true);
                    }
                }
                self.refetch_repairs();
                inflight.phase.transition(MutationPhase::Settled)?;
                let context = ErrorContext::new(format!("mutation:{}", inflight.mutation.label()))
                    .with_key(inflight.mutation.detail_key());
                drop(inflight);

                let classified = self.recovery.report(&err, context);
                self.notifier.notify(Notice::MutationFailed {
                    mutation_id: id,
                    message: classified.context().message.clone(),
                });
                Err(SyncError::Classified(classified))
            }
        }
    }

    /// Refetches entries a rollback could not restore because another
    /// mutation owned them at the time.
    fn refetch_repairs(&self) {
        for key in self.store().take_repairs() {
            debug!(key = %key, "Refetching entry left behind by a rollback");
            self.dispatcher.invalidate(&key, true);
        }
    }

    /// Replaces the speculative change with the server's answer. Entries a
    /// newer mutation has taken over are left to that mutation.
    fn reconcile(&self, id: MutationId, mutation: &Mutation, response: &Value) {
        let stamp = OwnerStamp::Settle(id);
        if mutation.action == EventAction::Created {
            let server_id = entity_id(mutation.entity, response);
            if server_id.as_deref().is_some_and(|sid| sid != mutation.id) {
                let temp = DomainEvent::new(mutation.entity, EventAction::Deleted, mutation.speculative_event().payload);
                self.dispatcher.apply_with(&temp, stamp);
            }
        }
        self.dispatcher.apply_with(&mutation.settled_event(response), stamp);
    }
}
