//! Command execution pipeline.
//!
//! Orchestrates the event-sourcing lifecycle for one aggregate: load history,
//! rehydrate, handle the command (pure), append with an exact-version
//! expectation, and hand the committed events (plus the post-commit state)
//! back to the caller.
//!
//! The exact-version append is the optimistic-concurrency discipline of the
//! stock ledger: the sufficiency check and the decrement were decided against
//! one specific stream version, so a concurrent writer invalidates the
//! decision and the dispatcher re-reads, re-validates and retries instead of
//! committing a stale write.

use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use rxledger_core::{Aggregate, AggregateId, DomainError, ExpectedVersion};

use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

#[derive(Debug)]
pub enum DispatchError {
    /// Optimistic concurrency failure that survived the retry budget.
    Concurrency(String),
    /// Domain validation failure (deterministic, client-correctable).
    Validation(String),
    /// Domain invariant failure (bug signal; the unit was aborted).
    InvariantViolation(String),
    /// Domain-level not found.
    NotFound,
    /// Domain conflict (duplicate batch number, already-resolved alert, ...).
    Conflict(String),
    /// Requested quantity exceeds what the selected batch can supply.
    InsufficientStock {
        medicine_id: AggregateId,
        requested: u32,
        available: u32,
    },
    /// Failed to deserialize historical event payloads.
    Deserialize(String),
    /// Persisting to the event store failed.
    Store(EventStoreError),
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match &value {
            EventStoreError::Concurrency(msg) => DispatchError::Concurrency(msg.clone()),
            _ => DispatchError::Store(value),
        }
    }
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => DispatchError::Validation(msg),
            DomainError::InvariantViolation(msg) => DispatchError::InvariantViolation(msg),
            DomainError::Conflict(msg) => DispatchError::Conflict(msg),
            DomainError::NotFound => DispatchError::NotFound,
            DomainError::InvalidId(msg) => DispatchError::Validation(msg),
            DomainError::InsufficientStock {
                medicine_id,
                requested,
                available,
            } => DispatchError::InsufficientStock {
                medicine_id,
                requested,
                available,
            },
        }
    }
}

impl DispatchError {
    pub fn is_concurrency(&self) -> bool {
        matches!(self, DispatchError::Concurrency(_))
    }
}

/// How many times a unit is re-decided after a version conflict before the
/// conflict is surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

/// Reusable command execution engine for event-sourced aggregates.
#[derive(Debug)]
pub struct CommandDispatcher<S> {
    store: S,
    retry: RetryPolicy,
}

impl<S> CommandDispatcher<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(store: S, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S> CommandDispatcher<S>
where
    S: EventStore,
{
    /// Load and rehydrate an aggregate without dispatching anything.
    ///
    /// Returns the aggregate and the stream version it was rehydrated at.
    pub fn load_aggregate<A>(
        &self,
        aggregate_id: AggregateId,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<(A, u64), DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: DeserializeOwned,
    {
        let history = self.store.load_stream(aggregate_id)?;
        validate_loaded_stream(aggregate_id, &history)?;
        let version = stream_version(&history);

        let mut aggregate = make_aggregate(aggregate_id);
        apply_history::<A>(&mut aggregate, &history)?;

        Ok((aggregate, version))
    }

    /// Dispatch a command through the full pipeline, retrying on version
    /// conflicts up to the configured budget.
    ///
    /// On success returns the aggregate *after* the new events were applied
    /// (callers re-evaluate alerts against this state) plus the committed
    /// events. A command that decides nothing commits nothing.
    pub fn dispatch<A>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        command: &A::Command,
        make_aggregate: impl Fn(AggregateId) -> A,
    ) -> Result<(A, Vec<StoredEvent>), DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: rxledger_events::Event + Serialize + DeserializeOwned,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;

            match self.dispatch_once(aggregate_id, aggregate_type, command, &make_aggregate) {
                Err(err) if err.is_concurrency() && attempt < self.retry.max_attempts.max(1) => {
                    tracing::debug!(
                        %aggregate_id,
                        attempt,
                        "version conflict, re-deciding command"
                    );
                    continue;
                }
                other => return other,
            }
        }
    }

    fn dispatch_once<A>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        command: &A::Command,
        make_aggregate: &impl Fn(AggregateId) -> A,
    ) -> Result<(A, Vec<StoredEvent>), DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: rxledger_events::Event + Serialize + DeserializeOwned,
    {
        // 1) Load + rehydrate.
        let (mut aggregate, version) = self.load_aggregate(aggregate_id, make_aggregate)?;
        let expected = ExpectedVersion::Exact(version);

        // 2) Decide events (no mutation).
        let decided = aggregate.handle(command).map_err(DispatchError::from)?;
        if decided.is_empty() {
            return Ok((aggregate, vec![]));
        }

        // 3) Persist (append-only, optimistic).
        let uncommitted = decided
            .iter()
            .map(|ev| {
                UncommittedEvent::from_typed(aggregate_id, aggregate_type, Uuid::now_v7(), ev)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let committed = self.store.append(uncommitted, expected)?;

        // 4) Evolve the returned aggregate to the post-commit state.
        for event in &decided {
            aggregate.apply(event);
        }

        Ok((aggregate, committed))
    }
}

pub(crate) fn stream_version(stream: &[StoredEvent]) -> u64 {
    stream.last().map(|e| e.sequence_number).unwrap_or(0)
}

pub(crate) fn validate_loaded_stream(
    aggregate_id: AggregateId,
    stream: &[StoredEvent],
) -> Result<(), DispatchError> {
    // Defense in depth: even a buggy backend must not feed us another
    // stream's events or a non-monotonic sequence.
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.aggregate_id != aggregate_id {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            ))));
        }
        if e.sequence_number == 0 {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(
                "stored event has sequence_number=0".to_string(),
            )));
        }
        if e.sequence_number <= last {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(format!(
                "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                e.sequence_number
            ))));
        }
        last = e.sequence_number;
    }
    Ok(())
}

pub(crate) fn apply_history<A>(aggregate: &mut A, history: &[StoredEvent]) -> Result<(), DispatchError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    // Ensure deterministic ordering.
    let mut sorted = history.to_vec();
    sorted.sort_by_key(|e| e.sequence_number);

    for stored in sorted {
        let ev: A::Event = serde_json::from_value(stored.payload)
            .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
        aggregate.apply(&ev);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rxledger_catalog::MedicineId;
    use rxledger_core::ActorId;
    use rxledger_core::AggregateRoot;
    use rxledger_inventory::{
        BatchId, BatchNumber, ConsumeStock, MedicineStock, OpenStock, ReceiveBatch, ReorderLevels,
        StockCommand,
    };
    use rxledger_core::Money;

    use crate::event_store::InMemoryEventStore;

    fn dispatcher() -> CommandDispatcher<InMemoryEventStore> {
        CommandDispatcher::new(InMemoryEventStore::new())
    }

    fn open_and_receive(
        dispatcher: &CommandDispatcher<InMemoryEventStore>,
        medicine_id: MedicineId,
        batch_id: BatchId,
        quantity: u32,
    ) {
        dispatcher
            .dispatch(
                medicine_id.0,
                "pharmacy.stock",
                &StockCommand::OpenStock(OpenStock {
                    medicine_id,
                    levels: ReorderLevels::new(0, 1_000, 10).unwrap(),
                    occurred_at: Utc::now(),
                }),
                |id| MedicineStock::empty(MedicineId::new(id)),
            )
            .unwrap();

        dispatcher
            .dispatch(
                medicine_id.0,
                "pharmacy.stock",
                &StockCommand::ReceiveBatch(ReceiveBatch {
                    medicine_id,
                    batch_id,
                    batch_number: BatchNumber::new("LOT-1").unwrap(),
                    quantity,
                    unit_cost: Money::from_minor(100),
                    selling_price: Money::from_minor(200),
                    manufacturing_date: chrono::NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
                    expiry_date: chrono::NaiveDate::from_ymd_opt(2027, 1, 1).unwrap(),
                    received_date: chrono::NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
                    location: "main-store".to_string(),
                    reference: None,
                    performed_by: ActorId::new(),
                    occurred_at: Utc::now(),
                }),
                |id| MedicineStock::empty(MedicineId::new(id)),
            )
            .unwrap();
    }

    #[test]
    fn dispatch_returns_post_commit_state() {
        let dispatcher = dispatcher();
        let medicine_id = MedicineId::new(AggregateId::new());
        let batch_id = BatchId::new(AggregateId::new());
        open_and_receive(&dispatcher, medicine_id, batch_id, 10);

        let (stock, committed) = dispatcher
            .dispatch(
                medicine_id.0,
                "pharmacy.stock",
                &StockCommand::ConsumeStock(ConsumeStock {
                    medicine_id,
                    batch_id: Some(batch_id),
                    quantity: 4,
                    today: chrono::NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
                    reference: None,
                    performed_by: ActorId::new(),
                    occurred_at: Utc::now(),
                }),
                |id| MedicineStock::empty(MedicineId::new(id)),
            )
            .unwrap();

        assert_eq!(committed.len(), 1);
        assert_eq!(stock.current_stock(), 6);
        assert_eq!(stock.version(), 3);
    }

    #[test]
    fn idempotent_command_commits_nothing() {
        let dispatcher = dispatcher();
        let medicine_id = MedicineId::new(AggregateId::new());
        let batch_id = BatchId::new(AggregateId::new());
        open_and_receive(&dispatcher, medicine_id, batch_id, 10);

        let (_, committed) = dispatcher
            .dispatch(
                medicine_id.0,
                "pharmacy.stock",
                &StockCommand::OpenStock(OpenStock {
                    medicine_id,
                    levels: ReorderLevels::new(1, 2, 2).unwrap(),
                    occurred_at: Utc::now(),
                }),
                |id| MedicineStock::empty(MedicineId::new(id)),
            )
            .unwrap();
        assert!(committed.is_empty());
    }

    #[test]
    fn domain_errors_surface_unchanged() {
        let dispatcher = dispatcher();
        let medicine_id = MedicineId::new(AggregateId::new());
        let batch_id = BatchId::new(AggregateId::new());
        open_and_receive(&dispatcher, medicine_id, batch_id, 3);

        let err = dispatcher
            .dispatch(
                medicine_id.0,
                "pharmacy.stock",
                &StockCommand::ConsumeStock(ConsumeStock {
                    medicine_id,
                    batch_id: Some(batch_id),
                    quantity: 4,
                    today: chrono::NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
                    reference: None,
                    performed_by: ActorId::new(),
                    occurred_at: Utc::now(),
                }),
                |id| MedicineStock::empty(MedicineId::new(id)),
            )
            .unwrap_err();

        match err {
            DispatchError::InsufficientStock {
                requested,
                available,
                ..
            } => {
                assert_eq!(requested, 4);
                assert_eq!(available, 3);
            }
            other => panic!("Expected InsufficientStock, got {other:?}"),
        }
    }
}
