use std::collections::HashMap;
use std::sync::RwLock;

use rxledger_core::{AggregateId, ExpectedVersion};

use super::r#trait::{EventStore, EventStoreError, StoredEvent, StreamAppend, UncommittedEvent};

/// In-memory append-only event store.
///
/// A single writer lock makes each `append`/`append_many` call one atomic
/// unit: all version checks and all commits happen under the same critical
/// section, so a concurrent writer either sequences entirely before or
/// entirely after it.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<AggregateId, Vec<StoredEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_version(stream: &[StoredEvent]) -> u64 {
        stream.last().map(|e| e.sequence_number).unwrap_or(0)
    }

    /// Validate one batch: same aggregate + type throughout.
    fn validate_batch(events: &[UncommittedEvent]) -> Result<(AggregateId, String), EventStoreError> {
        let aggregate_id = events[0].aggregate_id;
        let aggregate_type = events[0].aggregate_type.clone();

        for (idx, e) in events.iter().enumerate() {
            if e.aggregate_id != aggregate_id {
                return Err(EventStoreError::InvalidAppend(format!(
                    "batch contains multiple aggregate_ids (index {idx})"
                )));
            }
            if e.aggregate_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "batch contains multiple aggregate_types (index {idx})"
                )));
            }
        }

        Ok((aggregate_id, aggregate_type))
    }

    /// Check a stream append against current state without mutating it.
    fn check_against_stream(
        stream: &[StoredEvent],
        aggregate_id: AggregateId,
        aggregate_type: &str,
        expected_version: ExpectedVersion,
    ) -> Result<(), EventStoreError> {
        let current = Self::current_version(stream);
        if !expected_version.matches(current) {
            return Err(EventStoreError::Concurrency(format!(
                "stream {aggregate_id}: expected {expected_version:?}, found {current}"
            )));
        }

        // Enforce aggregate type stability across the stream.
        if let Some(existing) = stream.first() {
            if existing.aggregate_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate_type is '{}', attempted append with '{}'",
                    existing.aggregate_type, aggregate_type
                )));
            }
        }

        Ok(())
    }

    fn commit_to_stream(stream: &mut Vec<StoredEvent>, events: Vec<UncommittedEvent>) -> Vec<StoredEvent> {
        let mut next = Self::current_version(stream) + 1;
        let mut committed = Vec::with_capacity(events.len());
        for e in events {
            let stored = StoredEvent {
                event_id: e.event_id,
                aggregate_id: e.aggregate_id,
                aggregate_type: e.aggregate_type,
                sequence_number: next,
                event_type: e.event_type,
                event_version: e.event_version,
                occurred_at: e.occurred_at,
                payload: e.payload,
            };
            next += 1;
            stream.push(stored.clone());
            committed.push(stored);
        }
        committed
    }
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        self.append_many(vec![StreamAppend {
            expected_version,
            events,
        }])
    }

    fn append_many(&self, appends: Vec<StreamAppend>) -> Result<Vec<StoredEvent>, EventStoreError> {
        let mut appends: Vec<(AggregateId, String, StreamAppend)> = appends
            .into_iter()
            .filter(|a| !a.events.is_empty())
            .map(|a| {
                let (aggregate_id, aggregate_type) = Self::validate_batch(&a.events)?;
                Ok((aggregate_id, aggregate_type, a))
            })
            .collect::<Result<_, EventStoreError>>()?;

        if appends.is_empty() {
            return Ok(vec![]);
        }

        // Fixed global order: streams commit in ascending aggregate id, no
        // matter how the caller assembled the unit.
        appends.sort_by_key(|(id, _, _)| *id);
        for window in appends.windows(2) {
            if window[0].0 == window[1].0 {
                return Err(EventStoreError::InvalidAppend(format!(
                    "duplicate stream {} in one atomic unit",
                    window[0].0
                )));
            }
        }

        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        // Phase 1: check every stream. Nothing is mutated until all pass, so
        // a stale expected version anywhere aborts the whole unit.
        for (aggregate_id, aggregate_type, append) in &appends {
            let stream = streams.get(aggregate_id).map(Vec::as_slice).unwrap_or(&[]);
            Self::check_against_stream(stream, *aggregate_id, aggregate_type, append.expected_version)?;
        }

        // Phase 2: commit all, still under the same write lock.
        let mut committed = Vec::new();
        for (aggregate_id, _, append) in appends {
            let stream = streams.entry(aggregate_id).or_default();
            committed.extend(Self::commit_to_stream(stream, append.events));
        }

        Ok(committed)
    }

    fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        Ok(streams.get(&aggregate_id).cloned().unwrap_or_default())
    }

    fn load_all(&self) -> Result<Vec<StoredEvent>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        let mut all: Vec<StoredEvent> = streams.values().flatten().cloned().collect();
        all.sort_by_key(|e| (e.aggregate_id, e.sequence_number));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn uncommitted(aggregate_id: AggregateId, event_type: &str) -> UncommittedEvent {
        UncommittedEvent {
            event_id: Uuid::now_v7(),
            aggregate_id,
            aggregate_type: "pharmacy.stock".to_string(),
            event_type: event_type.to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: serde_json::json!({"event": event_type}),
        }
    }

    #[test]
    fn append_assigns_sequence_numbers_from_one() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();

        let stored = store
            .append(
                vec![uncommitted(id, "a"), uncommitted(id, "b")],
                ExpectedVersion::Exact(0),
            )
            .unwrap();
        assert_eq!(stored[0].sequence_number, 1);
        assert_eq!(stored[1].sequence_number, 2);

        let stored = store
            .append(vec![uncommitted(id, "c")], ExpectedVersion::Exact(2))
            .unwrap();
        assert_eq!(stored[0].sequence_number, 3);
    }

    #[test]
    fn stale_expected_version_is_rejected() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();

        store
            .append(vec![uncommitted(id, "a")], ExpectedVersion::Exact(0))
            .unwrap();

        let err = store
            .append(vec![uncommitted(id, "b")], ExpectedVersion::Exact(0))
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Concurrency(_)));
    }

    #[test]
    fn append_many_is_all_or_nothing() {
        let store = InMemoryEventStore::new();
        let healthy = AggregateId::new();
        let contended = AggregateId::new();

        store
            .append(vec![uncommitted(contended, "seed")], ExpectedVersion::Exact(0))
            .unwrap();

        // Second stream carries a stale expectation: the whole unit aborts.
        let err = store
            .append_many(vec![
                StreamAppend {
                    expected_version: ExpectedVersion::Exact(0),
                    events: vec![uncommitted(healthy, "a")],
                },
                StreamAppend {
                    expected_version: ExpectedVersion::Exact(0),
                    events: vec![uncommitted(contended, "b")],
                },
            ])
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Concurrency(_)));

        assert!(store.load_stream(healthy).unwrap().is_empty());
        assert_eq!(store.load_stream(contended).unwrap().len(), 1);

        // With correct expectations both streams commit.
        let stored = store
            .append_many(vec![
                StreamAppend {
                    expected_version: ExpectedVersion::Exact(0),
                    events: vec![uncommitted(healthy, "a")],
                },
                StreamAppend {
                    expected_version: ExpectedVersion::Exact(1),
                    events: vec![uncommitted(contended, "b")],
                },
            ])
            .unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[test]
    fn append_many_rejects_duplicate_streams() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();

        let err = store
            .append_many(vec![
                StreamAppend {
                    expected_version: ExpectedVersion::Exact(0),
                    events: vec![uncommitted(id, "a")],
                },
                StreamAppend {
                    expected_version: ExpectedVersion::Exact(0),
                    events: vec![uncommitted(id, "b")],
                },
            ])
            .unwrap_err();
        assert!(matches!(err, EventStoreError::InvalidAppend(_)));
    }

    #[test]
    fn aggregate_type_is_stable_per_stream() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();

        store
            .append(vec![uncommitted(id, "a")], ExpectedVersion::Exact(0))
            .unwrap();

        let mut other = uncommitted(id, "b");
        other.aggregate_type = "pharmacy.sale".to_string();
        let err = store
            .append(vec![other], ExpectedVersion::Exact(1))
            .unwrap_err();
        assert!(matches!(err, EventStoreError::AggregateTypeMismatch(_)));
    }

    #[test]
    fn load_all_orders_by_stream_then_sequence() {
        let store = InMemoryEventStore::new();
        let a = AggregateId::new();
        let b = AggregateId::new();

        store
            .append(vec![uncommitted(b, "b1")], ExpectedVersion::Exact(0))
            .unwrap();
        store
            .append(vec![uncommitted(a, "a1"), uncommitted(a, "a2")], ExpectedVersion::Exact(0))
            .unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 3);
        for window in all.windows(2) {
            assert!(
                (window[0].aggregate_id, window[0].sequence_number)
                    < (window[1].aggregate_id, window[1].sequence_number)
            );
        }
    }
}
