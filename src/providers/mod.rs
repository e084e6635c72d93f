//! Durable store abstraction.
//!
//! A provider is a plain datastore: an append-only, gap-free event history per instance plus
//! an optional snapshot. It owns no queues and runs no workers; the runtime is the only
//! writer for any given instance and serializes its own appends.

use serde::{Deserialize, Serialize};

use crate::{EntityCaller, ErrorDetails, Event};

pub mod error;
pub mod fs;
pub mod in_memory;

pub use error::ProviderError;

/// Latest materialized state of an instance, valid through `through_event_id`.
///
/// `callers` lists every orchestration caller the entity has answered. It survives a purge
/// (as a snapshot with no state and `through_event_id == 0`) so operations redelivered after
/// a delete are not applied again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub state: Option<String>,
    pub through_event_id: u64,
    #[serde(default)]
    pub callers: Vec<CallerRecord>,
}

/// Recorded outcome of an operation issued by an orchestration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerRecord {
    pub caller: EntityCaller,
    pub result: Result<Option<String>, ErrorDetails>,
}

#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Full history in append order. Unknown instances read as empty.
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError>;

    /// Append a batch atomically and return the `event_id` of the last event stored.
    ///
    /// Events carrying `event_id == 0` are numbered by the store. A non-zero id must equal
    /// the next sequence number or the whole batch is rejected with a permanent error.
    /// An empty batch returns the current last id.
    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<u64, ProviderError>;

    async fn read_snapshot(&self, instance: &str) -> Result<Option<Snapshot>, ProviderError>;

    async fn write_snapshot(&self, instance: &str, snapshot: Snapshot) -> Result<(), ProviderError>;

    /// Remove history and snapshot. Deleting an unknown instance is not an error.
    async fn delete(&self, instance: &str) -> Result<(), ProviderError>;

    /// Every instance that currently has history.
    async fn list_instances(&self) -> Result<Vec<String>, ProviderError>;
}

/// Number `new_events` so they continue `current_last` without gaps.
pub(crate) fn assign_event_ids(instance: &str, current_last: u64, new_events: &mut [Event]) -> Result<u64, ProviderError> {
    let mut next = current_last;
    for event in new_events.iter_mut() {
        next += 1;
        let id = event.event_id();
        if id != 0 && id != next {
            return Err(ProviderError::permanent(
                "append",
                format!("instance {instance}: event_id {id} does not follow {}", next - 1),
            ));
        }
        event.set_event_id(next);
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(event_id: u64) -> Event {
        Event::OrchestrationStarted {
            event_id,
            name: "o".into(),
            input: String::new(),
        }
    }

    #[test]
    fn numbers_unassigned_events() {
        let mut batch = vec![started(0), started(0)];
        let last = assign_event_ids("i", 3, &mut batch).unwrap();
        assert_eq!(last, 5);
        assert_eq!(batch[0].event_id(), 4);
        assert_eq!(batch[1].event_id(), 5);
    }

    #[test]
    fn accepts_matching_ids_and_rejects_gaps() {
        let mut ok = vec![started(1), started(2)];
        assert_eq!(assign_event_ids("i", 0, &mut ok).unwrap(), 2);

        let mut gap = vec![started(1), started(3)];
        let err = assign_event_ids("i", 0, &mut gap).unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.message.contains("event_id 3"));
    }

    #[test]
    fn empty_batch_keeps_last_id() {
        assert_eq!(assign_event_ids("i", 9, &mut []).unwrap(), 9);
    }
}
