use std::collections::HashMap;

use tokio::sync::Mutex;

use super::{Provider, ProviderError, Snapshot, assign_event_ids};
use crate::Event;

/// Volatile store for tests and single-process experiments.
#[derive(Default)]
pub struct InMemoryProvider {
    histories: Mutex<HashMap<String, Vec<Event>>>,
    snapshots: Mutex<HashMap<String, Snapshot>>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Debug helper: every history, one event per line.
    pub async fn dump_all_pretty(&self) -> String {
        let g = self.histories.lock().await;
        let mut instances: Vec<_> = g.keys().collect();
        instances.sort();
        let mut out = String::new();
        for inst in instances {
            out.push_str(&format!("instance={inst}\n"));
            for e in &g[inst] {
                out.push_str(&format!("  {e:?}\n"));
            }
        }
        out
    }
}

#[async_trait::async_trait]
impl Provider for InMemoryProvider {
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        Ok(self.histories.lock().await.get(instance).cloned().unwrap_or_default())
    }

    async fn append(&self, instance: &str, mut new_events: Vec<Event>) -> Result<u64, ProviderError> {
        let mut g = self.histories.lock().await;
        let current = g.get(instance).map(|h| h.len() as u64).unwrap_or(0);
        let last = assign_event_ids(instance, current, &mut new_events)?;
        if !new_events.is_empty() {
            g.entry(instance.to_string()).or_default().extend(new_events);
        }
        Ok(last)
    }

    async fn read_snapshot(&self, instance: &str) -> Result<Option<Snapshot>, ProviderError> {
        Ok(self.snapshots.lock().await.get(instance).cloned())
    }

    async fn write_snapshot(&self, instance: &str, snapshot: Snapshot) -> Result<(), ProviderError> {
        self.snapshots.lock().await.insert(instance.to_string(), snapshot);
        Ok(())
    }

    async fn delete(&self, instance: &str) -> Result<(), ProviderError> {
        self.histories.lock().await.remove(instance);
        self.snapshots.lock().await.remove(instance);
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let mut out: Vec<String> = self.histories.lock().await.keys().cloned().collect();
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activity(name: &str) -> Event {
        Event::ActivityScheduled {
            event_id: 0,
            name: name.into(),
            input: String::new(),
        }
    }

    #[tokio::test]
    async fn append_assigns_gap_free_ids() {
        let store = InMemoryProvider::new();
        assert_eq!(store.append("i1", vec![activity("a"), activity("b")]).await.unwrap(), 2);
        assert_eq!(store.append("i1", vec![activity("c")]).await.unwrap(), 3);

        let ids: Vec<u64> = store.read("i1").await.unwrap().iter().map(|e| e.event_id()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(store.read("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejected_batch_leaves_history_untouched() {
        let store = InMemoryProvider::new();
        store.append("i1", vec![activity("a")]).await.unwrap();

        let mut stale = activity("b");
        stale.set_event_id(1);
        assert!(store.append("i1", vec![stale]).await.is_err());
        assert_eq!(store.read("i1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn snapshots_and_delete() {
        let store = InMemoryProvider::new();
        store.append("@counter@a", vec![activity("x")]).await.unwrap();
        let snap = Snapshot {
            state: Some("3".into()),
            through_event_id: 1,
            callers: Vec::new(),
        };
        store.write_snapshot("@counter@a", snap.clone()).await.unwrap();
        assert_eq!(store.read_snapshot("@counter@a").await.unwrap(), Some(snap));
        assert_eq!(store.list_instances().await.unwrap(), vec!["@counter@a".to_string()]);

        store.delete("@counter@a").await.unwrap();
        assert!(store.read_snapshot("@counter@a").await.unwrap().is_none());
        assert!(store.list_instances().await.unwrap().is_empty());
        store.delete("@counter@a").await.unwrap();
    }
}
