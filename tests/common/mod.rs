// Not every test file uses every helper.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use duractor::Event;
use duractor::providers::in_memory::InMemoryProvider;
use duractor::providers::{Provider, ProviderError, Snapshot};
use duractor::runtime::registry::{ActivityRegistry, EntityRegistry, OrchestrationRegistry};
use duractor::runtime::{Runtime, RuntimeOptions};

/// Options that keep store retries short so fault tests finish quickly.
pub fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        store_retry_attempts: 2,
        store_retry_base_ms: 1,
        status_poll_interval_ms: 5,
        ..RuntimeOptions::default()
    }
}

pub async fn start_runtime(
    store: Arc<dyn Provider>,
    activities: ActivityRegistry,
    orchestrations: OrchestrationRegistry,
    entities: EntityRegistry,
) -> Arc<Runtime> {
    Runtime::start_with_options(store, activities, orchestrations, entities, fast_options()).await
}

/// `counter` entity: `add(n)`, `get()`, anything else fails.
pub fn counter_entities() -> EntityRegistry {
    EntityRegistry::builder()
        .register_typed::<i64, _>("counter", |count, operation, input| match operation {
            "add" => {
                *count += input.parse::<i64>().map_err(|e| format!("bad amount '{input}': {e}"))?;
                Ok(None)
            }
            "get" => Ok(Some(count.to_string())),
            other => Err(format!("unknown operation {other}")),
        })
        .build()
}

pub async fn wait_for_history<F>(store: Arc<dyn Provider>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&[Event]) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if let Ok(hist) = store.read(instance).await {
            if predicate(&hist) {
                return true;
            }
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// In-memory store whose reads and writes can be switched to fail as "store unavailable".
#[derive(Default)]
pub struct FlakyProvider {
    inner: InMemoryProvider,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl FlakyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, reads: bool, writes: bool) {
        self.fail_reads.store(reads, Ordering::SeqCst);
        self.fail_writes.store(writes, Ordering::SeqCst);
    }

    fn check(&self, flag: &AtomicBool, operation: &str) -> Result<(), ProviderError> {
        if flag.load(Ordering::SeqCst) {
            Err(ProviderError::unavailable(operation, "injected outage"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Provider for FlakyProvider {
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        self.check(&self.fail_reads, "read")?;
        self.inner.read(instance).await
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<u64, ProviderError> {
        self.check(&self.fail_writes, "append")?;
        self.inner.append(instance, new_events).await
    }

    async fn read_snapshot(&self, instance: &str) -> Result<Option<Snapshot>, ProviderError> {
        self.check(&self.fail_reads, "read_snapshot")?;
        self.inner.read_snapshot(instance).await
    }

    async fn write_snapshot(&self, instance: &str, snapshot: Snapshot) -> Result<(), ProviderError> {
        self.check(&self.fail_writes, "write_snapshot")?;
        self.inner.write_snapshot(instance, snapshot).await
    }

    async fn delete(&self, instance: &str) -> Result<(), ProviderError> {
        self.check(&self.fail_writes, "delete")?;
        self.inner.delete(instance).await
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        self.check(&self.fail_reads, "list_instances")?;
        self.inner.list_instances().await
    }
}
