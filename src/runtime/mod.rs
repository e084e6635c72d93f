use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::providers::{Provider, ProviderError};
use crate::{EntityId, ErrorDetails, Event, OrchestrationContext};

/// Configuration options for the Runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Activities allowed to run at the same time across all instances.
    /// Default: 64
    pub activity_concurrency: usize,
    /// Capacity of each entity mailbox; senders wait when it is full.
    /// Default: 32
    pub entity_mailbox_capacity: usize,
    /// An entity worker with an empty mailbox retires after this long.
    /// Default: 5 minutes
    pub entity_idle_timeout: Duration,
    /// Retries for a store call that fails with a retryable error.
    /// Default: 5
    pub store_retry_attempts: u32,
    /// First retry backoff for store calls; doubles per attempt.
    /// Default: 10ms
    pub store_retry_base_ms: u64,
    /// How often `Client::wait_for_orchestration` re-reads history.
    /// Default: 10ms
    pub status_poll_interval_ms: u64,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            activity_concurrency: 64,
            entity_mailbox_capacity: 32,
            entity_idle_timeout: Duration::from_secs(300),
            store_retry_attempts: 5,
            store_retry_base_ms: 10,
            status_poll_interval_ms: 10,
        }
    }
}

mod activity;
mod entities;
mod orchestrations;
pub mod registry;
mod replay_engine;
mod state_helpers;
mod timers;

pub use activity::{ActivityContext, ActivityExecutor};
pub use entities::EntityContext;
pub(crate) use entities::EntityMessage;
pub use registry::{
    ActivityRegistry, ActivityRegistryBuilder, EntityRegistry, EntityRegistryBuilder, OrchestrationRegistry,
    OrchestrationRegistryBuilder,
};
pub use replay_engine::{ReplayEngine, TurnResult};
pub use state_helpers::HistoryManager;

use timers::{TimerRequest, TimerService};

/// High-level orchestration status derived from history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    NotFound,
    Running,
    Completed { output: String },
    Failed { details: ErrorDetails },
}

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Trait implemented by activity handlers.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String>;
}

pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Entity operations are synchronous: they see one state and run one at a time.
pub trait EntityHandler: Send + Sync {
    fn handle(&self, ctx: &mut EntityContext) -> Result<Option<String>, String>;
}

pub struct FnEntity<F>(pub F)
where
    F: Fn(&mut EntityContext) -> Result<Option<String>, String> + Send + Sync + 'static;

impl<F> EntityHandler for FnEntity<F>
where
    F: Fn(&mut EntityContext) -> Result<Option<String>, String> + Send + Sync + 'static,
{
    fn handle(&self, ctx: &mut EntityContext) -> Result<Option<String>, String> {
        (self.0)(ctx)
    }
}

/// Message delivered to an orchestration instance's worker.
#[derive(Debug, Clone)]
pub enum OrchestratorMsg {
    ActivityCompleted {
        instance: String,
        id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        id: u64,
        details: ErrorDetails,
    },
    TimerFired {
        instance: String,
        id: u64,
        fire_at_ms: u64,
    },
    EntityCallCompleted {
        instance: String,
        id: u64,
        result: Option<String>,
    },
    EntityCallFailed {
        instance: String,
        id: u64,
        details: ErrorDetails,
    },
    CancelRequested {
        instance: String,
        reason: String,
    },
}

impl OrchestratorMsg {
    pub fn instance(&self) -> &str {
        match self {
            OrchestratorMsg::ActivityCompleted { instance, .. }
            | OrchestratorMsg::ActivityFailed { instance, .. }
            | OrchestratorMsg::TimerFired { instance, .. }
            | OrchestratorMsg::EntityCallCompleted { instance, .. }
            | OrchestratorMsg::EntityCallFailed { instance, .. }
            | OrchestratorMsg::CancelRequested { instance, .. } => instance,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorMsg::ActivityCompleted { .. } => "ActivityCompleted",
            OrchestratorMsg::ActivityFailed { .. } => "ActivityFailed",
            OrchestratorMsg::TimerFired { .. } => "TimerFired",
            OrchestratorMsg::EntityCallCompleted { .. } => "EntityCallCompleted",
            OrchestratorMsg::EntityCallFailed { .. } => "EntityCallFailed",
            OrchestratorMsg::CancelRequested { .. } => "CancelRequested",
        }
    }
}

/// In-process runtime hosting orchestration workers, entity workers, activities and
/// timers over one durable store.
///
/// Every instance has at most one worker in a runtime, and that worker is the only
/// writer of the instance's history.
pub struct Runtime {
    joins: Mutex<Vec<JoinHandle<()>>>,
    store: Arc<dyn Provider>,
    activity_executor: Arc<ActivityExecutor>,
    orchestration_registry: OrchestrationRegistry,
    entity_registry: EntityRegistry,
    orchestration_inboxes: Mutex<HashMap<String, mpsc::UnboundedSender<OrchestratorMsg>>>,
    entity_mailboxes: Mutex<HashMap<String, mpsc::Sender<EntityMessage>>>,
    timer_tx: mpsc::UnboundedSender<TimerRequest>,
    shutdown_flag: AtomicBool,
    options: RuntimeOptions,
}

impl Runtime {
    /// Start a new runtime over `store` with default options.
    pub async fn start_with_store(
        store: Arc<dyn Provider>,
        activity_registry: ActivityRegistry,
        orchestration_registry: OrchestrationRegistry,
        entity_registry: EntityRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(
            store,
            activity_registry,
            orchestration_registry,
            entity_registry,
            RuntimeOptions::default(),
        )
        .await
    }

    /// Start a new runtime with explicit options. Instances left unfinished in the store
    /// by an earlier process are resumed before this returns.
    pub async fn start_with_options(
        store: Arc<dyn Provider>,
        activity_registry: ActivityRegistry,
        orchestration_registry: OrchestrationRegistry,
        entity_registry: EntityRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
            .try_init();

        let (fired_tx, mut fired_rx) = mpsc::unbounded_channel::<TimerRequest>();
        let (timer_handle, timer_tx) = TimerService::start(fired_tx);
        let activity_executor = Arc::new(ActivityExecutor::new(activity_registry, options.activity_concurrency));

        let runtime = Arc::new(Self {
            joins: Mutex::new(vec![timer_handle]),
            store,
            activity_executor,
            orchestration_registry,
            entity_registry,
            orchestration_inboxes: Mutex::new(HashMap::new()),
            entity_mailboxes: Mutex::new(HashMap::new()),
            timer_tx,
            shutdown_flag: AtomicBool::new(false),
            options,
        });

        // route fired timers back to their instances
        let router = runtime.clone();
        runtime.spawn_tracked(async move {
            while let Some(fired) = fired_rx.recv().await {
                router.deliver(OrchestratorMsg::TimerFired {
                    instance: fired.instance,
                    id: fired.scheduling_event_id,
                    fire_at_ms: fired.fire_at_ms,
                });
            }
        });

        if let Err(e) = runtime.recover().await {
            error!(target: "duractor::runtime", error = %e, "Recovery scan failed; unfinished instances resume on their next message");
        }
        runtime
    }

    /// Stop all workers. Durable state is untouched; a new runtime over the same store
    /// resumes where this one stopped.
    pub async fn shutdown(self: Arc<Self>) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
        let joins: Vec<JoinHandle<()>> = {
            let mut joins = self.joins.lock().expect("Mutex should not be poisoned");
            joins.drain(..).collect()
        };
        for j in &joins {
            j.abort();
        }
        for j in joins {
            let _ = j.await;
        }
        self.orchestration_inboxes.lock().expect("Mutex should not be poisoned").clear();
        self.entity_mailboxes.lock().expect("Mutex should not be poisoned").clear();
        info!(target: "duractor::runtime", "Runtime stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> Arc<dyn Provider> {
        self.store.clone()
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn orchestration_registry(&self) -> &OrchestrationRegistry {
        &self.orchestration_registry
    }

    pub fn entity_registry(&self) -> &EntityRegistry {
        &self.entity_registry
    }

    /// Spawn a background task that shutdown aborts.
    pub(crate) fn spawn_tracked<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut joins = self.joins.lock().expect("Mutex should not be poisoned");
        if self.is_shutdown() {
            return;
        }
        let handle = tokio::spawn(fut);
        joins.retain(|j| !j.is_finished());
        joins.push(handle);
    }

    /// Run a store call, retrying retryable failures with doubling backoff.
    pub(crate) async fn with_store_retry<T, F, R>(&self, operation_tag: &str, operation: F) -> Result<T, ProviderError>
    where
        F: Fn() -> R,
        R: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let mut attempts: u32 = 0;
        loop {
            match operation().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempts < self.options.store_retry_attempts => {
                    let backoff_ms = self
                        .options
                        .store_retry_base_ms
                        .saturating_mul(1u64.checked_shl(attempts).unwrap_or(u64::MAX));
                    warn!(target: "duractor::runtime", attempts, backoff_ms, error = %e, "{} failed; retrying", operation_tag);
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempts += 1;
                }
                Err(e) => {
                    warn!(target: "duractor::runtime", attempts, error = %e, "Failed to {}", operation_tag);
                    return Err(e);
                }
            }
        }
    }

    pub(crate) async fn read_with_retry(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        self.with_store_retry("read history", || async { self.store.read(instance).await })
            .await
    }

    pub(crate) async fn append_with_retry(&self, instance: &str, events: Vec<Event>) -> Result<u64, ProviderError> {
        self.with_store_retry("append history", || async { self.store.append(instance, events.clone()).await })
            .await
    }

    /// Resume every instance the store shows as unfinished.
    async fn recover(self: &Arc<Self>) -> Result<(), ProviderError> {
        let instances = self
            .with_store_retry("list instances", || async { self.store.list_instances().await })
            .await?;
        let mut orchestrations = 0usize;
        let mut entities = 0usize;
        for instance in instances {
            let history = match self.read_with_retry(&instance).await {
                Ok(h) => h,
                Err(e) => {
                    warn!(target: "duractor::runtime", instance_id = %instance, error = %e, "Skipping instance during recovery");
                    continue;
                }
            };
            if let Some(entity) = EntityId::parse_instance_key(&instance) {
                if !entities::has_unprocessed_operations(&history) {
                    continue;
                }
                match self.entity_mailbox(&entity) {
                    Ok(_) => entities += 1,
                    Err(e) => warn!(target: "duractor::runtime", entity = %entity, error = %e, "Cannot resume entity"),
                }
            } else {
                let meta = HistoryManager::from_history(&history);
                if meta.is_started() && !meta.is_terminal() {
                    self.ensure_orchestration_worker(&instance);
                    orchestrations += 1;
                }
            }
        }
        if orchestrations + entities > 0 {
            info!(target: "duractor::runtime", orchestrations, entities, "Resumed unfinished instances");
        } else {
            debug!(target: "duractor::runtime", "Nothing to resume");
        }
        Ok(())
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
