//! # duractor
//!
//! Durable entities and deterministic, replay-driven orchestrations on tokio.
//!
//! - **Entities** are addressable single-writer actors. Each instance (`EntityId`) owns an
//!   opaque state string and processes operations strictly one at a time, in arrival order.
//!   Every operation and its outcome is recorded before the caller hears back.
//! - **Orchestrations** are plain async functions that coordinate activities, timers and
//!   entity calls. They are re-executed from the top on every turn and replay recorded
//!   results, so after a crash they pick up exactly where they left off.
//! - **Activities** are stateless named units of work executed on the tokio runtime.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use duractor::providers::in_memory::InMemoryProvider;
//! use duractor::runtime::registry::{ActivityRegistry, EntityRegistry, OrchestrationRegistry};
//! use duractor::runtime::{ActivityContext, Runtime};
//! use duractor::{Client, EntityId, OrchestrationContext, OrchestrationStatus};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryProvider::new());
//!
//! let activities = ActivityRegistry::builder()
//!     .register("Greet", |_ctx: ActivityContext, name: String| async move { Ok(format!("Hello, {name}!")) })
//!     .build();
//!
//! let orchestrations = OrchestrationRegistry::builder()
//!     .register("HelloWorld", |ctx: OrchestrationContext, name: String| async move {
//!         let greeting = ctx.schedule_activity("Greet", name).into_activity().await?;
//!         ctx.signal_entity(&EntityId::new("counter", "greetings"), "add", "1");
//!         Ok(greeting)
//!     })
//!     .build();
//!
//! let entities = EntityRegistry::builder()
//!     .register_typed::<i64, _>("counter", |count, operation, input| match operation {
//!         "add" => {
//!             *count += input.parse::<i64>().map_err(|e| e.to_string())?;
//!             Ok(None)
//!         }
//!         "get" => Ok(Some(count.to_string())),
//!         other => Err(format!("unknown operation {other}")),
//!     })
//!     .build();
//!
//! let rt = Runtime::start_with_store(store, activities, orchestrations, entities).await;
//! let client = Client::new(rt.clone());
//!
//! client.start_orchestration("inst-1", "HelloWorld", "Rust").await?;
//! match client.wait_for_orchestration("inst-1", std::time::Duration::from_secs(5)).await? {
//!     OrchestrationStatus::Completed { output } => assert_eq!(output, "Hello, Rust!"),
//!     other => panic!("unexpected status {other:?}"),
//! }
//! rt.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Determinism
//!
//! Orchestration code must make the same scheduling decisions every time it runs against the
//! same history. Use [`OrchestrationContext::utc_now_ms`] and [`OrchestrationContext::new_guid`]
//! instead of reading the clock or generating randomness, and log through the `durable_*!`
//! macros so replayed turns stay quiet. A turn whose decisions disagree with history fails
//! the instance with a nondeterminism error.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::_typed_codec::Codec;

pub mod client;
pub mod futures;
pub mod logging;
pub mod providers;
pub mod runtime;

pub use client::{Client, ClientError};
pub use futures::{DurableFuture, DurableOutput, JoinFuture, SelectFuture};
pub use runtime::{OrchestrationStatus, Runtime, RuntimeOptions};

/// Built-in activity returning wall-clock milliseconds since the Unix epoch.
pub const SYSTEM_NOW_ACTIVITY: &str = "__system_now";
/// Built-in activity returning a fresh v4 UUID.
pub const SYSTEM_GUID_ACTIVITY: &str = "__system_guid";
/// Built-in entity operation that removes the entity's state.
pub const DELETE_OPERATION: &str = "__delete";

// Internal codec utilities for typed I/O
pub(crate) mod _typed_codec {
    use serde::{Serialize, de::DeserializeOwned};
    use serde_json::Value;

    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }

    pub struct Json;

    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            // JSON strings are stored raw so untyped and typed callers agree
            match serde_json::to_value(v) {
                Ok(Value::String(s)) => Ok(s),
                Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }

        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            match serde_json::from_str::<T>(s) {
                Ok(v) => Ok(v),
                Err(_) => {
                    // fall back to the raw string as a JSON string value
                    let val = Value::String(s.to_string());
                    serde_json::from_value(val).map_err(|e| e.to_string())
                }
            }
        }
    }

}

/// Identity of an entity instance: the registered entity `name` plus a caller-chosen `key`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId {
    pub name: String,
    pub key: String,
}

impl EntityId {
    /// `name` must not contain `@`; `key` may be anything.
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
        }
    }

    /// Store key for this entity's history: `@{name}@{key}`.
    pub fn instance_key(&self) -> String {
        format!("@{}@{}", self.name, self.key)
    }

    /// Inverse of [`EntityId::instance_key`]; `None` for orchestration instances.
    pub fn parse_instance_key(instance: &str) -> Option<Self> {
        let rest = instance.strip_prefix('@')?;
        let (name, key) = rest.split_once('@')?;
        Some(Self::new(name, key))
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.key)
    }
}

/// Orchestration scheduling event that issued an entity operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityCaller {
    pub instance: String,
    pub source_event_id: u64,
}

/// Append-only history entries. Scheduling events are paired with their completions through
/// `source_event_id`. Entity histories hold only `EntityOperation*` events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Event {
    /// Instance created and started by orchestration name with input.
    OrchestrationStarted { event_id: u64, name: String, input: String },
    OrchestrationCompleted { event_id: u64, output: String },
    OrchestrationFailed { event_id: u64, details: ErrorDetails },
    OrchestrationCancelRequested { event_id: u64, reason: String },

    ActivityScheduled { event_id: u64, name: String, input: String },
    ActivityCompleted { event_id: u64, source_event_id: u64, result: String },
    ActivityFailed { event_id: u64, source_event_id: u64, details: ErrorDetails },

    TimerCreated { event_id: u64, fire_at_ms: u64 },
    TimerFired { event_id: u64, source_event_id: u64, fire_at_ms: u64 },

    /// An orchestration called an entity and expects a result.
    EntityCallScheduled {
        event_id: u64,
        entity: EntityId,
        operation: String,
        input: String,
    },
    EntityCallCompleted {
        event_id: u64,
        source_event_id: u64,
        result: Option<String>,
    },
    EntityCallFailed {
        event_id: u64,
        source_event_id: u64,
        details: ErrorDetails,
    },
    /// Fire-and-forget signal from an orchestration; never completes.
    EntitySignalSent {
        event_id: u64,
        entity: EntityId,
        operation: String,
        input: String,
    },

    /// An operation durably accepted into an entity's mailbox.
    EntityOperationQueued {
        event_id: u64,
        operation: String,
        input: String,
        caller: Option<EntityCaller>,
    },
    /// The queued operation `source_event_id` ran; `state` is the entity state afterwards
    /// (`None` when absent or deleted).
    EntityOperationProcessed {
        event_id: u64,
        source_event_id: u64,
        result: Result<Option<String>, ErrorDetails>,
        state: Option<String>,
    },
}

impl Event {
    pub fn event_id(&self) -> u64 {
        match self {
            Event::OrchestrationStarted { event_id, .. }
            | Event::OrchestrationCompleted { event_id, .. }
            | Event::OrchestrationFailed { event_id, .. }
            | Event::OrchestrationCancelRequested { event_id, .. }
            | Event::ActivityScheduled { event_id, .. }
            | Event::ActivityCompleted { event_id, .. }
            | Event::ActivityFailed { event_id, .. }
            | Event::TimerCreated { event_id, .. }
            | Event::TimerFired { event_id, .. }
            | Event::EntityCallScheduled { event_id, .. }
            | Event::EntityCallCompleted { event_id, .. }
            | Event::EntityCallFailed { event_id, .. }
            | Event::EntitySignalSent { event_id, .. }
            | Event::EntityOperationQueued { event_id, .. }
            | Event::EntityOperationProcessed { event_id, .. } => *event_id,
        }
    }

    pub(crate) fn set_event_id(&mut self, id: u64) {
        match self {
            Event::OrchestrationStarted { event_id, .. }
            | Event::OrchestrationCompleted { event_id, .. }
            | Event::OrchestrationFailed { event_id, .. }
            | Event::OrchestrationCancelRequested { event_id, .. }
            | Event::ActivityScheduled { event_id, .. }
            | Event::ActivityCompleted { event_id, .. }
            | Event::ActivityFailed { event_id, .. }
            | Event::TimerCreated { event_id, .. }
            | Event::TimerFired { event_id, .. }
            | Event::EntityCallScheduled { event_id, .. }
            | Event::EntityCallCompleted { event_id, .. }
            | Event::EntityCallFailed { event_id, .. }
            | Event::EntitySignalSent { event_id, .. }
            | Event::EntityOperationQueued { event_id, .. }
            | Event::EntityOperationProcessed { event_id, .. } => *event_id = id,
        }
    }

    /// For completion events, the scheduling event they complete.
    pub fn source_event_id(&self) -> Option<u64> {
        match self {
            Event::ActivityCompleted { source_event_id, .. }
            | Event::ActivityFailed { source_event_id, .. }
            | Event::TimerFired { source_event_id, .. }
            | Event::EntityCallCompleted { source_event_id, .. }
            | Event::EntityCallFailed { source_event_id, .. }
            | Event::EntityOperationProcessed { source_event_id, .. } => Some(*source_event_id),
            _ => None,
        }
    }

    /// Events produced by orchestration code that replay must claim in order.
    pub fn is_scheduling(&self) -> bool {
        matches!(
            self,
            Event::ActivityScheduled { .. }
                | Event::TimerCreated { .. }
                | Event::EntityCallScheduled { .. }
                | Event::EntitySignalSent { .. }
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::OrchestrationCompleted { .. } | Event::OrchestrationFailed { .. }
        )
    }

    /// Short human-readable form used in nondeterminism messages.
    pub fn describe(&self) -> String {
        match self {
            Event::ActivityScheduled { name, input, .. } => format!("activity '{name}' input '{input}'"),
            Event::TimerCreated { .. } => "timer".to_string(),
            Event::EntityCallScheduled {
                entity, operation, input, ..
            } => format!("entity call {entity}.{operation} input '{input}'"),
            Event::EntitySignalSent {
                entity, operation, input, ..
            } => format!("entity signal {entity}.{operation} input '{input}'"),
            other => format!("{other:?}"),
        }
    }
}

/// Which configuration problem stopped an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigErrorKind {
    Nondeterminism,
    UnregisteredOrchestration,
    UnregisteredActivity,
    UnregisteredEntity,
}

/// Failures raised by user code, or imposed on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppErrorKind {
    ActivityFailed,
    EntityOperationFailed,
    OrchestrationFailed,
    Cancelled,
    Panicked,
}

/// Recorded failure, classified by who has to act on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorDetails {
    /// Store faults. `retryable` marks the store-unavailable condition.
    Infrastructure {
        operation: String,
        message: String,
        retryable: bool,
    },
    /// Deployment problems: missing registrations or code that no longer matches history.
    Configuration {
        kind: ConfigErrorKind,
        resource: String,
        message: Option<String>,
    },
    /// Business failures visible to orchestration code as `Err(String)`.
    Application {
        kind: AppErrorKind,
        message: String,
        retryable: bool,
    },
}

impl ErrorDetails {
    pub fn nondeterminism(message: impl Into<String>) -> Self {
        ErrorDetails::Configuration {
            kind: ConfigErrorKind::Nondeterminism,
            resource: String::new(),
            message: Some(message.into()),
        }
    }

    pub fn unregistered(kind: ConfigErrorKind, resource: impl Into<String>) -> Self {
        ErrorDetails::Configuration {
            kind,
            resource: resource.into(),
            message: None,
        }
    }

    pub fn application(kind: AppErrorKind, message: impl Into<String>) -> Self {
        ErrorDetails::Application {
            kind,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            ErrorDetails::Infrastructure { .. } => "infrastructure",
            ErrorDetails::Configuration { .. } => "configuration",
            ErrorDetails::Application { .. } => "application",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorDetails::Infrastructure { retryable, .. } | ErrorDetails::Application { retryable, .. } => {
                *retryable
            }
            ErrorDetails::Configuration { .. } => false,
        }
    }

    pub fn is_nondeterminism(&self) -> bool {
        matches!(
            self,
            ErrorDetails::Configuration {
                kind: ConfigErrorKind::Nondeterminism,
                ..
            }
        )
    }

    /// The string orchestration code and clients see.
    pub fn display_message(&self) -> String {
        match self {
            ErrorDetails::Infrastructure { operation, message, .. } => {
                format!("infrastructure:{operation}: {message}")
            }
            ErrorDetails::Configuration {
                kind,
                resource,
                message,
            } => match kind {
                ConfigErrorKind::Nondeterminism => {
                    format!("nondeterministic: {}", message.as_deref().unwrap_or_default())
                }
                ConfigErrorKind::UnregisteredOrchestration => format!("unregistered orchestration: {resource}"),
                ConfigErrorKind::UnregisteredActivity => format!("unregistered activity: {resource}"),
                ConfigErrorKind::UnregisteredEntity => format!("unregistered entity: {resource}"),
            },
            ErrorDetails::Application { kind, message, .. } => match kind {
                AppErrorKind::Cancelled => format!("canceled: {message}"),
                AppErrorKind::Panicked => format!("panicked: {message}"),
                _ => message.clone(),
            },
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display_message())
    }
}

/// Work requested by a turn, dispatched only after the turn's events are persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CallActivity {
        scheduling_event_id: u64,
        name: String,
        input: String,
    },
    CreateTimer {
        scheduling_event_id: u64,
        fire_at_ms: u64,
    },
    CallEntity {
        scheduling_event_id: u64,
        entity: EntityId,
        operation: String,
        input: String,
    },
    SignalEntity {
        scheduling_event_id: u64,
        entity: EntityId,
        operation: String,
        input: String,
    },
}

/// Retry schedule for [`OrchestrationContext::schedule_activity_with_retry`]. The backoff
/// doubles after each failed attempt, capped at `max_backoff`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub(crate) fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// A scheduling decision as orchestration code states it.
#[derive(Debug, Clone)]
pub(crate) enum Schedule {
    Activity {
        name: String,
        input: String,
    },
    Timer {
        delay_ms: u64,
    },
    EntityCall {
        entity: EntityId,
        operation: String,
        input: String,
    },
    EntitySignal {
        entity: EntityId,
        operation: String,
        input: String,
    },
}

impl Schedule {
    /// Whether a recorded scheduling event is this decision.
    fn matches(&self, event: &Event) -> bool {
        match (self, event) {
            (Schedule::Activity { name, input }, Event::ActivityScheduled { name: n, input: i, .. }) => {
                name == n && input == i
            }
            // fire_at depends on the turn's wall clock, so only the kind is compared
            (Schedule::Timer { .. }, Event::TimerCreated { .. }) => true,
            (
                Schedule::EntityCall {
                    entity,
                    operation,
                    input,
                },
                Event::EntityCallScheduled {
                    entity: e,
                    operation: o,
                    input: i,
                    ..
                },
            )
            | (
                Schedule::EntitySignal {
                    entity,
                    operation,
                    input,
                },
                Event::EntitySignalSent {
                    entity: e,
                    operation: o,
                    input: i,
                    ..
                },
            ) => entity == e && operation == o && input == i,
            _ => false,
        }
    }

    fn describe(&self) -> String {
        match self {
            Schedule::Activity { name, input } => format!("activity '{name}' input '{input}'"),
            Schedule::Timer { .. } => "timer".to_string(),
            Schedule::EntityCall {
                entity,
                operation,
                input,
            } => format!("entity call {entity}.{operation} input '{input}'"),
            Schedule::EntitySignal {
                entity,
                operation,
                input,
            } => format!("entity signal {entity}.{operation} input '{input}'"),
        }
    }

    fn materialize(&self, event_id: u64, now_ms: u64) -> (Event, Action) {
        match self.clone() {
            Schedule::Activity { name, input } => (
                Event::ActivityScheduled {
                    event_id,
                    name: name.clone(),
                    input: input.clone(),
                },
                Action::CallActivity {
                    scheduling_event_id: event_id,
                    name,
                    input,
                },
            ),
            Schedule::Timer { delay_ms } => {
                let fire_at_ms = now_ms.saturating_add(delay_ms);
                (
                    Event::TimerCreated { event_id, fire_at_ms },
                    Action::CreateTimer {
                        scheduling_event_id: event_id,
                        fire_at_ms,
                    },
                )
            }
            Schedule::EntityCall {
                entity,
                operation,
                input,
            } => (
                Event::EntityCallScheduled {
                    event_id,
                    entity: entity.clone(),
                    operation: operation.clone(),
                    input: input.clone(),
                },
                Action::CallEntity {
                    scheduling_event_id: event_id,
                    entity,
                    operation,
                    input,
                },
            ),
            Schedule::EntitySignal {
                entity,
                operation,
                input,
            } => (
                Event::EntitySignalSent {
                    event_id,
                    entity: entity.clone(),
                    operation: operation.clone(),
                    input: input.clone(),
                },
                Action::SignalEntity {
                    scheduling_event_id: event_id,
                    entity,
                    operation,
                    input,
                },
            ),
        }
    }
}

#[derive(Debug)]
struct CtxInner {
    instance: String,
    history: Vec<Event>,
    baseline_len: usize,
    baseline_scheduling_events: usize,
    claimed_from_baseline: usize,
    claimed_scheduling_events: HashSet<u64>,
    actions: Vec<Action>,
    next_event_id: u64,
    turn_started_ms: u64,
    turn_index: u64,
    nondeterminism_error: Option<String>,
}

impl CtxInner {
    fn new(instance: String, history: Vec<Event>, turn_started_ms: u64, turn_index: u64) -> Self {
        let next_event_id = history.last().map(|e| e.event_id() + 1).unwrap_or(1);
        let baseline_scheduling_events = history.iter().filter(|e| e.is_scheduling()).count();
        Self {
            instance,
            baseline_len: history.len(),
            history,
            baseline_scheduling_events,
            claimed_from_baseline: 0,
            claimed_scheduling_events: HashSet::new(),
            actions: Vec::new(),
            next_event_id,
            turn_started_ms,
            turn_index,
            nondeterminism_error: None,
        }
    }

    /// Bind a decision to the next unclaimed scheduling event, or record a new one.
    fn claim_scheduling_event(&mut self, request: &Schedule) -> Option<u64> {
        if self.nondeterminism_error.is_some() {
            return None;
        }
        let next_unclaimed = self
            .history
            .iter()
            .find(|e| e.is_scheduling() && !self.claimed_scheduling_events.contains(&e.event_id()))
            .map(|e| (e.event_id(), request.matches(e), e.describe()));

        let event_id = match next_unclaimed {
            Some((id, true, _)) => {
                if (id as usize) <= self.baseline_len {
                    self.claimed_from_baseline += 1;
                }
                id
            }
            Some((id, false, recorded)) => {
                self.nondeterminism_error = Some(format!(
                    "history has {recorded} at event_id {id} but code scheduled {}",
                    request.describe()
                ));
                return None;
            }
            None => {
                let id = self.next_event_id;
                self.next_event_id += 1;
                let (event, action) = request.materialize(id, self.turn_started_ms);
                self.history.push(event);
                self.actions.push(action);
                id
            }
        };
        self.claimed_scheduling_events.insert(event_id);
        Some(event_id)
    }

    fn is_replaying(&self) -> bool {
        self.claimed_from_baseline < self.baseline_scheduling_events
    }
}

/// Handle passed to orchestration code. Every method records or replays a decision against
/// the instance's history; none of them perform I/O directly.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    pub(crate) fn new(instance: String, history: Vec<Event>, turn_started_ms: u64, turn_index: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(instance, history, turn_started_ms, turn_index))),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CtxInner> {
        self.inner.lock().expect("Mutex should not be poisoned")
    }

    pub fn instance_id(&self) -> String {
        self.lock().instance.clone()
    }

    pub fn turn_index(&self) -> u64 {
        self.lock().turn_index
    }

    /// True while the code is re-executing steps that earlier turns already recorded.
    pub fn is_replaying(&self) -> bool {
        self.lock().is_replaying()
    }

    pub fn is_logging_enabled(&self) -> bool {
        !self.is_replaying()
    }

    pub fn trace_info(&self, message: impl Into<String>) {
        if self.is_logging_enabled() {
            tracing::info!(target: "duractor::orchestration", instance_id = %self.instance_id(), "{}", message.into());
        }
    }

    pub fn trace_warn(&self, message: impl Into<String>) {
        if self.is_logging_enabled() {
            tracing::warn!(target: "duractor::orchestration", instance_id = %self.instance_id(), "{}", message.into());
        }
    }

    pub fn trace_error(&self, message: impl Into<String>) {
        if self.is_logging_enabled() {
            tracing::error!(target: "duractor::orchestration", instance_id = %self.instance_id(), "{}", message.into());
        }
    }

    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        DurableFuture::new(
            self.clone(),
            Schedule::Activity {
                name: name.into(),
                input: input.into(),
            },
        )
    }

    /// Typed variant of [`schedule_activity`](Self::schedule_activity). Pair it with
    /// [`DurableFuture::into_activity_typed`].
    pub fn schedule_activity_typed<In: Serialize>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> Result<DurableFuture, String> {
        let payload = _typed_codec::Json::encode(input)?;
        Ok(self.schedule_activity(name, payload))
    }

    /// Durable timer; the fire time is fixed when the timer is first scheduled.
    pub fn schedule_timer(&self, delay: Duration) -> DurableFuture {
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        DurableFuture::new(self.clone(), Schedule::Timer { delay_ms })
    }

    /// Call an entity operation and await its result.
    pub fn call_entity(
        &self,
        entity: &EntityId,
        operation: impl Into<String>,
        input: impl Into<String>,
    ) -> DurableFuture {
        DurableFuture::new(
            self.clone(),
            Schedule::EntityCall {
                entity: entity.clone(),
                operation: operation.into(),
                input: input.into(),
            },
        )
    }

    pub fn call_entity_typed<In: Serialize>(
        &self,
        entity: &EntityId,
        operation: impl Into<String>,
        input: &In,
    ) -> Result<DurableFuture, String> {
        let payload = _typed_codec::Json::encode(input)?;
        Ok(self.call_entity(entity, operation, payload))
    }

    /// Fire-and-forget entity operation. Recorded in history; never awaited.
    pub fn signal_entity(&self, entity: &EntityId, operation: impl Into<String>, input: impl Into<String>) {
        let request = Schedule::EntitySignal {
            entity: entity.clone(),
            operation: operation.into(),
            input: input.into(),
        };
        self.lock().claim_scheduling_event(&request);
    }

    /// Wall-clock time, recorded once through the built-in system activity.
    pub fn utc_now_ms(&self) -> impl Future<Output = Result<u64, String>> {
        let fut = self.schedule_activity(SYSTEM_NOW_ACTIVITY, "");
        async move {
            let raw = fut.into_activity().await?;
            raw.parse::<u64>().map_err(|e| format!("invalid system time '{raw}': {e}"))
        }
    }

    /// Fresh GUID, recorded once through the built-in system activity.
    pub fn new_guid(&self) -> impl Future<Output = Result<String, String>> {
        self.schedule_activity(SYSTEM_GUID_ACTIVITY, "").into_activity()
    }

    /// Run an activity until it succeeds or the policy gives up, waiting on durable timers
    /// between attempts. Returns the last error once attempts are exhausted.
    pub async fn schedule_activity_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        policy: RetryPolicy,
    ) -> Result<String, String> {
        let name = name.into();
        let input = input.into();
        let attempts = policy.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.schedule_activity(name.clone(), input.clone()).into_activity().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    crate::durable_warn!(self, activity_name = %name, attempt, error = %e, "activity attempt failed");
                    last_error = e;
                }
            }
            let delay = policy.delay_after(attempt);
            if attempt < attempts && !delay.is_zero() {
                self.schedule_timer(delay).into_timer().await;
            }
        }
        Err(last_error)
    }

    /// Wait for every future; outputs come back in the order the futures were given.
    pub fn join(&self, futures: Vec<DurableFuture>) -> JoinFuture {
        JoinFuture::new(futures)
    }

    /// Fan-in: fold all outputs in scheduling order with `combine`.
    pub fn join_reduce<T, F>(&self, futures: Vec<DurableFuture>, init: T, combine: F) -> impl Future<Output = T>
    where
        F: FnMut(T, DurableOutput) -> T,
    {
        let joined = self.join(futures);
        async move { joined.await.into_iter().fold(init, combine) }
    }

    /// Resolve with the first future to complete (by history order) and its index.
    pub fn select(&self, futures: Vec<DurableFuture>) -> SelectFuture {
        SelectFuture::new(futures)
    }

    pub(crate) fn take_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.lock().actions)
    }

    pub(crate) fn nondeterminism_error(&self) -> Option<String> {
        self.lock().nondeterminism_error.clone()
    }

    /// Events appended by this turn, after the baseline history.
    pub(crate) fn new_events(&self) -> Vec<Event> {
        let inner = self.lock();
        inner.history[inner.baseline_len..].to_vec()
    }

    /// Recorded scheduling events this turn's code never reached.
    pub(crate) fn unclaimed_baseline_events(&self) -> Vec<Event> {
        let inner = self.lock();
        inner.history[..inner.baseline_len]
            .iter()
            .filter(|e| e.is_scheduling() && !inner.claimed_scheduling_events.contains(&e.event_id()))
            .cloned()
            .collect()
    }

    pub(crate) fn with_history<R>(&self, f: impl FnOnce(&[Event]) -> R) -> R {
        f(&self.lock().history)
    }

    pub(crate) fn claim(&self, request: &Schedule) -> Option<u64> {
        self.lock().claim_scheduling_event(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with(history: Vec<Event>) -> OrchestrationContext {
        OrchestrationContext::new("inst".into(), history, 1_000, 1)
    }

    fn started() -> Event {
        Event::OrchestrationStarted {
            event_id: 1,
            name: "o".into(),
            input: String::new(),
        }
    }

    #[test]
    fn entity_ids_map_to_store_keys() {
        let id = EntityId::new("counter", "user@1");
        assert_eq!(id.instance_key(), "@counter@user@1");
        assert_eq!(EntityId::parse_instance_key(&id.instance_key()), Some(id));
        assert_eq!(EntityId::parse_instance_key("order-17"), None);
    }

    #[test]
    fn new_decisions_get_consecutive_ids_and_actions() {
        let ctx = ctx_with(vec![started()]);
        let a = Schedule::Activity {
            name: "A".into(),
            input: "1".into(),
        };
        assert_eq!(ctx.claim(&a), Some(2));
        assert_eq!(ctx.claim(&Schedule::Timer { delay_ms: 500 }), Some(3));

        let events = ctx.new_events();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            Event::TimerCreated {
                event_id: 3,
                fire_at_ms: 1_500
            }
        );
        assert_eq!(ctx.take_actions().len(), 2);
        assert!(!ctx.is_replaying());
    }

    #[test]
    fn recorded_decisions_are_claimed_not_rescheduled() {
        let history = vec![
            started(),
            Event::ActivityScheduled {
                event_id: 2,
                name: "A".into(),
                input: "1".into(),
            },
        ];
        let ctx = ctx_with(history);
        assert!(ctx.is_replaying());
        let a = Schedule::Activity {
            name: "A".into(),
            input: "1".into(),
        };
        assert_eq!(ctx.claim(&a), Some(2));
        assert!(ctx.new_events().is_empty());
        assert!(ctx.take_actions().is_empty());
        assert!(!ctx.is_replaying());
    }

    #[test]
    fn mismatched_decision_is_nondeterministic() {
        let history = vec![
            started(),
            Event::ActivityScheduled {
                event_id: 2,
                name: "A".into(),
                input: "1".into(),
            },
        ];
        let ctx = ctx_with(history);
        let b = Schedule::Activity {
            name: "B".into(),
            input: "1".into(),
        };
        assert_eq!(ctx.claim(&b), None);
        let msg = ctx.nondeterminism_error().unwrap();
        assert!(msg.contains("activity 'A'"), "{msg}");
        assert!(msg.contains("activity 'B'"), "{msg}");
    }

    #[test]
    fn error_details_display() {
        let nd = ErrorDetails::nondeterminism("boom");
        assert!(nd.is_nondeterminism());
        assert_eq!(nd.category(), "configuration");
        assert_eq!(nd.to_string(), "nondeterministic: boom");

        let app = ErrorDetails::application(AppErrorKind::ActivityFailed, "bad input");
        assert_eq!(app.display_message(), "bad input");
        assert!(!app.is_retryable());

        let cancelled = ErrorDetails::application(AppErrorKind::Cancelled, "user");
        assert_eq!(cancelled.display_message(), "canceled: user");

        let unreg = ErrorDetails::unregistered(ConfigErrorKind::UnregisteredEntity, "ghost");
        assert_eq!(unreg.display_message(), "unregistered entity: ghost");
    }

    #[test]
    fn retry_backoff_doubles_and_caps() {
        let p = RetryPolicy::new(5).with_backoff(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(p.delay_after(1), Duration::from_millis(100));
        assert_eq!(p.delay_after(2), Duration::from_millis(200));
        assert_eq!(p.delay_after(3), Duration::from_millis(350));
    }
}
