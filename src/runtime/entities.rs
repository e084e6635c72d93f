//! Entity workers.
//!
//! Each entity instance is served by one task that owns the instance's state and a bounded
//! mailbox. Operations are recorded as `EntityOperationQueued` before they run and as
//! `EntityOperationProcessed` (carrying the resulting state) after, so a restarted worker
//! can rebuild state and finish anything that was accepted but not yet applied.

use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::{EntityHandler, Runtime, panic_message};
use crate::_typed_codec::{Codec, Json};
use crate::providers::{CallerRecord, Snapshot};
use crate::{AppErrorKind, ConfigErrorKind, DELETE_OPERATION, EntityCaller, EntityId, ErrorDetails, Event};

/// Sends and reply waits tolerated against a mailbox whose worker just retired.
const MAILBOX_ATTEMPTS: usize = 3;

/// What an entity operation sees: its identity, the operation, and a working copy of the
/// state. Changes are kept only if the handler returns `Ok`.
#[derive(Debug, Clone)]
pub struct EntityContext {
    entity: EntityId,
    operation: String,
    input: String,
    state: Option<String>,
}

impl EntityContext {
    pub fn new(entity: EntityId, operation: String, input: String, state: Option<String>) -> Self {
        Self {
            entity,
            operation,
            input,
            state,
        }
    }

    pub fn entity(&self) -> &EntityId {
        &self.entity
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn input_typed<T: DeserializeOwned>(&self) -> Result<T, String> {
        Json::decode(&self.input)
    }

    /// Current state; `None` before the first write or after a delete.
    pub fn state(&self) -> Option<&str> {
        self.state.as_deref()
    }

    pub fn has_state(&self) -> bool {
        self.state.is_some()
    }

    /// Decode the state, starting from `T::default()` when there is none.
    pub fn state_typed<T: DeserializeOwned + Default>(&self) -> Result<T, String> {
        match &self.state {
            Some(raw) => Json::decode(raw),
            None => Ok(T::default()),
        }
    }

    pub fn set_state(&mut self, state: impl Into<String>) {
        self.state = Some(state.into());
    }

    pub fn set_state_typed<T: Serialize>(&mut self, state: &T) -> Result<(), String> {
        self.state = Some(Json::encode(state)?);
        Ok(())
    }

    pub fn delete_state(&mut self) {
        self.state = None;
    }

    pub(crate) fn into_state(self) -> Option<String> {
        self.state
    }
}

type OperationOutcome = Result<Option<String>, ErrorDetails>;

/// Request delivered to an entity worker's mailbox.
#[derive(Debug)]
pub(crate) enum EntityMessage {
    /// Acked once the operation is durably queued.
    Signal {
        operation: String,
        input: String,
        caller: Option<EntityCaller>,
        ack: oneshot::Sender<Result<(), ErrorDetails>>,
    },
    /// Replied to once the operation has been applied.
    Call {
        operation: String,
        input: String,
        caller: Option<EntityCaller>,
        reply: oneshot::Sender<OperationOutcome>,
    },
    ReadState {
        reply: oneshot::Sender<Result<Option<String>, ErrorDetails>>,
    },
}

impl EntityMessage {
    fn fail(self, details: ErrorDetails) {
        match self {
            EntityMessage::Signal { ack, .. } => {
                let _ = ack.send(Err(details));
            }
            EntityMessage::Call { reply, .. } => {
                let _ = reply.send(Err(details));
            }
            EntityMessage::ReadState { reply } => {
                let _ = reply.send(Err(details));
            }
        }
    }
}

/// Whether an entity history holds operations that were queued but never applied.
pub(crate) fn has_unprocessed_operations(history: &[Event]) -> bool {
    let mut pending = 0usize;
    for event in history {
        match event {
            Event::EntityOperationQueued { .. } => pending += 1,
            Event::EntityOperationProcessed { .. } => pending = pending.saturating_sub(1),
            _ => {}
        }
    }
    pending > 0
}

fn runtime_stopped() -> ErrorDetails {
    ErrorDetails::Infrastructure {
        operation: "entity_mailbox".into(),
        message: "runtime is shut down".into(),
        retryable: false,
    }
}

impl Runtime {
    /// Mailbox of a live worker for `entity`, spawning one if needed.
    pub(crate) fn entity_mailbox(self: &Arc<Self>, entity: &EntityId) -> Result<mpsc::Sender<EntityMessage>, ErrorDetails> {
        if self.is_shutdown() {
            return Err(runtime_stopped());
        }
        let Some(handler) = self.entity_registry.get(&entity.name) else {
            warn!(target: "duractor::runtime", entity = %entity, "Entity not registered");
            return Err(ErrorDetails::unregistered(ConfigErrorKind::UnregisteredEntity, entity.name.clone()));
        };
        let instance = entity.instance_key();
        let tx = {
            let mut mailboxes = self.entity_mailboxes.lock().expect("Mutex should not be poisoned");
            if let Some(tx) = mailboxes.get(&instance) {
                if !tx.is_closed() {
                    return Ok(tx.clone());
                }
            }
            let (tx, rx) = mpsc::channel(self.options.entity_mailbox_capacity.max(1));
            mailboxes.insert(instance.clone(), tx.clone());
            let worker = EntityWorker::new(self.clone(), entity.clone(), handler);
            self.spawn_tracked(worker.run(rx));
            tx
        };
        debug!(target: "duractor::runtime", entity = %entity, "Entity worker started");
        Ok(tx)
    }

    /// Place `msg` in the entity's mailbox, waiting while it is full.
    pub(crate) async fn send_entity_message(self: &Arc<Self>, entity: &EntityId, msg: EntityMessage) -> Result<(), ErrorDetails> {
        let mut msg = msg;
        for _ in 0..MAILBOX_ATTEMPTS {
            let tx = self.entity_mailbox(entity)?;
            match tx.send(msg).await {
                Ok(()) => return Ok(()),
                // the worker retired between lookup and send
                Err(mpsc::error::SendError(returned)) => msg = returned,
            }
        }
        if self.is_shutdown() {
            return Err(runtime_stopped());
        }
        Err(ErrorDetails::Infrastructure {
            operation: "entity_mailbox".into(),
            message: format!("no worker accepted a message for {entity}"),
            retryable: true,
        })
    }

    async fn entity_request<T>(
        self: &Arc<Self>,
        entity: &EntityId,
        make: impl Fn(oneshot::Sender<Result<T, ErrorDetails>>) -> EntityMessage,
    ) -> Result<T, ErrorDetails> {
        for attempt in 0..MAILBOX_ATTEMPTS {
            let (tx, rx) = oneshot::channel();
            self.send_entity_message(entity, make(tx)).await?;
            match rx.await {
                Ok(result) => return result,
                Err(_) => debug!(target: "duractor::runtime", entity = %entity, attempt, "Entity worker retired before replying; resending"),
            }
        }
        Err(ErrorDetails::Infrastructure {
            operation: "entity_mailbox".into(),
            message: format!("entity {entity} did not reply"),
            retryable: true,
        })
    }

    /// Durably enqueue an operation; returns once it is recorded, not once it ran.
    pub(crate) async fn signal_entity(
        self: &Arc<Self>,
        entity: &EntityId,
        operation: &str,
        input: &str,
        caller: Option<EntityCaller>,
    ) -> Result<(), ErrorDetails> {
        self.entity_request(entity, |ack| EntityMessage::Signal {
            operation: operation.to_string(),
            input: input.to_string(),
            caller: caller.clone(),
            ack,
        })
        .await
    }

    /// Enqueue an operation and wait for its output.
    pub(crate) async fn call_entity(
        self: &Arc<Self>,
        entity: &EntityId,
        operation: &str,
        input: &str,
        caller: Option<EntityCaller>,
    ) -> Result<Option<String>, ErrorDetails> {
        self.entity_request(entity, |reply| EntityMessage::Call {
            operation: operation.to_string(),
            input: input.to_string(),
            caller: caller.clone(),
            reply,
        })
        .await
    }

    /// State after the last applied operation, read in mailbox order.
    pub(crate) async fn read_entity_state(self: &Arc<Self>, entity: &EntityId) -> Result<Option<String>, ErrorDetails> {
        self.entity_request(entity, |reply| EntityMessage::ReadState { reply }).await
    }
}

struct EntityWorker {
    runtime: Arc<Runtime>,
    entity: EntityId,
    instance: String,
    handler: Arc<dyn EntityHandler>,
    state: Option<String>,
    last_event_id: u64,
    /// Recorded outcome per orchestration caller, for redelivered requests
    caller_outcomes: HashMap<EntityCaller, OperationOutcome>,
    /// Set after a delete; the history is purged once the mailbox drains
    purge_pending: bool,
}

impl EntityWorker {
    fn new(runtime: Arc<Runtime>, entity: EntityId, handler: Arc<dyn EntityHandler>) -> Self {
        let instance = entity.instance_key();
        Self {
            runtime,
            entity,
            instance,
            handler,
            state: None,
            last_event_id: 0,
            caller_outcomes: HashMap::new(),
            purge_pending: false,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<EntityMessage>) {
        if let Err(details) = self.recover().await {
            error!(target: "duractor::runtime", entity = %self.entity, error = %details, "Entity recovery failed; worker stopping");
            self.retire(&mut rx, Some(details));
            return;
        }

        let idle_timeout = self.runtime.options.entity_idle_timeout;
        loop {
            let msg = match tokio::time::timeout(idle_timeout, rx.recv()).await {
                Ok(Some(msg)) => msg,
                Ok(None) => return,
                Err(_) => {
                    if self.retire(&mut rx, None) {
                        debug!(target: "duractor::runtime", entity = %self.entity, "Entity worker idle; retired");
                        return;
                    }
                    continue;
                }
            };

            if let Err(details) = self.handle(msg).await {
                error!(target: "duractor::runtime", entity = %self.entity, error = %details, "Entity store failure; worker stopping");
                self.retire(&mut rx, Some(details));
                return;
            }

            if self.purge_pending && rx.is_empty() {
                self.purge().await;
            }
        }
    }

    /// Detach from the mailbox map. Without a failure the worker only retires when its
    /// mailbox is empty; messages that slip in before the close are dropped and their
    /// senders resend to a fresh worker.
    fn retire(&self, rx: &mut mpsc::Receiver<EntityMessage>, failure: Option<ErrorDetails>) -> bool {
        {
            let mut mailboxes = self.runtime.entity_mailboxes.lock().expect("Mutex should not be poisoned");
            if failure.is_none() && !rx.is_empty() {
                return false;
            }
            mailboxes.remove(&self.instance);
            rx.close();
        }
        while let Ok(msg) = rx.try_recv() {
            match &failure {
                Some(details) => msg.fail(details.clone()),
                None => drop(msg),
            }
        }
        true
    }

    /// Rebuild state from the snapshot and history, then apply anything queued but not
    /// yet processed.
    async fn recover(&mut self) -> Result<(), ErrorDetails> {
        let runtime = self.runtime.clone();
        let store = runtime.store.clone();
        let instance = self.instance.clone();

        let history = runtime
            .read_with_retry(&instance)
            .await
            .map_err(|e| e.to_infrastructure_error())?;
        let snapshot = runtime
            .with_store_retry("read snapshot", || async { store.read_snapshot(&instance).await })
            .await
            .map_err(|e| e.to_infrastructure_error())?;

        let last_event_id = history.last().map(|e| e.event_id()).unwrap_or(0);
        let mut state = None;
        let mut seed_through = 0;
        if let Some(snapshot) = snapshot {
            if snapshot.through_event_id <= last_event_id {
                state = snapshot.state;
                seed_through = snapshot.through_event_id;
                self.caller_outcomes
                    .extend(snapshot.callers.into_iter().map(|r| (r.caller, r.result)));
            } else {
                warn!(
                    target: "duractor::runtime",
                    entity = %self.entity,
                    through_event_id = snapshot.through_event_id,
                    last_event_id,
                    "Snapshot is ahead of history; ignoring it"
                );
            }
        }

        let mut queued: BTreeMap<u64, (String, String, Option<EntityCaller>)> = BTreeMap::new();
        for event in &history {
            match event {
                Event::EntityOperationQueued {
                    event_id,
                    operation,
                    input,
                    caller,
                } => {
                    queued.insert(*event_id, (operation.clone(), input.clone(), caller.clone()));
                }
                Event::EntityOperationProcessed {
                    event_id,
                    source_event_id,
                    result,
                    state: after,
                } => {
                    if let Some((_, _, Some(caller))) = queued.remove(source_event_id) {
                        self.caller_outcomes.insert(caller, result.clone());
                    }
                    if *event_id > seed_through {
                        state = after.clone();
                    }
                }
                other => warn!(target: "duractor::runtime", entity = %self.entity, event = %other.describe(), "Unexpected event in entity history"),
            }
        }
        self.state = state;
        self.last_event_id = last_event_id;

        if !queued.is_empty() {
            info!(target: "duractor::runtime", entity = %self.entity, count = queued.len(), "Applying operations queued before restart");
        }
        for (queued_id, (operation, input, caller)) in queued {
            let outcome = self.process(queued_id, &operation, &input, caller.as_ref()).await?;
            if let Err(details) = outcome {
                warn!(target: "duractor::runtime", entity = %self.entity, operation = %operation, error = %details, "Recovered entity operation failed");
            }
        }
        Ok(())
    }

    /// Serve one message. An `Err` means the store failed and the worker must stop.
    async fn handle(&mut self, msg: EntityMessage) -> Result<(), ErrorDetails> {
        match msg {
            EntityMessage::ReadState { reply } => {
                let _ = reply.send(Ok(self.state.clone()));
                Ok(())
            }
            EntityMessage::Signal {
                operation,
                input,
                caller,
                ack,
            } => {
                if let Some(caller) = &caller {
                    if self.caller_outcomes.contains_key(caller) {
                        debug!(target: "duractor::runtime", entity = %self.entity, caller = ?caller, "Duplicate signal ignored");
                        let _ = ack.send(Ok(()));
                        return Ok(());
                    }
                }
                let queued_id = match self.enqueue(&operation, &input, &caller).await {
                    Ok(id) => id,
                    Err(details) => {
                        let _ = ack.send(Err(details.clone()));
                        return Err(details);
                    }
                };
                let _ = ack.send(Ok(()));
                if let Err(details) = self.process(queued_id, &operation, &input, caller.as_ref()).await? {
                    warn!(
                        target: "duractor::runtime",
                        entity = %self.entity,
                        operation = %operation,
                        error = %details,
                        "Signaled entity operation failed"
                    );
                }
                Ok(())
            }
            EntityMessage::Call {
                operation,
                input,
                caller,
                reply,
            } => {
                if let Some(caller) = &caller {
                    if let Some(outcome) = self.caller_outcomes.get(caller) {
                        debug!(target: "duractor::runtime", entity = %self.entity, caller = ?caller, "Duplicate call answered from history");
                        let _ = reply.send(outcome.clone());
                        return Ok(());
                    }
                }
                let queued_id = match self.enqueue(&operation, &input, &caller).await {
                    Ok(id) => id,
                    Err(details) => {
                        let _ = reply.send(Err(details.clone()));
                        return Err(details);
                    }
                };
                match self.process(queued_id, &operation, &input, caller.as_ref()).await {
                    Ok(outcome) => {
                        let _ = reply.send(outcome);
                        Ok(())
                    }
                    Err(details) => {
                        let _ = reply.send(Err(details.clone()));
                        Err(details)
                    }
                }
            }
        }
    }

    async fn enqueue(&mut self, operation: &str, input: &str, caller: &Option<EntityCaller>) -> Result<u64, ErrorDetails> {
        let event = Event::EntityOperationQueued {
            event_id: 0,
            operation: operation.to_string(),
            input: input.to_string(),
            caller: caller.clone(),
        };
        let id = self.append(event).await?;
        debug!(target: "duractor::runtime", entity = %self.entity, operation, event_id = id, "Entity operation queued");
        Ok(id)
    }

    /// Apply a queued operation and record the outcome with the resulting state.
    async fn process(
        &mut self,
        queued_id: u64,
        operation: &str,
        input: &str,
        caller: Option<&EntityCaller>,
    ) -> Result<OperationOutcome, ErrorDetails> {
        let (outcome, state) = self.apply(operation, input);
        let event = Event::EntityOperationProcessed {
            event_id: 0,
            source_event_id: queued_id,
            result: outcome.clone(),
            state: state.clone(),
        };
        let processed_id = self.append(event).await?;
        self.state = state;
        self.purge_pending = operation == DELETE_OPERATION;
        if let Some(caller) = caller {
            self.caller_outcomes.insert(caller.clone(), outcome.clone());
        }
        debug!(
            target: "duractor::runtime",
            entity = %self.entity,
            operation,
            event_id = processed_id,
            success = outcome.is_ok(),
            "Entity operation processed"
        );
        self.write_snapshot().await;
        Ok(outcome)
    }

    /// Run the handler on a copy of the state; the copy is kept only on success.
    fn apply(&self, operation: &str, input: &str) -> (OperationOutcome, Option<String>) {
        if operation == DELETE_OPERATION {
            return (Ok(None), None);
        }
        let mut ctx = EntityContext::new(self.entity.clone(), operation.to_string(), input.to_string(), self.state.clone());
        let handler = self.handler.clone();
        match catch_unwind(AssertUnwindSafe(|| handler.handle(&mut ctx))) {
            Ok(Ok(output)) => (Ok(output), ctx.into_state()),
            Ok(Err(message)) => (
                Err(ErrorDetails::application(AppErrorKind::EntityOperationFailed, message)),
                self.state.clone(),
            ),
            Err(payload) => (
                Err(ErrorDetails::application(AppErrorKind::Panicked, panic_message(payload.as_ref()))),
                self.state.clone(),
            ),
        }
    }

    async fn append(&mut self, event: Event) -> Result<u64, ErrorDetails> {
        let last = self
            .runtime
            .append_with_retry(&self.instance, vec![event])
            .await
            .map_err(|e| e.to_infrastructure_error())?;
        self.last_event_id = last;
        Ok(last)
    }

    /// A failed write is logged and skipped; history still holds every outcome.
    async fn write_snapshot(&self) {
        let mut callers: Vec<CallerRecord> = self
            .caller_outcomes
            .iter()
            .map(|(caller, result)| CallerRecord {
                caller: caller.clone(),
                result: result.clone(),
            })
            .collect();
        callers.sort_by(|a, b| {
            (&a.caller.instance, a.caller.source_event_id).cmp(&(&b.caller.instance, b.caller.source_event_id))
        });
        let snapshot = Snapshot {
            state: self.state.clone(),
            through_event_id: self.last_event_id,
            callers,
        };
        if let Err(e) = self.runtime.store.write_snapshot(&self.instance, snapshot).await {
            warn!(target: "duractor::runtime", entity = %self.entity, error = %e, "Snapshot write failed");
        }
    }

    async fn purge(&mut self) {
        let runtime = self.runtime.clone();
        let store = runtime.store.clone();
        let instance = self.instance.clone();
        match runtime
            .with_store_retry("purge entity", || async { store.delete(&instance).await })
            .await
        {
            Ok(()) => {
                info!(target: "duractor::runtime", entity = %self.entity, "Deleted entity purged");
                self.state = None;
                self.last_event_id = 0;
                // callers outlive the purge so their redeliveries stay answered
                if !self.caller_outcomes.is_empty() {
                    self.write_snapshot().await;
                }
            }
            Err(e) => warn!(target: "duractor::runtime", entity = %self.entity, error = %e, "Purge failed; history kept"),
        }
        self.purge_pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::Provider;
    use crate::providers::in_memory::InMemoryProvider;
    use crate::runtime::{ActivityRegistry, EntityRegistry, OrchestrationRegistry};

    fn counters() -> EntityRegistry {
        EntityRegistry::builder()
            .register_typed::<i64, _>("counter", |count, op, input| match op {
                "add" => {
                    *count += input.parse::<i64>().map_err(|e| e.to_string())?;
                    Ok(None)
                }
                "get" => Ok(Some(count.to_string())),
                "boom" => panic!("counter exploded"),
                other => Err(format!("unknown operation {other}")),
            })
            .build()
    }

    async fn runtime(store: Arc<InMemoryProvider>) -> Arc<Runtime> {
        Runtime::start_with_store(
            store,
            ActivityRegistry::builder().build(),
            OrchestrationRegistry::builder().build(),
            counters(),
        )
        .await
    }

    #[test]
    fn context_state_helpers() {
        let mut ctx = EntityContext::new(EntityId::new("counter", "k"), "add".into(), "2".into(), None);
        assert!(!ctx.has_state());
        assert_eq!(ctx.state_typed::<i64>().unwrap(), 0);
        assert_eq!(ctx.input_typed::<i64>().unwrap(), 2);
        ctx.set_state_typed(&7i64).unwrap();
        assert_eq!(ctx.state(), Some("7"));
        ctx.delete_state();
        assert_eq!(ctx.into_state(), None);
    }

    #[test]
    fn unprocessed_operations_are_detected() {
        let queued = |id| Event::EntityOperationQueued {
            event_id: id,
            operation: "add".into(),
            input: "1".into(),
            caller: None,
        };
        let processed = Event::EntityOperationProcessed {
            event_id: 2,
            source_event_id: 1,
            result: Ok(None),
            state: Some("1".into()),
        };
        assert!(!has_unprocessed_operations(&[]));
        assert!(has_unprocessed_operations(&[queued(1)]));
        assert!(!has_unprocessed_operations(&[queued(1), processed.clone()]));
        assert!(has_unprocessed_operations(&[queued(1), processed, queued(3)]));
    }

    #[tokio::test]
    async fn operations_apply_in_order_and_record_state() {
        let store = Arc::new(InMemoryProvider::new());
        let rt = runtime(store.clone()).await;
        let id = EntityId::new("counter", "a");

        rt.signal_entity(&id, "add", "5", None).await.unwrap();
        rt.signal_entity(&id, "add", "-2", None).await.unwrap();
        assert_eq!(rt.call_entity(&id, "get", "", None).await.unwrap(), Some("3".into()));
        assert_eq!(rt.read_entity_state(&id).await.unwrap(), Some("3".into()));

        let history = store.read(&id.instance_key()).await.unwrap();
        assert_eq!(history.len(), 6);
        let snapshot = store.read_snapshot(&id.instance_key()).await.unwrap().unwrap();
        assert_eq!(snapshot.state.as_deref(), Some("3"));
        assert_eq!(snapshot.through_event_id, 6);
        rt.shutdown().await;
    }

    #[tokio::test]
    async fn failed_and_panicking_operations_keep_state() {
        let rt = runtime(Arc::new(InMemoryProvider::new())).await;
        let id = EntityId::new("counter", "b");
        rt.signal_entity(&id, "add", "4", None).await.unwrap();

        let err = rt.call_entity(&id, "add", "not a number", None).await.unwrap_err();
        assert!(matches!(
            err,
            ErrorDetails::Application {
                kind: AppErrorKind::EntityOperationFailed,
                ..
            }
        ));
        let err = rt.call_entity(&id, "boom", "", None).await.unwrap_err();
        assert_eq!(err.display_message(), "panicked: counter exploded");

        assert_eq!(rt.call_entity(&id, "get", "", None).await.unwrap(), Some("4".into()));
        rt.shutdown().await;
    }

    #[tokio::test]
    async fn redelivered_caller_is_answered_from_history() {
        let store = Arc::new(InMemoryProvider::new());
        let rt = runtime(store.clone()).await;
        let id = EntityId::new("counter", "c");
        let caller = EntityCaller {
            instance: "orch".into(),
            source_event_id: 4,
        };

        rt.call_entity(&id, "add", "1", Some(caller.clone())).await.unwrap();
        rt.call_entity(&id, "add", "1", Some(caller.clone())).await.unwrap();
        rt.signal_entity(&id, "add", "1", Some(caller)).await.unwrap();

        assert_eq!(rt.read_entity_state(&id).await.unwrap(), Some("1".into()));
        assert_eq!(store.read(&id.instance_key()).await.unwrap().len(), 2);
        rt.shutdown().await;
    }

    #[tokio::test]
    async fn delete_purges_and_resets() {
        let store = Arc::new(InMemoryProvider::new());
        let rt = runtime(store.clone()).await;
        let id = EntityId::new("counter", "d");
        rt.signal_entity(&id, "add", "9", None).await.unwrap();
        rt.call_entity(&id, DELETE_OPERATION, "", None).await.unwrap();
        assert_eq!(rt.read_entity_state(&id).await.unwrap(), None);
        // the purge runs once the mailbox is drained
        let mut purged = false;
        for _ in 0..100 {
            if store.read(&id.instance_key()).await.unwrap().is_empty() {
                purged = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(purged);

        assert_eq!(rt.call_entity(&id, "get", "", None).await.unwrap(), Some("0".into()));
        rt.shutdown().await;
    }

    #[tokio::test]
    async fn callers_are_remembered_across_delete_and_restart() {
        let store = Arc::new(InMemoryProvider::new());
        let rt = runtime(store.clone()).await;
        let id = EntityId::new("counter", "f");
        let key = id.instance_key();
        let caller = EntityCaller {
            instance: "orch".into(),
            source_event_id: 2,
        };

        rt.signal_entity(&id, "add", "5", Some(caller.clone())).await.unwrap();
        rt.call_entity(&id, DELETE_OPERATION, "", None).await.unwrap();
        let mut purged = false;
        for _ in 0..100 {
            if store.read(&key).await.unwrap().is_empty() {
                purged = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(purged);

        let tombstone = store.read_snapshot(&key).await.unwrap().unwrap();
        assert_eq!(tombstone.state, None);
        assert_eq!(tombstone.through_event_id, 0);
        assert_eq!(tombstone.callers.len(), 1);
        assert_eq!(tombstone.callers[0].caller, caller);

        // redelivery to the live worker, then to a fresh one after restart
        rt.signal_entity(&id, "add", "5", Some(caller.clone())).await.unwrap();
        assert_eq!(rt.read_entity_state(&id).await.unwrap(), None);
        rt.shutdown().await;

        let rt = runtime(store.clone()).await;
        rt.signal_entity(&id, "add", "5", Some(caller)).await.unwrap();
        assert_eq!(rt.read_entity_state(&id).await.unwrap(), None);
        assert!(store.read(&key).await.unwrap().is_empty());
        rt.shutdown().await;
    }

    #[tokio::test]
    async fn queued_operations_finish_after_restart() {
        let store = Arc::new(InMemoryProvider::new());
        let id = EntityId::new("counter", "e");
        let key = id.instance_key();
        store
            .append(
                &key,
                vec![
                    Event::EntityOperationQueued {
                        event_id: 0,
                        operation: "add".into(),
                        input: "2".into(),
                        caller: None,
                    },
                    Event::EntityOperationProcessed {
                        event_id: 0,
                        source_event_id: 1,
                        result: Ok(None),
                        state: Some("2".into()),
                    },
                    Event::EntityOperationQueued {
                        event_id: 0,
                        operation: "add".into(),
                        input: "3".into(),
                        caller: None,
                    },
                ],
            )
            .await
            .unwrap();

        let rt = runtime(store.clone()).await;
        assert_eq!(rt.call_entity(&id, "get", "", None).await.unwrap(), Some("5".into()));
        rt.shutdown().await;
    }

    #[tokio::test]
    async fn unregistered_entity_is_a_configuration_error() {
        let rt = runtime(Arc::new(InMemoryProvider::new())).await;
        let err = rt
            .call_entity(&EntityId::new("missing", "x"), "get", "", None)
            .await
            .unwrap_err();
        assert_eq!(err.display_message(), "unregistered entity: missing");
        rt.shutdown().await;
    }
}
