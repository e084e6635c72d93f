//! Orchestration instance workers.
//!
//! A worker owns one instance: it is the only appender of its history, runs one turn per
//! batch of inbox messages, persists the turn's events and only then dispatches the work
//! the turn decided on.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::activity::now_ms;
use super::replay_engine::{ReplayEngine, TurnResult};
use super::timers::TimerRequest;
use super::{EntityMessage, HistoryManager, OrchestratorMsg, Runtime};
use crate::{Action, AppErrorKind, ConfigErrorKind, EntityCaller, ErrorDetails, Event};

impl Runtime {
    /// Route a message to the instance's worker, starting one if none is live.
    pub(crate) fn deliver(self: &Arc<Self>, msg: OrchestratorMsg) {
        if self.is_shutdown() {
            debug!(target: "duractor::runtime", instance_id = %msg.instance(), kind = msg.kind(), "Runtime stopped; message dropped");
            return;
        }
        let instance = msg.instance().to_string();
        let mut inboxes = self.orchestration_inboxes.lock().expect("Mutex should not be poisoned");
        let msg = match inboxes.get(&instance) {
            Some(tx) => match tx.send(msg) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => returned,
            },
            None => msg,
        };
        let tx = self.spawn_orchestration_worker(&instance, &mut inboxes);
        if tx.send(msg).is_err() {
            warn!(target: "duractor::runtime", instance_id = %instance, "Orchestration worker unavailable; message dropped");
        }
    }

    /// Make sure a worker is attached to `instance`.
    pub(crate) fn ensure_orchestration_worker(self: &Arc<Self>, instance: &str) {
        if self.is_shutdown() {
            return;
        }
        let mut inboxes = self.orchestration_inboxes.lock().expect("Mutex should not be poisoned");
        if inboxes.get(instance).is_some_and(|tx| !tx.is_closed()) {
            return;
        }
        self.spawn_orchestration_worker(instance, &mut inboxes);
    }

    fn spawn_orchestration_worker(
        self: &Arc<Self>,
        instance: &str,
        inboxes: &mut std::collections::HashMap<String, mpsc::UnboundedSender<OrchestratorMsg>>,
    ) -> mpsc::UnboundedSender<OrchestratorMsg> {
        let (tx, rx) = mpsc::unbounded_channel();
        inboxes.insert(instance.to_string(), tx.clone());
        let runtime = self.clone();
        let instance = instance.to_string();
        debug!(target: "duractor::runtime", instance_id = %instance, "Orchestration worker started");
        self.spawn_tracked(async move { runtime.run_orchestration_worker(instance, rx).await });
        tx
    }

    /// Detach the worker from its inbox. Messages still buffered are dropped; completions for
    /// a finished instance have nowhere to go.
    fn retire_orchestration_worker(&self, instance: &str, rx: &mut mpsc::UnboundedReceiver<OrchestratorMsg>) {
        {
            let mut inboxes = self.orchestration_inboxes.lock().expect("Mutex should not be poisoned");
            inboxes.remove(instance);
            rx.close();
        }
        while let Ok(msg) = rx.try_recv() {
            debug!(target: "duractor::runtime", instance_id = %instance, kind = msg.kind(), "Dropping message for retired worker");
        }
    }

    async fn run_orchestration_worker(self: Arc<Self>, instance: String, mut rx: mpsc::UnboundedReceiver<OrchestratorMsg>) {
        let mut history = match self.read_with_retry(&instance).await {
            Ok(h) => h,
            Err(e) => {
                error!(target: "duractor::runtime", instance_id = %instance, error = %e, "Cannot load history; worker stopping");
                self.retire_orchestration_worker(&instance, &mut rx);
                return;
            }
        };
        let meta = HistoryManager::from_history(&history);
        let (Some(name), Some(input)) = (meta.orchestration_name.clone(), meta.orchestration_input.clone()) else {
            warn!(target: "duractor::runtime", instance_id = %instance, "No such orchestration instance");
            self.retire_orchestration_worker(&instance, &mut rx);
            return;
        };
        if meta.is_terminal() {
            debug!(target: "duractor::runtime", instance_id = %instance, "Instance already finished");
            self.retire_orchestration_worker(&instance, &mut rx);
            return;
        }

        // work scheduled by an earlier process that never reported back
        let outstanding = meta.outstanding_actions(&history);
        if !outstanding.is_empty() {
            info!(target: "duractor::runtime", instance_id = %instance, count = outstanding.len(), "Re-dispatching outstanding work");
            self.dispatch_actions(&instance, outstanding).await;
        }

        let handler = self.orchestration_registry.get(&name);
        let mut pending: Vec<OrchestratorMsg> = Vec::new();
        let mut turn_index: u64 = 0;
        loop {
            let mut engine = ReplayEngine::new(instance.clone(), history.clone()).with_turn_index(turn_index);
            engine.prep_completions(std::mem::take(&mut pending));

            // nothing new to react to: skip the replay and wait
            if turn_index == 0 || engine.made_progress() {
                let result = match &handler {
                    Some(handler) => engine.execute_orchestration(handler.clone(), input.clone(), now_ms()),
                    None => TurnResult::Failed(ErrorDetails::unregistered(ConfigErrorKind::UnregisteredOrchestration, name.clone())),
                };

                let mut delta = engine.history_delta().to_vec();
                let terminal = match &result {
                    TurnResult::Continue => None,
                    TurnResult::Completed(output) => Some(Event::OrchestrationCompleted {
                        event_id: engine.next_event_id(),
                        output: output.clone(),
                    }),
                    TurnResult::Failed(details) => Some(Event::OrchestrationFailed {
                        event_id: engine.next_event_id(),
                        details: details.clone(),
                    }),
                    TurnResult::Cancelled(reason) => Some(Event::OrchestrationFailed {
                        event_id: engine.next_event_id(),
                        details: ErrorDetails::application(AppErrorKind::Cancelled, reason.clone()),
                    }),
                };
                let is_terminal = terminal.is_some();
                delta.extend(terminal);

                if !delta.is_empty() {
                    if let Err(e) = self.append_with_retry(&instance, delta.clone()).await {
                        error!(
                            target: "duractor::runtime",
                            instance_id = %instance,
                            turn_idx = turn_index,
                            error = %e,
                            "Failed to persist turn; worker stopping"
                        );
                        self.retire_orchestration_worker(&instance, &mut rx);
                        return;
                    }
                    history.extend(delta);
                }

                self.dispatch_actions(&instance, engine.pending_actions().to_vec()).await;

                match &result {
                    TurnResult::Continue => {
                        debug!(target: "duractor::runtime", instance_id = %instance, turn_idx = turn_index, "Orchestration waiting")
                    }
                    TurnResult::Completed(_) => {
                        info!(target: "duractor::runtime", instance_id = %instance, orchestration_name = %name, "Orchestration completed")
                    }
                    TurnResult::Failed(details) => warn!(
                        target: "duractor::runtime",
                        instance_id = %instance,
                        orchestration_name = %name,
                        category = details.category(),
                        error = %details,
                        "Orchestration failed"
                    ),
                    TurnResult::Cancelled(reason) => {
                        info!(target: "duractor::runtime", instance_id = %instance, reason = %reason, "Orchestration cancelled")
                    }
                }
                if is_terminal {
                    self.retire_orchestration_worker(&instance, &mut rx);
                    return;
                }
                turn_index += 1;
            }

            match rx.recv().await {
                Some(msg) => pending.push(msg),
                None => return,
            }
            while let Ok(msg) = rx.try_recv() {
                pending.push(msg);
            }
        }
    }

    /// Dispatch persisted decisions. Entity messages are placed in their mailboxes here, in
    /// scheduling order, so one orchestration's operations reach an entity in that order.
    async fn dispatch_actions(self: &Arc<Self>, instance: &str, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::CallActivity {
                    scheduling_event_id,
                    name,
                    input,
                } => {
                    let runtime = self.clone();
                    let instance = instance.to_string();
                    self.spawn_tracked(async move {
                        let ctx = super::ActivityContext::new(instance.clone(), scheduling_event_id, name);
                        let msg = match runtime.activity_executor.execute(ctx, input).await {
                            Ok(result) => OrchestratorMsg::ActivityCompleted {
                                instance,
                                id: scheduling_event_id,
                                result,
                            },
                            Err(details) => OrchestratorMsg::ActivityFailed {
                                instance,
                                id: scheduling_event_id,
                                details,
                            },
                        };
                        runtime.deliver(msg);
                    });
                }
                Action::CreateTimer {
                    scheduling_event_id,
                    fire_at_ms,
                } => {
                    let request = TimerRequest {
                        fire_at_ms,
                        instance: instance.to_string(),
                        scheduling_event_id,
                    };
                    if self.timer_tx.send(request).is_err() {
                        warn!(target: "duractor::runtime", instance_id = %instance, event_id = scheduling_event_id, "Timer service stopped; timer not scheduled");
                    }
                }
                Action::CallEntity {
                    scheduling_event_id,
                    entity,
                    operation,
                    input,
                } => {
                    let caller = EntityCaller {
                        instance: instance.to_string(),
                        source_event_id: scheduling_event_id,
                    };
                    let (reply_tx, reply_rx) = oneshot::channel();
                    let sent = self
                        .send_entity_message(
                            &entity,
                            EntityMessage::Call {
                                operation: operation.clone(),
                                input: input.clone(),
                                caller: Some(caller.clone()),
                                reply: reply_tx,
                            },
                        )
                        .await;
                    let runtime = self.clone();
                    let instance = instance.to_string();
                    self.spawn_tracked(async move {
                        let outcome = match sent {
                            Err(details) => Err(details),
                            Ok(()) => match reply_rx.await {
                                Ok(outcome) => outcome,
                                // the worker retired first; the caller reference makes a resend safe
                                Err(_) => runtime.call_entity(&entity, &operation, &input, Some(caller)).await,
                            },
                        };
                        let msg = match outcome {
                            Ok(result) => OrchestratorMsg::EntityCallCompleted {
                                instance,
                                id: scheduling_event_id,
                                result,
                            },
                            Err(details @ ErrorDetails::Infrastructure { .. }) => {
                                error!(
                                    target: "duractor::runtime",
                                    instance_id = %instance,
                                    entity = %entity,
                                    event_id = scheduling_event_id,
                                    error = %details,
                                    "Entity call not delivered; it is re-sent when the instance resumes"
                                );
                                return;
                            }
                            Err(details) => OrchestratorMsg::EntityCallFailed {
                                instance,
                                id: scheduling_event_id,
                                details,
                            },
                        };
                        runtime.deliver(msg);
                    });
                }
                Action::SignalEntity {
                    scheduling_event_id,
                    entity,
                    operation,
                    input,
                } => {
                    let caller = EntityCaller {
                        instance: instance.to_string(),
                        source_event_id: scheduling_event_id,
                    };
                    if let Err(details) = self.signal_entity(&entity, &operation, &input, Some(caller)).await {
                        warn!(
                            target: "duractor::runtime",
                            instance_id = %instance,
                            entity = %entity,
                            operation = %operation,
                            error = %details,
                            "Entity signal not delivered"
                        );
                    }
                }
            }
        }
    }
}
