use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use tracing::{debug, warn};

use super::{OrchestrationHandler, OrchestratorMsg, panic_message};
use crate::{Action, AppErrorKind, ErrorDetails, Event, OrchestrationContext};

/// Result of executing an orchestration turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnResult {
    /// Turn completed successfully, orchestration continues
    Continue,
    /// Orchestration completed with output
    Completed(String),
    /// Orchestration failed with error details
    Failed(ErrorDetails),
    /// Cancellation was requested; the orchestration code did not run
    Cancelled(String),
}

/// Replays history and executes one deterministic orchestration evaluation
pub struct ReplayEngine {
    instance: String,
    /// History events generated during this run
    history_delta: Vec<Event>,
    /// Actions to dispatch after persistence
    pending_actions: Vec<Action>,
    /// Current history at start of run
    baseline_history: Vec<Event>,
    /// Next event_id for new events added this run
    next_event_id: u64,
    /// System-level error found while preparing completions; aborts the turn
    abort_error: Option<ErrorDetails>,
    turn_index: u64,
}

impl ReplayEngine {
    pub fn new(instance: impl Into<String>, baseline_history: Vec<Event>) -> Self {
        let next_event_id = baseline_history.last().map(|e| e.event_id() + 1).unwrap_or(1);
        Self {
            instance: instance.into(),
            history_delta: Vec::new(),
            pending_actions: Vec::new(),
            baseline_history,
            next_event_id,
            abort_error: None,
            turn_index: 0,
        }
    }

    pub fn with_turn_index(mut self, turn_index: u64) -> Self {
        self.turn_index = turn_index;
        self
    }

    /// Stage 1: convert completion messages into history events.
    ///
    /// Duplicates of completions already recorded are dropped. A completion whose
    /// scheduling event is missing or of another kind means the history and the code
    /// disagree, and aborts the turn.
    pub fn prep_completions(&mut self, messages: Vec<OrchestratorMsg>) {
        debug!(
            target: "duractor::runtime",
            instance_id = %self.instance,
            message_count = messages.len(),
            "converting messages to events"
        );

        for msg in messages {
            if msg.instance() != self.instance {
                warn!(target: "duractor::runtime", instance_id = %self.instance, other = %msg.instance(), "ignoring message for another instance");
                continue;
            }

            if let OrchestratorMsg::CancelRequested { reason, .. } = msg {
                let already = self
                    .working_history()
                    .any(|e| matches!(e, Event::OrchestrationCancelRequested { .. }));
                if already {
                    debug!(target: "duractor::runtime", instance_id = %self.instance, "cancellation already recorded");
                } else {
                    self.push_event(Event::OrchestrationCancelRequested { event_id: 0, reason });
                }
                continue;
            }

            let (source_id, kind) = match &msg {
                OrchestratorMsg::ActivityCompleted { id, .. } | OrchestratorMsg::ActivityFailed { id, .. } => {
                    (*id, "activity")
                }
                OrchestratorMsg::TimerFired { id, .. } => (*id, "timer"),
                OrchestratorMsg::EntityCallCompleted { id, .. } | OrchestratorMsg::EntityCallFailed { id, .. } => {
                    (*id, "entity call")
                }
                OrchestratorMsg::CancelRequested { .. } => continue,
            };

            if self.working_history().any(|e| e.source_event_id() == Some(source_id)) {
                warn!(
                    target: "duractor::runtime",
                    instance_id = %self.instance,
                    source_event_id = source_id,
                    kind = msg.kind(),
                    "ignoring duplicate completion"
                );
                continue;
            }

            let scheduled = self.working_history().find(|e| e.event_id() == source_id).cloned();
            let kind_matches = matches!(
                (&scheduled, kind),
                (Some(Event::ActivityScheduled { .. }), "activity")
                    | (Some(Event::TimerCreated { .. }), "timer")
                    | (Some(Event::EntityCallScheduled { .. }), "entity call")
            );
            if !kind_matches {
                let found = scheduled.map(|e| e.describe()).unwrap_or_else(|| "nothing".to_string());
                warn!(
                    target: "duractor::runtime",
                    instance_id = %self.instance,
                    source_event_id = source_id,
                    kind,
                    found = %found,
                    "completion does not match its scheduling event"
                );
                if self.abort_error.is_none() {
                    self.abort_error = Some(ErrorDetails::nondeterminism(format!(
                        "{kind} completion for event_id {source_id} but history has {found}"
                    )));
                }
                continue;
            }

            let event = match msg {
                OrchestratorMsg::ActivityCompleted { result, .. } => Event::ActivityCompleted {
                    event_id: 0,
                    source_event_id: source_id,
                    result,
                },
                OrchestratorMsg::ActivityFailed { details, .. } => {
                    if let ErrorDetails::Configuration { .. } = &details {
                        // an unregistered activity fails the whole instance, not just the call
                        if self.abort_error.is_none() {
                            self.abort_error = Some(details.clone());
                        }
                    }
                    Event::ActivityFailed {
                        event_id: 0,
                        source_event_id: source_id,
                        details,
                    }
                }
                OrchestratorMsg::TimerFired { fire_at_ms, .. } => Event::TimerFired {
                    event_id: 0,
                    source_event_id: source_id,
                    fire_at_ms,
                },
                OrchestratorMsg::EntityCallCompleted { result, .. } => Event::EntityCallCompleted {
                    event_id: 0,
                    source_event_id: source_id,
                    result,
                },
                OrchestratorMsg::EntityCallFailed { details, .. } => {
                    if let ErrorDetails::Configuration { .. } = &details {
                        if self.abort_error.is_none() {
                            self.abort_error = Some(details.clone());
                        }
                    }
                    Event::EntityCallFailed {
                        event_id: 0,
                        source_event_id: source_id,
                        details,
                    }
                }
                OrchestratorMsg::CancelRequested { .. } => continue,
            };
            self.push_event(event);
        }
    }

    /// Stage 2: run the orchestration once over baseline plus prepared completions.
    pub fn execute_orchestration(
        &mut self,
        handler: Arc<dyn OrchestrationHandler>,
        input: String,
        turn_started_ms: u64,
    ) -> TurnResult {
        if let Some(err) = self.abort_error.clone() {
            return TurnResult::Failed(err);
        }

        if let Some(reason) = self.working_history().find_map(|e| match e {
            Event::OrchestrationCancelRequested { reason, .. } => Some(reason.clone()),
            _ => None,
        }) {
            return TurnResult::Cancelled(reason);
        }

        let working_history: Vec<Event> = self.working_history().cloned().collect();
        let ctx = OrchestrationContext::new(self.instance.clone(), working_history, turn_started_ms, self.turn_index);

        let poll_ctx = ctx.clone();
        let run_result = catch_unwind(AssertUnwindSafe(move || {
            let mut fut = handler.invoke(poll_ctx, input);
            let mut cx = Context::from_waker(Waker::noop());
            fut.as_mut().poll(&mut cx)
        }));

        let poll = match run_result {
            Ok(poll) => poll,
            Err(panic_payload) => {
                let msg = panic_message(panic_payload.as_ref());
                warn!(target: "duractor::runtime", instance_id = %self.instance, panic = %msg, "orchestration panicked");
                return TurnResult::Failed(ErrorDetails::application(AppErrorKind::Panicked, msg));
            }
        };

        // If futures flagged nondeterminism (scheduling-order mismatch), fail gracefully
        if let Some(err) = ctx.nondeterminism_error() {
            return TurnResult::Failed(ErrorDetails::nondeterminism(err));
        }

        let unclaimed = ctx.unclaimed_baseline_events();
        if let Some(first) = unclaimed.first() {
            return TurnResult::Failed(ErrorDetails::nondeterminism(format!(
                "history has {} at event_id {} that this code never schedules",
                first.describe(),
                first.event_id()
            )));
        }

        let new_events = ctx.new_events();
        if let Some(last) = new_events.last() {
            self.next_event_id = last.event_id() + 1;
        }
        self.history_delta.extend(new_events);
        self.pending_actions = ctx.take_actions();

        match poll {
            Poll::Pending => TurnResult::Continue,
            Poll::Ready(Ok(output)) => TurnResult::Completed(output),
            Poll::Ready(Err(message)) => {
                TurnResult::Failed(ErrorDetails::application(AppErrorKind::OrchestrationFailed, message))
            }
        }
    }

    /// New events produced by this run, completions first.
    pub fn history_delta(&self) -> &[Event] {
        &self.history_delta
    }

    pub fn pending_actions(&self) -> &[Action] {
        &self.pending_actions
    }

    /// Id the next appended event must carry.
    pub fn next_event_id(&self) -> u64 {
        self.next_event_id
    }

    /// Whether this run recorded anything beyond the baseline.
    pub fn made_progress(&self) -> bool {
        !self.history_delta.is_empty() || self.abort_error.is_some()
    }

    pub fn final_history(&self) -> Vec<Event> {
        self.working_history().cloned().collect()
    }

    fn working_history(&self) -> impl Iterator<Item = &Event> {
        self.baseline_history.iter().chain(self.history_delta.iter())
    }

    fn push_event(&mut self, mut event: Event) {
        event.set_event_id(self.next_event_id);
        self.next_event_id += 1;
        self.history_delta.push(event);
    }
}
