use std::collections::HashSet;

use super::OrchestrationStatus;
use crate::{Action, ErrorDetails, Event};

/// Metadata derived from an orchestration history in a single scan.
#[derive(Debug, Clone, Default)]
pub struct HistoryManager {
    /// Orchestration name (from OrchestrationStarted)
    pub orchestration_name: Option<String>,
    /// Original input (from OrchestrationStarted)
    pub orchestration_input: Option<String>,
    pub output: Option<String>,
    pub failure: Option<ErrorDetails>,
    /// Reason from the first OrchestrationCancelRequested, if any
    pub cancel_reason: Option<String>,
    /// Scheduling events that already have a completion
    completed_sources: HashSet<u64>,
    last_event_id: u64,
}

impl HistoryManager {
    pub fn from_history(history: &[Event]) -> Self {
        let mut m = Self::default();
        for event in history {
            match event {
                Event::OrchestrationStarted { name, input, .. } => {
                    m.orchestration_name = Some(name.clone());
                    m.orchestration_input = Some(input.clone());
                }
                Event::OrchestrationCompleted { output, .. } => m.output = Some(output.clone()),
                Event::OrchestrationFailed { details, .. } => m.failure = Some(details.clone()),
                Event::OrchestrationCancelRequested { reason, .. } => {
                    if m.cancel_reason.is_none() {
                        m.cancel_reason = Some(reason.clone());
                    }
                }
                other => {
                    if let Some(source) = other.source_event_id() {
                        m.completed_sources.insert(source);
                    }
                }
            }
            m.last_event_id = event.event_id();
        }
        m
    }

    pub fn is_started(&self) -> bool {
        self.orchestration_name.is_some()
    }

    pub fn is_terminal(&self) -> bool {
        self.output.is_some() || self.failure.is_some()
    }

    pub fn last_event_id(&self) -> u64 {
        self.last_event_id
    }

    pub fn has_completion_for(&self, scheduling_event_id: u64) -> bool {
        self.completed_sources.contains(&scheduling_event_id)
    }

    pub fn status(&self) -> OrchestrationStatus {
        if !self.is_started() {
            OrchestrationStatus::NotFound
        } else if let Some(output) = &self.output {
            OrchestrationStatus::Completed { output: output.clone() }
        } else if let Some(details) = &self.failure {
            OrchestrationStatus::Failed {
                details: details.clone(),
            }
        } else {
            OrchestrationStatus::Running
        }
    }

    /// Work that was scheduled but never completed, as the actions that would dispatch it
    /// again. Signals are included; entities deduplicate them by caller.
    pub fn outstanding_actions(&self, history: &[Event]) -> Vec<Action> {
        history
            .iter()
            .filter(|e| !self.has_completion_for(e.event_id()))
            .filter_map(|e| match e {
                Event::ActivityScheduled { event_id, name, input } => Some(Action::CallActivity {
                    scheduling_event_id: *event_id,
                    name: name.clone(),
                    input: input.clone(),
                }),
                Event::TimerCreated { event_id, fire_at_ms } => Some(Action::CreateTimer {
                    scheduling_event_id: *event_id,
                    fire_at_ms: *fire_at_ms,
                }),
                Event::EntityCallScheduled {
                    event_id,
                    entity,
                    operation,
                    input,
                } => Some(Action::CallEntity {
                    scheduling_event_id: *event_id,
                    entity: entity.clone(),
                    operation: operation.clone(),
                    input: input.clone(),
                }),
                Event::EntitySignalSent {
                    event_id,
                    entity,
                    operation,
                    input,
                } => Some(Action::SignalEntity {
                    scheduling_event_id: *event_id,
                    entity: entity.clone(),
                    operation: operation.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AppErrorKind, EntityId};

    fn running_history() -> Vec<Event> {
        vec![
            Event::OrchestrationStarted {
                event_id: 1,
                name: "O".into(),
                input: "in".into(),
            },
            Event::ActivityScheduled {
                event_id: 2,
                name: "A".into(),
                input: "x".into(),
            },
            Event::TimerCreated {
                event_id: 3,
                fire_at_ms: 99,
            },
            Event::EntityCallScheduled {
                event_id: 4,
                entity: EntityId::new("counter", "k"),
                operation: "get".into(),
                input: String::new(),
            },
            Event::ActivityCompleted {
                event_id: 5,
                source_event_id: 2,
                result: "ok".into(),
            },
        ]
    }

    #[test]
    fn status_follows_history() {
        assert_eq!(HistoryManager::from_history(&[]).status(), OrchestrationStatus::NotFound);

        let mut h = running_history();
        let m = HistoryManager::from_history(&h);
        assert_eq!(m.status(), OrchestrationStatus::Running);
        assert_eq!(m.orchestration_name.as_deref(), Some("O"));
        assert_eq!(m.last_event_id(), 5);

        h.push(Event::OrchestrationFailed {
            event_id: 6,
            details: ErrorDetails::application(AppErrorKind::OrchestrationFailed, "no"),
        });
        let m = HistoryManager::from_history(&h);
        assert!(m.is_terminal());
        assert!(matches!(m.status(), OrchestrationStatus::Failed { .. }));
    }

    #[test]
    fn outstanding_work_skips_completed() {
        let h = running_history();
        let m = HistoryManager::from_history(&h);
        let ids: Vec<u64> = m
            .outstanding_actions(&h)
            .iter()
            .map(|a| match a {
                Action::CallActivity {
                    scheduling_event_id, ..
                }
                | Action::CreateTimer {
                    scheduling_event_id, ..
                }
                | Action::CallEntity {
                    scheduling_event_id, ..
                }
                | Action::SignalEntity {
                    scheduling_event_id, ..
                } => *scheduling_event_id,
            })
            .collect();
        assert_eq!(ids, vec![3, 4]);
    }
}
