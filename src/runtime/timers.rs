use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::time::Duration;

use tokio::sync::mpsc;

use super::activity::now_ms;

/// A durable timer waiting to fire for one orchestration instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerRequest {
    pub fire_at_ms: u64,
    pub instance: String,
    pub scheduling_event_id: u64,
}

/// In-process timer service.
///
/// Keeps a min-heap of pending timers and emits each one on the fired channel once its
/// `fire_at_ms` has passed. Timers are volatile here; after a restart the runtime schedules
/// them again from `TimerCreated` events without a matching `TimerFired`.
pub struct TimerService {
    rx: mpsc::UnboundedReceiver<TimerRequest>,
    fired: mpsc::UnboundedSender<TimerRequest>,
    keys: HashSet<(String, u64)>,
    min_heap: BinaryHeap<Reverse<TimerRequest>>,
}

impl TimerService {
    /// Spawn the service; returns its task handle and the scheduling sender.
    pub fn start(
        fired: mpsc::UnboundedSender<TimerRequest>,
    ) -> (tokio::task::JoinHandle<()>, mpsc::UnboundedSender<TimerRequest>) {
        let (tx, rx) = mpsc::unbounded_channel::<TimerRequest>();
        let mut svc = TimerService {
            rx,
            fired,
            keys: HashSet::new(),
            min_heap: BinaryHeap::new(),
        };
        let handle = tokio::spawn(async move { svc.run().await });
        (handle, tx)
    }

    async fn run(&mut self) {
        loop {
            while let Ok(item) = self.rx.try_recv() {
                self.insert_item(item);
            }

            let now = now_ms();
            while self.min_heap.peek().is_some_and(|Reverse(t)| t.fire_at_ms <= now) {
                if let Some(Reverse(due)) = self.min_heap.pop() {
                    self.keys.remove(&(due.instance.clone(), due.scheduling_event_id));
                    if self.fired.send(due).is_err() {
                        return;
                    }
                }
            }

            let next = match self.min_heap.peek() {
                Some(Reverse(t)) => Some(t.fire_at_ms.saturating_sub(now_ms()).max(1)),
                None => None,
            };
            match next {
                Some(dur_ms) => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(dur_ms)) => {}
                        maybe = self.rx.recv() => match maybe {
                            Some(item) => self.insert_item(item),
                            None => return,
                        }
                    }
                }
                None => match self.rx.recv().await {
                    Some(item) => self.insert_item(item),
                    None => return,
                },
            }
        }
    }

    fn insert_item(&mut self, item: TimerRequest) {
        // the same timer may be re-scheduled during recovery
        if self.keys.insert((item.instance.clone(), item.scheduling_event_id)) {
            self.min_heap.push(Reverse(item));
        }
    }
}
