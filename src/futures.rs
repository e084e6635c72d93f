//! Durable futures returned by [`OrchestrationContext`](crate::OrchestrationContext).
//!
//! A `DurableFuture` binds to a scheduling event on its first poll and resolves once the
//! matching completion is present in history. Nothing here ever registers a waker: turns are
//! driven by the replay engine, which polls the orchestration exactly once per turn.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::_typed_codec::{Codec, Json};
use crate::{Event, OrchestrationContext, Schedule};

/// Result of a completed durable future.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurableOutput {
    Activity(Result<String, String>),
    Timer,
    Entity(Result<Option<String>, String>),
}

pub struct DurableFuture {
    ctx: OrchestrationContext,
    schedule: Schedule,
    claimed_event_id: Option<u64>,
}

impl DurableFuture {
    pub(crate) fn new(ctx: OrchestrationContext, schedule: Schedule) -> Self {
        Self {
            ctx,
            schedule,
            claimed_event_id: None,
        }
    }

    /// Scheduling event this future is bound to, once polled.
    pub fn scheduling_event_id(&self) -> Option<u64> {
        self.claimed_event_id
    }

    /// Claim on first call, then look for the completion. Also yields the completion's
    /// event_id so combinators can order results by history.
    pub(crate) fn poll_completion(&mut self) -> Poll<(u64, DurableOutput)> {
        let id = match self.claimed_event_id {
            Some(id) => id,
            None => match self.ctx.claim(&self.schedule) {
                Some(id) => {
                    self.claimed_event_id = Some(id);
                    id
                }
                None => return Poll::Pending,
            },
        };
        match self.ctx.with_history(|h| find_completion(h, id)) {
            Some(done) => Poll::Ready(done),
            None => Poll::Pending,
        }
    }

    pub fn into_activity(self) -> impl Future<Output = Result<String, String>> {
        Expect(self, |out| match out {
            DurableOutput::Activity(r) => Ok(r),
            other => Err(other),
        })
    }

    pub fn into_activity_typed<Out: serde::de::DeserializeOwned>(self) -> impl Future<Output = Result<Out, String>> {
        let fut = self.into_activity();
        async move { Json::decode::<Out>(&fut.await?) }
    }

    pub fn into_timer(self) -> impl Future<Output = ()> {
        Expect(self, |out| match out {
            DurableOutput::Timer => Ok(()),
            other => Err(other),
        })
    }

    pub fn into_entity(self) -> impl Future<Output = Result<Option<String>, String>> {
        Expect(self, |out| match out {
            DurableOutput::Entity(r) => Ok(r),
            other => Err(other),
        })
    }

    pub fn into_entity_typed<Out: serde::de::DeserializeOwned>(
        self,
    ) -> impl Future<Output = Result<Option<Out>, String>> {
        let fut = self.into_entity();
        async move {
            match fut.await? {
                Some(raw) => Json::decode::<Out>(&raw).map(Some),
                None => Ok(None),
            }
        }
    }
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().poll_completion().map(|(_, out)| out)
    }
}

fn find_completion(history: &[Event], scheduling_event_id: u64) -> Option<(u64, DurableOutput)> {
    history.iter().find_map(|e| {
        if e.source_event_id() != Some(scheduling_event_id) {
            return None;
        }
        let out = match e {
            Event::ActivityCompleted { result, .. } => DurableOutput::Activity(Ok(result.clone())),
            Event::ActivityFailed { details, .. } => DurableOutput::Activity(Err(details.display_message())),
            Event::TimerFired { .. } => DurableOutput::Timer,
            Event::EntityCallCompleted { result, .. } => DurableOutput::Entity(Ok(result.clone())),
            Event::EntityCallFailed { details, .. } => DurableOutput::Entity(Err(details.display_message())),
            _ => return None,
        };
        Some((e.event_id(), out))
    })
}

/// Narrows a `DurableFuture` to one output kind. Using the wrong `into_*` adapter is a
/// programming error and panics; the replay engine reports it as a failed turn.
struct Expect<T>(DurableFuture, fn(DurableOutput) -> Result<T, DurableOutput>);

impl<T> Future for Expect<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        match this.0.poll_completion() {
            Poll::Ready((_, out)) => match (this.1)(out) {
                Ok(v) => Poll::Ready(v),
                Err(other) => panic!("durable future adapter does not match its output: {other:?}"),
            },
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Completes when every child has completed; outputs are in the order the children were
/// given, which is also the order their scheduling events were recorded.
pub struct JoinFuture {
    children: Vec<DurableFuture>,
    outputs: Vec<Option<DurableOutput>>,
}

impl JoinFuture {
    pub(crate) fn new(children: Vec<DurableFuture>) -> Self {
        let outputs = children.iter().map(|_| None).collect();
        Self { children, outputs }
    }
}

impl Future for JoinFuture {
    type Output = Vec<DurableOutput>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        // poll every child so all scheduling decisions land in the same turn
        for (child, slot) in this.children.iter_mut().zip(this.outputs.iter_mut()) {
            if slot.is_none() {
                if let Poll::Ready((_, out)) = child.poll_completion() {
                    *slot = Some(out);
                }
            }
        }
        if this.outputs.iter().all(Option::is_some) {
            Poll::Ready(this.outputs.iter_mut().filter_map(Option::take).collect())
        } else {
            Poll::Pending
        }
    }
}

/// Completes with the child whose completion appears first in history.
pub struct SelectFuture {
    children: Vec<DurableFuture>,
}

impl SelectFuture {
    pub(crate) fn new(children: Vec<DurableFuture>) -> Self {
        Self { children }
    }
}

impl Future for SelectFuture {
    type Output = (usize, DurableOutput);

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut winner: Option<(u64, usize, DurableOutput)> = None;
        for (idx, child) in this.children.iter_mut().enumerate() {
            if let Poll::Ready((completion_id, out)) = child.poll_completion() {
                if winner.as_ref().is_none_or(|(best, _, _)| completion_id < *best) {
                    winner = Some((completion_id, idx, out));
                }
            }
        }
        match winner {
            Some((_, idx, out)) => Poll::Ready((idx, out)),
            None => Poll::Pending,
        }
    }
}
