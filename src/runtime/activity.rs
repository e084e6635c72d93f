use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::registry::ActivityRegistry;
use crate::{AppErrorKind, ConfigErrorKind, ErrorDetails, SYSTEM_GUID_ACTIVITY, SYSTEM_NOW_ACTIVITY};

/// What an activity knows about the work item it is running.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    instance_id: String,
    activity_id: u64,
    activity_name: String,
}

impl ActivityContext {
    pub fn new(instance_id: impl Into<String>, activity_id: u64, activity_name: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            activity_id,
            activity_name: activity_name.into(),
        }
    }

    /// Orchestration instance that scheduled this activity.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Scheduling event id; stable across redeliveries, usable as an idempotency key.
    pub fn activity_id(&self) -> u64 {
        self.activity_id
    }

    pub fn activity_name(&self) -> &str {
        &self.activity_name
    }

    pub fn trace_info(&self, message: impl Into<String>) {
        tracing::info!(
            target: "duractor::activity",
            instance_id = %self.instance_id,
            activity_name = %self.activity_name,
            activity_id = self.activity_id,
            "{}",
            message.into()
        );
    }

    pub fn trace_warn(&self, message: impl Into<String>) {
        tracing::warn!(
            target: "duractor::activity",
            instance_id = %self.instance_id,
            activity_name = %self.activity_name,
            activity_id = self.activity_id,
            "{}",
            message.into()
        );
    }

    pub fn trace_error(&self, message: impl Into<String>) {
        tracing::error!(
            target: "duractor::activity",
            instance_id = %self.instance_id,
            activity_name = %self.activity_name,
            activity_id = self.activity_id,
            "{}",
            message.into()
        );
    }
}

/// Runs registered activities by name with bounded concurrency. No retries here; retry
/// policy belongs to orchestration code so it replays deterministically.
pub struct ActivityExecutor {
    registry: ActivityRegistry,
    permits: Arc<Semaphore>,
}

impl ActivityExecutor {
    pub fn new(registry: ActivityRegistry, concurrency: usize) -> Self {
        Self {
            registry,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    pub async fn execute(&self, ctx: ActivityContext, input: String) -> Result<String, ErrorDetails> {
        let name = ctx.activity_name().to_string();
        match name.as_str() {
            SYSTEM_NOW_ACTIVITY => return Ok(now_ms().to_string()),
            SYSTEM_GUID_ACTIVITY => return Ok(uuid::Uuid::new_v4().to_string()),
            _ => {}
        }

        let Some(handler) = self.registry.get(&name) else {
            tracing::error!(
                target: "duractor::runtime",
                instance_id = %ctx.instance_id(),
                activity_name = %name,
                activity_id = ctx.activity_id(),
                outcome = "system_error",
                error_type = "unregistered",
                "Activity not registered"
            );
            return Err(ErrorDetails::unregistered(ConfigErrorKind::UnregisteredActivity, name));
        };

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| ErrorDetails::application(AppErrorKind::ActivityFailed, format!("executor closed: {e}")))?;

        let start = Instant::now();
        tracing::debug!(
            target: "duractor::runtime",
            instance_id = %ctx.instance_id(),
            activity_name = %name,
            activity_id = ctx.activity_id(),
            "Activity started"
        );
        let instance = ctx.instance_id().to_string();
        let activity_id = ctx.activity_id();
        // own task so a panic stays contained; the set aborts it if this future is dropped
        let mut task = JoinSet::new();
        task.spawn(async move { handler.invoke(ctx, input).await });
        let outcome = task.join_next().await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Some(Ok(Ok(result))) => {
                tracing::debug!(
                    target: "duractor::runtime",
                    instance_id = %instance,
                    activity_name = %name,
                    activity_id,
                    outcome = "success",
                    duration_ms,
                    "Activity completed"
                );
                Ok(result)
            }
            Some(Ok(Err(message))) => {
                tracing::warn!(
                    target: "duractor::runtime",
                    instance_id = %instance,
                    activity_name = %name,
                    activity_id,
                    outcome = "app_error",
                    duration_ms,
                    error = %message,
                    "Activity failed"
                );
                Err(ErrorDetails::application(AppErrorKind::ActivityFailed, message))
            }
            Some(Err(join_err)) => {
                tracing::error!(
                    target: "duractor::runtime",
                    instance_id = %instance,
                    activity_name = %name,
                    activity_id,
                    outcome = "panicked",
                    duration_ms,
                    error = %join_err,
                    "Activity panicked"
                );
                Err(ErrorDetails::application(AppErrorKind::Panicked, join_err.to_string()))
            }
            None => Err(ErrorDetails::application(
                AppErrorKind::ActivityFailed,
                format!("activity {name} was not started"),
            )),
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
