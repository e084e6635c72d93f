use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::_typed_codec::{Codec, Json};
use crate::providers::ProviderError;
use crate::runtime::{HistoryManager, OrchestrationStatus, Runtime};
use crate::{ConfigErrorKind, DELETE_OPERATION, EntityId, ErrorDetails, Event};

/// Errors returned by [`Client`] calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The store failed; `retryable` errors are the store-unavailable condition.
    Provider(ProviderError),
    /// An instance with this id already has history.
    InstanceExists { instance: String },
    /// Instance ids starting with `@` are reserved for entities.
    InvalidInstance { instance: String },
    Timeout,
    NotFound,
    /// The operation or its target was rejected: a failing entity operation, or a name
    /// nothing is registered under.
    EntityOperationFailed(ErrorDetails),
    Codec(String),
    RuntimeStopped,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Provider(e) => write!(f, "{e}"),
            ClientError::InstanceExists { instance } => write!(f, "instance already exists: {instance}"),
            ClientError::InvalidInstance { instance } => write!(f, "invalid instance id: {instance}"),
            ClientError::Timeout => f.write_str("timed out"),
            ClientError::NotFound => f.write_str("instance not found"),
            ClientError::EntityOperationFailed(details) => write!(f, "{details}"),
            ClientError::Codec(e) => write!(f, "codec: {e}"),
            ClientError::RuntimeStopped => f.write_str("runtime is shut down"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ProviderError> for ClientError {
    fn from(e: ProviderError) -> Self {
        ClientError::Provider(e)
    }
}

/// Control-plane façade over a running [`Runtime`].
///
/// Orchestration calls read and seed history directly; entity calls go through the
/// entity's mailbox so they are ordered with every other operation on that entity.
#[derive(Clone)]
pub struct Client {
    runtime: Arc<Runtime>,
}

impl Client {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    fn entity_error(&self, details: ErrorDetails) -> ClientError {
        if self.runtime.is_shutdown() {
            return ClientError::RuntimeStopped;
        }
        match details {
            ErrorDetails::Infrastructure {
                operation,
                message,
                retryable,
            } => ClientError::Provider(ProviderError {
                operation,
                message,
                retryable,
            }),
            other => ClientError::EntityOperationFailed(other),
        }
    }

    fn check_running(&self) -> Result<(), ClientError> {
        if self.runtime.is_shutdown() {
            Err(ClientError::RuntimeStopped)
        } else {
            Ok(())
        }
    }

    /// Start an orchestration instance with string input.
    pub async fn start_orchestration(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.check_running()?;
        if instance.is_empty() || instance.starts_with('@') {
            return Err(ClientError::InvalidInstance {
                instance: instance.to_string(),
            });
        }
        let store = self.runtime.store();
        if !store.read(instance).await?.is_empty() {
            return Err(ClientError::InstanceExists {
                instance: instance.to_string(),
            });
        }

        let mut events = vec![Event::OrchestrationStarted {
            event_id: 1,
            name: orchestration.to_string(),
            input: input.into(),
        }];
        let registered = self.runtime.orchestration_registry().has(orchestration);
        if !registered {
            events.push(Event::OrchestrationFailed {
                event_id: 2,
                details: ErrorDetails::unregistered(ConfigErrorKind::UnregisteredOrchestration, orchestration),
            });
        }

        if let Err(e) = store.append(instance, events).await {
            // lost a race with another start of the same id
            if !e.is_retryable() && !store.read(instance).await?.is_empty() {
                return Err(ClientError::InstanceExists {
                    instance: instance.to_string(),
                });
            }
            return Err(ClientError::Provider(e));
        }

        if registered {
            self.runtime.ensure_orchestration_worker(instance);
            tracing::debug!(target: "duractor::client", instance_id = %instance, orchestration_name = %orchestration, "Orchestration started");
        } else {
            tracing::warn!(target: "duractor::client", instance_id = %instance, orchestration_name = %orchestration, "Orchestration not registered; instance failed");
        }
        Ok(())
    }

    /// Start an orchestration with typed input (serialized to JSON).
    pub async fn start_orchestration_typed<In: Serialize>(
        &self,
        instance: &str,
        orchestration: &str,
        input: In,
    ) -> Result<(), ClientError> {
        let payload = Json::encode(&input).map_err(ClientError::Codec)?;
        self.start_orchestration(instance, orchestration, payload).await
    }

    /// Start an orchestration under a generated instance id and return the id.
    pub async fn start_new(&self, orchestration: &str, input: impl Into<String>) -> Result<String, ClientError> {
        let instance = uuid::Uuid::new_v4().to_string();
        self.start_orchestration(&instance, orchestration, input).await?;
        Ok(instance)
    }

    /// Current status from history; never waits.
    pub async fn get_orchestration_status(&self, instance: &str) -> Result<OrchestrationStatus, ClientError> {
        let history = self.runtime.store().read(instance).await?;
        Ok(HistoryManager::from_history(&history).status())
    }

    /// Poll until the instance completes or fails, or `timeout` passes.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, ClientError> {
        let poll_interval = Duration::from_millis(self.runtime.options().status_poll_interval_ms.max(1));
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.get_orchestration_status(instance).await? {
                OrchestrationStatus::NotFound => return Err(ClientError::NotFound),
                OrchestrationStatus::Running => {}
                terminal => return Ok(terminal),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClientError::Timeout);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Typed variant: `Ok(Ok(out))` on completion, `Ok(Err(message))` on failure.
    pub async fn wait_for_orchestration_typed<Out: DeserializeOwned>(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<Result<Out, String>, ClientError> {
        match self.wait_for_orchestration(instance, timeout).await? {
            OrchestrationStatus::Completed { output } => Ok(Ok(Json::decode(&output).map_err(ClientError::Codec)?)),
            OrchestrationStatus::Failed { details } => Ok(Err(details.display_message())),
            OrchestrationStatus::Running => Err(ClientError::Timeout),
            OrchestrationStatus::NotFound => Err(ClientError::NotFound),
        }
    }

    /// Request cancellation. The instance fails with a cancelled error on its next turn;
    /// finished instances are left as they are.
    pub async fn cancel_instance(&self, instance: &str, reason: impl Into<String>) -> Result<(), ClientError> {
        self.check_running()?;
        match self.get_orchestration_status(instance).await? {
            OrchestrationStatus::NotFound => Err(ClientError::NotFound),
            OrchestrationStatus::Running => {
                self.runtime.deliver(crate::runtime::OrchestratorMsg::CancelRequested {
                    instance: instance.to_string(),
                    reason: reason.into(),
                });
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Recorded history of an orchestration instance, for diagnostics.
    pub async fn read_history(&self, instance: &str) -> Result<Vec<Event>, ClientError> {
        Ok(self.runtime.store().read(instance).await?)
    }

    /// Enqueue an entity operation; returns once it is durably recorded.
    pub async fn signal_entity(
        &self,
        entity: &EntityId,
        operation: &str,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.check_running()?;
        let input = input.into();
        self.runtime
            .signal_entity(entity, operation, &input, None)
            .await
            .map_err(|d| self.entity_error(d))
    }

    pub async fn signal_entity_typed<In: Serialize>(
        &self,
        entity: &EntityId,
        operation: &str,
        input: &In,
    ) -> Result<(), ClientError> {
        let payload = Json::encode(input).map_err(ClientError::Codec)?;
        self.signal_entity(entity, operation, payload).await
    }

    /// Run an entity operation and wait for its output.
    pub async fn call_entity(
        &self,
        entity: &EntityId,
        operation: &str,
        input: impl Into<String>,
    ) -> Result<Option<String>, ClientError> {
        self.check_running()?;
        let input = input.into();
        self.runtime
            .call_entity(entity, operation, &input, None)
            .await
            .map_err(|d| self.entity_error(d))
    }

    pub async fn call_entity_typed<In: Serialize, Out: DeserializeOwned>(
        &self,
        entity: &EntityId,
        operation: &str,
        input: &In,
    ) -> Result<Option<Out>, ClientError> {
        let payload = Json::encode(input).map_err(ClientError::Codec)?;
        match self.call_entity(entity, operation, payload).await? {
            Some(raw) => Ok(Some(Json::decode(&raw).map_err(ClientError::Codec)?)),
            None => Ok(None),
        }
    }

    /// State after the last applied operation; `None` if the entity has no state.
    pub async fn read_entity_state(&self, entity: &EntityId) -> Result<Option<String>, ClientError> {
        self.check_running()?;
        self.runtime
            .read_entity_state(entity)
            .await
            .map_err(|d| self.entity_error(d))
    }

    pub async fn read_entity_state_typed<S: DeserializeOwned>(&self, entity: &EntityId) -> Result<Option<S>, ClientError> {
        match self.read_entity_state(entity).await? {
            Some(raw) => Ok(Some(Json::decode(&raw).map_err(ClientError::Codec)?)),
            None => Ok(None),
        }
    }

    /// Delete the entity's state. Operations queued behind the delete start from scratch.
    pub async fn delete_entity(&self, entity: &EntityId) -> Result<(), ClientError> {
        self.signal_entity(entity, DELETE_OPERATION, "").await
    }
}
