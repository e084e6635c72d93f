//! Name-keyed registries for orchestrations, activities and entities.
//!
//! One generic `Registry<H>` stores all three handler kinds. Registries are populated once
//! at startup through a builder and are immutable afterwards; cloning is cheap.

use std::collections::HashMap;
use std::sync::Arc;

use super::{ActivityContext, ActivityHandler, EntityContext, EntityHandler, FnActivity, FnEntity, FnOrchestration, OrchestrationHandler};
use crate::OrchestrationContext;
use crate::_typed_codec::{Codec, Json};

pub struct Registry<H: ?Sized> {
    pub(crate) inner: Arc<HashMap<String, Arc<H>>>,
}

// Manual Clone impl since H: ?Sized doesn't auto-derive Clone
impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
        }
    }
}

pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, Arc<H>>,
    errors: Vec<String>,
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type EntityRegistry = Registry<dyn EntityHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;
pub type EntityRegistryBuilder = RegistryBuilder<dyn EntityHandler>;

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<H>> {
        let found = self.inner.get(name).cloned();
        if found.is_none() {
            self.log_registry_miss(name);
        }
        found
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    fn log_registry_miss(&self, name: &str) {
        tracing::debug!(
            target: "duractor::runtime::registry",
            requested_name = %name,
            registered_count = self.inner.len(),
            registered_names = ?self.list_names(),
            "Registry lookup miss"
        );
    }
}

impl<H: ?Sized> RegistryBuilder<H> {
    pub fn build(self) -> Registry<H> {
        Registry {
            inner: Arc::new(self.map),
        }
    }

    /// Build the registry, failing if any name was registered twice.
    ///
    /// # Errors
    ///
    /// Returns all registration errors joined with `; `.
    pub fn build_result(self) -> Result<Registry<H>, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }

    /// First registration wins; later ones are recorded as errors.
    fn insert_handler(&mut self, name: String, handler: Arc<H>, error_prefix: &str) {
        if self.map.contains_key(&name) {
            self.errors.push(format!("duplicate {error_prefix} registration: {name}"));
        } else {
            self.map.insert(name, handler);
        }
    }
}

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert_handler(name.into(), Arc::new(FnOrchestration(f)), "orchestration");
        self
    }

    pub fn register_typed<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: OrchestrationContext, input_s: String| {
            let f_inner = f.clone();
            async move {
                let input: In = Json::decode(&input_s)?;
                let out: Out = (f_inner)(ctx, input).await?;
                Json::encode(&out)
            }
        };
        self.insert_handler(name.into(), Arc::new(FnOrchestration(wrapper)), "orchestration");
        self
    }
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert_handler(name.into(), Arc::new(FnActivity(f)), "activity");
        self
    }

    pub fn register_typed<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: ActivityContext, input_s: String| {
            let f_inner = f.clone();
            async move {
                let input: In = Json::decode(&input_s)?;
                let out: Out = (f_inner)(ctx, input).await?;
                Json::encode(&out)
            }
        };
        self.insert_handler(name.into(), Arc::new(FnActivity(wrapper)), "activity");
        self
    }
}

impl EntityRegistryBuilder {
    /// Register an entity over its raw state string.
    pub fn register<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut EntityContext) -> Result<Option<String>, String> + Send + Sync + 'static,
    {
        let name = name.into();
        if name.contains('@') {
            self.errors.push(format!("entity name must not contain '@': {name}"));
            return self;
        }
        self.insert_handler(name, Arc::new(FnEntity(f)), "entity");
        self
    }

    /// Register an entity over a typed state. Absent state starts as `S::default()`; the
    /// handler gets the operation name and raw input and may return an output.
    pub fn register_typed<S, F>(self, name: impl Into<String>, f: F) -> Self
    where
        S: serde::Serialize + serde::de::DeserializeOwned + Default + 'static,
        F: Fn(&mut S, &str, &str) -> Result<Option<String>, String> + Send + Sync + 'static,
    {
        self.register(name, move |ctx: &mut EntityContext| {
            let mut state: S = ctx.state_typed()?;
            let out = f(&mut state, ctx.operation(), ctx.input())?;
            ctx.set_state_typed(&state)?;
            Ok(out)
        })
    }
}
