//! Caller-owned state threaded through a run.
//!
//! `RunContext` is never sent to the model. It carries typed values the caller
//! registers up front (database handles, user ids, ...) and the usage counters
//! the orchestrator accumulates while the run progresses.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::future::BoxFuture;

use crate::agent::Agent;
use crate::usage::Usage;

type DynValue = Arc<dyn Any + Send + Sync>;

#[derive(Clone, Default, Debug)]
pub struct RunContext {
    typed: Arc<RwLock<HashMap<TypeId, DynValue>>>,
    named: Arc<RwLock<HashMap<String, DynValue>>>,
    usage: Arc<RwLock<Usage>>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T>(self, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.insert(value);
        self
    }

    pub fn insert<T>(&self, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.typed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(TypeId::of::<T>(), Arc::new(value));
    }

    pub fn get<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let typed = self.typed.read().unwrap_or_else(PoisonError::into_inner);
        let value = typed.get(&TypeId::of::<T>())?.clone();
        Arc::downcast::<T>(value).ok()
    }

    pub fn insert_named<T>(&self, key: impl Into<String>, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.named
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), Arc::new(value));
    }

    pub fn get_named<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let named = self.named.read().unwrap_or_else(PoisonError::into_inner);
        let value = named.get(key)?.clone();
        Arc::downcast::<T>(value).ok()
    }

    /// Snapshot of the usage accumulated so far in the run.
    pub fn usage(&self) -> Usage {
        *self.usage.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add_usage(&self, usage: &Usage) {
        self.usage
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add(usage);
    }

    /// Same caller values, fresh usage counters. Every run starts from one.
    pub(crate) fn fork(&self) -> Self {
        Self {
            typed: Arc::clone(&self.typed),
            named: Arc::clone(&self.named),
            usage: Arc::default(),
        }
    }
}

type EnabledFn = dyn Fn(&RunContext, &Agent) -> BoxFuture<'static, bool> + Send + Sync;

/// Whether a tool or handoff is offered to the model on a given turn.
#[derive(Clone)]
pub enum Enabled {
    Static(bool),
    Predicate(Arc<EnabledFn>),
}

impl Default for Enabled {
    fn default() -> Self {
        Self::Static(true)
    }
}

impl std::fmt::Debug for Enabled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Static(value) => f.debug_tuple("Static").field(value).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl From<bool> for Enabled {
    fn from(value: bool) -> Self {
        Self::Static(value)
    }
}

impl Enabled {
    pub fn when<F>(predicate: F) -> Self
    where
        F: Fn(&RunContext, &Agent) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(move |ctx, agent| {
            let enabled = predicate(ctx, agent);
            Box::pin(async move { enabled })
        }))
    }

    pub fn when_async<F, Fut>(predicate: F) -> Self
    where
        F: Fn(&RunContext, &Agent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Self::Predicate(Arc::new(move |ctx, agent| Box::pin(predicate(ctx, agent))))
    }

    pub async fn evaluate(&self, ctx: &RunContext, agent: &Agent) -> bool {
        match self {
            Self::Static(value) => *value,
            Self::Predicate(predicate) => predicate(ctx, agent).await,
        }
    }
}
