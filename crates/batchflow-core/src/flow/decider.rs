//! Deciders: external collaborators consulted by `Decision` nodes.
//!
//! A decider looks at the job context and the outcome of the previous node
//! and returns the exit signal the decision node routes on. It is consulted
//! exactly once per visit and must not depend on engine state.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use batchflow_types::status::ExitStatus;

use super::step::StepContext;

pub trait Decider: Send + Sync {
    fn name(&self) -> &str;

    fn decide(&self, ctx: &StepContext) -> impl Future<Output = anyhow::Result<ExitStatus>> + Send;
}

/// Object-safe version of [`Decider`] with boxed futures.
pub trait DeciderDyn: Send + Sync {
    fn name(&self) -> &str;

    fn decide_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ExitStatus>> + Send + 'a>>;
}

impl<T: Decider> DeciderDyn for T {
    fn name(&self) -> &str {
        Decider::name(self)
    }

    fn decide_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ExitStatus>> + Send + 'a>> {
        Box::pin(self.decide(ctx))
    }
}

/// Type-erased decider.
pub struct BoxDecider {
    inner: Box<dyn DeciderDyn + Send + Sync>,
}

impl BoxDecider {
    pub fn new<T: Decider + 'static>(decider: T) -> Self {
        Self {
            inner: Box::new(decider),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn decide(&self, ctx: &StepContext) -> anyhow::Result<ExitStatus> {
        self.inner.decide_boxed(ctx).await
    }
}

/// Deciders by name.
#[derive(Default)]
pub struct DeciderRegistry {
    deciders: HashMap<String, Arc<BoxDecider>>,
}

impl DeciderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Decider + 'static>(&mut self, decider: T) {
        let decider = BoxDecider::new(decider);
        self.deciders
            .insert(decider.name().to_string(), Arc::new(decider));
    }

    pub fn get(&self, name: &str) -> Option<Arc<BoxDecider>> {
        self.deciders.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.deciders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deciders.is_empty()
    }
}

impl std::fmt::Debug for DeciderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.deciders.keys().collect();
        names.sort();
        f.debug_struct("DeciderRegistry").field("deciders", &names).finish()
    }
}
