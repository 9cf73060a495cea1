//! Lifecycle hooks attached to resource and dependency descriptors

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::warn;

use super::config::HookErrorPolicy;
use super::handle::ManagedHandle;
use super::result::StepResult;
use crate::error::{Error, Result};

/// Hook callback: may update the managed object (typically its conditions)
/// and sees the child or dependency object last known at that point
pub type Hook<K, T> = Arc<dyn Fn(&mut ManagedHandle<K>, Option<&T>) -> Result<()> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HookKind {
    Before,
    After,
    OnCreate,
    OnUpdate,
    OnDelete,
    OnFinalize,
}

impl HookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::Before => "before",
            HookKind::After => "after",
            HookKind::OnCreate => "on-create",
            HookKind::OnUpdate => "on-update",
            HookKind::OnDelete => "on-delete",
            HookKind::OnFinalize => "on-finalize",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct Hooks<K, T> {
    hooks: HashMap<HookKind, Hook<K, T>>,
}

impl<K, T> Default for Hooks<K, T> {
    fn default() -> Self {
        Self {
            hooks: HashMap::new(),
        }
    }
}

impl<K, T> Clone for Hooks<K, T> {
    fn clone(&self) -> Self {
        Self {
            hooks: self.hooks.clone(),
        }
    }
}

impl<K, T> Hooks<K, T> {
    pub fn set(&mut self, kind: HookKind, hook: Hook<K, T>) {
        self.hooks.insert(kind, hook);
    }

    pub fn has(&self, kind: HookKind) -> bool {
        self.hooks.contains_key(&kind)
    }

    /// Run one hook; a missing hook succeeds
    ///
    /// Errors come back as [`Error::HookError`] naming the owner and hook.
    pub fn run(
        &self,
        kind: HookKind,
        owner: &str,
        handle: &mut ManagedHandle<K>,
        object: Option<&T>,
    ) -> Result<()> {
        let Some(hook) = self.hooks.get(&kind) else {
            return Ok(());
        };
        hook(handle, object).map_err(|e| match e {
            Error::HookError { .. } => e,
            other => Error::hook(format!("{owner} {kind}"), other),
        })
    }

    /// Run the after hook and combine its outcome with the prior result
    pub fn finish(
        &self,
        policy: HookErrorPolicy,
        owner: &str,
        handle: Option<&mut ManagedHandle<K>>,
        object: Option<&T>,
        result: StepResult,
    ) -> StepResult {
        let Some(handle) = handle else {
            return result;
        };
        let Err(hook_error) = self.run(HookKind::After, owner, handle, object) else {
            return result;
        };
        match (policy, result) {
            (HookErrorPolicy::PreservePrior, StepResult::Error(prior)) => {
                warn!("{}; keeping earlier error: {}", hook_error, prior);
                StepResult::Error(prior)
            }
            (_, _) => StepResult::Error(hook_error),
        }
    }
}
