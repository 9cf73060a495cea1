//! Engine tunables

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;

/// How an after-hook error combines with the outcome it follows
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HookErrorPolicy {
    /// The hook error becomes the final result, whatever preceded it
    #[default]
    Replace,
    /// The hook error replaces non-error outcomes; an earlier error is kept
    PreservePrior,
}

impl FromStr for HookErrorPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "replace" => Ok(HookErrorPolicy::Replace),
            "preserve-prior" | "preserve_prior" | "preserveprior" => {
                Ok(HookErrorPolicy::PreservePrior)
            }
            other => Err(Error::ConfigError(format!(
                "unknown hook error policy '{other}', expected 'replace' or 'preserve-prior'"
            ))),
        }
    }
}

impl fmt::Display for HookErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookErrorPolicy::Replace => write!(f, "replace"),
            HookErrorPolicy::PreservePrior => write!(f, "preserve-prior"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Concurrent reconcile workers
    pub workers: usize,
    /// Requeue delay while a dependency is missing or not ready
    pub dependency_backoff: Duration,
    /// Requeue delay when the managed object vanished during deletion
    pub deletion_race_requeue: Duration,
    pub field_manager: String,
    /// Label that pauses mutation of a managed object or child
    pub pause_label: String,
    /// Prefix for annotations and the finalizer
    pub domain: String,
    pub hook_error_policy: HookErrorPolicy,
    pub rate_limit_base: Duration,
    pub rate_limit_max: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            dependency_backoff: Duration::from_secs(30),
            deletion_race_requeue: Duration::from_secs(1),
            field_manager: "steward-operator".to_string(),
            pause_label: "steward.dev/paused".to_string(),
            domain: "steward.dev".to_string(),
            hook_error_policy: HookErrorPolicy::Replace,
            rate_limit_base: Duration::from_millis(5),
            rate_limit_max: Duration::from_secs(1000),
        }
    }
}

impl ControllerConfig {
    /// Annotation on a dependency listing the managed objects of `kind` that use it
    pub fn dependents_annotation(&self, kind: &str) -> String {
        format!("{}/{}-dependents", self.domain, kind.to_ascii_lowercase())
    }

    /// Annotation carrying the owner uid on children without an owner reference
    pub fn owner_annotation(&self) -> String {
        format!("{}/owner-uid", self.domain)
    }

    pub fn finalizer(&self) -> String {
        format!("{}/finalizer", self.domain)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.workers == 0 {
            return Err(Error::ConfigError("workers must be at least 1".to_string()));
        }
        if self.domain.is_empty() || self.domain.contains('/') {
            return Err(Error::ConfigError(format!(
                "invalid annotation domain '{}'",
                self.domain
            )));
        }
        if self.rate_limit_base > self.rate_limit_max {
            return Err(Error::ConfigError(
                "rate limit base delay exceeds the maximum".to_string(),
            ));
        }
        Ok(())
    }
}
