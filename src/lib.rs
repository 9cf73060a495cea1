//! steward-k8s: reconciliation orchestration engine for Kubernetes operators
//!
//! Controllers are built from an ordered step pipeline that loads a managed
//! object, resolves the external objects it depends on, reconciles the child
//! objects it owns and publishes its status. Watches are registered lazily
//! and at most once per kind and purpose; change notifications reach workers
//! through an instrumented queue that carries the originating trace context.

pub mod client;
pub mod controller;
pub mod crd;
pub mod error;
pub mod telemetry;

#[cfg(feature = "metrics")]
pub mod server;

pub use crate::error::{Error, Result};
