//! Custom Resource Definitions for Steward
//!
//! `Condition` is shared by every managed object; `Bundle` is the CRD
//! reconciled by the bundled demonstration controller.

mod bundle;
pub mod types;


pub use bundle::{Bundle, BundleSpec, BundleStatus, ConfigMapTemplate, SecretDependencyRef};
pub use types::*;
