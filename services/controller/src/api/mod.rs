//! Resource types managed by the controller.
//!
//! - [`AppScaler`]: desired replica count for a set of target workloads,
//!   plus the status the controller reports back.
//! - [`Workload`]: a deployment-like object whose replica count is scaled.

mod types;

pub use types::*;
