//! appscaler controller library.
//!
//! This crate primarily ships the `appscaler-controller` binary, but exposes
//! its modules so the reconcile loop can be driven from integration tests.
//!
//! ## Modules
//!
//! - `api`: AppScaler and Workload object types
//! - `config`: environment-based configuration
//! - `controller`: reconciler, workers, and the event watcher
//! - `store`: the cluster state store boundary and its in-memory implementation

pub mod api;
pub mod config;
pub mod controller;
pub mod store;
