//! # appscaler-id
//!
//! Identity types shared by the appscaler store and controller.
//!
//! ## Design Principles
//!
//! - Objects are addressed by a namespaced key (`namespace/name`) chosen by
//!   the operator
//! - Each stored object also gets a system-generated uid that never changes
//! - Every write bumps a resource version used for optimistic concurrency
//! - Keys have a canonical string representation with strict parsing
//!
//! ## Formats
//!
//! - Object key: `default/web`
//! - Object uid: `uid_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - Resource version: a plain unsigned integer, starting at 1

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
