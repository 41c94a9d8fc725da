//! # fleet-events
//!
//! Lifecycle commands delivered to the cluster service over the pub/sub bus.
//!
//! ## Design Principles
//!
//! - Every command names exactly one virtual cluster
//! - Payloads mirror the wire format published by the cluster API
//! - Envelopes are tolerant: `data` may arrive as an object or as a JSON string
//!
//! ## Topics
//!
//! - `cluster-create`
//! - `cluster-start`
//! - `cluster-stop`
//! - `cluster-delete`
//! - `cluster-plan-upgrade`

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
