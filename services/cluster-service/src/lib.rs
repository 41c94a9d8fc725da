//! vcluster fleet cluster service library.
//!
//! This crate primarily ships a `cluster-service` binary, but we expose a
//! library surface so the lifecycle pipelines can be driven from integration
//! tests against the in-memory control plane.

pub mod alert;
pub mod api;
pub mod config;
pub mod control_plane;
pub mod credentials;
pub mod descriptor;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod placement;
pub mod provisioner;
pub mod quota;
pub mod readiness;
pub mod secrets;
pub mod sessions;
pub mod state;
pub mod status;
