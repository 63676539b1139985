//! `nacc-orchestrator` — the hub of the control plane.
//!
//! Owns the node registry (health-probed, transport-dispatched), the
//! append-only audit log, and the request planner that couples the
//! router/security/execution/sync agent quartet to the active completion
//! backend. Requests fan out across nodes with bounded parallelism and
//! come back as ordered per-node results; partial failure is data, never a
//! 500.

pub mod audit;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod planner;
pub mod registry;
pub mod server;
pub mod service;
pub mod sync;
pub mod transport;

pub use error::OrchestratorError;
pub use service::OrchestratorService;
