//! `nacc-node` — the per-machine tool server.
//!
//! Exposes six tools over HTTP-JSON, every filesystem and process effect
//! confined to a single configured root directory:
//!
//! - `POST /tools/list-files`
//! - `POST /tools/read-file`
//! - `POST /tools/write-file`
//! - `POST /tools/execute-command`
//! - `POST /tools/sync-files`
//! - `POST /tools/get-node-info`
//!
//! plus `GET /healthz` (liveness, no I/O) and `GET /node` (full telemetry
//! snapshot). Client errors never bring the process down; each handler
//! returns either a typed payload or the shared error envelope.

pub mod config;
pub mod context;
pub mod exec;
pub mod fsops;
pub mod paths;
pub mod server;
pub mod sync;
pub mod telemetry;

pub use config::NodeConfig;
pub use context::RootContext;
