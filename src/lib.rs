//! rscdm - CDM session lifecycle management.
//!
//! This crate provides:
//! - Key-system capability queries over a native DRM engine.
//! - Session managers and sessions whose asynchronous engine completions are
//!   matched to callers through per-operation FIFO queues.
//! - Destruction-safe completion delivery on a single client context.
//! - An in-process W3C Clear Key engine.
//!
//! Feature flags:
//! - `cli`: enable the CLI binary.
//! - `mock`: expose the scripted test engine.
//! - `chrono`: use chrono for date handling in CLI.
//! - `tracing`: route log output through tracing instead of log.
#![allow(clippy::result_large_err)]

#[macro_use]
mod macros;

/// Generational slot table backing handles.
pub mod arena;
/// DRM engines behind the CDM.
pub mod backend;
/// Key-system capability queries.
pub mod cdm;
/// YAML configuration.
pub mod config;
/// Client execution context and cross-thread posting.
pub mod context;
mod convert;
/// Common error types and Result alias.
pub mod error;
/// Session managers.
pub mod instance;
/// Key status representation.
pub mod key;
/// `cenc` init data parsing.
pub mod pssh;
/// Correlation queue for untagged completions.
pub mod queue;
/// CDM sessions.
pub mod session;
/// Shared data model.
pub mod types;

pub use cdm::Cdm;
pub use context::ClientContext;
pub use error::{Error, Result};
pub use instance::InstanceHandle;
pub use session::{SessionClient, SessionHandle};
