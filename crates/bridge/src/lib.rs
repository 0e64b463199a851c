#![forbid(unsafe_code)]

//! A code-execution bridge between an MCP client and a pool of downstream
//! MCP tool servers.
//!
//! The single outward tool, `run_python`, executes a snippet inside a
//! freshly launched rootless container; while it runs, a host-side
//! dispatcher proxies the sandbox's framed tool-call requests back out to
//! the requested downstream servers. Tool documentation is paged lazily
//! through discovery helpers so the outward schema stays near-constant in
//! size regardless of how many servers are configured.

mod bridge;
mod client;
mod config;
mod discovery;
mod dispatcher;
mod entrypoint;
mod error;
mod frame;
mod invocation;
mod naming;
mod pool;
mod render;
mod runtime;
mod sandbox;
mod server;
mod settings;
#[cfg(test)]
mod testutil;

pub use bridge::Bridge;
pub use client::{ClientState, DownstreamClient, MCP_PROTOCOL_VERSION};
pub use config::{load_catalog, Catalog, ServerRecord};
pub use discovery::{Detail, DiscoveryService, CAPABILITY_RESOURCE_URI};
pub use error::BridgeError;
pub use frame::{DoneStatus, Frame, FrameError, MAX_FRAME_BYTES};
pub use invocation::{validate, SandboxInvocation, ValidatedRequest};
pub use naming::{sanitize_identifier, ServerName, ServerNameError};
pub use pool::ClientPool;
pub use render::{render, RunOutcome, RunStatus, ToolResponse};
pub use server::{serve, serve_io};
pub use settings::{OutputMode, Settings};
