//! Sandbox module for isolated fork execution environments.
//!
//! This module provides the [`SandboxBackend`] trait that fork executors and the
//! cleanup sweeper drive, and the [`LocalSandboxBackend`] implementation that
//! isolates each sandbox in its own directory.

mod local;
mod provider;

pub use local::LocalSandboxBackend;
pub use provider::{
    CommandOutput, SandboxBackend, SandboxError, SandboxHandle, SandboxId, SandboxInfo,
    SandboxRequest,
};
