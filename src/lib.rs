//! Service supervisor and property service for early userspace.

#![warn(unused_crate_dependencies)]
#[cfg(test)]
use assert_cmd as _;
#[cfg(target_os = "linux")]
use caps as _;
#[cfg(test)]
use predicates as _;
use strum as _;
#[cfg(test)]
use tempfile as _;
use tracing_subscriber as _;

/// CLI parsing.
pub mod cli;

/// Config loading.
pub mod config;

/// Constants.
pub mod constants;

/// Errors.
pub mod error;

/// Credential/Sandbox Applier (C1).
pub mod privilege;

/// Property Store (C4) and Property Server (C5).
pub mod property;

/// Service Registry (C3).
pub mod registry;

/// Runtime paths and process-wide singleton state.
pub mod runtime;

/// Service Object (C2).
pub mod service;

/// Supervisor main loop.
pub mod supervisor;

/// Test utils.
#[doc(hidden)]
pub mod test_utils;
