// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Error types for the orchestration engine.
//!
//! The split matters for control flow: configuration errors abort a run before
//! any cloud resource is touched, resource errors are fatal while provisioning
//! but only logged while tearing down, and aggregate errors carry every
//! failure collected from one parallel fan-out.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// A problem with the declarative benchmark configuration or the provider
/// registrations it resolves against. Always fatal, always raised before any
/// resource has been created.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    /// A spec parameter bag contained a key no provider parameter matches.
    /// Unknown keys are rejected rather than ignored so that a typo in a
    /// config file cannot silently change what gets provisioned.
    #[error("benchmark '{benchmark}' config contains an unexpected parameter '{key}'")]
    UnknownParameter { benchmark: String, key: String },

    #[error("benchmark '{benchmark}' config is missing required parameter '{key}'")]
    MissingParameter { benchmark: String, key: String },

    #[error("benchmark '{benchmark}' parameter '{key}' has an invalid value: {reason}")]
    InvalidParameter {
        benchmark: String,
        key: String,
        reason: String,
    },

    #[error("cloud '{cloud}' is not supported (no provider is registered for it)")]
    UnsupportedCloud { cloud: String },

    #[error("VMs of type '{os_type}' are not currently supported on cloud '{cloud}'")]
    UnsupportedCombination { cloud: String, os_type: String },

    #[error("a provider is already registered for '{identity}'")]
    DuplicateRegistration { identity: String },
}

/// An error reported by a provider action (a cloud CLI invocation, or the
/// local test provider's filesystem operation).
///
/// The distinction between the variants drives the create retry loop: a
/// `NotReady` means the resource is not yet visible and the operation can be
/// retried with backoff, while a `Failed` is permanent and stops the retry
/// loop immediately.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("not ready: {0}")]
    NotReady(String),

    #[error("{0}")]
    Failed(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::NotReady(_))
    }
}

/// A single resource's lifecycle operation failed. Carries the resource
/// identity and cloud so that a teardown log line is enough to locate the
/// offending resource.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("{cloud} {kind} '{name}': {op} failed: {source}")]
    Operation {
        cloud: String,
        kind: &'static str,
        name: String,
        op: &'static str,
        #[source]
        source: ProviderError,
    },

    /// A bounded-retry operation ran out of attempts without ever seeing a
    /// permanent failure. Distinct from `Operation` so callers can tell
    /// "gave up waiting" apart from "the provider rejected it".
    #[error("{cloud} {kind} '{name}': {op} did not succeed after {attempts} attempts: {source}")]
    RetryExhausted {
        cloud: String,
        kind: &'static str,
        name: String,
        op: &'static str,
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    #[error(
        "VM '{vm}' cannot allocate another local disk: \
         the '{cloud}' provider allows at most {max_local_disks}"
    )]
    LocalDiskAllocation {
        vm: String,
        cloud: String,
        max_local_disks: u32,
    },
}

/// Every failure collected from one parallel fan-out call. Raised once, after
/// every item has been attempted.
#[derive(Debug)]
pub struct AggregateError {
    pub failures: Vec<Error>,
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} parallel operation(s) failed:", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "\n  - {failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

/// A problem persisting or restoring the serialized run state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("could not access run state file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not decode run state file '{path}': {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not encode run state: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error(transparent)]
    State(#[from] StateError),
}
