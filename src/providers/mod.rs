// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Cloud and OS identities, plus the provider implementations behind them.
//!
//! Every provider exposes an explicit `register` function that is called
//! eagerly when the builtin registry is built, so registration order and
//! duplicate detection are visible and testable.

pub mod gcp;
pub mod local;
pub mod static_vm;

pub const GCP: &str = "GCP";

/// The identity of pre-provisioned machines absorbed into a run.
pub const STATIC: &str = "Static";

/// The in-process provider backed by the local filesystem, used by the test
/// environment.
pub const LOCAL: &str = "Local";

// Ubuntu's os_type is "debian" because it is largely built on Debian and uses
// the same package manager. In general, two OSes that share a package manager
// and are otherwise very similar share an os_type.
pub const DEBIAN: &str = "debian";
pub const RHEL: &str = "rhel";
pub const WINDOWS: &str = "windows";
pub const UBUNTU_CONTAINER: &str = "ubuntu_container";
