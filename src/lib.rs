// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::path::PathBuf;

pub mod config;
pub mod disk;
pub mod errors;
pub mod flags;
pub mod network;
pub mod providers;
pub mod registry;
pub mod resource;
pub mod runner;
pub mod spec;
pub mod test_env;
pub mod vm;

/// Gets the directory under which per-run state (including the serialized
/// benchmark spec used for resumed teardown) is stored.
pub fn temp_dir() -> PathBuf {
    match std::env::var("RIG_TEMP_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => std::env::temp_dir().join("rig"),
    }
}

pub fn default_config_path() -> String {
    match std::env::var("RIG_CONFIG") {
        Ok(conf) => conf,
        Err(_) => "/etc/rig/rig.conf".to_string(),
    }
}

/// Gets the path of the gcloud binary used by the GCP provider.
pub fn gcloud_path() -> String {
    match std::env::var("RIG_GCLOUD") {
        Ok(path) => path,
        Err(_) => "gcloud".to_string(),
    }
}

/// The path of the serialized state file for the run identified by `uid`.
pub fn run_state_path(uid: &str) -> PathBuf {
    temp_dir().join("runs").join(format!("{uid}.json"))
}
