// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Process-wide flags and their resolution against the benchmark config.
//!
//! Every flag that can also appear in a config file follows the same
//! precedence, in decreasing order:
//!
//!   - the flag, if explicitly supplied on the command line
//!   - the value from the config (group key or config-level `flags` table)
//!   - the flag's default value
//!
//! Flags are `Option` fields so that "explicitly supplied" is observable; the
//! accessor methods apply the defaults.

use clap::{Parser, ValueEnum};
use log::warn;

use crate::config::VmGroupConfig;
use crate::providers;

/// The phase selector controlling which lifecycle operations may execute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum RunStage {
    #[default]
    All,
    Provision,
    Cleanup,
}

impl RunStage {
    /// Whether this stage permits teardown to run at all.
    pub fn allows_teardown(&self) -> bool {
        matches!(self, RunStage::All | RunStage::Cleanup)
    }
}

#[derive(Parser, Debug, Clone, Default)]
pub struct Flags {
    /// Name of the cloud to use.
    #[arg(long)]
    pub cloud: Option<String>,

    /// The VM's OS type. OSes that share a package manager share an OS type.
    #[arg(long)]
    pub os_type: Option<String>,

    /// Base name for scratch disk mount points in the VM. When one spec
    /// produces several disks, a number is appended (/scratch0, /scratch1...).
    #[arg(long)]
    pub scratch_dir: Option<String>,

    /// Size of scratch disks, in GB.
    #[arg(long)]
    pub scratch_disk_size: Option<u64>,

    /// Type of scratch disks ("standard", "remote_ssd", "piops", or "local").
    #[arg(long)]
    pub scratch_disk_type: Option<String>,

    /// The number of disks to stripe together into each scratch disk.
    #[arg(long)]
    pub num_striped_disks: Option<u32>,

    /// Number of VMs for groups that do not configure an explicit count.
    #[arg(long)]
    pub num_vms: Option<u32>,

    #[arg(long)]
    pub machine_type: Option<String>,

    #[arg(long)]
    pub zone: Option<String>,

    #[arg(long)]
    pub image: Option<String>,

    /// The cloud project to create resources in.
    #[arg(long)]
    pub project: Option<String>,

    /// The number of local SSDs to attach to each GCE instance.
    #[arg(long)]
    pub gce_num_local_ssds: Option<u32>,

    /// Whether GCE instances should be provisioned as preemptible.
    #[arg(long)]
    pub gce_preemptible_vms: Option<bool>,

    /// Cap on the number of lifecycle operations in flight at once.
    #[arg(long)]
    pub max_concurrency: Option<usize>,

    #[arg(long, value_enum, default_value = "all")]
    pub run_stage: RunStage,
}

impl Flags {
    pub fn cloud(&self) -> &str {
        self.cloud.as_deref().unwrap_or(providers::GCP)
    }

    pub fn os_type(&self) -> &str {
        self.os_type.as_deref().unwrap_or(providers::DEBIAN)
    }

    /// Gets the cloud for a VM group. The explicitly supplied flag wins over
    /// the group's configured cloud, which wins over the flag's default.
    pub fn resolve_cloud(&self, group: &VmGroupConfig) -> String {
        if self.cloud.is_none() {
            if let Some(cloud) = &group.cloud {
                return cloud.clone();
            }
        }
        self.cloud().to_string()
    }

    /// Gets the OS type for a VM group, with the same precedence as
    /// `resolve_cloud`, resolved independently of it.
    pub fn resolve_os_type(&self, group: &VmGroupConfig) -> String {
        if self.os_type.is_none() {
            if let Some(os_type) = &group.os_type {
                return os_type.clone();
            }
        }
        self.os_type().to_string()
    }

    /// Merge config-level flag overrides beneath these flags.
    ///
    /// A config value fills a flag only when the flag was not explicitly
    /// supplied on the command line. The result wraps process-wide state, so
    /// it is recomputed on every invocation rather than persisted with a run.
    pub fn merge_config(&self, overrides: Option<&toml::Table>) -> Flags {
        let mut merged = self.clone();
        let Some(overrides) = overrides else {
            return merged;
        };

        for (key, value) in overrides {
            match key.as_str() {
                "cloud" => fill_string(&mut merged.cloud, key, value),
                "os_type" => fill_string(&mut merged.os_type, key, value),
                "scratch_dir" => fill_string(&mut merged.scratch_dir, key, value),
                "scratch_disk_size" => fill_u64(&mut merged.scratch_disk_size, key, value),
                "scratch_disk_type" => fill_string(&mut merged.scratch_disk_type, key, value),
                "num_striped_disks" => fill_u32(&mut merged.num_striped_disks, key, value),
                "num_vms" => fill_u32(&mut merged.num_vms, key, value),
                "machine_type" => fill_string(&mut merged.machine_type, key, value),
                "zone" => fill_string(&mut merged.zone, key, value),
                "image" => fill_string(&mut merged.image, key, value),
                "project" => fill_string(&mut merged.project, key, value),
                "gce_num_local_ssds" => fill_u32(&mut merged.gce_num_local_ssds, key, value),
                "gce_preemptible_vms" => fill_bool(&mut merged.gce_preemptible_vms, key, value),
                "max_concurrency" => {
                    if merged.max_concurrency.is_none() {
                        match value.as_integer() {
                            Some(n) if n > 0 => merged.max_concurrency = Some(n as usize),
                            _ => warn!("config flag '{key}' has a non-positive value; ignoring"),
                        }
                    }
                }
                other => warn!("ignoring unrecognized config flag '{other}'"),
            }
        }

        merged
    }
}

fn fill_string(slot: &mut Option<String>, key: &str, value: &toml::Value) {
    if slot.is_some() {
        return;
    }
    match value.as_str() {
        Some(s) => *slot = Some(s.to_string()),
        None => warn!("config flag '{key}' is not a string; ignoring"),
    }
}

fn fill_u64(slot: &mut Option<u64>, key: &str, value: &toml::Value) {
    if slot.is_some() {
        return;
    }
    match value.as_integer() {
        Some(n) if n >= 0 => *slot = Some(n as u64),
        _ => warn!("config flag '{key}' is not a non-negative integer; ignoring"),
    }
}

fn fill_u32(slot: &mut Option<u32>, key: &str, value: &toml::Value) {
    if slot.is_some() {
        return;
    }
    match value.as_integer() {
        Some(n) if n >= 0 && n <= u32::MAX as i64 => *slot = Some(n as u32),
        _ => warn!("config flag '{key}' is not a valid count; ignoring"),
    }
}

fn fill_bool(slot: &mut Option<bool>, key: &str, value: &toml::Value) {
    if slot.is_some() {
        return;
    }
    match value.as_bool() {
        Some(b) => *slot = Some(b),
        None => warn!("config flag '{key}' is not a boolean; ignoring"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(cloud: Option<&str>, os_type: Option<&str>) -> VmGroupConfig {
        VmGroupConfig {
            cloud: cloud.map(str::to_string),
            os_type: os_type.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn explicit_flag_beats_group_config() {
        let flags = Flags {
            cloud: Some("AWS".to_string()),
            ..Default::default()
        };
        assert_eq!(flags.resolve_cloud(&group(Some("GCP"), None)), "AWS");
    }

    #[test]
    fn group_config_beats_flag_default() {
        let flags = Flags::default();
        assert_eq!(flags.resolve_cloud(&group(Some("AWS"), None)), "AWS");
    }

    #[test]
    fn flag_default_when_group_is_silent() {
        let flags = Flags::default();
        assert_eq!(flags.resolve_cloud(&group(None, None)), providers::GCP);
        assert_eq!(flags.resolve_os_type(&group(None, None)), providers::DEBIAN);
    }

    #[test]
    fn cloud_and_os_type_resolve_independently() {
        let flags = Flags {
            cloud: Some("AWS".to_string()),
            ..Default::default()
        };
        let group = group(Some("GCP"), Some("rhel"));
        assert_eq!(flags.resolve_cloud(&group), "AWS");
        // The os_type flag was not supplied, so the group's value wins.
        assert_eq!(flags.resolve_os_type(&group), "rhel");
    }

    #[test]
    fn config_flags_fill_only_unsupplied_flags() {
        let flags = Flags {
            scratch_disk_size: Some(100),
            ..Default::default()
        };
        let mut overrides = toml::Table::new();
        overrides.insert("scratch_disk_size".to_string(), toml::Value::Integer(500));
        overrides.insert("scratch_dir".to_string(), toml::Value::String("/scratch".into()));

        let merged = flags.merge_config(Some(&overrides));
        assert_eq!(merged.scratch_disk_size, Some(100));
        assert_eq!(merged.scratch_dir.as_deref(), Some("/scratch"));
    }
}
