// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The declarative model for a benchmark run used in the config file. The
//! config file is deserialized into a BenchmarkConfig object.
//!
//! The model used in the config file is intentionally different from the model
//! used to track live resources in memory. Since they are decoupled, the
//! dynamic model can be changed without needing to change the configuration
//! file format. Provider-specific parameters are kept as opaque tables here
//! and only interpreted by the provider's own spec constructor.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct BenchmarkConfig {
    /// The benchmark's name, used in resource metadata and error reporting.
    pub name: Option<String>,

    #[serde(default)]
    pub vm_groups: BTreeMap<String, VmGroupConfig>,

    /// Config-level flag overrides, applied beneath explicitly-supplied
    /// process flags.
    pub flags: Option<toml::Table>,
}

impl BenchmarkConfig {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_str(&contents, path)
    }

    pub fn from_str(contents: &str, path: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }
}

/// The declarative shape of one named group of homogeneously-configured VMs.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct VmGroupConfig {
    /// Number of VMs in the group. When absent, the process-wide `--num-vms`
    /// flag applies, and failing that a single VM is created.
    pub vm_count: Option<u32>,

    /// Number of scratch disks per VM.
    pub disk_count: Option<u32>,

    pub cloud: Option<String>,

    pub os_type: Option<String>,

    /// Pre-provisioned machines absorbed into the group instead of being
    /// created by the run. Instantiated before any dynamic VM, and bounded by
    /// the group's VM count.
    #[serde(default)]
    pub static_vms: Vec<StaticVmConfig>,

    /// Per-cloud VM spec parameters, keyed by cloud name.
    #[serde(default)]
    pub vm_spec: BTreeMap<String, toml::Table>,

    /// Per-cloud disk spec parameters, keyed by cloud name.
    #[serde(default)]
    pub disk_spec: BTreeMap<String, toml::Table>,
}

/// A descriptor for one pre-provisioned machine.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StaticVmConfig {
    pub ip_address: String,
    pub internal_ip: Option<String>,
    pub user_name: Option<String>,
    pub os_type: Option<String>,
    pub ssh_port: Option<u16>,

    /// Whether the run may install and clean up packages on this machine.
    #[serde(default = "default_install_packages")]
    pub install_packages: bool,
}

fn default_install_packages() -> bool {
    true
}

/// A bag of provider-specific parameters taken from a `vm_spec.<cloud>` or
/// `disk_spec.<cloud>` table.
///
/// Constructors consume the parameters they understand with the `take_*`
/// methods and then call `finish()`, which rejects whatever is left over.
/// This is how a typo'd or unsupported key becomes a hard error naming the
/// benchmark and the key, instead of being silently ignored.
pub struct ParamBag {
    benchmark: String,
    values: toml::Table,
}

impl ParamBag {
    pub fn new(benchmark: &str, values: toml::Table) -> Self {
        ParamBag {
            benchmark: benchmark.to_string(),
            values,
        }
    }

    pub fn benchmark(&self) -> &str {
        &self.benchmark
    }

    pub fn take_string(&mut self, key: &str) -> Result<Option<String>, ConfigError> {
        match self.values.remove(key) {
            None => Ok(None),
            Some(toml::Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(self.invalid(key, &format!("expected a string, got {other}"))),
        }
    }

    pub fn take_u64(&mut self, key: &str) -> Result<Option<u64>, ConfigError> {
        match self.values.remove(key) {
            None => Ok(None),
            Some(toml::Value::Integer(n)) if n >= 0 => Ok(Some(n as u64)),
            Some(other) => {
                Err(self.invalid(key, &format!("expected a non-negative integer, got {other}")))
            }
        }
    }

    pub fn take_u32(&mut self, key: &str) -> Result<Option<u32>, ConfigError> {
        match self.take_u64(key)? {
            None => Ok(None),
            Some(n) if n <= u32::MAX as u64 => Ok(Some(n as u32)),
            Some(n) => Err(self.invalid(key, &format!("value {n} is out of range"))),
        }
    }

    pub fn take_bool(&mut self, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.values.remove(key) {
            None => Ok(None),
            Some(toml::Value::Boolean(b)) => Ok(Some(b)),
            Some(other) => Err(self.invalid(key, &format!("expected a boolean, got {other}"))),
        }
    }

    pub fn require_string(&mut self, key: &str) -> Result<String, ConfigError> {
        self.take_string(key)?.ok_or_else(|| ConfigError::MissingParameter {
            benchmark: self.benchmark.clone(),
            key: key.to_string(),
        })
    }

    /// Reject any parameter that no `take_*` call consumed.
    pub fn finish(self) -> Result<(), ConfigError> {
        match self.values.into_iter().next() {
            None => Ok(()),
            Some((key, _)) => Err(ConfigError::UnknownParameter {
                benchmark: self.benchmark,
                key,
            }),
        }
    }

    fn invalid(&self, key: &str, reason: &str) -> ConfigError {
        ConfigError::InvalidParameter {
            benchmark: self.benchmark.clone(),
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ConfigError;

    fn bag(toml_src: &str) -> ParamBag {
        let values: toml::Table = toml::from_str(toml_src).unwrap();
        ParamBag::new("iperf", values)
    }

    #[test]
    fn known_parameters_are_consumed() {
        let mut bag = bag("machine_type = \"n1-standard-4\"\nnum_local_ssds = 2");
        assert_eq!(
            bag.take_string("machine_type").unwrap().as_deref(),
            Some("n1-standard-4")
        );
        assert_eq!(bag.take_u32("num_local_ssds").unwrap(), Some(2));
        bag.finish().unwrap();
    }

    #[test]
    fn unknown_parameter_names_the_benchmark_and_key() {
        let mut bag = bag("machine_type = \"n1-standard-4\"\nmachne_typo = \"oops\"");
        bag.take_string("machine_type").unwrap();
        match bag.finish() {
            Err(ConfigError::UnknownParameter { benchmark, key }) => {
                assert_eq!(benchmark, "iperf");
                assert_eq!(key, "machne_typo");
            }
            other => panic!("expected UnknownParameter, got {other:?}"),
        }
    }

    #[test]
    fn missing_required_parameter_is_distinct_from_unknown() {
        let mut bag = bag("");
        match bag.require_string("image") {
            Err(ConfigError::MissingParameter { benchmark, key }) => {
                assert_eq!(benchmark, "iperf");
                assert_eq!(key, "image");
            }
            other => panic!("expected MissingParameter, got {other:?}"),
        }
    }

    #[test]
    fn group_config_round_trips_through_toml() {
        let config = BenchmarkConfig::from_str(
            r#"
            name = "iperf"

            [vm_groups.servers]
            vm_count = 2
            disk_count = 1
            cloud = "GCP"

            [vm_groups.servers.vm_spec.GCP]
            machine_type = "n1-standard-4"
            zone = "us-central1-a"

            [vm_groups.servers.disk_spec.GCP]
            disk_size = 500
            disk_type = "standard"
            mount_point = "/scratch"
            "#,
            "inline",
        )
        .unwrap();

        let group = &config.vm_groups["servers"];
        assert_eq!(group.vm_count, Some(2));
        assert!(group.vm_spec.contains_key("GCP"));
        assert!(group.disk_spec.contains_key("GCP"));
    }
}
