// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The provider registry: explicit tables mapping a cloud (or cloud + OS
//! type) identity onto the factory that builds the matching spec or resource.
//!
//! The tables are built eagerly by `builtin()`, so a duplicate registration
//! fails at construction time rather than surfacing as whichever-won-last
//! behavior at dispatch time, and a lookup miss is a descriptive error rather
//! than a silent fallback.

use std::collections::BTreeMap;

use crate::disk::DiskSpec;
use crate::errors::ConfigError;
use crate::network::{Firewall, Network};
use crate::providers::{gcp, local};
use crate::vm::{VirtualMachine, VmArgs, VmSpec};
use crate::config::ParamBag;

pub type VmSpecFactory = fn(ParamBag) -> Result<VmSpec, ConfigError>;
pub type DiskSpecFactory = fn(ParamBag) -> Result<DiskSpec, ConfigError>;
pub type VmFactory = fn(VmArgs) -> Result<VirtualMachine, ConfigError>;
pub type NetworkFactory = fn(run_uid: &str, zone: Option<&str>, spec: &VmSpec) -> Network;
pub type FirewallFactory = fn(spec: &VmSpec) -> Firewall;

#[derive(Default)]
pub struct ProviderRegistry {
    vm_specs: BTreeMap<String, VmSpecFactory>,
    disk_specs: BTreeMap<String, DiskSpecFactory>,
    vms: BTreeMap<(String, String), VmFactory>,
    networks: BTreeMap<String, NetworkFactory>,
    firewalls: BTreeMap<String, FirewallFactory>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry with every provider this binary ships.
    pub fn builtin() -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        gcp::register(&mut registry)?;
        local::register(&mut registry)?;
        Ok(registry)
    }

    pub fn register_vm_spec(
        &mut self,
        cloud: &str,
        factory: VmSpecFactory,
    ) -> Result<(), ConfigError> {
        if self.vm_specs.insert(cloud.to_string(), factory).is_some() {
            return Err(duplicate(&format!("{cloud} vm spec")));
        }
        Ok(())
    }

    pub fn register_disk_spec(
        &mut self,
        cloud: &str,
        factory: DiskSpecFactory,
    ) -> Result<(), ConfigError> {
        if self.disk_specs.insert(cloud.to_string(), factory).is_some() {
            return Err(duplicate(&format!("{cloud} disk spec")));
        }
        Ok(())
    }

    pub fn register_vm(
        &mut self,
        cloud: &str,
        os_type: &str,
        factory: VmFactory,
    ) -> Result<(), ConfigError> {
        let key = (cloud.to_string(), os_type.to_string());
        if self.vms.insert(key, factory).is_some() {
            return Err(duplicate(&format!("{cloud}/{os_type} vm")));
        }
        Ok(())
    }

    pub fn register_network(
        &mut self,
        cloud: &str,
        factory: NetworkFactory,
    ) -> Result<(), ConfigError> {
        if self.networks.insert(cloud.to_string(), factory).is_some() {
            return Err(duplicate(&format!("{cloud} network")));
        }
        Ok(())
    }

    pub fn register_firewall(
        &mut self,
        cloud: &str,
        factory: FirewallFactory,
    ) -> Result<(), ConfigError> {
        if self.firewalls.insert(cloud.to_string(), factory).is_some() {
            return Err(duplicate(&format!("{cloud} firewall")));
        }
        Ok(())
    }

    pub fn vm_spec_factory(&self, cloud: &str) -> Result<VmSpecFactory, ConfigError> {
        self.vm_specs
            .get(cloud)
            .copied()
            .ok_or_else(|| unsupported_cloud(cloud))
    }

    pub fn disk_spec_factory(&self, cloud: &str) -> Result<DiskSpecFactory, ConfigError> {
        self.disk_specs
            .get(cloud)
            .copied()
            .ok_or_else(|| unsupported_cloud(cloud))
    }

    pub fn vm_factory(&self, cloud: &str, os_type: &str) -> Result<VmFactory, ConfigError> {
        self.vms
            .get(&(cloud.to_string(), os_type.to_string()))
            .copied()
            .ok_or_else(|| ConfigError::UnsupportedCombination {
                cloud: cloud.to_string(),
                os_type: os_type.to_string(),
            })
    }

    pub fn network_factory(&self, cloud: &str) -> Result<NetworkFactory, ConfigError> {
        self.networks
            .get(cloud)
            .copied()
            .ok_or_else(|| unsupported_cloud(cloud))
    }

    pub fn firewall_factory(&self, cloud: &str) -> Result<FirewallFactory, ConfigError> {
        self.firewalls
            .get(cloud)
            .copied()
            .ok_or_else(|| unsupported_cloud(cloud))
    }
}

fn duplicate(identity: &str) -> ConfigError {
    ConfigError::DuplicateRegistration {
        identity: identity.to_string(),
    }
}

fn unsupported_cloud(cloud: &str) -> ConfigError {
    ConfigError::UnsupportedCloud {
        cloud: cloud.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers;

    #[test]
    fn builtin_providers_register_cleanly() {
        let registry = ProviderRegistry::builtin().unwrap();
        registry.vm_spec_factory(providers::GCP).unwrap();
        registry.disk_spec_factory(providers::GCP).unwrap();
        registry
            .vm_factory(providers::GCP, providers::WINDOWS)
            .unwrap();
        registry.vm_factory(providers::LOCAL, providers::DEBIAN).unwrap();
    }

    #[test]
    fn duplicate_registration_fails_loudly() {
        let mut registry = ProviderRegistry::builtin().unwrap();
        let factory = registry.vm_spec_factory(providers::GCP).unwrap();
        assert!(matches!(
            registry.register_vm_spec(providers::GCP, factory),
            Err(ConfigError::DuplicateRegistration { .. })
        ));
    }

    #[test]
    fn unknown_combination_is_a_descriptive_error() {
        let registry = ProviderRegistry::builtin().unwrap();
        let error = registry
            .vm_factory(providers::LOCAL, providers::WINDOWS)
            .unwrap_err();
        let message = error.to_string();
        assert!(message.contains("windows"));
        assert!(message.contains("Local"));

        assert!(matches!(
            registry.vm_spec_factory("DigitalOcean"),
            Err(ConfigError::UnsupportedCloud { .. })
        ));
    }
}
