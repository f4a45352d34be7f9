// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Pre-provisioned ("static") machines.
//!
//! A static VM is described in the config rather than created by the run: it
//! is already live when the run starts and keeps running after teardown, so
//! its create and delete actions are no-ops. Package cleanup is the only
//! teardown work it can need, and only when the run was allowed to install
//! packages on it.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::StaticVmConfig;
use crate::errors::ProviderError;
use crate::providers::{DEBIAN, STATIC};
use crate::vm::{Addresses, BaseVmSpec, VirtualMachine, VmArgs, VmBackend, VmSpec};

#[derive(Debug, Serialize, Deserialize)]
pub struct StaticVm {
    pub user_name: Option<String>,
    pub ssh_port: u16,
}

impl StaticVm {
    pub async fn package_cleanup(&self, vm: &VirtualMachine) -> Result<(), ProviderError> {
        debug!("VM {}: package cleanup runs over the remote channel", vm.name);
        Ok(())
    }
}

/// Absorb one static machine descriptor into a run as a live VM.
pub fn from_config(config: &StaticVmConfig, name: &str) -> VirtualMachine {
    let os_type = config.os_type.clone().unwrap_or_else(|| DEBIAN.to_string());
    let args = VmArgs {
        name: name.to_string(),
        cloud: STATIC.to_string(),
        os_type,
        spec: VmSpec::Static {
            base: BaseVmSpec::default(),
        },
    };
    let backend = VmBackend::Static(StaticVm {
        user_name: config.user_name.clone(),
        ssh_port: config.ssh_port.unwrap_or(22),
    });
    let addresses = Addresses {
        ip_address: Some(config.ip_address.clone()),
        internal_ip: config.internal_ip.clone(),
    };

    VirtualMachine::assemble(args, 0, backend, addresses, true, config.install_packages)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> StaticVmConfig {
        StaticVmConfig {
            ip_address: "10.0.0.7".to_string(),
            internal_ip: None,
            user_name: Some("perf".to_string()),
            os_type: None,
            ssh_port: None,
            install_packages: false,
        }
    }

    #[tokio::test]
    async fn static_vms_are_live_and_survive_delete() {
        let vm = from_config(&descriptor(), "group-static-0");
        assert!(vm.is_static);
        assert_eq!(vm.ip_address().as_deref(), Some("10.0.0.7"));

        // Delete transitions the lifecycle but performs no cloud action; the
        // machine itself is not ours to destroy.
        vm.delete().await.unwrap();
        vm.delete().await.unwrap();
    }

    #[tokio::test]
    async fn create_is_a_noop_on_a_live_machine() {
        let vm = from_config(&descriptor(), "group-static-0");
        vm.create().await.unwrap();
        assert!(vm.exists().await.unwrap());
    }
}
