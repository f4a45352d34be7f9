// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The in-process provider used by the test environment.
//!
//! Resources are marker files in a directory the spec points at, so a test
//! can assert exactly which resources exist at any point and can inject
//! failures through the spec's `fail_*` parameters. The provider goes through
//! the same registry, contract, and orchestration paths as a real cloud.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::ParamBag;
use crate::disk::{Disk, DiskSpec};
use crate::errors::{ConfigError, ProviderError};
use crate::network::{Firewall, FirewallBackend, FirewallRule, Network, NetworkBackend};
use crate::providers::{DEBIAN, LOCAL};
use crate::registry::ProviderRegistry;
use crate::vm::{Addresses, BaseVmSpec, VirtualMachine, VmArgs, VmBackend, VmSpec};

pub fn register(registry: &mut ProviderRegistry) -> Result<(), ConfigError> {
    registry.register_vm_spec(LOCAL, vm_spec_from_params)?;
    registry.register_disk_spec(LOCAL, disk_spec_from_params)?;
    registry.register_vm(LOCAL, DEBIAN, new_vm)?;
    registry.register_network(LOCAL, new_network)?;
    registry.register_firewall(LOCAL, new_firewall)?;
    Ok(())
}

fn vm_spec_from_params(mut bag: ParamBag) -> Result<VmSpec, ConfigError> {
    let base = BaseVmSpec::from_params(&mut bag)?;
    let spec = VmSpec::Local {
        base,
        dir: PathBuf::from(bag.require_string("dir")?),
        max_local_disks: bag.take_u32("max_local_disks")?.unwrap_or(0),
        fail_create: bag.take_bool("fail_create")?.unwrap_or(false),
        fail_delete: bag.take_bool("fail_delete")?.unwrap_or(false),
        fail_disallow_ports: bag.take_bool("fail_disallow_ports")?.unwrap_or(false),
    };
    bag.finish()?;
    Ok(spec)
}

fn disk_spec_from_params(mut bag: ParamBag) -> Result<DiskSpec, ConfigError> {
    let spec = DiskSpec::from_params(&mut bag)?;
    bag.finish()?;
    Ok(spec)
}

fn new_vm(args: VmArgs) -> Result<VirtualMachine, ConfigError> {
    let VmSpec::Local {
        dir,
        max_local_disks,
        fail_create,
        fail_delete,
        ..
    } = &args.spec
    else {
        return Err(ConfigError::InvalidParameter {
            benchmark: args.name.clone(),
            key: "vm_spec".to_string(),
            reason: format!("a {LOCAL} VM requires a {LOCAL} vm spec"),
        });
    };

    let backend = VmBackend::Local(LocalVm {
        dir: dir.clone(),
        fail_create: *fail_create,
        fail_delete: *fail_delete,
    });
    let max_local_disks = *max_local_disks;

    Ok(VirtualMachine::assemble(
        args,
        max_local_disks,
        backend,
        Addresses::default(),
        false,
        true,
    ))
}

fn new_network(run_uid: &str, zone: Option<&str>, spec: &VmSpec) -> Network {
    let dir = spec_dir(spec);
    let name = match zone {
        Some(zone) => format!("rig-{run_uid}-{zone}"),
        None => format!("rig-{run_uid}"),
    };
    Network::new(&name, LOCAL, zone, NetworkBackend::Local(LocalNetwork { dir }))
}

fn new_firewall(spec: &VmSpec) -> Firewall {
    let fail_disallow = matches!(
        spec,
        VmSpec::Local {
            fail_disallow_ports: true,
            ..
        }
    );
    Firewall::new(
        LOCAL,
        FirewallBackend::Local(LocalFirewall {
            dir: spec_dir(spec),
            fail_disallow,
        }),
    )
}

fn spec_dir(spec: &VmSpec) -> PathBuf {
    match spec {
        VmSpec::Local { dir, .. } => dir.clone(),
        _ => std::env::temp_dir(),
    }
}

async fn touch(path: &Path, contents: &str) -> Result<(), ProviderError> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| ProviderError::Failed(format!("could not write '{}': {e}", path.display())))
}

async fn remove(path: &Path) -> Result<(), ProviderError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ProviderError::Failed(format!(
            "could not remove '{}': {e}",
            path.display()
        ))),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LocalVm {
    pub dir: PathBuf,
    pub fail_create: bool,
    pub fail_delete: bool,
}

impl LocalVm {
    fn marker(&self, vm_name: &str) -> PathBuf {
        self.dir.join(format!("vm-{vm_name}"))
    }

    pub async fn create_action(&self, vm: &VirtualMachine) -> Result<(), ProviderError> {
        if self.fail_create {
            return Err(ProviderError::Failed("configured to fail create".to_string()));
        }
        touch(&self.marker(&vm.name), "").await
    }

    pub async fn post_create(&self, vm: &VirtualMachine) -> Result<Addresses, ProviderError> {
        if !self.marker(&vm.name).exists() {
            return Err(ProviderError::NotReady("instance not yet visible".to_string()));
        }
        Ok(Addresses {
            ip_address: Some("127.0.0.1".to_string()),
            internal_ip: Some("127.0.0.1".to_string()),
        })
    }

    pub async fn delete_action(&self, vm: &VirtualMachine) -> Result<(), ProviderError> {
        if self.fail_delete {
            return Err(ProviderError::Failed("configured to fail delete".to_string()));
        }
        remove(&self.marker(&vm.name)).await?;
        remove(&self.dir.join(format!("vm-{}.metadata", vm.name))).await?;
        remove(&self.dir.join(format!("env-{}", vm.name))).await?;
        remove(&self.dir.join(format!("localdisks-{}", vm.name))).await
    }

    pub async fn exists(&self, vm: &VirtualMachine) -> Result<bool, ProviderError> {
        Ok(self.marker(&vm.name).exists())
    }

    pub async fn add_metadata(
        &self,
        vm: &VirtualMachine,
        pairs: &[(String, String)],
    ) -> Result<(), ProviderError> {
        let lines: String = pairs
            .iter()
            .map(|(key, value)| format!("{key}={value}\n"))
            .collect();
        touch(&self.dir.join(format!("vm-{}.metadata", vm.name)), &lines).await
    }

    pub async fn wait_for_boot_completion(&self, vm: &VirtualMachine) -> Result<(), ProviderError> {
        self.post_create(vm).await.map(|_| ())
    }

    pub async fn on_startup(&self, _vm: &VirtualMachine) -> Result<(), ProviderError> {
        Ok(())
    }

    pub async fn setup_local_disks(&self, vm: &VirtualMachine) -> Result<(), ProviderError> {
        touch(&self.dir.join(format!("localdisks-{}", vm.name)), "").await
    }

    /// Records how many scratch disks existed when the environment was
    /// prepared, so tests can check the disks-before-environment ordering.
    pub async fn prepare_vm_environment(&self, vm: &VirtualMachine) -> Result<(), ProviderError> {
        let count = vm.scratch_disk_count();
        touch(&self.dir.join(format!("env-{}", vm.name)), &count.to_string()).await
    }

    pub async fn package_cleanup(&self, _vm: &VirtualMachine) -> Result<(), ProviderError> {
        Ok(())
    }

    pub fn disk_handle(&self) -> LocalDisk {
        LocalDisk {
            dir: self.dir.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LocalDisk {
    pub dir: PathBuf,
}

impl LocalDisk {
    fn marker(&self, disk: &Disk) -> PathBuf {
        self.dir.join(format!("disk-{}", disk.name))
    }

    pub async fn create(&self, disk: &Disk) -> Result<(), ProviderError> {
        touch(&self.marker(disk), "").await
    }

    pub async fn delete(&self, disk: &Disk) -> Result<(), ProviderError> {
        remove(&self.marker(disk)).await
    }

    pub async fn exists(&self, disk: &Disk) -> Result<bool, ProviderError> {
        Ok(self.marker(disk).exists())
    }

    pub async fn attach(&self, disk: &Disk, vm_name: &str) -> Result<(), ProviderError> {
        touch(&self.marker(disk), vm_name).await
    }

    pub async fn detach(&self, disk: &Disk, _vm_name: &str) -> Result<(), ProviderError> {
        touch(&self.marker(disk), "").await
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LocalNetwork {
    pub dir: PathBuf,
}

impl LocalNetwork {
    fn marker(&self, network: &Network) -> PathBuf {
        self.dir.join(format!("net-{}", network.name))
    }

    pub async fn create(&self, network: &Network) -> Result<(), ProviderError> {
        touch(&self.marker(network), "").await
    }

    pub async fn delete(&self, network: &Network) -> Result<(), ProviderError> {
        remove(&self.marker(network)).await
    }

    pub async fn exists(&self, network: &Network) -> Result<bool, ProviderError> {
        Ok(self.marker(network).exists())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LocalFirewall {
    pub dir: PathBuf,
    pub fail_disallow: bool,
}

impl LocalFirewall {
    fn marker(&self, rule: &FirewallRule) -> PathBuf {
        self.dir.join(format!("fw-{}", rule.rule_name()))
    }

    pub async fn allow_port(&self, rule: &FirewallRule) -> Result<(), ProviderError> {
        touch(&self.marker(rule), "").await
    }

    pub async fn disallow_port(&self, rule: &FirewallRule) -> Result<(), ProviderError> {
        if self.fail_disallow {
            return Err(ProviderError::Failed(
                "configured to fail disallow-ports".to_string(),
            ));
        }
        remove(&self.marker(rule)).await
    }
}
