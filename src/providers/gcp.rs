// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The Google Compute Engine provider.
//!
//! All cloud mutation goes through the gcloud CLI, invoked as an opaque
//! collaborator: commands are assembled here, executed in a subprocess, and
//! instance data is read back from gcloud's JSON output. Nothing in the
//! orchestration core inspects this module's state.

use std::collections::BTreeMap;

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ParamBag;
use crate::disk::{self, Disk, DiskBackend, DiskSpec};
use crate::errors::{ConfigError, ProviderError, ResourceError};
use crate::network::{Firewall, FirewallBackend, FirewallRule, Network, NetworkBackend};
use crate::providers::{DEBIAN, GCP, RHEL, UBUNTU_CONTAINER, WINDOWS};
use crate::registry::ProviderRegistry;
use crate::resource::{retry_not_ready, RetryError, RetryPolicy};
use crate::vm::{Addresses, BaseVmSpec, VirtualMachine, VmArgs, VmBackend, VmSpec};

const UBUNTU_IMAGE: &str = "ubuntu-14-04";
const RHEL_IMAGE: &str = "rhel-7";
const WINDOWS_IMAGE: &str = "windows-2012-r2";

const NVME: &str = "nvme";
const SCSI: &str = "SCSI";

// Installed through instance metadata so that remote management is reachable
// on a fresh Windows image.
const WINDOWS_STARTUP_SCRIPT: &str =
    "Enable-PSRemoting -Force; Set-Item WSMan:\\localhost\\Client\\TrustedHosts * -Force";

pub fn register(registry: &mut ProviderRegistry) -> Result<(), ConfigError> {
    registry.register_vm_spec(GCP, vm_spec_from_params)?;
    registry.register_disk_spec(GCP, disk_spec_from_params)?;
    for os_type in [DEBIAN, RHEL, UBUNTU_CONTAINER, WINDOWS] {
        registry.register_vm(GCP, os_type, new_vm)?;
    }
    registry.register_network(GCP, new_network)?;
    registry.register_firewall(GCP, new_firewall)?;
    Ok(())
}

fn vm_spec_from_params(mut bag: ParamBag) -> Result<VmSpec, ConfigError> {
    let base = BaseVmSpec::from_params(&mut bag)?;
    let spec = VmSpec::Gce {
        base,
        project: bag.take_string("project")?,
        num_local_ssds: bag.take_u32("num_local_ssds")?.unwrap_or(0),
        preemptible: bag.take_bool("preemptible")?.unwrap_or(false),
    };
    bag.finish()?;
    Ok(spec)
}

fn disk_spec_from_params(mut bag: ParamBag) -> Result<DiskSpec, ConfigError> {
    let spec = DiskSpec::from_params(&mut bag)?;
    bag.finish()?;
    Ok(spec)
}

struct OsDefaults {
    image: &'static str,
    boot_disk_size_gb: u64,
    boot_disk_type: &'static str,
}

fn os_defaults(os_type: &str) -> OsDefaults {
    match os_type {
        WINDOWS => OsDefaults {
            image: WINDOWS_IMAGE,
            boot_disk_size_gb: 50,
            boot_disk_type: disk::REMOTE_SSD,
        },
        RHEL => OsDefaults {
            image: RHEL_IMAGE,
            boot_disk_size_gb: 10,
            boot_disk_type: disk::STANDARD,
        },
        // Debian-based, including the containerized variant.
        _ => OsDefaults {
            image: UBUNTU_IMAGE,
            boot_disk_size_gb: 10,
            boot_disk_type: disk::STANDARD,
        },
    }
}

fn new_vm(args: VmArgs) -> Result<VirtualMachine, ConfigError> {
    let VmSpec::Gce {
        base,
        project,
        num_local_ssds,
        preemptible,
    } = &args.spec
    else {
        return Err(ConfigError::InvalidParameter {
            benchmark: args.name.clone(),
            key: "vm_spec".to_string(),
            reason: format!("a {GCP} VM requires a {GCP} vm spec"),
        });
    };

    let defaults = os_defaults(&args.os_type);
    let image = base.image.clone().unwrap_or_else(|| defaults.image.to_string());

    // The boot disk is a create dependency: it is created before the
    // instance and deleted after it, and shares the instance's name.
    let boot_spec = DiskSpec {
        disk_size: Some(defaults.boot_disk_size_gb),
        disk_type: Some(defaults.boot_disk_type.to_string()),
        num_striped_disks: 1,
        ..Default::default()
    };
    let boot_disk = Disk::new(
        &boot_spec,
        &args.name,
        GCP,
        DiskBackend::Gce(GceDisk {
            project: project.clone(),
            zone: base.zone.clone(),
            image: Some(image.clone()),
            is_local: false,
        }),
    );

    let mut boot_metadata = BTreeMap::new();
    if args.os_type == WINDOWS {
        boot_metadata.insert(
            "windows-startup-script-ps1".to_string(),
            WINDOWS_STARTUP_SCRIPT.to_string(),
        );
    }

    let backend = VmBackend::Gce(GceVm {
        project: project.clone(),
        zone: base.zone.clone(),
        machine_type: base.machine_type.clone(),
        image,
        preemptible: *preemptible,
        boot_disk,
        boot_metadata,
    });

    let max_local_disks = *num_local_ssds;
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
    let project = match spec {
        VmSpec::Gce { project, .. } => project.clone(),
        _ => None,
    };
    let name = match zone {
        Some(zone) => format!("rig-{run_uid}-{zone}"),
        None => format!("rig-{run_uid}"),
    };
    Network::new(&name, GCP, zone, NetworkBackend::Gce(GceNetwork { project }))
}

fn new_firewall(spec: &VmSpec) -> Firewall {
    let project = match spec {
        VmSpec::Gce { project, .. } => project.clone(),
        _ => None,
    };
    Firewall::new(GCP, FirewallBackend::Gce(GceFirewall { project }))
}

/// Run gcloud with the given arguments, capturing stdout.
///
/// A nonzero exit whose stderr reports a missing resource maps to `NotReady`
/// so that callers can retry (post-create) or swallow it (exists); everything
/// else is permanent.
async fn run_gcloud(args: &[String]) -> Result<String, ProviderError> {
    debug!("issuing command: gcloud {}", args.join(" "));
    let output = tokio::process::Command::new(crate::gcloud_path())
        .args(args)
        .output()
        .await
        .map_err(|e| ProviderError::Failed(format!("could not run gcloud: {e}")))?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("not found") || stderr.contains("notFound") {
        Err(ProviderError::NotReady(stderr.trim().to_string()))
    } else {
        Err(ProviderError::Failed(format!(
            "gcloud exited with {}: {}",
            output.status,
            stderr.trim()
        )))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GceVm {
    pub project: Option<String>,
    pub zone: Option<String>,
    pub machine_type: Option<String>,
    pub image: String,
    pub preemptible: bool,
    pub boot_disk: Disk,
    pub boot_metadata: BTreeMap<String, String>,
}

impl GceVm {
    /// Flags appended to every gcloud invocation for this VM's scope.
    fn scoped_args(&self) -> Vec<String> {
        let mut args = vec!["--format".to_string(), "json".to_string(), "--quiet".to_string()];
        if let Some(project) = &self.project {
            args.push("--project".to_string());
            args.push(project.clone());
        }
        if let Some(zone) = &self.zone {
            args.push("--zone".to_string());
            args.push(zone.clone());
        }
        args
    }

    pub fn create_command(&self, vm_name: &str, num_local_ssds: u32) -> Vec<String> {
        let mut cmd: Vec<String> = [
            "compute",
            "instances",
            "create",
            vm_name,
            "--disk",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        cmd.push(format!("name={},boot=yes,mode=rw", self.boot_disk.name));
        if let Some(machine_type) = &self.machine_type {
            cmd.push("--machine-type".to_string());
            cmd.push(machine_type.clone());
        }
        cmd.push("--tags=rig".to_string());
        cmd.push("--no-restart-on-failure".to_string());
        for (key, value) in &self.boot_metadata {
            cmd.push("--metadata".to_string());
            cmd.push(format!("{key}={value}"));
        }

        // Local SSDs are declared at create time; the interface depends on
        // what the image supports.
        let ssd_interface = if self.image.contains(NVME) { NVME } else { SCSI };
        for _ in 0..num_local_ssds {
            cmd.push("--local-ssd".to_string());
            cmd.push(format!("interface={ssd_interface}"));
        }

        if self.preemptible {
            cmd.push("--preemptible".to_string());
        }
        cmd.extend(self.scoped_args());
        cmd
    }

    fn describe_command(&self, vm_name: &str) -> Vec<String> {
        let mut cmd: Vec<String> = ["compute", "instances", "describe", vm_name]
            .iter()
            .map(|s| s.to_string())
            .collect();
        cmd.extend(self.scoped_args());
        cmd
    }

    pub async fn create_dependencies(&self, _vm: &VirtualMachine) -> Result<(), ResourceError> {
        self.boot_disk.create().await
    }

    pub async fn delete_dependencies(&self, _vm: &VirtualMachine) -> Result<(), ResourceError> {
        self.boot_disk.delete().await
    }

    pub async fn create_action(&self, vm: &VirtualMachine) -> Result<(), ProviderError> {
        run_gcloud(&self.create_command(&vm.name, vm.max_local_disks)).await?;
        Ok(())
    }

    /// Fetch the instance's authoritative addressing data. A not-yet-visible
    /// instance is transient; a response that cannot be parsed fails the
    /// create.
    pub async fn post_create(&self, vm: &VirtualMachine) -> Result<Addresses, ProviderError> {
        let stdout = run_gcloud(&self.describe_command(&vm.name)).await?;
        let response: Value = serde_json::from_str(&stdout).map_err(|e| {
            ProviderError::Failed(format!("could not parse instance description: {e}"))
        })?;

        let interface = &response["networkInterfaces"][0];
        let internal_ip = interface["networkIP"].as_str();
        let ip_address = interface["accessConfigs"][0]["natIP"].as_str();
        match (ip_address, internal_ip) {
            (Some(ip_address), Some(internal_ip)) => Ok(Addresses {
                ip_address: Some(ip_address.to_string()),
                internal_ip: Some(internal_ip.to_string()),
            }),
            _ => Err(ProviderError::Failed(
                "instance description is missing network addresses".to_string(),
            )),
        }
    }

    pub async fn delete_action(&self, vm: &VirtualMachine) -> Result<(), ProviderError> {
        let mut cmd: Vec<String> = ["compute", "instances", "delete", vm.name.as_str()]
            .iter()
            .map(|s| s.to_string())
            .collect();
        cmd.extend(self.scoped_args());
        run_gcloud(&cmd).await?;
        Ok(())
    }

    pub async fn exists(&self, vm: &VirtualMachine) -> Result<bool, ProviderError> {
        match run_gcloud(&self.describe_command(&vm.name)).await {
            Ok(stdout) => Ok(serde_json::from_str::<Value>(&stdout).is_ok()),
            Err(ProviderError::NotReady(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn add_metadata(
        &self,
        vm: &VirtualMachine,
        pairs: &[(String, String)],
    ) -> Result<(), ProviderError> {
        let mut cmd: Vec<String> = [
            "compute",
            "instances",
            "add-metadata",
            vm.name.as_str(),
            "--metadata",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        cmd.push(
            pairs
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
                .join(","),
        );
        cmd.extend(self.scoped_args());
        run_gcloud(&cmd).await?;
        Ok(())
    }

    /// Poll the instance until gcloud reports it running.
    pub async fn wait_for_boot_completion(&self, vm: &VirtualMachine) -> Result<(), ProviderError> {
        let policy = RetryPolicy::default();
        let check = || async {
            let stdout = run_gcloud(&self.describe_command(&vm.name)).await?;
            let response: Value = serde_json::from_str(&stdout).map_err(|e| {
                ProviderError::Failed(format!("could not parse instance description: {e}"))
            })?;
            match response["status"].as_str() {
                Some("RUNNING") => Ok(()),
                Some(status) => Err(ProviderError::NotReady(format!("instance is {status}"))),
                None => Err(ProviderError::Failed(
                    "instance description is missing a status".to_string(),
                )),
            }
        };

        match retry_not_ready(&policy, check).await {
            Ok(()) => Ok(()),
            Err(RetryError::Permanent(e)) => Err(e),
            Err(RetryError::Exhausted { attempts, last }) => Err(ProviderError::Failed(format!(
                "instance did not reach RUNNING within {attempts} attempts: {last}"
            ))),
        }
    }

    pub async fn on_startup(&self, vm: &VirtualMachine) -> Result<(), ProviderError> {
        debug!("VM {} has no startup hook", vm.name);
        Ok(())
    }

    // Local disk formatting, environment preparation, and package cleanup act
    // through remote execution on the instance, which is handled outside the
    // orchestration core.

    pub async fn setup_local_disks(&self, vm: &VirtualMachine) -> Result<(), ProviderError> {
        debug!("VM {}: local disks are set up over the remote channel", vm.name);
        Ok(())
    }

    pub async fn prepare_vm_environment(&self, vm: &VirtualMachine) -> Result<(), ProviderError> {
        debug!("VM {}: environment prepared over the remote channel", vm.name);
        Ok(())
    }

    pub async fn package_cleanup(&self, vm: &VirtualMachine) -> Result<(), ProviderError> {
        debug!("VM {}: package cleanup runs over the remote channel", vm.name);
        Ok(())
    }

    pub fn disk_handle(&self, spec: &DiskSpec) -> GceDisk {
        GceDisk {
            project: self.project.clone(),
            zone: self.zone.clone(),
            image: None,
            is_local: spec.is_local(),
        }
    }
}

/// Maps the portable disk type names onto GCE persistent disk types.
fn gce_disk_type(disk_type: &str) -> &str {
    match disk_type {
        disk::STANDARD => "pd-standard",
        disk::REMOTE_SSD | disk::PIOPS => "pd-ssd",
        other => other,
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GceDisk {
    pub project: Option<String>,
    pub zone: Option<String>,
    pub image: Option<String>,
    /// Local SSDs are created and destroyed with the instance; their disk
    /// objects only track numbering and device paths.
    pub is_local: bool,
}

impl GceDisk {
    fn scoped_args(&self) -> Vec<String> {
        let mut args = vec!["--format".to_string(), "json".to_string(), "--quiet".to_string()];
        if let Some(project) = &self.project {
            args.push("--project".to_string());
            args.push(project.clone());
        }
        if let Some(zone) = &self.zone {
            args.push("--zone".to_string());
            args.push(zone.clone());
        }
        args
    }

    pub fn create_command(&self, disk: &Disk) -> Vec<String> {
        let mut cmd: Vec<String> = ["compute", "disks", "create", disk.name.as_str()]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if let Some(size) = disk.disk_size {
            cmd.push("--size".to_string());
            cmd.push(format!("{size}GB"));
        }
        if let Some(disk_type) = &disk.disk_type {
            cmd.push("--type".to_string());
            cmd.push(gce_disk_type(disk_type).to_string());
        }
        if let Some(image) = &self.image {
            cmd.push("--image".to_string());
            cmd.push(image.clone());
        }
        cmd.extend(self.scoped_args());
        cmd
    }

    pub async fn create(&self, disk: &Disk) -> Result<(), ProviderError> {
        if self.is_local {
            return Ok(());
        }
        run_gcloud(&self.create_command(disk)).await?;
        Ok(())
    }

    pub async fn delete(&self, disk: &Disk) -> Result<(), ProviderError> {
        if self.is_local {
            return Ok(());
        }
        let mut cmd: Vec<String> = ["compute", "disks", "delete", disk.name.as_str()]
            .iter()
            .map(|s| s.to_string())
            .collect();
        cmd.extend(self.scoped_args());
        run_gcloud(&cmd).await?;
        Ok(())
    }

    pub async fn exists(&self, disk: &Disk) -> Result<bool, ProviderError> {
        if self.is_local {
            return Ok(true);
        }
        let mut cmd: Vec<String> = ["compute", "disks", "describe", disk.name.as_str()]
            .iter()
            .map(|s| s.to_string())
            .collect();
        cmd.extend(self.scoped_args());
        match run_gcloud(&cmd).await {
            Ok(stdout) => Ok(serde_json::from_str::<Value>(&stdout).is_ok()),
            Err(ProviderError::NotReady(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn attach(&self, disk: &Disk, vm_name: &str) -> Result<(), ProviderError> {
        if self.is_local {
            return Ok(());
        }
        let mut cmd: Vec<String> = [
            "compute",
            "instances",
            "attach-disk",
            vm_name,
            "--disk",
            disk.name.as_str(),
            "--device-name",
            disk.name.as_str(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        cmd.extend(self.scoped_args());
        run_gcloud(&cmd).await?;
        Ok(())
    }

    pub async fn detach(&self, disk: &Disk, vm_name: &str) -> Result<(), ProviderError> {
        if self.is_local {
            return Ok(());
        }
        let mut cmd: Vec<String> = [
            "compute",
            "instances",
            "detach-disk",
            vm_name,
            "--disk",
            disk.name.as_str(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        cmd.extend(self.scoped_args());
        run_gcloud(&cmd).await?;
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GceNetwork {
    pub project: Option<String>,
}

impl GceNetwork {
    fn scoped_args(&self) -> Vec<String> {
        let mut args = vec!["--format".to_string(), "json".to_string(), "--quiet".to_string()];
        if let Some(project) = &self.project {
            args.push("--project".to_string());
            args.push(project.clone());
        }
        args
    }

    pub async fn create(&self, network: &Network) -> Result<(), ProviderError> {
        let mut cmd: Vec<String> = ["compute", "networks", "create", network.name.as_str()]
            .iter()
            .map(|s| s.to_string())
            .collect();
        cmd.extend(self.scoped_args());
        run_gcloud(&cmd).await?;
        Ok(())
    }

    pub async fn delete(&self, network: &Network) -> Result<(), ProviderError> {
        let mut cmd: Vec<String> = ["compute", "networks", "delete", network.name.as_str()]
            .iter()
            .map(|s| s.to_string())
            .collect();
        cmd.extend(self.scoped_args());
        run_gcloud(&cmd).await?;
        Ok(())
    }

    pub async fn exists(&self, network: &Network) -> Result<bool, ProviderError> {
        let mut cmd: Vec<String> = ["compute", "networks", "describe", network.name.as_str()]
            .iter()
            .map(|s| s.to_string())
            .collect();
        cmd.extend(self.scoped_args());
        match run_gcloud(&cmd).await {
            Ok(stdout) => Ok(serde_json::from_str::<Value>(&stdout).is_ok()),
            Err(ProviderError::NotReady(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GceFirewall {
    pub project: Option<String>,
}

impl GceFirewall {
    fn scoped_args(&self) -> Vec<String> {
        let mut args = vec!["--format".to_string(), "json".to_string(), "--quiet".to_string()];
        if let Some(project) = &self.project {
            args.push("--project".to_string());
            args.push(project.clone());
        }
        args
    }

    pub async fn allow_port(&self, rule: &FirewallRule) -> Result<(), ProviderError> {
        let mut cmd: Vec<String> = [
            "compute",
            "firewall-rules",
            "create",
            rule.rule_name().as_str(),
            "--allow",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        cmd.push(format!("tcp:{}", rule.port));
        cmd.extend(self.scoped_args());
        run_gcloud(&cmd).await?;
        Ok(())
    }

    pub async fn disallow_port(&self, rule: &FirewallRule) -> Result<(), ProviderError> {
        let mut cmd: Vec<String> = [
            "compute",
            "firewall-rules",
            "delete",
            rule.rule_name().as_str(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        cmd.extend(self.scoped_args());
        run_gcloud(&cmd).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gce_vm(preemptible: bool) -> GceVm {
        let boot_spec = DiskSpec {
            disk_size: Some(10),
            disk_type: Some(disk::STANDARD.to_string()),
            num_striped_disks: 1,
            ..Default::default()
        };
        GceVm {
            project: Some("test-project".to_string()),
            zone: Some("us-central1-a".to_string()),
            machine_type: Some("n1-standard-4".to_string()),
            image: UBUNTU_IMAGE.to_string(),
            preemptible,
            boot_disk: Disk::new(
                &boot_spec,
                "vm-0",
                GCP,
                DiskBackend::Gce(GceDisk {
                    project: Some("test-project".to_string()),
                    zone: Some("us-central1-a".to_string()),
                    image: Some(UBUNTU_IMAGE.to_string()),
                    is_local: false,
                }),
            ),
            boot_metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn preemptible_vms_are_created_preemptible() {
        let cmd = gce_vm(true).create_command("vm-0", 0);
        assert!(cmd.contains(&"--preemptible".to_string()));

        let cmd = gce_vm(false).create_command("vm-0", 0);
        assert!(!cmd.contains(&"--preemptible".to_string()));
    }

    #[test]
    fn one_local_ssd_flag_per_requested_disk() {
        let cmd = gce_vm(false).create_command("vm-0", 3);
        let count = cmd.iter().filter(|arg| *arg == "--local-ssd").count();
        assert_eq!(count, 3);
        assert!(cmd.contains(&format!("interface={SCSI}")));
    }

    #[test]
    fn create_scopes_to_project_and_zone() {
        let cmd = gce_vm(false).create_command("vm-0", 0);
        assert!(cmd.contains(&"--project".to_string()));
        assert!(cmd.contains(&"test-project".to_string()));
        assert!(cmd.contains(&"--zone".to_string()));
    }

    #[test]
    fn portable_disk_types_map_to_pd_types() {
        assert_eq!(gce_disk_type(disk::STANDARD), "pd-standard");
        assert_eq!(gce_disk_type(disk::REMOTE_SSD), "pd-ssd");
        assert_eq!(gce_disk_type("pd-balanced"), "pd-balanced");
    }
}
