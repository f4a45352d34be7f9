// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Virtual machine specs and VM resources.
//!
//! A VirtualMachine owns its disk inventory. Disk numbering follows the
//! attach order the provider will see: the system disk is 0, local disks take
//! 1 to the provider-advertised local maximum, and remote disks start after
//! that. The two counters are independent per VM and never reused.

use std::sync::Mutex;

use log::info;
use serde::{Deserialize, Serialize};

use crate::config::ParamBag;
use crate::disk::{Disk, DiskBackend, DiskSpec};
use crate::errors::{ConfigError, ProviderError, ResourceError};
use crate::flags::Flags;
use crate::providers::{self, gcp, local, static_vm};
use crate::resource::{lock, retry_not_ready, Lifecycle, RetryError, RetryPolicy};

/// The spec fields every cloud shares.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct BaseVmSpec {
    pub machine_type: Option<String>,
    pub image: Option<String>,
    pub zone: Option<String>,
}

impl BaseVmSpec {
    pub fn from_params(bag: &mut ParamBag) -> Result<Self, ConfigError> {
        Ok(BaseVmSpec {
            machine_type: bag.take_string("machine_type")?,
            image: bag.take_string("image")?,
            zone: bag.take_string("zone")?,
        })
    }
}

/// The information needed to create a VM, extended per cloud.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum VmSpec {
    Gce {
        base: BaseVmSpec,
        project: Option<String>,
        num_local_ssds: u32,
        preemptible: bool,
    },
    Local {
        base: BaseVmSpec,
        dir: std::path::PathBuf,
        max_local_disks: u32,
        fail_create: bool,
        fail_delete: bool,
        fail_disallow_ports: bool,
    },
    Static {
        base: BaseVmSpec,
    },
}

impl VmSpec {
    pub fn base(&self) -> &BaseVmSpec {
        match self {
            VmSpec::Gce { base, .. } | VmSpec::Local { base, .. } | VmSpec::Static { base } => base,
        }
    }

    fn base_mut(&mut self) -> &mut BaseVmSpec {
        match self {
            VmSpec::Gce { base, .. } | VmSpec::Local { base, .. } | VmSpec::Static { base } => base,
        }
    }

    /// Overlay explicitly-supplied process flags onto this spec. Applied once
    /// per constructed VM, on that VM's own copy of the group template.
    pub fn apply_flags(&mut self, flags: &Flags) {
        let base = self.base_mut();
        if let Some(machine_type) = &flags.machine_type {
            base.machine_type = Some(machine_type.clone());
        }
        if let Some(zone) = &flags.zone {
            base.zone = Some(zone.clone());
        }
        if let Some(image) = &flags.image {
            base.image = Some(image.clone());
        }

        if let VmSpec::Gce {
            project,
            num_local_ssds,
            preemptible,
            ..
        } = self
        {
            if let Some(flag_project) = &flags.project {
                *project = Some(flag_project.clone());
            }
            if let Some(count) = flags.gce_num_local_ssds {
                *num_local_ssds = count;
            }
            if let Some(value) = flags.gce_preemptible_vms {
                *preemptible = value;
            }
        }
    }
}

/// Addressing data fetched from the provider after creation.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Addresses {
    pub ip_address: Option<String>,
    pub internal_ip: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct DiskInventory {
    local_disk_counter: u32,
    remote_disk_counter: u32,
    scratch_disks: Vec<Disk>,
}

/// Provider-specific state and behavior for one VM.
#[derive(Debug, Serialize, Deserialize)]
pub enum VmBackend {
    Gce(gcp::GceVm),
    Local(local::LocalVm),
    Static(static_vm::StaticVm),
}

/// Everything a provider VM factory receives.
pub struct VmArgs {
    pub name: String,
    pub cloud: String,
    pub os_type: String,
    pub spec: VmSpec,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub name: String,
    pub cloud: String,
    pub os_type: String,
    pub spec: VmSpec,

    /// One deep-copied disk spec per scratch disk this VM will create.
    pub disk_specs: Vec<DiskSpec>,

    /// The provider-advertised maximum number of local disks.
    pub max_local_disks: u32,

    /// Whether this is a pre-provisioned machine absorbed into the run.
    pub is_static: bool,

    /// Whether the run may install (and must clean up) packages on this VM.
    pub install_packages: bool,

    lifecycle: Lifecycle,

    #[serde(with = "lock")]
    inventory: Mutex<DiskInventory>,

    #[serde(with = "lock")]
    addresses: Mutex<Addresses>,

    pub backend: VmBackend,
}

impl VirtualMachine {
    /// Assemble a VM from the parts a provider factory produced. Dynamic VMs
    /// start unborn; pre-provisioned ones are already live.
    pub fn assemble(
        args: VmArgs,
        max_local_disks: u32,
        backend: VmBackend,
        addresses: Addresses,
        is_static: bool,
        install_packages: bool,
    ) -> Self {
        VirtualMachine {
            name: args.name,
            cloud: args.cloud,
            os_type: args.os_type,
            spec: args.spec,
            disk_specs: Vec::new(),
            max_local_disks,
            is_static,
            install_packages,
            lifecycle: if is_static {
                Lifecycle::live()
            } else {
                Lifecycle::new()
            },
            inventory: Mutex::new(DiskInventory::default()),
            addresses: Mutex::new(addresses),
            backend,
        }
    }

    pub fn ip_address(&self) -> Option<String> {
        self.addresses.lock().unwrap().ip_address.clone()
    }

    pub fn internal_ip(&self) -> Option<String> {
        self.addresses.lock().unwrap().internal_ip.clone()
    }

    /// The inbound ports that must be open for remote management of this VM.
    pub fn remote_access_ports(&self) -> &'static [u16] {
        if self.os_type == providers::WINDOWS {
            // RDP and WinRM.
            &[3389, 5986]
        } else {
            &[22]
        }
    }

    pub async fn create(&self) -> Result<(), ResourceError> {
        if !self.lifecycle.begin_create() {
            return Ok(());
        }

        self.backend.create_dependencies(self).await?;
        self.backend
            .create_action(self)
            .await
            .map_err(|e| self.error("create", e))?;

        // The freshly-created instance may not be visible to a describe call
        // yet, so the identity fetch is retried with bounded backoff. A
        // malformed response is permanent and fails the whole create.
        let policy = RetryPolicy::default();
        let addresses = retry_not_ready(&policy, || self.backend.post_create(self))
            .await
            .map_err(|e| self.retry_error("post-create", e))?;
        *self.addresses.lock().unwrap() = addresses;

        self.lifecycle.finish_create();
        info!("VM {}: ip address {:?}", self.name, self.ip_address());
        Ok(())
    }

    pub async fn delete(&self) -> Result<(), ResourceError> {
        if !self.lifecycle.begin_delete() {
            return Ok(());
        }
        self.backend
            .delete_action(self)
            .await
            .map_err(|e| self.error("delete", e))?;
        self.backend.delete_dependencies(self).await?;
        self.lifecycle.finish_delete();
        Ok(())
    }

    pub async fn exists(&self) -> Result<bool, ResourceError> {
        self.backend
            .exists(self)
            .await
            .map_err(|e| self.error("exists", e))
    }

    pub async fn add_metadata(&self, pairs: &[(String, String)]) -> Result<(), ResourceError> {
        if pairs.is_empty() {
            return Ok(());
        }
        self.backend
            .add_metadata(self, pairs)
            .await
            .map_err(|e| self.error("add-metadata", e))
    }

    pub async fn wait_for_boot_completion(&self) -> Result<(), ResourceError> {
        self.backend
            .wait_for_boot_completion(self)
            .await
            .map_err(|e| self.error("wait-for-boot", e))
    }

    pub async fn on_startup(&self) -> Result<(), ResourceError> {
        self.backend
            .on_startup(self)
            .await
            .map_err(|e| self.error("on-startup", e))
    }

    pub async fn setup_local_disks(&self) -> Result<(), ResourceError> {
        self.backend
            .setup_local_disks(self)
            .await
            .map_err(|e| self.error("setup-local-disks", e))
    }

    pub async fn prepare_vm_environment(&self) -> Result<(), ResourceError> {
        self.backend
            .prepare_vm_environment(self)
            .await
            .map_err(|e| self.error("prepare-environment", e))
    }

    pub async fn package_cleanup(&self) -> Result<(), ResourceError> {
        self.backend
            .package_cleanup(self)
            .await
            .map_err(|e| self.error("package-cleanup", e))
    }

    /// Create one scratch disk from `disk_spec` and attach it.
    ///
    /// When the spec asks for striping, that many member disks are allocated
    /// from the same spec and wrapped in a striped aggregate whose identity is
    /// independent of the members'.
    pub async fn create_scratch_disk(&self, disk_spec: &DiskSpec) -> Result<(), ResourceError> {
        let member_count = disk_spec.num_striped_disks.max(1) as usize;

        let (mut disks, scratch_index) = {
            let mut inventory = self.inventory.lock().unwrap();
            let scratch_index = inventory.scratch_disks.len();
            let mut disks = Vec::with_capacity(member_count);
            for member_index in 0..member_count {
                disks.push(self.allocate_disk(
                    &mut inventory,
                    disk_spec,
                    scratch_index,
                    member_index,
                )?);
            }
            (disks, scratch_index)
        };

        let scratch = if disks.len() > 1 {
            let name = format!("{}-striped-{}", self.name, scratch_index);
            Disk::striped(disk_spec, &name, &self.cloud, disks)
        } else {
            disks.pop().unwrap()
        };

        scratch.create().await?;
        scratch.attach(&self.name).await?;
        self.inventory.lock().unwrap().scratch_disks.push(scratch);
        Ok(())
    }

    /// Assign the next disk number for one disk and build the disk object.
    ///
    /// Local disks take the next sequential local number starting at 1 (0 is
    /// the system disk); asking for more than the provider advertises is a
    /// hard error, not a clamp. Remote disks number independently, starting
    /// right after the local range.
    fn allocate_disk(
        &self,
        inventory: &mut DiskInventory,
        disk_spec: &DiskSpec,
        scratch_index: usize,
        member_index: usize,
    ) -> Result<Disk, ResourceError> {
        let mut spec = disk_spec.clone();
        let name;

        if spec.is_local() {
            let number = inventory.local_disk_counter + 1;
            inventory.local_disk_counter += 1;
            if inventory.local_disk_counter > self.max_local_disks {
                return Err(ResourceError::LocalDiskAllocation {
                    vm: self.name.clone(),
                    cloud: self.cloud.clone(),
                    max_local_disks: self.max_local_disks,
                });
            }
            spec.disk_number = Some(number);
            name = format!("local-ssd-{}", number - 1);
            if spec.device_path.is_none() {
                spec.device_path = self.backend.local_disk_device_path(number - 1);
            }
        } else {
            let number = inventory.remote_disk_counter + 1 + self.max_local_disks;
            inventory.remote_disk_counter += 1;
            spec.disk_number = Some(number);
            name = format!("{}-data-{}-{}", self.name, scratch_index, member_index);
        }

        Ok(Disk::new(
            &spec,
            &name,
            &self.cloud,
            self.backend.disk_backend(&spec),
        ))
    }

    /// Tear down this VM's scratch disks. Pre-provisioned machines keep
    /// running, so their disks are detached first; local disks live and die
    /// with the instance and are never deleted separately.
    pub async fn delete_scratch_disks(&self) -> Result<(), ResourceError> {
        let disks = std::mem::take(&mut self.inventory.lock().unwrap().scratch_disks);

        let mut first_error = None;
        for disk in &disks {
            let result = async {
                if self.is_static {
                    disk.detach().await?;
                }
                if !disk.is_local() {
                    disk.delete().await?;
                }
                Ok(())
            }
            .await;

            if let Err(e) = result {
                first_error = Some(e);
                break;
            }
        }

        self.inventory.lock().unwrap().scratch_disks = disks;
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    pub fn scratch_disk_count(&self) -> usize {
        self.inventory.lock().unwrap().scratch_disks.len()
    }

    pub fn scratch_disk_numbers(&self) -> Vec<Option<u32>> {
        self.inventory
            .lock()
            .unwrap()
            .scratch_disks
            .iter()
            .map(|d| d.disk_number)
            .collect()
    }

    pub fn scratch_disk_mount_points(&self) -> Vec<Option<String>> {
        self.inventory
            .lock()
            .unwrap()
            .scratch_disks
            .iter()
            .map(|d| d.mount_point.clone())
            .collect()
    }

    /// The member disk numbers of each striped scratch disk, in assembly
    /// order.
    pub fn striped_member_numbers(&self) -> Vec<Vec<Option<u32>>> {
        self.inventory
            .lock()
            .unwrap()
            .scratch_disks
            .iter()
            .filter(|d| d.is_striped())
            .map(|d| d.members().iter().map(|m| m.disk_number).collect())
            .collect()
    }

    fn error(&self, op: &'static str, source: ProviderError) -> ResourceError {
        ResourceError::Operation {
            cloud: self.cloud.clone(),
            kind: "vm",
            name: self.name.clone(),
            op,
            source,
        }
    }

    fn retry_error(&self, op: &'static str, error: RetryError) -> ResourceError {
        match error {
            RetryError::Permanent(source) => self.error(op, source),
            RetryError::Exhausted { attempts, last } => ResourceError::RetryExhausted {
                cloud: self.cloud.clone(),
                kind: "vm",
                name: self.name.clone(),
                op,
                attempts,
                source: last,
            },
        }
    }
}

impl VmBackend {
    async fn create_dependencies(&self, vm: &VirtualMachine) -> Result<(), ResourceError> {
        match self {
            VmBackend::Gce(gce) => gce.create_dependencies(vm).await,
            VmBackend::Local(_) | VmBackend::Static(_) => Ok(()),
        }
    }

    async fn delete_dependencies(&self, vm: &VirtualMachine) -> Result<(), ResourceError> {
        match self {
            VmBackend::Gce(gce) => gce.delete_dependencies(vm).await,
            VmBackend::Local(_) | VmBackend::Static(_) => Ok(()),
        }
    }

    async fn create_action(&self, vm: &VirtualMachine) -> Result<(), ProviderError> {
        match self {
            VmBackend::Gce(gce) => gce.create_action(vm).await,
            VmBackend::Local(local) => local.create_action(vm).await,
            VmBackend::Static(_) => Ok(()),
        }
    }

    async fn post_create(&self, vm: &VirtualMachine) -> Result<Addresses, ProviderError> {
        match self {
            VmBackend::Gce(gce) => gce.post_create(vm).await,
            VmBackend::Local(local) => local.post_create(vm).await,
            VmBackend::Static(_) => Ok(vm.addresses.lock().unwrap().clone()),
        }
    }

    async fn delete_action(&self, vm: &VirtualMachine) -> Result<(), ProviderError> {
        match self {
            VmBackend::Gce(gce) => gce.delete_action(vm).await,
            VmBackend::Local(local) => local.delete_action(vm).await,
            VmBackend::Static(_) => Ok(()),
        }
    }

    async fn exists(&self, vm: &VirtualMachine) -> Result<bool, ProviderError> {
        match self {
            VmBackend::Gce(gce) => gce.exists(vm).await,
            VmBackend::Local(local) => local.exists(vm).await,
            VmBackend::Static(_) => Ok(true),
        }
    }

    async fn add_metadata(
        &self,
        vm: &VirtualMachine,
        pairs: &[(String, String)],
    ) -> Result<(), ProviderError> {
        match self {
            VmBackend::Gce(gce) => gce.add_metadata(vm, pairs).await,
            VmBackend::Local(local) => local.add_metadata(vm, pairs).await,
            VmBackend::Static(_) => Ok(()),
        }
    }

    async fn wait_for_boot_completion(&self, vm: &VirtualMachine) -> Result<(), ProviderError> {
        match self {
            VmBackend::Gce(gce) => gce.wait_for_boot_completion(vm).await,
            VmBackend::Local(local) => local.wait_for_boot_completion(vm).await,
            VmBackend::Static(_) => Ok(()),
        }
    }

    async fn on_startup(&self, vm: &VirtualMachine) -> Result<(), ProviderError> {
        match self {
            VmBackend::Gce(gce) => gce.on_startup(vm).await,
            VmBackend::Local(local) => local.on_startup(vm).await,
            VmBackend::Static(_) => Ok(()),
        }
    }

    async fn setup_local_disks(&self, vm: &VirtualMachine) -> Result<(), ProviderError> {
        match self {
            VmBackend::Gce(gce) => gce.setup_local_disks(vm).await,
            VmBackend::Local(local) => local.setup_local_disks(vm).await,
            VmBackend::Static(_) => Ok(()),
        }
    }

    async fn prepare_vm_environment(&self, vm: &VirtualMachine) -> Result<(), ProviderError> {
        match self {
            VmBackend::Gce(gce) => gce.prepare_vm_environment(vm).await,
            VmBackend::Local(local) => local.prepare_vm_environment(vm).await,
            VmBackend::Static(_) => Ok(()),
        }
    }

    async fn package_cleanup(&self, vm: &VirtualMachine) -> Result<(), ProviderError> {
        match self {
            VmBackend::Gce(gce) => gce.package_cleanup(vm).await,
            VmBackend::Local(local) => local.package_cleanup(vm).await,
            VmBackend::Static(static_vm) => static_vm.package_cleanup(vm).await,
        }
    }

    /// Build the disk backend that a scratch disk of this VM should use.
    fn disk_backend(&self, spec: &DiskSpec) -> DiskBackend {
        match self {
            VmBackend::Gce(gce) => DiskBackend::Gce(gce.disk_handle(spec)),
            VmBackend::Local(local) => DiskBackend::Local(local.disk_handle()),
            VmBackend::Static(_) => DiskBackend::Static,
        }
    }

    fn local_disk_device_path(&self, index: u32) -> Option<String> {
        match self {
            VmBackend::Gce(_) => Some(format!("/dev/disk/by-id/google-local-ssd-{index}")),
            VmBackend::Local(_) | VmBackend::Static(_) => None,
        }
    }
}
