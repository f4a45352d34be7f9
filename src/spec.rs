// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The benchmark spec: the root object owning a run's entire resource
//! topology and driving it through construction, preparation, and teardown.
//!
//! Provisioning and teardown are separated by an invariant, not a lock:
//! the networks and firewalls maps are only mutated (under their lock) while
//! VMs are being constructed, so teardown can snapshot and walk them freely.
//! Teardown is also the one phase that must keep going when things fail,
//! since every resource left behind keeps costing money; each stage records
//! failures and moves on.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

use log::{error, info};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{BenchmarkConfig, ParamBag};
use crate::disk::DiskSpec;
use crate::errors::{ConfigError, Error, StateError};
use crate::flags::Flags;
use crate::network::{Firewall, Network};
use crate::providers::static_vm;
use crate::registry::ProviderRegistry;
use crate::resource::lock;
use crate::runner::run_parallel;
use crate::vm::{VirtualMachine, VmArgs};

pub const DEFAULT_VM_COUNT: u32 = 1;
pub const DEFAULT_DISK_COUNT: u32 = 1;

/// Contains the various data required to make a benchmark run.
#[derive(Debug, Serialize, Deserialize)]
pub struct BenchmarkSpec {
    pub name: String,

    /// Identifier unique to this run of the benchmark, even when the same
    /// benchmark runs multiple times with different configs. Also names the
    /// run's state file.
    pub uid: String,

    /// Fresh identifier minted every time a spec object is constructed.
    pub uuid: String,

    pub config: BenchmarkConfig,

    vm_groups: BTreeMap<String, Vec<VirtualMachine>>,

    #[serde(with = "lock")]
    networks: Mutex<BTreeMap<String, Arc<Network>>>,

    #[serde(with = "lock")]
    firewalls: Mutex<BTreeMap<String, Arc<Firewall>>>,

    deleted: bool,

    /// The process flags. Reattached on load, never persisted.
    #[serde(skip)]
    flags: Flags,

    /// Cache for the merged config/process flag view. Wraps process-wide
    /// state, so it is recomputed after a load rather than carried.
    #[serde(skip)]
    merged_flags: OnceLock<Flags>,
}

impl BenchmarkSpec {
    pub fn new(config: BenchmarkConfig, name: &str, uid: &str, flags: Flags) -> Self {
        BenchmarkSpec {
            name: name.to_string(),
            uid: uid.to_string(),
            uuid: Uuid::new_v4().to_string(),
            config,
            vm_groups: BTreeMap::new(),
            networks: Mutex::new(BTreeMap::new()),
            firewalls: Mutex::new(BTreeMap::new()),
            deleted: false,
            flags,
            merged_flags: OnceLock::new(),
        }
    }

    /// The result of merging config-level flag overrides with the process
    /// flags, computed once per process.
    pub fn flags(&self) -> &Flags {
        self.merged_flags
            .get_or_init(|| self.flags.merge_config(self.config.flags.as_ref()))
    }

    pub fn deleted(&self) -> bool {
        self.deleted
    }

    pub fn vms(&self) -> impl Iterator<Item = &VirtualMachine> {
        self.vm_groups.values().flatten()
    }

    pub fn vm_groups(&self) -> &BTreeMap<String, Vec<VirtualMachine>> {
        &self.vm_groups
    }

    pub fn network_names(&self) -> Vec<String> {
        self.networks
            .lock()
            .unwrap()
            .values()
            .map(|net| net.name.clone())
            .collect()
    }

    pub fn firewall(&self, cloud: &str) -> Option<Arc<Firewall>> {
        self.firewalls.lock().unwrap().get(cloud).cloned()
    }

    /// Construct the spec's VirtualMachine objects from its configuration.
    ///
    /// Within each group, pre-provisioned machines are absorbed first,
    /// bounded by the group's VM count; the remaining VMs are synthesized
    /// from the group's spec templates. Flag overlays and disk specs are
    /// applied to per-VM copies of the templates, so one VM's mutation can
    /// never corrupt a sibling's.
    pub fn construct_virtual_machines(
        &mut self,
        registry: &ProviderRegistry,
    ) -> Result<(), ConfigError> {
        let flags = self.flags().clone();
        let groups: Vec<_> = self
            .config
            .vm_groups
            .iter()
            .map(|(name, group)| (name.clone(), group.clone()))
            .collect();

        for (group_name, group) in groups {
            let vm_count = group.vm_count.or(flags.num_vms).unwrap_or(DEFAULT_VM_COUNT) as usize;
            let disk_count = group.disk_count.unwrap_or(DEFAULT_DISK_COUNT) as usize;

            let mut vms: Vec<VirtualMachine> = Vec::with_capacity(vm_count);

            for (index, descriptor) in group.static_vms.iter().take(vm_count).enumerate() {
                let name = format!("{}-{}-static-{}", self.uid, group_name, index);
                vms.push(static_vm::from_config(descriptor, &name));
            }

            if vms.len() < vm_count {
                let cloud = flags.resolve_cloud(&group);
                let os_type = flags.resolve_os_type(&group);

                let vm_spec_params = group.vm_spec.get(&cloud).cloned().ok_or_else(|| {
                    ConfigError::MissingParameter {
                        benchmark: self.name.clone(),
                        key: format!("vm_groups.{group_name}.vm_spec.{cloud}"),
                    }
                })?;
                let vm_spec_template =
                    registry.vm_spec_factory(&cloud)?(ParamBag::new(&self.name, vm_spec_params))?;

                let disk_spec_template = match group.disk_spec.get(&cloud) {
                    Some(params) => {
                        let mut spec = registry.disk_spec_factory(&cloud)?(ParamBag::new(
                            &self.name,
                            params.clone(),
                        ))?;
                        spec.apply_flags(&flags);
                        Some(spec)
                    }
                    None => None,
                };

                let vm_factory = registry.vm_factory(&cloud, &os_type)?;

                for index in vms.len()..vm_count {
                    let mut vm_spec = vm_spec_template.clone();
                    vm_spec.apply_flags(&flags);

                    let name = format!("{}-{}-{}", self.uid, group_name, index);
                    let mut vm = vm_factory(VmArgs {
                        name,
                        cloud: cloud.clone(),
                        os_type: os_type.clone(),
                        spec: vm_spec,
                    })?;

                    if let Some(template) = &disk_spec_template {
                        let mut disk_specs: Vec<DiskSpec> =
                            (0..disk_count).map(|_| template.clone()).collect();
                        // Several disks built from one spec would otherwise
                        // collide on the mount point.
                        if disk_count > 1 && template.mount_point.is_some() {
                            for (i, spec) in disk_specs.iter_mut().enumerate() {
                                if let Some(mount_point) = &mut spec.mount_point {
                                    mount_point.push_str(&i.to_string());
                                }
                            }
                        }
                        vm.disk_specs = disk_specs;
                    }

                    self.register_shared_resources(registry, &vm)?;
                    vms.push(vm);
                }
            }

            self.vm_groups.insert(group_name, vms);
        }

        Ok(())
    }

    /// Materialize the network and firewall shared by this VM's cloud (and,
    /// for networks, zone), creating each key at most once.
    fn register_shared_resources(
        &self,
        registry: &ProviderRegistry,
        vm: &VirtualMachine,
    ) -> Result<(), ConfigError> {
        if vm.is_static {
            return Ok(());
        }

        let zone = vm.spec.base().zone.clone();
        let network_key = Network::key_for(&vm.cloud, zone.as_deref());
        {
            let mut networks = self.networks.lock().unwrap();
            if !networks.contains_key(&network_key) {
                let factory = registry.network_factory(&vm.cloud)?;
                let network = factory(&self.uid, zone.as_deref(), &vm.spec);
                networks.insert(network_key, Arc::new(network));
            }
        }
        {
            let mut firewalls = self.firewalls.lock().unwrap();
            if !firewalls.contains_key(&vm.cloud) {
                let factory = registry.firewall_factory(&vm.cloud)?;
                firewalls.insert(vm.cloud.clone(), Arc::new(factory(&vm.spec)));
            }
        }
        Ok(())
    }

    /// Prepare the VMs and networks necessary for the benchmark to run.
    pub async fn prepare(&self) -> Result<(), Error> {
        let limit = self.flags().max_concurrency;

        let networks: Vec<Arc<Network>> =
            self.networks.lock().unwrap().values().cloned().collect();
        run_parallel(networks, limit, |network| async move {
            network.create().await.map_err(Error::from)
        })
        .await?;

        let vms: Vec<&VirtualMachine> = self.vms().collect();
        if vms.is_empty() {
            return Ok(());
        }
        run_parallel(vms, limit, |vm| self.prepare_vm(vm)).await?;
        Ok(())
    }

    /// Create a single VM and prepare its scratch disks.
    async fn prepare_vm(&self, vm: &VirtualMachine) -> Result<(), Error> {
        vm.create().await?;
        info!("VM: {:?}", vm.ip_address());

        for port in vm.remote_access_ports() {
            self.allow_port(vm, *port).await?;
        }
        vm.add_metadata(&self.metadata_pairs()).await?;

        info!("Waiting for boot completion.");
        vm.wait_for_boot_completion().await?;
        vm.on_startup().await?;

        if vm.disk_specs.iter().any(|spec| spec.is_local()) {
            vm.setup_local_disks().await?;
        }
        for disk_spec in &vm.disk_specs {
            vm.create_scratch_disk(disk_spec).await?;
        }

        // This must come after scratch disk creation: containerized
        // environments mount the scratch disks into the container.
        vm.prepare_vm_environment().await?;
        Ok(())
    }

    async fn allow_port(&self, vm: &VirtualMachine, port: u16) -> Result<(), Error> {
        let firewall = self.firewalls.lock().unwrap().get(&vm.cloud).cloned();
        match firewall {
            Some(firewall) => firewall.allow_port(&vm.name, port).await.map_err(Error::from),
            // Pre-provisioned machines have no managed firewall.
            None => Ok(()),
        }
    }

    fn metadata_pairs(&self) -> Vec<(String, String)> {
        vec![
            ("benchmark".to_string(), self.name.clone()),
            ("benchmark_uid".to_string(), self.uid.clone()),
            ("rig_uuid".to_string(), self.uuid.clone()),
            (
                "provisioned_at".to_string(),
                chrono::Utc::now().to_rfc3339(),
            ),
        ]
    }

    /// Tear the topology down: VMs in parallel, then firewalls, then
    /// networks. Failures at every granularity are logged and teardown moves
    /// on, so as much as possible is cleaned up even when some of it fails.
    pub async fn delete(&mut self) {
        if !self.flags().run_stage.allows_teardown() || self.deleted {
            return;
        }
        let limit = self.flags().max_concurrency;

        {
            let vms: Vec<&VirtualMachine> = self.vm_groups.values().flatten().collect();
            if !vms.is_empty() {
                if let Err(e) = run_parallel(vms, limit, |vm| self.delete_vm(vm)).await {
                    error!("Got an error deleting VMs: {e}. Attempting to continue tearing down.");
                }
            }

            let firewalls: Vec<Arc<Firewall>> =
                self.firewalls.lock().unwrap().values().cloned().collect();
            for firewall in firewalls {
                if let Err(e) = firewall.disallow_all_ports().await {
                    error!(
                        "Got an error disabling firewalls: {e}. \
                         Attempting to continue tearing down."
                    );
                }
            }

            let networks: Vec<Arc<Network>> =
                self.networks.lock().unwrap().values().cloned().collect();
            for network in networks {
                if let Err(e) = network.delete().await {
                    error!(
                        "Got an error deleting networks: {e}. \
                         Attempting to continue tearing down."
                    );
                }
            }
        }

        self.deleted = true;
    }

    /// Delete a single VM and its scratch disks. A pre-provisioned machine
    /// skips package cleanup unless the run installed packages on it, but its
    /// own delete and disk teardown still run.
    async fn delete_vm(&self, vm: &VirtualMachine) -> Result<(), Error> {
        if vm.is_static && vm.install_packages {
            vm.package_cleanup().await?;
        }
        vm.delete().await?;
        vm.delete_scratch_disks().await?;
        Ok(())
    }

    /// Serialize the spec so a subsequent invocation can resume teardown.
    pub fn save(&self) -> Result<PathBuf, StateError> {
        let path = crate::run_state_path(&self.uid);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StateError::Io {
                path: path.clone(),
                source,
            })?;
        }
        let contents = serde_json::to_string_pretty(self).map_err(StateError::Encode)?;
        std::fs::write(&path, contents).map_err(|source| StateError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// Restore the spec persisted for `uid`, reattaching the current process
    /// flags.
    pub fn load(uid: &str, flags: Flags) -> Result<Self, StateError> {
        let path = crate::run_state_path(uid);
        let contents = std::fs::read_to_string(&path).map_err(|source| StateError::Io {
            path: path.clone(),
            source,
        })?;
        let mut spec: BenchmarkSpec =
            serde_json::from_str(&contents).map_err(|source| StateError::Decode { path, source })?;

        // Always let the spec be deleted after being restored, so that it is
        // possible to run cleanup even if cleanup has already run.
        spec.deleted = false;
        spec.flags = flags;
        Ok(spec)
    }
}
