// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Disk specs and disk resources.
//!
//! Disks can be created, deleted, attached to VMs, and detached from VMs.
//! A striped disk is an aggregate of several member disks presented as one
//! logical disk; its operations fan out to the members in assembly order.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::config::ParamBag;
use crate::errors::{ConfigError, ProviderError, ResourceError};
use crate::flags::Flags;
use crate::providers::{gcp, local};
use crate::resource::{lock, Lifecycle};

pub const STANDARD: &str = "standard";
pub const REMOTE_SSD: &str = "remote_ssd";
/// Provisioned IOPS (SSD).
pub const PIOPS: &str = "piops";
pub const LOCAL: &str = "local";

/// Stores the information needed to create a disk.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct DiskSpec {
    /// Size of the disk in GB.
    pub disk_size: Option<u64>,

    /// Disk type string; see the constants in this module for the base set.
    pub disk_type: Option<String>,

    pub mount_point: Option<String>,

    /// The number of disks to stripe together. 1 means no striping.
    pub num_striped_disks: u32,

    pub disk_number: Option<u32>,

    pub device_path: Option<String>,
}

impl DiskSpec {
    /// Consume the base disk parameters from a provider's parameter bag.
    /// Provider constructors take their own extensions afterwards and then
    /// reject whatever is left.
    pub fn from_params(bag: &mut ParamBag) -> Result<Self, ConfigError> {
        Ok(DiskSpec {
            disk_size: bag.take_u64("disk_size")?,
            disk_type: bag.take_string("disk_type")?,
            mount_point: bag.take_string("mount_point")?,
            num_striped_disks: bag.take_u32("num_striped_disks")?.unwrap_or(1),
            disk_number: bag.take_u32("disk_number")?,
            device_path: bag.take_string("device_path")?,
        })
    }

    /// Overlay explicitly-supplied process flags onto this spec.
    pub fn apply_flags(&mut self, flags: &Flags) {
        if let Some(size) = flags.scratch_disk_size {
            self.disk_size = Some(size);
        }
        if let Some(disk_type) = &flags.scratch_disk_type {
            self.disk_type = Some(disk_type.clone());
        }
        if let Some(count) = flags.num_striped_disks {
            self.num_striped_disks = count;
        }
        if let Some(dir) = &flags.scratch_dir {
            self.mount_point = Some(dir.clone());
        }
    }

    pub fn is_local(&self) -> bool {
        self.disk_type.as_deref() == Some(LOCAL)
    }
}

/// Provider-specific state for one disk. `Striped` owns its member disks;
/// the other variants are leaves.
#[derive(Debug, Serialize, Deserialize)]
pub enum DiskBackend {
    Gce(gcp::GceDisk),
    Local(local::LocalDisk),
    Striped { disks: Vec<Disk> },
    /// A disk belonging to a pre-provisioned machine; never cloud-managed.
    Static,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Disk {
    pub name: String,
    pub cloud: String,
    pub disk_size: Option<u64>,
    pub disk_type: Option<String>,
    pub mount_point: Option<String>,
    pub num_striped_disks: u32,

    /// The disk number corresponds to the order in which disks were attached
    /// to the instance. The system disk has disk number 0. Local disks have
    /// numbers ranging from 1 to the number of local disks on the system;
    /// disks attached after boot get numbers starting at the number of local
    /// disks + 1.
    pub disk_number: Option<u32>,

    device_path: Option<String>,

    lifecycle: Lifecycle,

    #[serde(with = "lock")]
    attached_to: Mutex<Option<String>>,

    pub backend: DiskBackend,
}

impl Disk {
    pub fn new(spec: &DiskSpec, name: &str, cloud: &str, backend: DiskBackend) -> Self {
        Disk {
            name: name.to_string(),
            cloud: cloud.to_string(),
            disk_size: spec.disk_size,
            disk_type: spec.disk_type.clone(),
            mount_point: spec.mount_point.clone(),
            num_striped_disks: spec.num_striped_disks,
            disk_number: spec.disk_number,
            device_path: spec.device_path.clone(),
            lifecycle: Lifecycle::new(),
            attached_to: Mutex::new(None),
            backend,
        }
    }

    /// Wrap several disks into one logical striped disk. The aggregate's
    /// identity comes from the outer spec; it has no device path of its own.
    pub fn striped(spec: &DiskSpec, name: &str, cloud: &str, disks: Vec<Disk>) -> Self {
        let mut disk = Disk::new(spec, name, cloud, DiskBackend::Striped { disks });
        disk.device_path = None;
        disk
    }

    pub fn is_striped(&self) -> bool {
        matches!(self.backend, DiskBackend::Striped { .. })
    }

    pub fn is_local(&self) -> bool {
        self.disk_type.as_deref() == Some(LOCAL)
    }

    /// The path to the device inside a Linux VM.
    pub fn device_path(&self) -> Option<&str> {
        self.device_path.as_deref()
    }

    pub fn members(&self) -> &[Disk] {
        match &self.backend {
            DiskBackend::Striped { disks } => disks,
            _ => &[],
        }
    }

    pub async fn create(&self) -> Result<(), ResourceError> {
        if !self.lifecycle.begin_create() {
            return Ok(());
        }
        match &self.backend {
            DiskBackend::Striped { disks } => {
                // A member failure aborts the fan-out and fails the aggregate.
                for member in disks {
                    Box::pin(member.create()).await?;
                }
            }
            backend => {
                backend
                    .create(self)
                    .await
                    .map_err(|e| self.error("create", e))?;
            }
        }
        self.lifecycle.finish_create();
        Ok(())
    }

    pub async fn delete(&self) -> Result<(), ResourceError> {
        if !self.lifecycle.begin_delete() {
            return Ok(());
        }
        match &self.backend {
            DiskBackend::Striped { disks } => {
                for member in disks {
                    Box::pin(member.delete()).await?;
                }
            }
            backend => {
                backend
                    .delete(self)
                    .await
                    .map_err(|e| self.error("delete", e))?;
            }
        }
        self.lifecycle.finish_delete();
        Ok(())
    }

    pub async fn exists(&self) -> Result<bool, ResourceError> {
        match &self.backend {
            DiskBackend::Striped { disks } => {
                for member in disks {
                    if !Box::pin(member.exists()).await? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            backend => backend
                .exists(self)
                .await
                .map_err(|e| self.error("exists", e)),
        }
    }

    pub async fn attach(&self, vm_name: &str) -> Result<(), ResourceError> {
        match &self.backend {
            DiskBackend::Striped { disks } => {
                for member in disks {
                    Box::pin(member.attach(vm_name)).await?;
                }
            }
            backend => {
                backend
                    .attach(self, vm_name)
                    .await
                    .map_err(|e| self.error("attach", e))?;
            }
        }
        *self.attached_to.lock().unwrap() = Some(vm_name.to_string());
        Ok(())
    }

    pub async fn detach(&self) -> Result<(), ResourceError> {
        let vm_name = self.attached_to.lock().unwrap().take();
        let Some(vm_name) = vm_name else {
            return Ok(());
        };
        match &self.backend {
            DiskBackend::Striped { disks } => {
                for member in disks {
                    Box::pin(member.detach()).await?;
                }
            }
            backend => {
                backend
                    .detach(self, &vm_name)
                    .await
                    .map_err(|e| self.error("detach", e))?;
            }
        }
        Ok(())
    }

    fn error(&self, op: &'static str, source: ProviderError) -> ResourceError {
        ResourceError::Operation {
            cloud: self.cloud.clone(),
            kind: "disk",
            name: self.name.clone(),
            op,
            source,
        }
    }
}

impl DiskBackend {
    async fn create(&self, disk: &Disk) -> Result<(), ProviderError> {
        match self {
            DiskBackend::Gce(gce) => gce.create(disk).await,
            DiskBackend::Local(local) => local.create(disk).await,
            DiskBackend::Static => Ok(()),
            DiskBackend::Striped { .. } => unreachable!("striped disks fan out to members"),
        }
    }

    async fn delete(&self, disk: &Disk) -> Result<(), ProviderError> {
        match self {
            DiskBackend::Gce(gce) => gce.delete(disk).await,
            DiskBackend::Local(local) => local.delete(disk).await,
            DiskBackend::Static => Ok(()),
            DiskBackend::Striped { .. } => unreachable!("striped disks fan out to members"),
        }
    }

    async fn exists(&self, disk: &Disk) -> Result<bool, ProviderError> {
        match self {
            DiskBackend::Gce(gce) => gce.exists(disk).await,
            DiskBackend::Local(local) => local.exists(disk).await,
            DiskBackend::Static => Ok(true),
            DiskBackend::Striped { .. } => unreachable!("striped disks fan out to members"),
        }
    }

    async fn attach(&self, disk: &Disk, vm_name: &str) -> Result<(), ProviderError> {
        match self {
            DiskBackend::Gce(gce) => gce.attach(disk, vm_name).await,
            DiskBackend::Local(local) => local.attach(disk, vm_name).await,
            DiskBackend::Static => Ok(()),
            DiskBackend::Striped { .. } => unreachable!("striped disks fan out to members"),
        }
    }

    async fn detach(&self, disk: &Disk, vm_name: &str) -> Result<(), ProviderError> {
        match self {
            DiskBackend::Gce(gce) => gce.detach(disk, vm_name).await,
            DiskBackend::Local(local) => local.detach(disk, vm_name).await,
            DiskBackend::Static => Ok(()),
            DiskBackend::Striped { .. } => unreachable!("striped disks fan out to members"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_overlay_spec_values() {
        let mut spec = DiskSpec {
            disk_size: Some(100),
            disk_type: Some(STANDARD.to_string()),
            mount_point: Some("/data".to_string()),
            num_striped_disks: 1,
            ..Default::default()
        };
        let flags = Flags {
            scratch_disk_size: Some(500),
            scratch_disk_type: Some(REMOTE_SSD.to_string()),
            num_striped_disks: Some(2),
            ..Default::default()
        };

        spec.apply_flags(&flags);
        assert_eq!(spec.disk_size, Some(500));
        assert_eq!(spec.disk_type.as_deref(), Some(REMOTE_SSD));
        assert_eq!(spec.num_striped_disks, 2);
        // No scratch_dir flag: the spec's mount point survives.
        assert_eq!(spec.mount_point.as_deref(), Some("/data"));
    }

    #[test]
    fn base_params_reject_leftover_keys() {
        let values: toml::Table =
            toml::from_str("disk_size = 500\ndisk_typ = \"standard\"").unwrap();
        let mut bag = ParamBag::new("fio", values);
        DiskSpec::from_params(&mut bag).unwrap();
        assert!(matches!(
            bag.finish(),
            Err(ConfigError::UnknownParameter { key, .. }) if key == "disk_typ"
        ));
    }
}
