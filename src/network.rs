// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Networks and firewalls: resources shared by every VM of one cloud (and,
//! for networks, one zone). They live in maps on the benchmark spec and are
//! discovered there through lock-protected get-or-create, so one key is only
//! ever materialized once.

use std::collections::BTreeSet;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::errors::{ProviderError, ResourceError};
use crate::providers::{gcp, local};
use crate::resource::{lock, Lifecycle};

#[derive(Debug, Serialize, Deserialize)]
pub enum NetworkBackend {
    Gce(gcp::GceNetwork),
    Local(local::LocalNetwork),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    pub cloud: String,
    pub zone: Option<String>,
    lifecycle: Lifecycle,
    pub backend: NetworkBackend,
}

impl Network {
    /// The key identifying the network shared by VMs of one cloud and zone.
    pub fn key_for(cloud: &str, zone: Option<&str>) -> String {
        match zone {
            Some(zone) => format!("{cloud}.{zone}"),
            None => cloud.to_string(),
        }
    }

    pub fn new(name: &str, cloud: &str, zone: Option<&str>, backend: NetworkBackend) -> Self {
        Network {
            name: name.to_string(),
            cloud: cloud.to_string(),
            zone: zone.map(str::to_string),
            lifecycle: Lifecycle::new(),
            backend,
        }
    }

    pub async fn create(&self) -> Result<(), ResourceError> {
        if !self.lifecycle.begin_create() {
            return Ok(());
        }
        match &self.backend {
            NetworkBackend::Gce(gce) => gce.create(self).await,
            NetworkBackend::Local(local) => local.create(self).await,
        }
        .map_err(|e| self.error("create", e))?;
        self.lifecycle.finish_create();
        Ok(())
    }

    pub async fn delete(&self) -> Result<(), ResourceError> {
        if !self.lifecycle.begin_delete() {
            return Ok(());
        }
        match &self.backend {
            NetworkBackend::Gce(gce) => gce.delete(self).await,
            NetworkBackend::Local(local) => local.delete(self).await,
        }
        .map_err(|e| self.error("delete", e))?;
        self.lifecycle.finish_delete();
        Ok(())
    }

    pub async fn exists(&self) -> Result<bool, ResourceError> {
        match &self.backend {
            NetworkBackend::Gce(gce) => gce.exists(self).await,
            NetworkBackend::Local(local) => local.exists(self).await,
        }
        .map_err(|e| self.error("exists", e))
    }

    fn error(&self, op: &'static str, source: ProviderError) -> ResourceError {
        ResourceError::Operation {
            cloud: self.cloud.clone(),
            kind: "network",
            name: self.name.clone(),
            op,
            source,
        }
    }
}

/// One allowed (VM, port) pair, tracked so teardown knows which rules to
/// remove.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FirewallRule {
    pub vm_name: String,
    pub port: u16,
}

impl FirewallRule {
    pub fn rule_name(&self) -> String {
        format!("{}-tcp-{}", self.vm_name, self.port)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub enum FirewallBackend {
    Gce(gcp::GceFirewall),
    Local(local::LocalFirewall),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Firewall {
    pub cloud: String,

    #[serde(with = "lock")]
    rules: Mutex<BTreeSet<FirewallRule>>,

    pub backend: FirewallBackend,
}

impl Firewall {
    pub fn new(cloud: &str, backend: FirewallBackend) -> Self {
        Firewall {
            cloud: cloud.to_string(),
            rules: Mutex::new(BTreeSet::new()),
            backend,
        }
    }

    /// Open `port` for inbound traffic to `vm_name`. Opening a port that is
    /// already open is a no-op.
    pub async fn allow_port(&self, vm_name: &str, port: u16) -> Result<(), ResourceError> {
        let rule = FirewallRule {
            vm_name: vm_name.to_string(),
            port,
        };
        if self.rules.lock().unwrap().contains(&rule) {
            return Ok(());
        }

        match &self.backend {
            FirewallBackend::Gce(gce) => gce.allow_port(&rule).await,
            FirewallBackend::Local(local) => local.allow_port(&rule).await,
        }
        .map_err(|e| self.error("allow-port", &rule.rule_name(), e))?;

        self.rules.lock().unwrap().insert(rule);
        Ok(())
    }

    /// Remove every rule this firewall created. The first failing rule aborts
    /// the loop; rules already removed stay removed.
    pub async fn disallow_all_ports(&self) -> Result<(), ResourceError> {
        let rules: Vec<FirewallRule> = self.rules.lock().unwrap().iter().cloned().collect();

        for rule in rules {
            match &self.backend {
                FirewallBackend::Gce(gce) => gce.disallow_port(&rule).await,
                FirewallBackend::Local(local) => local.disallow_port(&rule).await,
            }
            .map_err(|e| self.error("disallow-port", &rule.rule_name(), e))?;

            self.rules.lock().unwrap().remove(&rule);
        }
        Ok(())
    }

    pub fn open_rule_count(&self) -> usize {
        self.rules.lock().unwrap().len()
    }

    fn error(&self, op: &'static str, rule: &str, source: ProviderError) -> ResourceError {
        ResourceError::Operation {
            cloud: self.cloud.clone(),
            kind: "firewall",
            name: rule.to_string(),
            op,
            source,
        }
    }
}
