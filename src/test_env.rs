// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Helpers for integration tests.
//!
//! A TestEnvironment holds a test's private working directory, which doubles
//! as the resource directory for the Local provider: every VM, disk, network,
//! and firewall rule the test provisions shows up as a marker file there, so
//! tests assert on the filesystem instead of on internal state.
//!
//! All access to a test's on-disk state should go through methods here rather
//! than be coded in the tests themselves.

use std::io;
use std::path::PathBuf;

use crate::config::BenchmarkConfig;
use crate::flags::Flags;
use crate::registry::ProviderRegistry;
use crate::spec::BenchmarkSpec;

/// Given a relative `path` in the test directory, prepend the full path to
/// the test directory.
fn test_path(path: &str) -> PathBuf {
    PathBuf::from(std::env::var("CARGO_MANIFEST_DIR").unwrap())
        .join("tests")
        .join(path)
}

pub struct TestEnvironment {
    test_id: String,

    /// The path to this test's private working directory.
    private_dir: PathBuf,
}

impl TestEnvironment {
    /// Set up an environment for a test named `test_id`.
    ///
    /// Creates a unique subdirectory for the test, emptying it first so files
    /// from a previous run don't impact this one.
    pub fn new(test_id: &str) -> Self {
        let private_dir = test_path(&format!("test_output/{test_id}"));
        match std::fs::remove_dir_all(&private_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => panic!("Could not clean up test directory: {e}"),
        };
        std::fs::create_dir_all(&private_dir).unwrap();

        // Run state files land under the shared test output directory. Every
        // test's run uid embeds its test_id, so tests never collide.
        std::env::set_var("RIG_TEMP_DIR", test_path("test_output/tmp"));

        Self {
            test_id: test_id.to_string(),
            private_dir,
        }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.private_dir
    }

    /// Whether a provider marker file (like `vm-...` or `net-...`) exists.
    pub fn has(&self, marker: &str) -> bool {
        self.private_dir.join(marker).exists()
    }

    pub fn read(&self, marker: &str) -> String {
        std::fs::read_to_string(self.private_dir.join(marker))
            .unwrap_or_else(|e| panic!("could not read marker '{marker}': {e}"))
    }

    /// Plant a provider marker file, simulating a resource that reappeared
    /// (or was left behind) outside the orchestrator's control.
    pub fn plant(&self, marker: &str) {
        std::fs::write(self.private_dir.join(marker), "").unwrap();
    }

    pub fn marker_names(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.private_dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    /// Build a config with a single group named `vms` on the Local provider.
    ///
    /// `vm_extras` is appended to the group's vm spec table; `disk_spec`, if
    /// given, becomes the group's disk spec table.
    pub fn group_config(
        &self,
        vm_count: u32,
        disk_count: u32,
        vm_extras: &str,
        disk_spec: Option<&str>,
    ) -> BenchmarkConfig {
        let dir = self.private_dir.display();
        let mut contents = format!(
            r#"
name = "{id}"

[vm_groups.vms]
vm_count = {vm_count}
disk_count = {disk_count}
cloud = "Local"

[vm_groups.vms.vm_spec.Local]
dir = '{dir}'
zone = "here"
{vm_extras}
"#,
            id = self.test_id,
        );
        if let Some(disk_spec) = disk_spec {
            contents.push_str(&format!("\n[vm_groups.vms.disk_spec.Local]\n{disk_spec}\n"));
        }
        BenchmarkConfig::from_str(&contents, "inline").unwrap()
    }

    pub fn registry(&self) -> ProviderRegistry {
        ProviderRegistry::builtin().unwrap()
    }

    /// The run uid `constructed_spec` builds specs under.
    pub fn run_uid(&self) -> String {
        format!("{}-0", self.test_id)
    }

    /// Build a spec for this test with fully-constructed VM objects.
    pub fn constructed_spec(&self, config: BenchmarkConfig, flags: Flags) -> BenchmarkSpec {
        let uid = self.run_uid();
        let mut spec = BenchmarkSpec::new(config, &self.test_id, &uid, flags);
        spec.construct_virtual_machines(&self.registry())
            .expect("could not construct VMs from config");
        spec
    }
}
