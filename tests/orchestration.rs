// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use rig_lib::config::BenchmarkConfig;
    use rig_lib::errors::Error;
    use rig_lib::flags::Flags;
    use rig_lib::providers;
    use rig_lib::test_env::TestEnvironment;

    #[tokio::test]
    async fn provisions_and_tears_down_a_group() {
        let env = TestEnvironment::new("simple_lifecycle");
        let config = env.group_config(
            3,
            2,
            "",
            Some("disk_size = 10\ndisk_type = \"standard\"\nmount_point = \"/scratch\""),
        );
        let mut spec = env.constructed_spec(config, Flags::default());

        assert_eq!(spec.vms().count(), 3);
        for vm in spec.vms() {
            // Two disks were built from one spec, so each got its own
            // mount point suffix.
            let mounts: Vec<_> = vm
                .disk_specs
                .iter()
                .map(|s| s.mount_point.clone().unwrap())
                .collect();
            assert_eq!(mounts, vec!["/scratch0", "/scratch1"]);
        }

        spec.prepare().await.unwrap();

        for vm in spec.vms() {
            assert!(env.has(&format!("vm-{}", vm.name)));
            // No local disks: remote numbering starts right after the
            // (empty) local range.
            assert_eq!(vm.scratch_disk_numbers(), vec![Some(1), Some(2)]);
            // The VM environment was prepared only after both scratch disks
            // existed.
            assert_eq!(env.read(&format!("env-{}", vm.name)), "2");
            assert!(env.has(&format!("fw-{}-tcp-22", vm.name)));
        }
        let uid = env.run_uid();
        assert!(env.has(&format!("net-rig-{uid}-here")));
        assert_eq!(spec.network_names(), vec![format!("rig-{uid}-here")]);

        spec.delete().await;
        assert!(spec.deleted());
        assert!(env.marker_names().is_empty(), "leftovers: {:?}", env.marker_names());
    }

    #[tokio::test]
    async fn local_disks_number_from_one_in_every_vm() {
        let env = TestEnvironment::new("local_disks");
        let config = env.group_config(
            3,
            2,
            "max_local_disks = 4",
            Some("disk_type = \"local\"\nmount_point = \"/scratch\""),
        );
        let spec = env.constructed_spec(config, Flags::default());
        spec.prepare().await.unwrap();

        // Each VM numbers its own local disks independently, starting at 1.
        for vm in spec.vms() {
            assert_eq!(vm.scratch_disk_numbers(), vec![Some(1), Some(2)]);
            assert!(env.has(&format!("localdisks-{}", vm.name)));
        }
    }

    #[tokio::test]
    async fn local_disk_allocation_beyond_the_maximum_fails_per_vm() {
        let env = TestEnvironment::new("local_disk_overflow");
        let config = env.group_config(
            2,
            2,
            "max_local_disks = 1",
            Some("disk_type = \"local\"\nmount_point = \"/scratch\""),
        );
        let spec = env.constructed_spec(config, Flags::default());

        let error = spec.prepare().await.unwrap_err();
        let message = error.to_string();
        assert!(
            message.contains("cannot allocate another local disk"),
            "unexpected error: {message}"
        );
        // Both VMs overflowed independently.
        match error {
            Error::Aggregate(aggregate) => assert_eq!(aggregate.failures.len(), 2),
            other => panic!("expected an aggregate failure, got {other}"),
        }

        // Each VM kept its first local disk; the overflowing one was never
        // allocated.
        for vm in spec.vms() {
            assert_eq!(vm.scratch_disk_numbers(), vec![Some(1)]);
        }
    }

    #[tokio::test]
    async fn striped_disks_fan_out_to_members() {
        let env = TestEnvironment::new("striped");
        let config = env.group_config(
            1,
            1,
            "",
            Some("disk_size = 10\nnum_striped_disks = 2\nmount_point = \"/scratch\""),
        );
        let spec = env.constructed_spec(config, Flags::default());
        spec.prepare().await.unwrap();

        let vm = spec.vms().next().unwrap();
        // One logical scratch disk whose members took the two remote numbers.
        assert_eq!(vm.scratch_disk_count(), 1);
        assert_eq!(vm.striped_member_numbers(), vec![vec![Some(1), Some(2)]]);
        // A single disk from one spec keeps its mount point unsuffixed.
        assert_eq!(
            vm.scratch_disk_mount_points(),
            vec![Some("/scratch".to_string())]
        );
        assert!(env.has(&format!("disk-{}-data-0-0", vm.name)));
        assert!(env.has(&format!("disk-{}-data-0-1", vm.name)));
    }

    #[tokio::test]
    async fn sibling_vm_failures_do_not_stop_others() {
        let env = TestEnvironment::new("partial_failure");
        let dir = env.dir().display().to_string();
        let config = BenchmarkConfig::from_str(
            &format!(
                r#"
                name = "partial_failure"

                [vm_groups.good]
                vm_count = 2
                cloud = "Local"

                [vm_groups.good.vm_spec.Local]
                dir = '{dir}'

                [vm_groups.bad]
                vm_count = 1
                cloud = "Local"

                [vm_groups.bad.vm_spec.Local]
                dir = '{dir}'
                fail_create = true
                "#
            ),
            "inline",
        )
        .unwrap();
        let spec = env.constructed_spec(config, Flags::default());

        let error = spec.prepare().await.unwrap_err();
        match error {
            Error::Aggregate(aggregate) => assert_eq!(aggregate.failures.len(), 1),
            other => panic!("expected an aggregate failure, got {other}"),
        }

        // The healthy group's VMs were still created.
        let uid = env.run_uid();
        assert!(env.has(&format!("vm-{uid}-good-0")));
        assert!(env.has(&format!("vm-{uid}-good-1")));
        assert!(!env.has(&format!("vm-{uid}-bad-0")));
    }

    #[tokio::test]
    async fn teardown_continues_past_firewall_failures() {
        let env = TestEnvironment::new("firewall_failure");
        let config = env.group_config(1, 0, "fail_disallow_ports = true", None);
        let mut spec = env.constructed_spec(config, Flags::default());
        spec.prepare().await.unwrap();

        let uid = env.run_uid();
        let vm_name = format!("{uid}-vms-0");
        assert!(env.has(&format!("fw-{vm_name}-tcp-22")));
        assert_eq!(spec.firewall("Local").unwrap().open_rule_count(), 1);

        spec.delete().await;

        // The firewall teardown failed, but the VM and network stages still
        // ran and the spec still counts as deleted.
        assert!(env.has(&format!("fw-{vm_name}-tcp-22")));
        assert!(!env.has(&format!("vm-{vm_name}")));
        assert!(!env.has(&format!("net-rig-{uid}-here")));
        assert!(spec.deleted());
    }

    #[tokio::test]
    async fn delete_twice_performs_teardown_once() {
        let env = TestEnvironment::new("delete_idempotent");
        let config = env.group_config(1, 0, "", None);
        let mut spec = env.constructed_spec(config, Flags::default());
        spec.prepare().await.unwrap();

        spec.delete().await;
        assert!(spec.deleted());

        // A marker that reappears is not touched by a second delete.
        let vm_name = format!("{}-vms-0", env.run_uid());
        env.plant(&format!("vm-{vm_name}"));
        spec.delete().await;
        assert!(env.has(&format!("vm-{vm_name}")));
    }

    #[tokio::test]
    async fn static_vms_come_first_and_are_never_created() {
        let env = TestEnvironment::new("static_vms");
        let dir = env.dir().display().to_string();
        let config = BenchmarkConfig::from_str(
            &format!(
                r#"
                name = "static_vms"

                [vm_groups.vms]
                vm_count = 3
                cloud = "Local"

                [[vm_groups.vms.static_vms]]
                ip_address = "10.0.0.1"
                install_packages = false

                [[vm_groups.vms.static_vms]]
                ip_address = "10.0.0.2"

                [vm_groups.vms.vm_spec.Local]
                dir = '{dir}'
                "#
            ),
            "inline",
        )
        .unwrap();
        let spec = env.constructed_spec(config, Flags::default());

        let vms: Vec<_> = spec.vms().collect();
        assert_eq!(vms.len(), 3);
        assert!(vms[0].is_static && vms[1].is_static);
        assert!(!vms[2].is_static);
        assert_eq!(vms[0].cloud, providers::STATIC);
        assert_eq!(vms[0].ip_address().as_deref(), Some("10.0.0.1"));

        spec.prepare().await.unwrap();

        // Only the dynamic VM produced a provider marker.
        let markers = env.marker_names();
        let vm_markers: Vec<_> = markers
            .iter()
            .filter(|name| name.starts_with("vm-") && !name.ends_with(".metadata"))
            .collect();
        assert_eq!(vm_markers.len(), 1);
    }

    #[tokio::test]
    async fn a_topology_with_no_vms_provisions_nothing() {
        let env = TestEnvironment::new("no_vms");
        let dir = env.dir().display().to_string();
        let config = BenchmarkConfig::from_str(
            &format!(
                r#"
                name = "no_vms"

                [vm_groups.vms]
                vm_count = 0
                cloud = "Local"

                [vm_groups.vms.vm_spec.Local]
                dir = '{dir}'
                "#
            ),
            "inline",
        )
        .unwrap();
        let mut spec = env.constructed_spec(config, Flags::default());
        assert_eq!(spec.vms().count(), 0);

        spec.prepare().await.unwrap();
        assert!(env.marker_names().is_empty());

        spec.delete().await;
        assert!(spec.deleted());
    }
}
