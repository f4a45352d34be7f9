// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use rig_lib::flags::Flags;
    use rig_lib::spec::BenchmarkSpec;
    use rig_lib::test_env::TestEnvironment;

    #[tokio::test]
    async fn a_restored_spec_tears_down_what_a_prior_process_provisioned() {
        let env = TestEnvironment::new("resume_teardown");
        let config = env.group_config(
            2,
            1,
            "",
            Some("disk_size = 10\nmount_point = \"/scratch\""),
        );
        let spec = env.constructed_spec(config, Flags::default());
        spec.prepare().await.unwrap();
        spec.save().unwrap();
        drop(spec);

        // A new process would start here: only the run uid and the current
        // process flags carry over.
        let mut restored = BenchmarkSpec::load(&env.run_uid(), Flags::default()).unwrap();
        assert!(!restored.deleted());
        assert_eq!(restored.vms().count(), 2);
        for vm in restored.vms() {
            assert!(env.has(&format!("vm-{}", vm.name)));
        }

        restored.delete().await;
        assert!(restored.deleted());
        assert!(
            env.marker_names().is_empty(),
            "leftovers: {:?}",
            env.marker_names()
        );
    }

    #[tokio::test]
    async fn the_deleted_flag_resets_on_load_and_teardown_stays_idempotent() {
        let env = TestEnvironment::new("resume_deleted");
        let config = env.group_config(1, 0, "", None);
        let mut spec = env.constructed_spec(config, Flags::default());
        spec.prepare().await.unwrap();

        spec.delete().await;
        assert!(spec.deleted());
        spec.save().unwrap();

        // The flag must not survive serialization: a later invocation must
        // always be able to attempt cleanup again.
        let mut restored = BenchmarkSpec::load(&env.run_uid(), Flags::default()).unwrap();
        assert!(!restored.deleted());

        // Teardown already ran, so re-running it performs no work; the
        // resources' own lifecycle makes the second pass a no-op.
        let vm_name = format!("{}-vms-0", env.run_uid());
        env.plant(&format!("vm-{vm_name}"));
        restored.delete().await;
        assert!(restored.deleted());
        assert!(env.has(&format!("vm-{vm_name}")));
    }

    #[tokio::test]
    async fn merged_flags_are_recomputed_for_the_restoring_process() {
        let env = TestEnvironment::new("resume_flags");
        let mut config = env.group_config(1, 0, "", None);
        let mut overrides = toml::Table::new();
        overrides.insert("scratch_disk_size".to_string(), toml::Value::Integer(500));
        config.flags = Some(overrides);

        let spec = env.constructed_spec(config, Flags::default());
        // No explicit flag: the config override shows through.
        assert_eq!(spec.flags().scratch_disk_size, Some(500));
        spec.save().unwrap();

        // The restoring process supplied the flag explicitly, so its value
        // wins over the persisted config's override.
        let explicit = Flags {
            scratch_disk_size: Some(9),
            ..Default::default()
        };
        let restored = BenchmarkSpec::load(&env.run_uid(), explicit).unwrap();
        assert_eq!(restored.flags().scratch_disk_size, Some(9));
    }

    #[tokio::test]
    async fn a_partially_provisioned_spec_can_still_be_restored_and_cleaned() {
        let env = TestEnvironment::new("resume_partial");
        let config = env.group_config(1, 0, "fail_create = true", None);
        let spec = env.constructed_spec(config, Flags::default());

        assert!(spec.prepare().await.is_err());
        spec.save().unwrap();

        let mut restored = BenchmarkSpec::load(&env.run_uid(), Flags::default()).unwrap();
        restored.delete().await;
        assert!(restored.deleted());
        assert!(
            env.marker_names().is_empty(),
            "leftovers: {:?}",
            env.marker_names()
        );
    }
}
