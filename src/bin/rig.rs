// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::path::Path;

use clap::Parser;
use log::{error, info};
use uuid::Uuid;

use rig_lib::config::BenchmarkConfig;
use rig_lib::errors::Error;
use rig_lib::flags::{Flags, RunStage};
use rig_lib::registry::ProviderRegistry;
use rig_lib::spec::BenchmarkSpec;

/// The rig binary provisions, and later tears down, the cloud topology a
/// benchmark run needs.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path of the benchmark config file.
    #[arg(long)]
    config: Option<String>,

    /// Identifier for this run. Pass the same value to a later
    /// `--run-stage cleanup` invocation to resume teardown of that run.
    #[arg(long)]
    run_uri: Option<String>,

    #[command(flatten)]
    flags: Flags,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("RIG_LOG", "info")).init();

    let cli = Cli::parse();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Error launching tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    if rt.block_on(run(cli)).is_err() {
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), ()> {
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => rig_lib::default_config_path(),
    };
    let config = BenchmarkConfig::from_file(&config_path).map_err(|e| error!("{e}"))?;

    let name = benchmark_name(&config, &config_path);
    let run_uri = cli
        .run_uri
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string()[..8].to_string());
    let uid = format!("{name}-{run_uri}");
    let flags = cli.flags.clone();

    let registry = ProviderRegistry::builtin().map_err(|e| error!("{e}"))?;

    match flags.run_stage {
        RunStage::Cleanup => {
            let mut spec = BenchmarkSpec::load(&uid, flags).map_err(|e| error!("{e}"))?;
            spec.delete().await;
            save(&spec)?;
            info!("teardown of run {uid} complete");
        }
        RunStage::Provision => {
            let mut spec = BenchmarkSpec::new(config, &name, &uid, flags);
            spec.construct_virtual_machines(&registry)
                .map_err(|e| error!("{e}"))?;

            let prepared = spec.prepare().await;
            // Persist even a partially-provisioned topology so a later
            // cleanup invocation can find everything that was created.
            save(&spec)?;
            report(prepared)?;
            info!("run {uid} provisioned; tear it down with --run-stage cleanup --run-uri {run_uri}");
        }
        RunStage::All => {
            let mut spec = BenchmarkSpec::new(config, &name, &uid, flags);
            spec.construct_virtual_machines(&registry)
                .map_err(|e| error!("{e}"))?;

            let prepared = spec.prepare().await;
            save(&spec)?;

            // The benchmark workload itself would run here.

            spec.delete().await;
            save(&spec)?;
            report(prepared)?;
        }
    }

    Ok(())
}

fn benchmark_name(config: &BenchmarkConfig, config_path: &str) -> String {
    if let Some(name) = &config.name {
        return name.clone();
    }
    Path::new(config_path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "benchmark".to_string())
}

fn save(spec: &BenchmarkSpec) -> Result<(), ()> {
    spec.save().map(|_| ()).map_err(|e| error!("{e}"))
}

fn report(result: Result<(), Error>) -> Result<(), ()> {
    result.map_err(|e| error!("{e}"))
}
