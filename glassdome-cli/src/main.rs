//! `glassdome`: single binary wiring the Deployment & Lifecycle Core
//! together - the execution engine, network allocator, hot spare pool,
//! state reconciler, and lab orchestrator - behind one `clap`-derived
//! CLI, grounded in mvirt-vmm/mvirt-node's `clap::Parser` + `tracing`
//! binary shape (this crate has no gRPC surface of its own: everything
//! it wires together lives in-process).

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use config::GlassdomeConfig;
use glassdome_audit::AuditLogger;
use glassdome_orchestrator::{LabOrchestrator, LabSpec};
use glassdome_platform::{LocalSimAdapter, PlatformAdapter};
use glassdome_pool::HotSparePool;
use glassdome_reconciler::StateReconciler;
use glassdome_store::{DataStore, InMemoryStore};

#[derive(Parser)]
#[command(name = "glassdome")]
#[command(about = "Cyber-range orchestrator: labs, hot spares, and state reconciliation")]
struct Cli {
    /// Path to a TOML config file (hot-spare pool families, reconciler
    /// cadence, platform instance tag). Defaults if omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a lab spec file and report whether it is well-formed.
    Validate {
        /// Path to a JSON lab spec file.
        spec: PathBuf,
    },
    /// Print the execution plan (parallel task layers) for a lab spec
    /// without running anything.
    Plan {
        spec: PathBuf,
    },
    /// Deploy a lab spec against the configured platform adapter.
    Deploy {
        spec: PathBuf,
    },
    /// Print current hot-spare pool status per configured OS family.
    PoolStatus,
    /// Run the state reconciler loop standalone for a fixed number of
    /// cycles (useful for smoke-testing drift detection without a full
    /// deployment).
    Reconcile {
        /// Number of reconciliation cycles to run before exiting.
        #[arg(long, default_value = "1")]
        cycles: u32,
    },
}

fn load_spec(path: &PathBuf) -> Result<LabSpec> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading lab spec {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing lab spec {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("glassdome=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = GlassdomeConfig::load(cli.config.as_deref())?;

    let store: Arc<dyn DataStore> = Arc::new(InMemoryStore::new());
    let platform: Arc<dyn PlatformAdapter> = Arc::new(LocalSimAdapter::new());
    let audit = Arc::new(AuditLogger::new("glassdome-cli"));

    match cli.command {
        Commands::Validate { spec } => {
            let spec = load_spec(&spec)?;
            println!(
                "lab spec '{}' is well-formed: {} network(s), {} vm(s)",
                spec.name,
                spec.networks.len(),
                spec.vms.len()
            );
        }
        Commands::Plan { spec } => {
            let spec = load_spec(&spec)?;
            let orchestrator =
                LabOrchestrator::new(store, platform, audit, config.platform_instance.clone());
            let plan = orchestrator
                .plan(&spec)
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            for (i, layer) in plan.iter().enumerate() {
                println!("layer {i}: {}", layer.join(", "));
            }
        }
        Commands::Deploy { spec } => {
            let spec = load_spec(&spec)?;
            let orchestrator =
                LabOrchestrator::new(store, platform, audit, config.platform_instance.clone());
            let report = orchestrator
                .deploy(spec)
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.success {
                std::process::exit(1);
            }
        }
        Commands::PoolStatus => {
            let families = config.family_configs(&config.platform_instance);
            let pool = HotSparePool::new(store, platform, audit, families);
            pool.start().await;
            let status = pool.pool_status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
            pool.stop().await;
        }
        Commands::Reconcile { cycles } => {
            let reconciler =
                StateReconciler::new(store, platform, audit, config.reconciler_interval_secs);
            for cycle in 0..cycles.max(1) {
                let results = reconciler.run_cycle().await;
                let drifted = results.iter().filter(|r| r.drifted).count();
                println!("cycle {cycle}: {} checks, {drifted} drifted", results.len());
            }
            let status = reconciler.status().await;
            println!("total_checks={} recent_drift={}", status.total_checks, status.recent_drift_count);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_spec_rejects_malformed_json() {
        let mut file = tempfile_with(b"{ not json").unwrap();
        let err = load_spec(&file.path_buf()).unwrap_err();
        assert!(err.to_string().contains("parsing lab spec"));
        file.cleanup();
    }

    #[test]
    fn load_spec_ignores_unknown_fields() {
        let json = r#"{
            "lab_id": "lab-1",
            "name": "Test",
            "networks": [],
            "vms": [],
            "max_parallel": 2,
            "fail_fast": true,
            "post_deployment_scripts": [],
            "some_future_field": 42
        }"#;
        let mut file = tempfile_with(json.as_bytes()).unwrap();
        let spec = load_spec(&file.path_buf()).unwrap();
        assert_eq!(spec.lab_id, "lab-1");
        file.cleanup();
    }

    struct TempFile {
        path: PathBuf,
    }

    impl TempFile {
        fn path_buf(&self) -> PathBuf {
            self.path.clone()
        }
        fn cleanup(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    fn tempfile_with(contents: &[u8]) -> std::io::Result<TempFile> {
        let path = std::env::temp_dir().join(format!("glassdome-cli-test-{}.json", uuid::Uuid::new_v4()));
        let mut f = std::fs::File::create(&path)?;
        f.write_all(contents)?;
        Ok(TempFile { path })
    }
}
