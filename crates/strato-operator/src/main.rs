//! Strato - Kubernetes-native inference control plane

use std::path::PathBuf;

use clap::Parser;
use kube::CustomResourceExt;

use strato_common::crd::Model;
use strato_common::telemetry::{init_telemetry, TelemetryConfig};

mod config;
mod run;

/// Strato control plane: OpenAI-compatible gateway + model autoscaler + workload reconciler
#[derive(Parser, Debug)]
#[command(name = "strato", version, about, long_about = None)]
struct Cli {
    /// Generate the Model CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Path to the system config YAML; defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Model::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig::default())
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    let cfg = config::Config::load(cli.config.as_deref())?;
    run::run(cfg).await
}
