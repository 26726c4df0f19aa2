// SPDX-License-Identifier: MIT OR Apache-2.0

//! fedclust - run clustered federated learning simulations
//!
//! Runs one or more configurations back to back on a synthetic Gaussian-blob
//! dataset, using the softmax reference model as trainer and evaluator.
//! Each configuration is fully isolated: fresh partition, fresh models.

mod render;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use fedclust_neural::config::{config_paths, RunConfig};
use fedclust_neural::{
    Collaborators, ProjectionEmbedder, RoundOrchestrator, SoftmaxModel, SyntheticDataset, SyntheticShape,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Command-line arguments
#[derive(Parser, Debug)]
#[clap(
    name = "fedclust",
    about = "Clustered federated learning simulator",
    version
)]
struct Args {
    /// Config file (.toml/.json) or a directory of them
    config: Option<PathBuf>,

    /// Built-in configurations to run when no config path is given
    #[clap(long, value_enum)]
    preset: Vec<Preset>,

    /// Directory for CSV summaries, membership snapshots and checkpoints
    #[clap(long)]
    results_dir: Option<PathBuf>,

    /// Override the worker pool size of every config
    #[clap(long)]
    workers: Option<usize>,

    /// Override the round count of every config
    #[clap(long)]
    rounds: Option<usize>,

    /// Number of synthetic labels
    #[clap(long, default_value = "10")]
    labels: usize,

    /// Synthetic training samples per label
    #[clap(long, default_value = "300")]
    train_per_label: usize,

    /// Synthetic test samples per label
    #[clap(long, default_value = "200")]
    test_per_label: usize,

    /// Feature dimension of the synthetic data
    #[clap(long, default_value = "16")]
    dim: usize,

    /// Seed of the synthetic dataset
    #[clap(long, default_value = "0")]
    data_seed: u64,

    /// SGD learning rate of the reference model
    #[clap(long, default_value = "0.05")]
    learning_rate: f32,

    /// Print the final membership matrix of every run
    #[clap(long)]
    show_membership: bool,

    /// Enable debug logging
    #[clap(long)]
    debug: bool,
}

/// Built-in configuration
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Preset {
    /// One global cluster
    Fedavg,
    /// Every client alone
    Local,
    /// Clusters from the clients' dominant labels
    Oracle,
    /// k-means over model parameters
    MultiCenter,
}

impl Preset {
    fn config(self) -> RunConfig {
        match self {
            Preset::Fedavg => RunConfig::fedavg(),
            Preset::Local => RunConfig::local_only(),
            Preset::Oracle => RunConfig::oracle_clusters(),
            Preset::MultiCenter => RunConfig::parameter_clusters(),
        }
    }
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_configs(args: &Args) -> Result<Vec<RunConfig>> {
    let configs = match &args.config {
        Some(path) if path.is_dir() => {
            let paths = config_paths(path).with_context(|| format!("Failed to list {}", path.display()))?;
            if paths.is_empty() {
                bail!("No .toml or .json configs in {}", path.display());
            }
            paths
                .iter()
                .map(|p| RunConfig::from_path(p).with_context(|| format!("Failed to load {}", p.display())))
                .collect::<Result<Vec<_>>>()?
        }
        Some(path) => {
            vec![RunConfig::from_path(path).with_context(|| format!("Failed to load {}", path.display()))?]
        }
        None if args.preset.is_empty() => [Preset::Fedavg, Preset::Local, Preset::Oracle, Preset::MultiCenter]
            .into_iter()
            .map(Preset::config)
            .collect(),
        None => args.preset.iter().map(|p| p.config()).collect(),
    };

    Ok(configs
        .into_iter()
        .map(|mut config| {
            if let Some(workers) = args.workers {
                config.workers = Some(workers);
            }
            if let Some(rounds) = args.rounds {
                config.rounds = rounds;
            }
            config
        })
        .collect())
}

/// Main entry point
fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let configs = load_configs(&args)?;

    let shape = SyntheticShape {
        num_labels: args.labels,
        train_per_label: args.train_per_label,
        test_per_label: args.test_per_label,
        dim: args.dim,
        ..SyntheticShape::default()
    };
    let data = Arc::new(SyntheticDataset::generate(shape, args.data_seed).context("Failed to generate dataset")?);
    let model = Arc::new(SoftmaxModel::new(data.clone()).with_learning_rate(args.learning_rate));
    let collaborators = Collaborators {
        trainer: model.clone(),
        evaluator: model.clone(),
        factory: model,
        embedder: Some(Arc::new(ProjectionEmbedder::new(data.clone(), args.data_seed))),
    };

    tracing::info!(configs = configs.len(), "Running configurations");

    for config in configs {
        let name = config.name.clone();
        let mut orchestrator = RoundOrchestrator::new(config, data.labels(), collaborators.clone())
            .with_context(|| format!("Invalid configuration {}", name))?;
        if let Some(dir) = &args.results_dir {
            orchestrator = orchestrator.with_results_dir(dir);
        }
        let outcome = orchestrator.run().with_context(|| format!("Run {} failed", name))?;

        println!("== {} ({} rounds) ==", outcome.config_name, outcome.completed_rounds);
        print!("{}", render::render_history(&outcome.history));
        if args.show_membership {
            print!("{}", render::render_membership(&outcome.membership));
        }
    }

    if let Some(dir) = &args.results_dir {
        println!("Results written to {}", dir.display());
    }
    Ok(())
}
