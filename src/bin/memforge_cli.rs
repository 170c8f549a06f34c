use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use memforge::logging::init_logging_default;
use memforge::{Device, MemoryConfig, MemoryManager};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Parser, Debug)]
#[command(name = "memforge-cli", version)]
#[command(about = "Inspect memforge configuration and run synthetic workloads", long_about = None)]
struct Cli {
    /// JSON configuration file (defaults are used when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a configuration (after MEMFORGE_* overrides) and print it
    CheckConfig,
    /// Print the default configuration as JSON
    Defaults,
    /// Drive a manager with a random multi-model workload
    Simulate {
        /// Number of models
        #[arg(long, default_value_t = 4)]
        models: usize,
        /// Layers per model
        #[arg(long, default_value_t = 8)]
        layers: usize,
        /// Bytes per layer
        #[arg(long, default_value_t = 1 << 20)]
        layer_bytes: usize,
        /// Requests to issue
        #[arg(long, default_value_t = 200)]
        requests: usize,
        /// Run a maintenance tick every N requests
        #[arg(long, default_value_t = 10)]
        tick_every: usize,
        /// RNG seed
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Idle time before a model may be offloaded
        #[arg(long, default_value_t = 0.0)]
        eligibility_secs: f64,
        /// Also print Prometheus metrics
        #[arg(long)]
        metrics: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<MemoryConfig> {
    let config = match path {
        Some(path) => MemoryConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => MemoryConfig::default(),
    };
    Ok(config.apply_env_overrides()?)
}

/// Small pools so a few dozen megabytes of weights create real pressure
fn simulation_defaults() -> MemoryConfig {
    MemoryConfig::new()
        .with_pool_sizes(Default::default())
        .with_pool_size(Device::Gpu(0), 48 << 20)
        .with_pool_size(Device::Cpu, 256 << 20)
        .with_cache_size_gb(0.04)
        .with_monitoring_interval(0.05)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging_default();
    let cli = Cli::parse();

    match cli.command {
        Commands::Defaults => {
            println!("{}", MemoryConfig::default().to_json_pretty()?);
        }
        Commands::CheckConfig => {
            let config = load_config(cli.config.as_ref())?;
            println!("{}", config.to_json_pretty()?);
            eprintln!("configuration is valid");
        }
        Commands::Simulate {
            models,
            layers,
            layer_bytes,
            requests,
            tick_every,
            seed,
            eligibility_secs,
            metrics,
        } => {
            let config = match cli.config.as_ref() {
                Some(_) => load_config(cli.config.as_ref())?,
                None => simulation_defaults().apply_env_overrides()?,
            }
            .with_offload_eligibility_secs(eligibility_secs);
            config.validate()?;

            let manager = Arc::new(MemoryManager::from_config(config)?);
            let background = Arc::clone(&manager).start_background();

            let workload = Workload {
                models,
                layers,
                layer_bytes,
                requests,
                tick_every: tick_every.max(1),
                seed,
            };
            let worker = Arc::clone(&manager);
            let summary = tokio::task::spawn_blocking(move || workload.run(&worker)).await??;

            background.stop().await;

            eprintln!(
                "{} requests in {:.2?}: {} layer loads, {} loader calls, {} ticks",
                summary.requests, summary.elapsed, summary.loads, summary.loader_calls, summary.ticks
            );
            println!("{}", serde_json::to_string_pretty(&manager.report())?);
            if metrics {
                println!("{}", manager.export_metrics());
            }
        }
    }

    Ok(())
}

struct Workload {
    models: usize,
    layers: usize,
    layer_bytes: usize,
    requests: usize,
    tick_every: usize,
    seed: u64,
}

struct WorkloadSummary {
    requests: usize,
    loads: usize,
    loader_calls: usize,
    ticks: usize,
    elapsed: Duration,
}

impl Workload {
    fn run(&self, manager: &MemoryManager) -> anyhow::Result<WorkloadSummary> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let home = manager.config().cache_device;
        let names: Vec<String> = (0..self.models).map(|i| format!("model-{}", i)).collect();
        for name in &names {
            manager.register_model(name, home)?;
        }

        let started = Instant::now();
        let mut summary = WorkloadSummary {
            requests: 0,
            loads: 0,
            loader_calls: 0,
            ticks: 0,
            elapsed: Duration::ZERO,
        };

        for request in 0..self.requests {
            // Skewed popularity: lower-numbered models are hotter
            let a = rng.gen_range(0..self.models.max(1));
            let b = rng.gen_range(0..self.models.max(1));
            let model = &names[a.min(b)];

            let _lease = manager.begin_inference(model)?;
            for layer in 0..self.layers {
                let layer_name = format!("layers.{}", layer);
                let mut called = false;
                manager.load_weights(model, &layer_name, || {
                    called = true;
                    let mut weights = vec![0u8; self.layer_bytes];
                    rng.fill(&mut weights[..]);
                    Ok(weights)
                })?;
                summary.loads += 1;
                if called {
                    summary.loader_calls += 1;
                }
            }
            summary.requests += 1;

            if (request + 1) % self.tick_every == 0 {
                manager.tick()?;
                summary.ticks += 1;
            }
        }

        summary.elapsed = started.elapsed();
        Ok(summary)
    }
}
