use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing_subscriber::EnvFilter;

use gaia_evolve::experiments::env::{EnvHandle, EnvRegistry};
use gaia_evolve::experiments::metrics::{load_solution, FileStore, MetricsRecorder};
use gaia_evolve::experiments::policy::{Architecture, PolicyEvaluator};
use gaia_evolve::experiments::rollout::{episode_seed, RolloutRunner};
use gaia_evolve::experiments::trainer::{RunInfo, TrainingLoop};
use gaia_evolve::{CmaEs, TrainConfig};

#[derive(Parser)]
#[command(name = "gaia-evolve", about = "Train neural policies with CMA-ES")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a policy and write checkpoints to the output directory
    Train(TrainArgs),
    /// Evaluate a saved solution
    Replay(ReplayArgs),
}

#[derive(Args)]
struct TrainArgs {
    /// JSON config file; flags below override it
    #[arg(long, env = "GAIA_CONFIG")]
    config: Option<PathBuf>,

    /// Environment name (e.g. CartPole-v1)
    #[arg(long)]
    env: Option<String>,

    /// Hidden layer sizes, comma separated (e.g. 16,8)
    #[arg(long, value_delimiter = ',')]
    hidden: Option<Vec<usize>>,

    /// Initial step size
    #[arg(long)]
    sigma0: Option<f64>,

    /// Population size (default 4 + 3 ln n)
    #[arg(long)]
    pop_size: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    max_iterations: Option<usize>,

    /// Write a snapshot every N generations
    #[arg(long)]
    checkpoint_interval: Option<usize>,

    /// Per-episode step cap
    #[arg(long)]
    max_steps: Option<usize>,

    /// Episodes averaged per fitness evaluation
    #[arg(long)]
    eval_episodes: Option<usize>,

    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[arg(long)]
    run_name: Option<String>,

    /// Rollout threads
    #[arg(long, env = "GAIA_WORKERS")]
    workers: Option<usize>,
}

#[derive(Args)]
struct ReplayArgs {
    /// Solution file (`_sol<N>.json` or `_converge.json`)
    #[arg(long)]
    solution: PathBuf,

    #[arg(long, default_value = "CartPole-v1")]
    env: String,

    #[arg(long, value_delimiter = ',')]
    hidden: Vec<usize>,

    #[arg(long, default_value = "5")]
    episodes: usize,

    /// Base seed; pass the training seed to replay its start states
    #[arg(long, default_value = "0")]
    seed: u64,

    #[arg(long)]
    max_steps: Option<usize>,
}

impl TrainArgs {
    fn into_config(self) -> Result<TrainConfig> {
        let mut cfg = match &self.config {
            Some(path) => TrainConfig::load(path)?,
            None => TrainConfig::default(),
        };
        if let Some(v) = self.env {
            cfg.env = v;
        }
        if let Some(v) = self.hidden {
            cfg.hidden = v;
        }
        if let Some(v) = self.sigma0 {
            cfg.sigma0 = v;
        }
        if self.pop_size.is_some() {
            cfg.pop_size = self.pop_size;
        }
        if self.seed.is_some() {
            cfg.seed = self.seed;
        }
        if let Some(v) = self.max_iterations {
            cfg.max_iterations = v;
        }
        if let Some(v) = self.checkpoint_interval {
            cfg.checkpoint_interval = v;
        }
        if self.max_steps.is_some() {
            cfg.max_steps = self.max_steps;
        }
        if let Some(v) = self.eval_episodes {
            cfg.eval_episodes = v;
        }
        if let Some(v) = self.output_dir {
            cfg.output_dir = v;
        }
        if self.run_name.is_some() {
            cfg.run_name = self.run_name;
        }
        if self.workers.is_some() {
            cfg.workers = self.workers;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Train(args) => train(args.into_config()?).await,
        Command::Replay(args) => replay(args),
    }
}

fn resolve(env: &str, hidden: &[usize]) -> Result<(EnvHandle, Architecture)> {
    let handle = EnvRegistry::with_builtins().resolve(env)?;
    let cfg = handle.config();
    let arch = Architecture::for_env(cfg.obs_dim, hidden, cfg.action_space)
        .ok_or_else(|| anyhow!("invalid hidden layer sizes {hidden:?}"))?;
    Ok((handle, arch))
}

async fn train(cfg: TrainConfig) -> Result<()> {
    if let Some(n) = cfg.workers {
        rayon::ThreadPoolBuilder::new()
            .num_threads(n)
            .build_global()
            .context("configuring rollout thread pool")?;
    }

    let (handle, arch) = resolve(&cfg.env, &cfg.hidden)?;
    let seed = cfg.seed.unwrap_or_else(rand::random);
    let run_name = cfg.run_name();
    let max_steps = cfg.max_steps.unwrap_or(handle.config().max_steps);
    let n_params = arch.n_params();

    tracing::info!(
        env = %handle.config(),
        arch = %arch.arch_string(),
        n_params,
        seed,
        run = %run_name,
        output = %cfg.output_dir.display(),
        "Starting training run"
    );

    let optimizer = CmaEs::new(n_params, &cfg.cma_config(seed));
    if optimizer.is_diagonal() {
        tracing::info!(n_params, "Using diagonal covariance");
    }
    let info = RunInfo {
        run_name: run_name.clone(),
        environment: cfg.env.clone(),
        architecture: arch.layers.clone(),
        seed,
    };
    let runner = RolloutRunner::new(handle, arch, max_steps, cfg.eval_episodes, seed);
    let store = FileStore::new(&cfg.output_dir, run_name)?;

    let stop = Arc::new(AtomicBool::new(false));
    let mut training = TrainingLoop::new(optimizer, runner, MetricsRecorder::new(store), cfg.loop_settings())
        .with_run_info(info)
        .with_stop_flag(stop.clone());

    let mut task = tokio::task::spawn_blocking(move || training.run());

    let outcome = tokio::select! {
        res = &mut task => res,
        _ = shutdown_signal() => {
            tracing::info!("Stopping after the current generation");
            stop.store(true, Ordering::Relaxed);
            task.await
        }
    }
    .context("training task panicked")??;

    match &outcome.best {
        Some(best) => tracing::info!(
            state = %outcome.terminal,
            iterations = outcome.iterations,
            best_reward = -best.fitness,
            best_iteration = best.iteration,
            "Run complete"
        ),
        None => tracing::info!(state = %outcome.terminal, "Run complete, no generation evaluated"),
    }
    Ok(())
}

fn replay(args: ReplayArgs) -> Result<()> {
    let (handle, arch) = resolve(&args.env, &args.hidden)?;
    let params = load_solution(&args.solution)?;
    let max_steps = args.max_steps.unwrap_or(handle.config().max_steps);

    let mut evaluator = PolicyEvaluator::new(arch);
    let mut env = handle.make(Some(args.seed));
    let mut total = 0.0;
    for ep in 0..args.episodes {
        let seed = episode_seed(args.seed, ep);
        let reward = RolloutRunner::run(&mut evaluator, env.as_mut(), &params, max_steps, Some(seed))
            .with_context(|| format!("replaying {}", args.solution.display()))?;
        tracing::info!(episode = ep + 1, reward, steps = env.steps(), "Episode");
        total += reward;
    }
    env.close();

    if args.episodes > 0 {
        let mean = total / args.episodes as f64;
        tracing::info!(
            mean,
            solved = mean >= handle.config().solved_threshold,
            "Replay finished"
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async { signal::ctrl_c().await.ok(); };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
