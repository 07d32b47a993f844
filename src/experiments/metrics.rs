//! Reward history and solution snapshots.
//!
//! Artifacts for a run named `<run>`:
//! - `<run>_sol<iteration>.json`: best solution at a checkpoint
//! - `<run>_reward.json`: full reward history, overwritten at each checkpoint
//! - `<run>_converge.json`: best solution at the end of the run
//! - `<run>_summary.json`: run metadata
//!
//! Solutions and histories are plain JSON arrays of numbers.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::optim::StopReason;

/// Lowest-cost parameter vector seen so far.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BestSolution {
    pub params: Vec<f64>,
    pub fitness: f64,
    /// Iteration (1-based) whose generation produced it.
    pub iteration: usize,
}

/// One aggregate reward per completed generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RewardHistory(Vec<f64>);

impl RewardHistory {
    pub fn push(&mut self, reward: f64) {
        self.0.push(reward);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
}

/// Metadata written next to the final artifacts.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_name: String,
    pub environment: String,
    pub architecture: Vec<usize>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub terminal_state: String,
    pub stop_reasons: Vec<StopReason>,
    pub iterations: usize,
    pub best_fitness: Option<f64>,
    pub best_iteration: Option<usize>,
    pub seed: u64,
}

/// Durable storage for run artifacts.
pub trait ArtifactStore {
    fn save_snapshot(&mut self, iteration: usize, best: &BestSolution) -> Result<()>;
    fn save_history(&mut self, history: &RewardHistory) -> Result<()>;
    fn save_converged(&mut self, best: &BestSolution) -> Result<()>;
    fn save_summary(&mut self, summary: &RunSummary) -> Result<()>;
}

/// JSON files in one directory, each written atomically.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
    run_name: String,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>, run_name: impl Into<String>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating output directory {}", dir.display()))?;
        Ok(FileStore {
            dir,
            run_name: run_name.into(),
        })
    }

    pub fn snapshot_path(&self, iteration: usize) -> PathBuf {
        self.dir.join(format!("{}_sol{}.json", self.run_name, iteration))
    }

    pub fn history_path(&self) -> PathBuf {
        self.dir.join(format!("{}_reward.json", self.run_name))
    }

    pub fn converged_path(&self) -> PathBuf {
        self.dir.join(format!("{}_converge.json", self.run_name))
    }

    pub fn summary_path(&self) -> PathBuf {
        self.dir.join(format!("{}_summary.json", self.run_name))
    }
}

/// Write to a sibling temp file, then rename over the target.
fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_vec_pretty(value)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, body).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("renaming {} into place", tmp.display()))?;
    Ok(())
}

impl ArtifactStore for FileStore {
    fn save_snapshot(&mut self, iteration: usize, best: &BestSolution) -> Result<()> {
        write_json_atomic(&self.snapshot_path(iteration), &best.params)
    }

    fn save_history(&mut self, history: &RewardHistory) -> Result<()> {
        write_json_atomic(&self.history_path(), history)
    }

    fn save_converged(&mut self, best: &BestSolution) -> Result<()> {
        write_json_atomic(&self.converged_path(), &best.params)
    }

    fn save_summary(&mut self, summary: &RunSummary) -> Result<()> {
        write_json_atomic(&self.summary_path(), summary)
    }
}

/// Load a saved solution (`_sol<N>` or `_converge` file).
pub fn load_solution(path: &Path) -> Result<Vec<f64>> {
    let data = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing solution {}", path.display()))
}

/// Load a saved reward history.
pub fn load_history(path: &Path) -> Result<Vec<f64>> {
    let data = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing history {}", path.display()))
}

/// Keeps the reward history and pushes snapshots to a store.
pub struct MetricsRecorder<S> {
    store: S,
    history: RewardHistory,
}

impl<S: ArtifactStore> MetricsRecorder<S> {
    pub fn new(store: S) -> Self {
        MetricsRecorder {
            store,
            history: RewardHistory::default(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn history(&self) -> &RewardHistory {
        &self.history
    }

    pub fn record_generation(&mut self, aggregate_reward: f64) {
        self.history.push(aggregate_reward);
    }

    /// Persist the best solution and the whole history so far. Failures are
    /// logged and swallowed: the next checkpoint overwrites forward.
    pub fn checkpoint(&mut self, iteration: usize, best: Option<&BestSolution>) -> bool {
        let mut ok = true;
        if let Some(best) = best {
            if let Err(e) = self.store.save_snapshot(iteration, best) {
                tracing::warn!(iteration, "Checkpoint solution write failed: {e:#}");
                ok = false;
            }
        }
        if let Err(e) = self.store.save_history(&self.history) {
            tracing::warn!(iteration, "Checkpoint history write failed: {e:#}");
            ok = false;
        }
        if ok {
            tracing::debug!(iteration, generations = self.history.len(), "Checkpoint written");
        }
        ok
    }

    /// Final converged-solution snapshot, complete history, and summary.
    pub fn finalize(&mut self, best: Option<&BestSolution>, summary: &RunSummary) -> Result<()> {
        if let Some(best) = best {
            self.store.save_converged(best).context("writing final solution")?;
        }
        self.store.save_history(&self.history).context("writing reward history")?;
        self.store.save_summary(summary).context("writing run summary")?;
        Ok(())
    }
}
