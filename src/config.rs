use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::experiments::optim::CmaEsConfig;
use crate::experiments::trainer::LoopSettings;

/// Training run configuration. Loaded from JSON, then overridden by CLI flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainConfig {
    pub env: String,
    /// Hidden layer sizes; empty means a linear policy.
    pub hidden: Vec<usize>,
    pub sigma0: f64,
    pub pop_size: Option<usize>,
    /// Drawn at random (and logged) when unset.
    pub seed: Option<u64>,
    pub max_iterations: usize,
    pub checkpoint_interval: usize,
    /// Per-episode step cap; the environment's own cap when unset.
    pub max_steps: Option<usize>,
    pub eval_episodes: usize,
    pub failure_cost: f64,
    pub output_dir: PathBuf,
    /// Artifact file prefix; derived from the environment name when unset.
    pub run_name: Option<String>,
    /// Rollout threads; all cores when unset.
    pub workers: Option<usize>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            env: "CartPole-v1".to_string(),
            hidden: Vec::new(),
            sigma0: 0.5,
            pop_size: None,
            seed: None,
            max_iterations: 1000,
            checkpoint_interval: 50,
            max_steps: None,
            eval_episodes: 1,
            failure_cost: 1e6,
            output_dir: PathBuf::from("."),
            run_name: None,
            workers: None,
        }
    }
}

impl TrainConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&data).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.env.is_empty() {
            bail!("env must be set");
        }
        if !(self.sigma0.is_finite() && self.sigma0 > 0.0) {
            bail!("sigma0 must be a positive number, got {}", self.sigma0);
        }
        if matches!(self.pop_size, Some(n) if n < 2) {
            bail!("pop_size must be at least 2");
        }
        if self.hidden.contains(&0) {
            bail!("hidden layer sizes must be non-zero");
        }
        if self.checkpoint_interval == 0 {
            bail!("checkpoint_interval must be at least 1");
        }
        if self.eval_episodes == 0 {
            bail!("eval_episodes must be at least 1");
        }
        if !self.failure_cost.is_finite() {
            bail!("failure_cost must be finite");
        }
        if self.workers == Some(0) {
            bail!("workers must be at least 1");
        }
        Ok(())
    }

    /// `CartPole-v1` + linear → `cartpole-v1_linear`
    pub fn run_name(&self) -> String {
        if let Some(name) = &self.run_name {
            return name.clone();
        }
        let arch = if self.hidden.is_empty() {
            "linear".to_string()
        } else {
            format!(
                "mlp{}",
                self.hidden.iter().map(|h| h.to_string()).collect::<Vec<_>>().join("x")
            )
        };
        format!("{}_{}", self.env.to_lowercase(), arch)
    }

    pub fn cma_config(&self, seed: u64) -> CmaEsConfig {
        CmaEsConfig {
            sigma0: self.sigma0,
            pop_size: self.pop_size,
            seed,
            ..CmaEsConfig::default()
        }
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            max_iterations: self.max_iterations,
            checkpoint_interval: self.checkpoint_interval,
            failure_cost: self.failure_cost,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = TrainConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.max_iterations, 1000);
        assert_eq!(cfg.checkpoint_interval, 50);
        assert_eq!(cfg.sigma0, 0.5);
        assert_eq!(cfg.run_name(), "cartpole-v1_linear");
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(&path, r#"{"env": "Pendulum-v1", "hidden": [16, 8], "seed": 3}"#).unwrap();
        let cfg = TrainConfig::load(&path).unwrap();
        assert_eq!(cfg.env, "Pendulum-v1");
        assert_eq!(cfg.seed, Some(3));
        assert_eq!(cfg.max_iterations, 1000);
        assert_eq!(cfg.run_name(), "pendulum-v1_mlp16x8");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(&path, r#"{"sigma": 0.3}"#).unwrap();
        assert!(TrainConfig::load(&path).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad = [
            TrainConfig { sigma0: 0.0, ..TrainConfig::default() },
            TrainConfig { sigma0: f64::NAN, ..TrainConfig::default() },
            TrainConfig { pop_size: Some(1), ..TrainConfig::default() },
            TrainConfig { checkpoint_interval: 0, ..TrainConfig::default() },
            TrainConfig { eval_episodes: 0, ..TrainConfig::default() },
            TrainConfig { failure_cost: f64::INFINITY, ..TrainConfig::default() },
            TrainConfig { hidden: vec![8, 0], ..TrainConfig::default() },
        ];
        for cfg in bad {
            assert!(cfg.validate().is_err(), "{cfg:?} should be rejected");
        }
    }
}
