//! Episode rollouts: the inner loop of every fitness evaluation.

use super::env::{EnvHandle, Environment};
use super::policy::{Architecture, PolicyEvaluator};
use crate::error::{EnvError, RolloutError};

/// Source of total episode reward for a parameter vector.
///
/// The training loop evaluates a generation in parallel and gives every
/// worker its own `Worker` value, so implementations never share mutable
/// state between concurrent rollouts.
pub trait FitnessEvaluator: Sync {
    type Worker;

    fn spawn_worker(&self) -> Self::Worker;

    /// Total (undiscounted) reward earned by `params`.
    fn total_reward(&self, worker: &mut Self::Worker, params: &[f64]) -> Result<f64, RolloutError>;
}

/// Evaluator and environment owned by one rollout worker.
pub struct RolloutWorker {
    pub evaluator: PolicyEvaluator,
    pub env: Box<dyn Environment>,
}

impl Drop for RolloutWorker {
    fn drop(&mut self) {
        self.env.close();
    }
}

/// Runs episodes of a registered environment under a fixed policy architecture.
#[derive(Debug, Clone)]
pub struct RolloutRunner {
    env: EnvHandle,
    arch: Architecture,
    max_steps: usize,
    episodes: usize,
    seed: u64,
}

impl RolloutRunner {
    pub fn new(env: EnvHandle, arch: Architecture, max_steps: usize, episodes: usize, seed: u64) -> Self {
        RolloutRunner {
            env,
            arch,
            max_steps,
            episodes: episodes.max(1),
            seed,
        }
    }

    /// One episode: reset, then act/step until done or `max_steps` steps.
    ///
    /// A failing step aborts the episode; the caller decides what cost that
    /// candidate gets. An observation of the wrong length counts as an
    /// environment fault at that step.
    pub fn run(
        evaluator: &mut PolicyEvaluator,
        env: &mut dyn Environment,
        params: &[f64],
        max_steps: usize,
        seed: Option<u64>,
    ) -> Result<f64, RolloutError> {
        evaluator.configure(params)?;
        env.reset(seed);

        let input_dim = evaluator.architecture().input_dim();
        let mut total = 0.0;
        for step in 0..max_steps {
            let obs = env.observation();
            if obs.len() != input_dim {
                return Err(RolloutError::Environment {
                    step,
                    source: EnvError::Fault {
                        env: env.config().name.clone(),
                        reason: format!("observation has {} values, policy expects {input_dim}", obs.len()),
                    },
                });
            }
            let action = evaluator.act(obs);
            let result = env
                .step(action)
                .map_err(|source| RolloutError::Environment { step, source })?;
            total += result.reward;
            if result.done() {
                break;
            }
        }
        Ok(total)
    }
}

/// Reset seed of episode `episode` in an evaluation seeded with `base`.
pub fn episode_seed(base: u64, episode: usize) -> u64 {
    base.wrapping_add(episode as u64 * 1000)
}

impl FitnessEvaluator for RolloutRunner {
    type Worker = RolloutWorker;

    fn spawn_worker(&self) -> RolloutWorker {
        RolloutWorker {
            evaluator: PolicyEvaluator::new(self.arch.clone()),
            env: self.env.make(Some(self.seed)),
        }
    }

    /// Mean total reward over the configured number of episodes.
    fn total_reward(&self, worker: &mut RolloutWorker, params: &[f64]) -> Result<f64, RolloutError> {
        let mut sum = 0.0;
        for ep in 0..self.episodes {
            sum += Self::run(
                &mut worker.evaluator,
                worker.env.as_mut(),
                params,
                self.max_steps,
                Some(episode_seed(self.seed, ep)),
            )?;
        }
        Ok(sum / self.episodes as f64)
    }
}
