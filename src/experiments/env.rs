//! Environment abstraction for training runs.
//!
//! Mirrors gymnasium's reset/step/close API in pure Rust. Environments are
//! registered by name once, and the training loop only ever holds a resolved
//! [`EnvHandle`]: the name lookup never happens inside the step loop.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::EnvError;

/// Action space type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ActionSpace {
    /// Discrete actions: 0..n
    Discrete(usize),
    /// Continuous actions: n-dimensional vector in [-1, 1]
    Continuous(usize),
}

impl ActionSpace {
    pub fn size(&self) -> usize {
        match self {
            ActionSpace::Discrete(n) | ActionSpace::Continuous(n) => *n,
        }
    }
}

/// Action passed to environment.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Discrete(usize),
    Continuous(Vec<f32>),
}

/// Outcome of a single step. The new observation stays inside the
/// environment and is read through [`Environment::observation`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepResult {
    pub reward: f64,
    pub terminated: bool,
    pub truncated: bool,
}

impl StepResult {
    pub fn done(&self) -> bool {
        self.terminated || self.truncated
    }
}

/// Static description of an environment.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvConfig {
    pub name: String,
    pub obs_dim: usize,
    pub action_space: ActionSpace,
    pub max_steps: usize,
    pub solved_threshold: f64,
}

impl fmt::Display for EnvConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (obs={}, act={:?}, cap={}, solved≥{})",
            self.name, self.obs_dim, self.action_space, self.max_steps, self.solved_threshold
        )
    }
}

/// The core Environment trait.
///
/// One instance is never shared between rollouts running in parallel; each
/// worker builds its own from an [`EnvHandle`].
pub trait Environment: Send {
    /// Reset to an initial state and return the first observation.
    fn reset(&mut self, seed: Option<u64>) -> &[f32];

    /// Advance one step. Fails on invalid actions or internal faults.
    fn step(&mut self, action: &Action) -> Result<StepResult, EnvError>;

    /// Observation after the last reset or step.
    fn observation(&self) -> &[f32];

    fn config(&self) -> &EnvConfig;

    /// Steps taken since the last reset.
    fn steps(&self) -> usize;

    /// Release simulation resources. Pure-Rust environments hold none.
    fn close(&mut self) {}
}

type EnvFactory = dyn Fn(Option<u64>) -> Box<dyn Environment> + Send + Sync;

/// A resolved environment constructor.
#[derive(Clone)]
pub struct EnvHandle {
    config: EnvConfig,
    factory: Arc<EnvFactory>,
}

impl EnvHandle {
    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    /// Build a fresh, independent environment instance.
    pub fn make(&self, seed: Option<u64>) -> Box<dyn Environment> {
        (self.factory)(seed)
    }
}

impl fmt::Debug for EnvHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvHandle").field("config", &self.config).finish()
    }
}

/// Name → constructor table.
#[derive(Default, Clone)]
pub struct EnvRegistry {
    entries: BTreeMap<String, EnvHandle>,
}

impl EnvRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every environment shipped in this crate.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(cartpole::config(), |seed| Box::new(cartpole::CartPole::new(seed)));
        registry.register(super::pendulum::config(), |seed| {
            Box::new(super::pendulum::Pendulum::new(seed))
        });
        registry
    }

    /// Register (or replace) a constructor under `config.name`.
    pub fn register<F>(&mut self, config: EnvConfig, factory: F)
    where
        F: Fn(Option<u64>) -> Box<dyn Environment> + Send + Sync + 'static,
    {
        let handle = EnvHandle {
            config: config.clone(),
            factory: Arc::new(factory),
        };
        self.entries.insert(config.name, handle);
    }

    pub fn resolve(&self, name: &str) -> Result<EnvHandle, EnvError> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| EnvError::UnknownEnvironment(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

/// Validate a discrete action against the space, shared by the built-ins.
pub(crate) fn discrete_index(config: &EnvConfig, action: &Action) -> Result<usize, EnvError> {
    match (config.action_space, action) {
        (ActionSpace::Discrete(n), Action::Discrete(a)) if *a < n => Ok(*a),
        (ActionSpace::Discrete(n), Action::Discrete(a)) => Err(EnvError::InvalidAction {
            env: config.name.clone(),
            reason: format!("action {a} outside 0..{n}"),
        }),
        _ => Err(EnvError::InvalidAction {
            env: config.name.clone(),
            reason: format!("expected a discrete action, got {action:?}"),
        }),
    }
}

/// Validate a continuous action against the space, shared by the built-ins.
pub(crate) fn continuous_values<'a>(
    config: &EnvConfig,
    action: &'a Action,
) -> Result<&'a [f32], EnvError> {
    match (config.action_space, action) {
        (ActionSpace::Continuous(n), Action::Continuous(v)) if v.len() == n => {
            if v.iter().all(|x| x.is_finite()) {
                Ok(v)
            } else {
                Err(EnvError::InvalidAction {
                    env: config.name.clone(),
                    reason: "non-finite action component".into(),
                })
            }
        }
        (ActionSpace::Continuous(n), Action::Continuous(v)) => Err(EnvError::InvalidAction {
            env: config.name.clone(),
            reason: format!("expected {n} action components, got {}", v.len()),
        }),
        _ => Err(EnvError::InvalidAction {
            env: config.name.clone(),
            reason: format!("expected a continuous action, got {action:?}"),
        }),
    }
}

// ─── CartPole (pure Rust, no dependencies) ────────────────────────────

pub mod cartpole {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const GRAVITY: f64 = 9.8;
    const CART_MASS: f64 = 1.0;
    const POLE_MASS: f64 = 0.1;
    const TOTAL_MASS: f64 = CART_MASS + POLE_MASS;
    const POLE_HALF_LENGTH: f64 = 0.5;
    const POLE_MASS_LENGTH: f64 = POLE_MASS * POLE_HALF_LENGTH;
    const FORCE_MAG: f64 = 10.0;
    const TAU: f64 = 0.02;
    const X_THRESHOLD: f64 = 2.4;
    const THETA_THRESHOLD: f64 = 12.0 * std::f64::consts::PI / 180.0;

    pub fn config() -> EnvConfig {
        EnvConfig {
            name: "CartPole-v1".to_string(),
            obs_dim: 4,
            action_space: ActionSpace::Discrete(2),
            max_steps: 500,
            solved_threshold: 475.0,
        }
    }

    pub struct CartPole {
        config: EnvConfig,
        /// x, x_dot, theta, theta_dot
        state: [f64; 4],
        obs: [f32; 4],
        step_count: usize,
        finished: bool,
        rng: StdRng,
    }

    impl CartPole {
        pub fn new(seed: Option<u64>) -> Self {
            let mut env = CartPole {
                config: config(),
                state: [0.0; 4],
                obs: [0.0; 4],
                step_count: 0,
                finished: false,
                rng: StdRng::seed_from_u64(seed.unwrap_or(42)),
            };
            env.reset(None);
            env
        }

        fn sync_obs(&mut self) {
            for (o, s) in self.obs.iter_mut().zip(self.state) {
                *o = s as f32;
            }
        }
    }

    impl Environment for CartPole {
        fn reset(&mut self, seed: Option<u64>) -> &[f32] {
            if let Some(s) = seed {
                self.rng = StdRng::seed_from_u64(s);
            }
            for v in &mut self.state {
                *v = self.rng.gen_range(-0.05..0.05);
            }
            self.step_count = 0;
            self.finished = false;
            self.sync_obs();
            &self.obs
        }

        fn step(&mut self, action: &Action) -> Result<StepResult, EnvError> {
            if self.finished {
                return Err(EnvError::EpisodeFinished {
                    env: self.config.name.clone(),
                });
            }
            let force = if discrete_index(&self.config, action)? == 1 {
                FORCE_MAG
            } else {
                -FORCE_MAG
            };

            let [x, x_dot, theta, theta_dot] = self.state;
            let (sin_theta, cos_theta) = theta.sin_cos();

            let temp = (force + POLE_MASS_LENGTH * theta_dot * theta_dot * sin_theta) / TOTAL_MASS;
            let theta_acc = (GRAVITY * sin_theta - cos_theta * temp)
                / (POLE_HALF_LENGTH * (4.0 / 3.0 - POLE_MASS * cos_theta * cos_theta / TOTAL_MASS));
            let x_acc = temp - POLE_MASS_LENGTH * theta_acc * cos_theta / TOTAL_MASS;

            // Explicit Euler, as gymnasium does
            self.state = [
                x + TAU * x_dot,
                x_dot + TAU * x_acc,
                theta + TAU * theta_dot,
                theta_dot + TAU * theta_acc,
            ];
            self.step_count += 1;
            self.sync_obs();

            let terminated =
                self.state[0].abs() > X_THRESHOLD || self.state[2].abs() > THETA_THRESHOLD;
            let truncated = self.step_count >= self.config.max_steps;
            self.finished = terminated || truncated;

            Ok(StepResult {
                reward: 1.0,
                terminated,
                truncated,
            })
        }

        fn observation(&self) -> &[f32] {
            &self.obs
        }

        fn config(&self) -> &EnvConfig {
            &self.config
        }

        fn steps(&self) -> usize {
            self.step_count
        }
    }
}
