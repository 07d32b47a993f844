//! Pendulum-v1: classic torque-limited swing-up, continuous control.
//!
//! State: angle θ (0 = upright) and angular velocity ω.
//! Observation: [cos θ, sin θ, ω]
//! Action: one torque component in [-1, 1], scaled to ±MAX_TORQUE.
//! Reward: -(θ² + 0.1·ω² + 0.001·u²), so the best possible episode scores 0.
//! No terminal state; episodes are truncated at the step cap.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::env::*;
use crate::error::EnvError;

const GRAVITY: f32 = 10.0;
const MASS: f32 = 1.0;
const LENGTH: f32 = 1.0;
const DT: f32 = 0.05;
const MAX_TORQUE: f32 = 2.0;
const MAX_SPEED: f32 = 8.0;

pub fn config() -> EnvConfig {
    EnvConfig {
        name: "Pendulum-v1".to_string(),
        obs_dim: 3,
        action_space: ActionSpace::Continuous(1),
        max_steps: 200,
        solved_threshold: -200.0,
    }
}

/// Wrap an angle into [-π, π).
fn angle_normalize(theta: f32) -> f32 {
    use std::f32::consts::PI;
    (theta + PI).rem_euclid(2.0 * PI) - PI
}

pub struct Pendulum {
    config: EnvConfig,
    theta: f32,
    omega: f32,
    obs: [f32; 3],
    step_count: usize,
    finished: bool,
    rng: StdRng,
}

impl Pendulum {
    pub fn new(seed: Option<u64>) -> Self {
        let mut env = Pendulum {
            config: config(),
            theta: 0.0,
            omega: 0.0,
            obs: [0.0; 3],
            step_count: 0,
            finished: false,
            rng: StdRng::seed_from_u64(seed.unwrap_or(42)),
        };
        env.reset(None);
        env
    }

    fn sync_obs(&mut self) {
        self.obs = [self.theta.cos(), self.theta.sin(), self.omega];
    }
}

impl Environment for Pendulum {
    fn reset(&mut self, seed: Option<u64>) -> &[f32] {
        if let Some(s) = seed {
            self.rng = StdRng::seed_from_u64(s);
        }
        self.theta = self.rng.gen_range(-std::f32::consts::PI..std::f32::consts::PI);
        self.omega = self.rng.gen_range(-1.0..1.0);
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
        let u = continuous_values(&self.config, action)?[0].clamp(-1.0, 1.0) * MAX_TORQUE;

        let th = angle_normalize(self.theta);
        let cost = th * th + 0.1 * self.omega * self.omega + 0.001 * u * u;

        let omega_dot =
            3.0 * GRAVITY / (2.0 * LENGTH) * self.theta.sin() + 3.0 / (MASS * LENGTH * LENGTH) * u;
        self.omega = (self.omega + omega_dot * DT).clamp(-MAX_SPEED, MAX_SPEED);
        self.theta += self.omega * DT;

        self.step_count += 1;
        self.sync_obs();

        let truncated = self.step_count >= self.config.max_steps;
        self.finished = truncated;

        Ok(StepResult {
            reward: -(cost as f64),
            terminated: false,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_angle_normalize() {
        use std::f32::consts::PI;
        assert!((angle_normalize(2.0 * PI)).abs() < 1e-5);
        assert!((angle_normalize(PI / 2.0) - PI / 2.0).abs() < 1e-5);
        assert!((angle_normalize(-3.0 * PI / 2.0) - PI / 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_pendulum_truncates_at_cap() {
        let mut env = Pendulum::new(Some(3));
        let mut steps = 0;
        loop {
            let r = env.step(&Action::Continuous(vec![0.0])).unwrap();
            steps += 1;
            assert!(r.reward <= 0.0);
            assert!(!r.terminated);
            if r.done() {
                assert!(r.truncated);
                break;
            }
        }
        assert_eq!(steps, 200);
        assert!(env.step(&Action::Continuous(vec![0.0])).is_err());
    }

    #[test]
    fn test_pendulum_observation_on_unit_circle() {
        let mut env = Pendulum::new(None);
        let obs = env.reset(Some(9)).to_vec();
        assert_eq!(obs.len(), 3);
        assert!((obs[0] * obs[0] + obs[1] * obs[1] - 1.0).abs() < 1e-5);
        assert!(obs[2].abs() <= 1.0);
    }

    #[test]
    fn test_pendulum_rejects_bad_actions() {
        let mut env = Pendulum::new(Some(1));
        assert!(env.step(&Action::Discrete(0)).is_err());
        assert!(env.step(&Action::Continuous(vec![0.1, 0.2])).is_err());
        assert!(env.step(&Action::Continuous(vec![f32::NAN])).is_err());
        assert_eq!(env.steps(), 0);
    }
}
