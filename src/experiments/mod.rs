//! Gradient-free policy training in pure Rust.
//!
//! Architecture:
//! - `env`: Environment trait, registry, CartPole
//! - `pendulum`: Pendulum swing-up
//! - `policy`: Feed-forward forward pass over a flat parameter vector
//! - `rollout`: Episode runner and the parallel fitness seam
//! - `optim`: Ask/tell optimizer contract, CMA-ES
//! - `metrics`: Reward history and snapshot persistence
//! - `trainer`: Generation loop state machine

pub mod env;
pub mod metrics;
pub mod optim;
pub mod pendulum;
pub mod policy;
pub mod rollout;
pub mod trainer;
