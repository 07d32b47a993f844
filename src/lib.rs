//! GAIA evolve: trains fixed-architecture control policies with CMA-ES over
//! episodic rollouts, checkpointing the best solution and reward history.

pub mod config;
pub mod error;
pub mod experiments;

pub use config::TrainConfig;
pub use error::{EnvError, OptimizerError, RolloutError, ShapeMismatch, TrainError};
pub use experiments::env::{EnvRegistry, Environment};
pub use experiments::optim::{CmaEs, CmaEsConfig, Generation, PopulationOptimizer};
pub use experiments::policy::{Architecture, PolicyEvaluator};
pub use experiments::rollout::{FitnessEvaluator, RolloutRunner};
pub use experiments::trainer::{TrainOutcome, TrainState, TrainingLoop};
