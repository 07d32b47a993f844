//! Error types shared by the training pipeline.
//!
//! Rollout-level failures (`EnvError`) are recoverable: the training loop
//! assigns the failing candidate the worst-case cost. Everything wrapped in
//! `TrainError` aborts the run.

use thiserror::Error;

/// Parameter vector length disagrees with the declared architecture.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("parameter vector has {actual} values, architecture expects {expected}")]
pub struct ShapeMismatch {
    pub expected: usize,
    pub actual: usize,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EnvError {
    #[error("invalid action for {env}: {reason}")]
    InvalidAction { env: String, reason: String },

    #[error("{env}: step called after the episode finished")]
    EpisodeFinished { env: String },

    #[error("unknown environment: {0}")]
    UnknownEnvironment(String),

    #[error("{env}: simulation fault: {reason}")]
    Fault { env: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RolloutError {
    #[error(transparent)]
    Shape(#[from] ShapeMismatch),

    #[error("rollout aborted at step {step}: {source}")]
    Environment {
        step: usize,
        #[source]
        source: EnvError,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OptimizerError {
    #[error("fitness report has {actual} candidates, generation had {expected}")]
    Misaligned { expected: usize, actual: usize },

    #[error("candidate {index} was reported without a fitness value")]
    MissingFitness { index: usize },

    #[error("candidate {index} has non-finite fitness {value}")]
    NonFiniteFitness { index: usize, value: f64 },

    #[error("candidate {index} has dimension {actual}, search space has {expected}")]
    Dimension {
        index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("fitness reported without a pending generation")]
    NoPendingGeneration,
}

#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Shape(#[from] ShapeMismatch),

    #[error("non-finite reward {reward} for candidate {candidate} at iteration {iteration}")]
    Divergence {
        iteration: usize,
        candidate: usize,
        reward: f64,
    },

    #[error("optimizer rejected fitness report: {0}")]
    Optimizer(#[from] OptimizerError),

    #[error("failed to write final artifacts: {0:#}")]
    Finalize(anyhow::Error),
}
