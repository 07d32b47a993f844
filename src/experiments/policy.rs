//! Feed-forward policy. Forward pass only, no backprop.
//!
//! Weights live in a flat vector that the optimizer searches over. Layout per
//! layer: `fan_in × fan_out` weights (row-major, input index first), then
//! `fan_out` biases.

use serde::{Deserialize, Serialize};

use super::env::{Action, ActionSpace};
use crate::error::ShapeMismatch;

/// Network architecture: `[input_dim, hidden..., output_dim]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Architecture {
    pub layers: Vec<usize>,
    pub action_space: ActionSpace,
}

impl Architecture {
    /// `layers` must hold at least input and output sizes, all non-zero.
    pub fn new(layers: Vec<usize>, action_space: ActionSpace) -> Option<Self> {
        if layers.len() < 2 || layers.contains(&0) {
            return None;
        }
        if layers[layers.len() - 1] != action_space.size() {
            return None;
        }
        Some(Architecture { layers, action_space })
    }

    /// Input → hidden → action-space architecture.
    pub fn for_env(obs_dim: usize, hidden: &[usize], action_space: ActionSpace) -> Option<Self> {
        let mut layers = Vec::with_capacity(hidden.len() + 2);
        layers.push(obs_dim);
        layers.extend_from_slice(hidden);
        layers.push(action_space.size());
        Self::new(layers, action_space)
    }

    pub fn input_dim(&self) -> usize {
        self.layers[0]
    }

    /// (fan_in, fan_out) per layer.
    pub fn layer_dims(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.layers.windows(2).map(|w| (w[0], w[1]))
    }

    /// Total number of parameters (weights + biases).
    pub fn n_params(&self) -> usize {
        self.layer_dims().map(|(i, o)| i * o + o).sum()
    }

    /// e.g. "8→4"
    pub fn arch_string(&self) -> String {
        self.layers
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join("→")
    }
}

/// A parameter vector bound to an architecture, ready to act.
///
/// Holds its own scratch buffers, so acting does not allocate. One instance
/// per rollout worker; never share one between concurrent rollouts.
#[derive(Debug, Clone)]
pub struct PolicyEvaluator {
    arch: Architecture,
    params: Vec<f32>,
    front: Vec<f32>,
    back: Vec<f32>,
    action: Action,
}

impl PolicyEvaluator {
    pub fn new(arch: Architecture) -> Self {
        let width = arch.layers.iter().copied().max().unwrap_or(0);
        let action = match arch.action_space {
            ActionSpace::Discrete(_) => Action::Discrete(0),
            ActionSpace::Continuous(n) => Action::Continuous(vec![0.0; n]),
        };
        PolicyEvaluator {
            params: vec![0.0; arch.n_params()],
            front: Vec::with_capacity(width),
            back: Vec::with_capacity(width),
            action,
            arch,
        }
    }

    pub fn architecture(&self) -> &Architecture {
        &self.arch
    }

    /// Load a parameter vector, replacing the previous one.
    pub fn configure(&mut self, params: &[f64]) -> Result<(), ShapeMismatch> {
        if params.len() != self.params.len() {
            return Err(ShapeMismatch {
                expected: self.params.len(),
                actual: params.len(),
            });
        }
        for (dst, &src) in self.params.iter_mut().zip(params) {
            *dst = src as f32;
        }
        Ok(())
    }

    /// Forward pass: observation → action.
    pub fn act(&mut self, obs: &[f32]) -> &Action {
        debug_assert_eq!(obs.len(), self.arch.input_dim());

        self.front.clear();
        self.front.extend_from_slice(obs);
        let n_layers = self.arch.layers.len() - 1;
        let mut offset = 0;

        for (layer_idx, (fan_in, fan_out)) in self.arch.layer_dims().enumerate() {
            let weights = &self.params[offset..offset + fan_in * fan_out];
            offset += fan_in * fan_out;
            let biases = &self.params[offset..offset + fan_out];
            offset += fan_out;

            // x (1×fan_in) @ W (fan_in×fan_out) + b
            self.back.clear();
            self.back.extend_from_slice(biases);
            for (i, &x) in self.front.iter().enumerate() {
                let row = &weights[i * fan_out..(i + 1) * fan_out];
                for (out, &w) in self.back.iter_mut().zip(row) {
                    *out += x * w;
                }
            }

            if layer_idx + 1 < n_layers {
                for v in &mut self.back {
                    *v = v.tanh();
                }
            }
            std::mem::swap(&mut self.front, &mut self.back);
        }

        let logits = &self.front;
        match &mut self.action {
            Action::Discrete(choice) => *choice = argmax(logits),
            Action::Continuous(values) => {
                for (v, &x) in values.iter_mut().zip(logits) {
                    *v = x.tanh();
                }
            }
        }
        &self.action
    }
}

/// Index of the first maximum. NaN logits never win.
fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > values[best] || values[best].is_nan() {
            best = i;
        }
    }
    best
}
