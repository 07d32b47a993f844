//! Population optimizers behind an ask/tell contract.
//!
//! The training loop only sees [`PopulationOptimizer`]. [`CmaEs`] is the
//! default implementation: Covariance Matrix Adaptation Evolution Strategy,
//! minimising cost, with pycma's default stopping rules.
//! Reference: Hansen, "The CMA Evolution Strategy: A Tutorial" (2016).

use std::collections::VecDeque;
use std::fmt;

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use serde::Serialize;

use crate::error::OptimizerError;

/// One proposed parameter vector and, once evaluated, its cost.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub params: Vec<f64>,
    /// Cost, lower is better. `None` until evaluated.
    pub fitness: Option<f64>,
}

/// A batch of candidates evaluated together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generation {
    pub candidates: Vec<Candidate>,
}

impl Generation {
    pub fn from_params(params: Vec<Vec<f64>>) -> Self {
        Generation {
            candidates: params
                .into_iter()
                .map(|params| Candidate { params, fitness: None })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Index and cost of the first candidate with minimal cost.
    /// Unevaluated candidates are ignored.
    pub fn argmin(&self) -> Option<(usize, f64)> {
        let mut best: Option<(usize, f64)> = None;
        for (i, c) in self.candidates.iter().enumerate() {
            if let Some(f) = c.fitness {
                if best.map_or(true, |(_, b)| f < b) {
                    best = Some((i, f));
                }
            }
        }
        best
    }

    /// Checks the report is complete and finite, returns the costs in order.
    pub fn costs(&self) -> Result<Vec<f64>, OptimizerError> {
        self.candidates
            .iter()
            .enumerate()
            .map(|(index, c)| match c.fitness {
                None => Err(OptimizerError::MissingFitness { index }),
                Some(value) if !value.is_finite() => {
                    Err(OptimizerError::NonFiniteFitness { index, value })
                }
                Some(value) => Ok(value),
            })
            .collect()
    }
}

/// Why an optimizer decided to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxIter,
    TolFun,
    TolX,
    ConditionCov,
    TolUpSigma,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::MaxIter => "maxiter",
            StopReason::TolFun => "tolfun",
            StopReason::TolX => "tolx",
            StopReason::ConditionCov => "conditioncov",
            StopReason::TolUpSigma => "tolupsigma",
        };
        f.write_str(s)
    }
}

/// Ask/tell contract the training loop depends on.
pub trait PopulationOptimizer {
    /// True once the internal stopping criteria are met.
    fn has_converged(&self) -> bool;

    /// Sample a fixed-size batch from the current search distribution.
    fn propose_generation(&mut self) -> Generation;

    /// Update the search distribution from the evaluated batch. The batch must
    /// be the last proposed one, in proposal order, fully evaluated.
    fn report_fitness(&mut self, generation: &Generation) -> Result<(), OptimizerError>;

    fn population_size(&self) -> usize;

    fn step_size(&self) -> Option<f64> {
        None
    }

    fn stop_reasons(&self) -> Vec<StopReason> {
        Vec::new()
    }
}

/// Above this dimension the covariance is kept diagonal (sep-CMA-ES).
const FULL_COVARIANCE_MAX_DIM: usize = 2000;

/// CMA-ES settings. `None` fields fall back to the textbook defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct CmaEsConfig {
    pub sigma0: f64,
    pub pop_size: Option<usize>,
    pub seed: u64,
    pub max_generations: Option<usize>,
    pub tol_fun: f64,
    pub tol_x: f64,
    pub max_condition: f64,
    pub tol_up_sigma: f64,
}

impl Default for CmaEsConfig {
    fn default() -> Self {
        CmaEsConfig {
            sigma0: 0.5,
            pop_size: None,
            seed: 42,
            max_generations: None,
            tol_fun: 1e-11,
            tol_x: 1e-11,
            max_condition: 1e14,
            tol_up_sigma: 1e20,
        }
    }
}

enum Covariance {
    Full {
        c: DMatrix<f64>,
        /// Eigenvectors as columns.
        b: DMatrix<f64>,
        /// Square roots of the eigenvalues.
        d: DVector<f64>,
        /// Evaluation count at the last decomposition.
        decomposed_at: usize,
    },
    Diagonal(DVector<f64>),
}

pub struct CmaEs {
    n: usize,
    lambda: usize,
    mu: usize,
    weights: DVector<f64>,
    mu_eff: f64,
    cs: f64,
    ds: f64,
    cc: f64,
    c1: f64,
    cmu: f64,
    chi_n: f64,
    lazy_gap_evals: f64,

    sigma0: f64,
    sigma: f64,
    mean: DVector<f64>,
    ps: DVector<f64>,
    pc: DVector<f64>,
    cov: Covariance,

    generation: usize,
    evals: usize,
    pending: Option<usize>,
    best_history: VecDeque<f64>,
    last_range: f64,
    max_generations: usize,
    tol_fun: f64,
    tol_x: f64,
    max_condition: f64,
    tol_up_sigma: f64,
    rng: StdRng,
}

impl CmaEs {
    /// Zero initial mean of dimension `n`. Panics if `n == 0` or the
    /// population size is below 2.
    pub fn new(n: usize, config: &CmaEsConfig) -> Self {
        assert!(n > 0, "search space must have at least one dimension");
        let nf = n as f64;
        let lambda = config.pop_size.unwrap_or(4 + (3.0 * nf.ln()).floor() as usize);
        assert!(lambda >= 2, "population size must be at least 2");
        let mu = lambda / 2;

        // Log-scale recombination weights, normalised to sum 1
        let raw: Vec<f64> = (0..mu)
            .map(|i| (mu as f64 + 0.5).ln() - ((i + 1) as f64).ln())
            .collect();
        let total: f64 = raw.iter().sum();
        let weights = DVector::from_iterator(mu, raw.iter().map(|w| w / total));
        let mu_eff = 1.0 / weights.iter().map(|w| w * w).sum::<f64>();

        let cs = (mu_eff + 2.0) / (nf + mu_eff + 5.0);
        let ds = 1.0 + 2.0 * (((mu_eff - 1.0) / (nf + 1.0)).sqrt() - 1.0).max(0.0) + cs;
        let cc = (4.0 + mu_eff / nf) / (nf + 4.0 + 2.0 * mu_eff / nf);
        let mut c1 = 2.0 / ((nf + 1.3).powi(2) + mu_eff);
        let mut cmu =
            (2.0 * (mu_eff - 2.0 + 1.0 / mu_eff) / ((nf + 2.0).powi(2) + mu_eff)).min(1.0 - c1);
        let chi_n = nf.sqrt() * (1.0 - 1.0 / (4.0 * nf) + 1.0 / (21.0 * nf * nf));

        let cov = if n <= FULL_COVARIANCE_MAX_DIM {
            Covariance::Full {
                c: DMatrix::identity(n, n),
                b: DMatrix::identity(n, n),
                d: DVector::from_element(n, 1.0),
                decomposed_at: 0,
            }
        } else {
            // Separable variant learns faster on the diagonal
            let boost = (nf + 2.0) / 3.0;
            c1 = (c1 * boost).min(1.0);
            cmu = (cmu * boost).min(1.0 - c1);
            Covariance::Diagonal(DVector::from_element(n, 1.0))
        };
        let lazy_gap_evals = 0.5 * lambda as f64 / ((c1 + cmu) * nf);

        let max_generations = config.max_generations.unwrap_or_else(|| {
            100 + (150.0 * (nf + 3.0).powi(2) / (lambda as f64).sqrt()) as usize
        });

        CmaEs {
            n,
            lambda,
            mu,
            weights,
            mu_eff,
            cs,
            ds,
            cc,
            c1,
            cmu,
            chi_n,
            lazy_gap_evals,
            sigma0: config.sigma0,
            sigma: config.sigma0,
            mean: DVector::zeros(n),
            ps: DVector::zeros(n),
            pc: DVector::zeros(n),
            cov,
            generation: 0,
            evals: 0,
            pending: None,
            best_history: VecDeque::new(),
            last_range: f64::INFINITY,
            max_generations,
            tol_fun: config.tol_fun,
            tol_x: config.tol_x,
            max_condition: config.max_condition,
            tol_up_sigma: config.tol_up_sigma,
            rng: StdRng::seed_from_u64(config.seed),
        }
    }

    pub fn generation(&self) -> usize {
        self.generation
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    pub fn mean(&self) -> &[f64] {
        self.mean.as_slice()
    }

    pub fn is_diagonal(&self) -> bool {
        matches!(self.cov, Covariance::Diagonal(_))
    }

    /// Recompute B and D when enough evaluations passed since the last time.
    fn refresh_eigensystem(&mut self) {
        let evals = self.evals;
        let gap = self.lazy_gap_evals;
        if let Covariance::Full { c, b, d, decomposed_at } = &mut self.cov {
            if evals > 0 && ((evals - *decomposed_at) as f64) < gap {
                return;
            }
            // Drop floating-point asymmetry before decomposing
            let sym = (&*c + c.transpose()) * 0.5;
            *c = sym.clone();
            let eigen = SymmetricEigen::new(sym);
            *d = eigen.eigenvalues.map(|v| v.max(1e-20).sqrt());
            *b = eigen.eigenvectors;
            *decomposed_at = evals;
        }
    }

    /// C^(-1/2) · v
    fn inv_sqrt_c_mul(&self, v: &DVector<f64>) -> DVector<f64> {
        match &self.cov {
            Covariance::Full { b, d, .. } => {
                let mut z = b.tr_mul(v);
                z.component_div_assign(d);
                b * z
            }
            Covariance::Diagonal(diag) => v.zip_map(diag, |x, c| x / c.max(1e-20).sqrt()),
        }
    }

    /// Standard deviation of each coordinate of the sampling distribution.
    fn coordinate_stds(&self) -> DVector<f64> {
        match &self.cov {
            Covariance::Full { c, .. } => c.diagonal().map(|v| self.sigma * v.max(0.0).sqrt()),
            Covariance::Diagonal(diag) => diag.map(|v| self.sigma * v.max(0.0).sqrt()),
        }
    }

    fn condition_number(&self) -> f64 {
        let (max, min) = match &self.cov {
            Covariance::Full { d, .. } => (d.max().powi(2), d.min().powi(2)),
            Covariance::Diagonal(diag) => (diag.max(), diag.min()),
        };
        max / min.max(1e-300)
    }

    fn max_axis(&self) -> f64 {
        match &self.cov {
            Covariance::Full { d, .. } => d.max(),
            Covariance::Diagonal(diag) => diag.max().sqrt(),
        }
    }

    /// Length of the best-cost history used by `TolFun`.
    fn history_len(&self) -> usize {
        10 + ((30 * self.n) as f64 / self.lambda as f64).ceil() as usize
    }
}

impl PopulationOptimizer for CmaEs {
    fn has_converged(&self) -> bool {
        !self.stop_reasons().is_empty()
    }

    fn propose_generation(&mut self) -> Generation {
        self.refresh_eigensystem();

        let params = (0..self.lambda)
            .map(|_| {
                let z = DVector::<f64>::from_fn(self.n, |_, _| StandardNormal.sample(&mut self.rng));
                // x = m + σ · B · D · z
                let y = match &self.cov {
                    Covariance::Full { b, d, .. } => b * z.component_mul(d),
                    Covariance::Diagonal(diag) => z.zip_map(diag, |zi, c| zi * c.sqrt()),
                };
                (&self.mean + y * self.sigma).as_slice().to_vec()
            })
            .collect();

        self.pending = Some(self.lambda);
        Generation::from_params(params)
    }

    fn report_fitness(&mut self, generation: &Generation) -> Result<(), OptimizerError> {
        let expected = self.pending.ok_or(OptimizerError::NoPendingGeneration)?;
        if generation.len() != expected {
            return Err(OptimizerError::Misaligned {
                expected,
                actual: generation.len(),
            });
        }
        if let Some((index, c)) = generation
            .candidates
            .iter()
            .enumerate()
            .find(|(_, c)| c.params.len() != self.n)
        {
            return Err(OptimizerError::Dimension {
                index,
                expected: self.n,
                actual: c.params.len(),
            });
        }
        let costs = generation.costs()?;
        self.pending = None;

        let n = self.n as f64;
        let mut order: Vec<usize> = (0..costs.len()).collect();
        order.sort_by(|&a, &b| costs[a].total_cmp(&costs[b]));

        // Steps of the selected candidates, in units of σ
        let old_mean = self.mean.clone();
        let steps: Vec<DVector<f64>> = order[..self.mu]
            .iter()
            .map(|&i| (DVector::from_column_slice(&generation.candidates[i].params) - &old_mean) / self.sigma)
            .collect();

        let mut y_w = DVector::zeros(self.n);
        for (w, y) in self.weights.iter().zip(&steps) {
            y_w += y * *w;
        }
        self.mean = &old_mean + &y_w * self.sigma;

        // Step-size path
        let ps_factor = (self.cs * (2.0 - self.cs) * self.mu_eff).sqrt();
        self.ps = &self.ps * (1.0 - self.cs) + self.inv_sqrt_c_mul(&y_w) * ps_factor;
        let ps_norm = self.ps.norm();

        // Stall indicator
        let decay = 1.0 - (1.0 - self.cs).powi(2 * (self.generation as i32 + 1));
        let hsig = if ps_norm / decay.sqrt() / self.chi_n < 1.4 + 2.0 / (n + 1.0) {
            1.0
        } else {
            0.0
        };

        let pc_factor = (self.cc * (2.0 - self.cc) * self.mu_eff).sqrt();
        self.pc = &self.pc * (1.0 - self.cc) + &y_w * (hsig * pc_factor);

        // Covariance: decay, rank-one, rank-mu
        let c1a = self.c1 * (1.0 - (1.0 - hsig) * self.cc * (2.0 - self.cc));
        let keep = 1.0 - c1a - self.cmu;
        match &mut self.cov {
            Covariance::Full { c, .. } => {
                *c *= keep;
                c.ger(self.c1, &self.pc, &self.pc, 1.0);
                for (w, y) in self.weights.iter().zip(&steps) {
                    c.ger(self.cmu * w, y, y, 1.0);
                }
            }
            Covariance::Diagonal(diag) => {
                for i in 0..self.n {
                    let rank_mu: f64 = self
                        .weights
                        .iter()
                        .zip(&steps)
                        .map(|(w, y)| w * y[i] * y[i])
                        .sum();
                    diag[i] = (keep * diag[i] + self.c1 * self.pc[i] * self.pc[i] + self.cmu * rank_mu)
                        .max(1e-20);
                }
            }
        }

        // Cumulative step-size adaptation, capped at e¹ per generation
        self.sigma *= ((self.cs / self.ds) * (ps_norm / self.chi_n - 1.0)).min(1.0).exp();
        self.sigma = self.sigma.clamp(1e-20, 1e10);

        // Bookkeeping for TolFun
        let best = costs[order[0]];
        let worst = costs[order[costs.len() - 1]];
        self.last_range = worst - best;
        self.best_history.push_back(best);
        while self.best_history.len() > self.history_len() {
            self.best_history.pop_front();
        }

        self.generation += 1;
        self.evals += costs.len();
        Ok(())
    }

    fn population_size(&self) -> usize {
        self.lambda
    }

    fn step_size(&self) -> Option<f64> {
        Some(self.sigma)
    }

    fn stop_reasons(&self) -> Vec<StopReason> {
        let mut reasons = Vec::new();
        if self.generation >= self.max_generations {
            reasons.push(StopReason::MaxIter);
        }
        if self.generation == 0 {
            return reasons;
        }

        if self.best_history.len() >= self.history_len() {
            let (lo, hi) = self
                .best_history
                .iter()
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
            if (hi - lo).max(self.last_range) < self.tol_fun {
                reasons.push(StopReason::TolFun);
            }
        }

        let pc_small = self.pc.iter().all(|p| (self.sigma * p).abs() < self.tol_x);
        if pc_small && self.coordinate_stds().iter().all(|s| *s < self.tol_x) {
            reasons.push(StopReason::TolX);
        }

        if self.condition_number() > self.max_condition {
            reasons.push(StopReason::ConditionCov);
        }

        if self.sigma / self.sigma0 > self.tol_up_sigma * self.max_axis() {
            reasons.push(StopReason::TolUpSigma);
        }
        reasons
    }
}
