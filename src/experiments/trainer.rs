//! Generation loop: ask → evaluate in parallel → tell → record.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rayon::prelude::*;

use super::metrics::{ArtifactStore, BestSolution, MetricsRecorder, RewardHistory, RunSummary};
use super::optim::{PopulationOptimizer, StopReason};
use super::rollout::FitnessEvaluator;
use crate::error::{RolloutError, TrainError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainState {
    Init,
    Running,
    Converged,
    IterationLimitReached,
    Interrupted,
    Done,
}

impl fmt::Display for TrainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrainState::Init => "init",
            TrainState::Running => "running",
            TrainState::Converged => "converged",
            TrainState::IterationLimitReached => "iteration_limit_reached",
            TrainState::Interrupted => "interrupted",
            TrainState::Done => "done",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopSettings {
    pub max_iterations: usize,
    pub checkpoint_interval: usize,
    /// Cost assigned to a candidate whose rollout failed. Raised to the worst
    /// finished cost of the same generation when that is higher.
    pub failure_cost: f64,
}

impl Default for LoopSettings {
    fn default() -> Self {
        LoopSettings {
            max_iterations: 1000,
            checkpoint_interval: 50,
            failure_cost: 1e6,
        }
    }
}

/// Identifies the run in the summary file.
#[derive(Debug, Clone, Default)]
pub struct RunInfo {
    pub run_name: String,
    pub environment: String,
    pub architecture: Vec<usize>,
    pub seed: u64,
}

/// Per-generation progress, handed to the optional observer.
#[derive(Debug, Clone)]
pub struct GenReport {
    pub iteration: usize,
    pub gen_best: f64,
    pub best_ever: f64,
    pub aggregate_reward: f64,
    pub failed: usize,
    pub sigma: Option<f64>,
    pub elapsed: f64,
}

/// How the run ended.
#[derive(Debug, Clone)]
pub struct TrainOutcome {
    /// Converged, IterationLimitReached or Interrupted.
    pub terminal: TrainState,
    pub iterations: usize,
    pub best: Option<BestSolution>,
    pub history: RewardHistory,
    pub stop_reasons: Vec<StopReason>,
}

pub struct TrainingLoop<O, F, S> {
    optimizer: O,
    fitness: F,
    recorder: MetricsRecorder<S>,
    settings: LoopSettings,
    info: RunInfo,
    state: TrainState,
    iteration: usize,
    best: Option<BestSolution>,
    stop: Arc<AtomicBool>,
    on_gen: Option<Box<dyn FnMut(&GenReport) + Send>>,
}

impl<O, F, S> TrainingLoop<O, F, S>
where
    O: PopulationOptimizer,
    F: FitnessEvaluator,
    S: ArtifactStore,
{
    pub fn new(optimizer: O, fitness: F, recorder: MetricsRecorder<S>, settings: LoopSettings) -> Self {
        TrainingLoop {
            optimizer,
            fitness,
            recorder,
            settings,
            info: RunInfo::default(),
            state: TrainState::Init,
            iteration: 0,
            best: None,
            stop: Arc::new(AtomicBool::new(false)),
            on_gen: None,
        }
    }

    pub fn with_run_info(mut self, info: RunInfo) -> Self {
        self.info = info;
        self
    }

    /// Flag checked between generations; setting it ends the run as Interrupted.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn on_generation(mut self, f: impl FnMut(&GenReport) + Send + 'static) -> Self {
        self.on_gen = Some(Box::new(f));
        self
    }

    pub fn state(&self) -> TrainState {
        self.state
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn best(&self) -> Option<&BestSolution> {
        self.best.as_ref()
    }

    pub fn recorder(&self) -> &MetricsRecorder<S> {
        &self.recorder
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    /// Run until convergence, the iteration cap, or a stop request, then
    /// write the final artifacts.
    pub fn run(&mut self) -> Result<TrainOutcome, TrainError> {
        let started_at = Utc::now();
        let start = Instant::now();
        self.state = TrainState::Running;
        tracing::info!(
            pop_size = self.optimizer.population_size(),
            max_iterations = self.settings.max_iterations,
            checkpoint_interval = self.settings.checkpoint_interval,
            "Training started"
        );

        let terminal = loop {
            if self.stop.load(Ordering::Relaxed) {
                break TrainState::Interrupted;
            }
            if self.optimizer.has_converged() {
                break TrainState::Converged;
            }
            if self.iteration >= self.settings.max_iterations {
                break TrainState::IterationLimitReached;
            }
            self.step(start)?;
        };
        self.state = terminal;

        let stop_reasons = self.optimizer.stop_reasons();
        tracing::info!(
            state = %terminal,
            iterations = self.iteration,
            best = ?self.best.as_ref().map(|b| b.fitness),
            reasons = ?stop_reasons,
            "Training finished"
        );

        let summary = self.summary(terminal, &stop_reasons, started_at);
        self.recorder
            .finalize(self.best.as_ref(), &summary)
            .map_err(TrainError::Finalize)?;
        self.state = TrainState::Done;

        Ok(TrainOutcome {
            terminal,
            iterations: self.iteration,
            best: self.best.clone(),
            history: self.recorder.history().clone(),
            stop_reasons,
        })
    }

    /// One generation.
    fn step(&mut self, start: Instant) -> Result<(), TrainError> {
        let mut generation = self.optimizer.propose_generation();
        let iteration = self.iteration + 1;

        let fitness = &self.fitness;
        let rewards: Vec<Result<f64, RolloutError>> = generation
            .candidates
            .par_iter()
            .map_init(|| fitness.spawn_worker(), |worker, c| fitness.total_reward(worker, &c.params))
            .collect();

        let mut failed = Vec::new();
        for (index, (candidate, reward)) in generation.candidates.iter_mut().zip(rewards).enumerate() {
            match reward {
                Ok(r) if r.is_finite() => candidate.fitness = Some(-r),
                Ok(r) => {
                    return Err(TrainError::Divergence {
                        iteration,
                        candidate: index,
                        reward: r,
                    })
                }
                Err(RolloutError::Shape(e)) => return Err(e.into()),
                Err(RolloutError::Environment { step, source }) => {
                    tracing::warn!(
                        iteration,
                        candidate = index,
                        step,
                        "Rollout failed, assigning worst-case cost: {source}"
                    );
                    failed.push(index);
                }
            }
        }
        // Never cheaper than the worst candidate that did finish
        let failure_cost = generation
            .candidates
            .iter()
            .filter_map(|c| c.fitness)
            .fold(self.settings.failure_cost, f64::max);
        for &index in &failed {
            generation.candidates[index].fitness = Some(failure_cost);
        }
        let failed = failed.len();

        let costs: Vec<f64> = generation.candidates.iter().filter_map(|c| c.fitness).collect();
        let aggregate_reward = -costs.iter().sum::<f64>();

        self.optimizer.report_fitness(&generation)?;

        if let Some((idx, cost)) = generation.argmin() {
            if self.best.as_ref().map_or(true, |b| cost < b.fitness) {
                self.best = Some(BestSolution {
                    params: generation.candidates[idx].params.clone(),
                    fitness: cost,
                    iteration,
                });
            }
        }
        self.recorder.record_generation(aggregate_reward);
        self.iteration = iteration;

        let report = GenReport {
            iteration,
            gen_best: costs.iter().copied().fold(f64::INFINITY, f64::min),
            best_ever: self.best.as_ref().map_or(f64::INFINITY, |b| b.fitness),
            aggregate_reward,
            failed,
            sigma: self.optimizer.step_size(),
            elapsed: start.elapsed().as_secs_f64(),
        };
        tracing::info!(
            iter = report.iteration,
            gen_best = report.gen_best,
            best_ever = report.best_ever,
            reward = report.aggregate_reward,
            sigma = ?report.sigma,
            failed = report.failed,
            "Generation"
        );
        if let Some(cb) = self.on_gen.as_mut() {
            cb(&report);
        }

        if self.settings.checkpoint_interval > 0 && iteration % self.settings.checkpoint_interval == 0 {
            self.recorder.checkpoint(iteration, self.best.as_ref());
        }
        Ok(())
    }

    fn summary(&self, terminal: TrainState, stop_reasons: &[StopReason], started_at: DateTime<Utc>) -> RunSummary {
        RunSummary {
            run_name: self.info.run_name.clone(),
            environment: self.info.environment.clone(),
            architecture: self.info.architecture.clone(),
            started_at,
            finished_at: Utc::now(),
            terminal_state: terminal.to_string(),
            stop_reasons: stop_reasons.to_vec(),
            iterations: self.iteration,
            best_fitness: self.best.as_ref().map(|b| b.fitness),
            best_iteration: self.best.as_ref().map(|b| b.iteration),
            seed: self.info.seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EnvError, OptimizerError};
    use crate::experiments::env::{Action, ActionSpace, EnvConfig, EnvRegistry, Environment, StepResult};
    use crate::experiments::optim::{CmaEs, CmaEsConfig, Generation};
    use crate::experiments::policy::Architecture;
    use crate::experiments::rollout::RolloutRunner;
    use anyhow::Result;
    use std::sync::Mutex;

    // ─── Test doubles ────────────────────────────────────────────────

    #[derive(Default)]
    struct MemoryStore {
        snapshots: Vec<(usize, Vec<f64>)>,
        histories: Vec<Vec<f64>>,
        converged: Vec<Vec<f64>>,
        summaries: Vec<RunSummary>,
        fail_writes: bool,
    }

    impl ArtifactStore for MemoryStore {
        fn save_snapshot(&mut self, iteration: usize, best: &BestSolution) -> Result<()> {
            anyhow::ensure!(!self.fail_writes, "disk full");
            self.snapshots.push((iteration, best.params.clone()));
            Ok(())
        }
        fn save_history(&mut self, history: &RewardHistory) -> Result<()> {
            anyhow::ensure!(!self.fail_writes, "disk full");
            self.histories.push(history.as_slice().to_vec());
            Ok(())
        }
        fn save_converged(&mut self, best: &BestSolution) -> Result<()> {
            self.converged.push(best.params.clone());
            Ok(())
        }
        fn save_summary(&mut self, summary: &RunSummary) -> Result<()> {
            self.summaries.push(summary.clone());
            Ok(())
        }
    }

    /// Fitness source computing reward = -‖params‖² (one step, then done).
    struct NegNorm;

    impl FitnessEvaluator for NegNorm {
        type Worker = ();
        fn spawn_worker(&self) {}
        fn total_reward(&self, _: &mut (), params: &[f64]) -> Result<f64, RolloutError> {
            Ok(-params.iter().map(|v| v * v).sum::<f64>())
        }
    }

    /// Fails on the first step for vectors whose first component is 666.
    struct FailsOnMarker;

    impl FitnessEvaluator for FailsOnMarker {
        type Worker = ();
        fn spawn_worker(&self) {}
        fn total_reward(&self, _: &mut (), params: &[f64]) -> Result<f64, RolloutError> {
            if params[0] == 666.0 {
                return Err(RolloutError::Environment {
                    step: 0,
                    source: EnvError::InvalidAction { env: "stub".into(), reason: "bad".into() },
                });
            }
            Ok(params.iter().sum())
        }
    }

    /// Replays fixed generations; never converges on its own.
    struct Scripted {
        generations: Vec<Vec<Vec<f64>>>,
        next: usize,
        reported: Arc<Mutex<Vec<Generation>>>,
    }

    impl Scripted {
        fn cycling(generations: Vec<Vec<Vec<f64>>>) -> Self {
            Scripted { generations, next: 0, reported: Arc::default() }
        }
    }

    impl PopulationOptimizer for Scripted {
        fn has_converged(&self) -> bool {
            false
        }
        fn propose_generation(&mut self) -> Generation {
            let g = self.generations[self.next % self.generations.len()].clone();
            self.next += 1;
            Generation::from_params(g)
        }
        fn report_fitness(&mut self, generation: &Generation) -> Result<(), OptimizerError> {
            generation.costs()?;
            self.reported.lock().unwrap().push(generation.clone());
            Ok(())
        }
        fn population_size(&self) -> usize {
            self.generations[0].len()
        }
    }

    /// Wraps an optimizer and keeps every proposed generation.
    struct Recording<O> {
        inner: O,
        proposed: Vec<Generation>,
    }

    impl<O: PopulationOptimizer> PopulationOptimizer for Recording<O> {
        fn has_converged(&self) -> bool {
            self.inner.has_converged()
        }
        fn propose_generation(&mut self) -> Generation {
            let g = self.inner.propose_generation();
            self.proposed.push(g.clone());
            g
        }
        fn report_fitness(&mut self, generation: &Generation) -> Result<(), OptimizerError> {
            self.inner.report_fitness(generation)
        }
        fn population_size(&self) -> usize {
            self.inner.population_size()
        }
    }

    /// Reward 1 per step for 3 steps; faults on action 1.
    struct Picky {
        config: EnvConfig,
        obs: Vec<f32>,
        steps: usize,
    }

    fn picky_config(obs_dim: usize) -> EnvConfig {
        EnvConfig {
            name: "Picky".into(),
            obs_dim,
            action_space: ActionSpace::Discrete(2),
            max_steps: 3,
            solved_threshold: 3.0,
        }
    }

    impl Environment for Picky {
        fn reset(&mut self, _seed: Option<u64>) -> &[f32] {
            self.steps = 0;
            &self.obs
        }
        fn step(&mut self, action: &Action) -> Result<StepResult, EnvError> {
            if *action == Action::Discrete(1) {
                return Err(EnvError::Fault { env: "Picky".into(), reason: "actuator jammed".into() });
            }
            self.steps += 1;
            Ok(StepResult { reward: 1.0, terminated: false, truncated: self.steps >= 3 })
        }
        fn observation(&self) -> &[f32] {
            &self.obs
        }
        fn config(&self) -> &EnvConfig {
            &self.config
        }
        fn steps(&self) -> usize {
            self.steps
        }
    }

    /// Runner over a registered `Picky` declaring `obs_dim` and emitting `emit` values.
    fn picky_runner(obs_dim: usize, emit: usize) -> RolloutRunner {
        let mut registry = EnvRegistry::new();
        registry.register(picky_config(obs_dim), move |_| {
            Box::new(Picky { config: picky_config(obs_dim), obs: vec![1.0; emit], steps: 0 })
        });
        let handle = registry.resolve("Picky").unwrap();
        let arch = Architecture::for_env(obs_dim, &[], ActionSpace::Discrete(2)).unwrap();
        RolloutRunner::new(handle, arch, 50, 1, 0)
    }

    fn settings(max_iterations: usize, checkpoint_interval: usize) -> LoopSettings {
        LoopSettings { max_iterations, checkpoint_interval, ..LoopSettings::default() }
    }

    fn seeded_cma(pop: usize) -> Recording<CmaEs> {
        let cfg = CmaEsConfig { pop_size: Some(pop), seed: 2024, ..CmaEsConfig::default() };
        Recording { inner: CmaEs::new(36, &cfg), proposed: Vec::new() }
    }

    // ─── Scenarios ───────────────────────────────────────────────────

    #[test]
    fn test_one_generation_picks_min_norm() {
        let recorder = MetricsRecorder::new(MemoryStore::default());
        let mut trainer = TrainingLoop::new(seeded_cma(8), NegNorm, recorder, settings(1, 50));
        let outcome = trainer.run().unwrap();

        assert_eq!(outcome.terminal, TrainState::IterationLimitReached);
        assert_eq!(trainer.state(), TrainState::Done);
        let proposed = &trainer.optimizer().proposed;
        assert_eq!(proposed.len(), 1);
        assert_eq!(proposed[0].len(), 8);

        let norms: Vec<f64> = proposed[0]
            .candidates
            .iter()
            .map(|c| c.params.iter().map(|v| v * v).sum())
            .collect();
        let min_idx = (0..8).min_by(|&a, &b| norms[a].total_cmp(&norms[b])).unwrap();
        let best = outcome.best.unwrap();
        assert_eq!(best.params, proposed[0].candidates[min_idx].params);
        assert_eq!(best.params.len(), 36);
        assert_eq!(best.fitness, norms[min_idx]);

        // aggregate reward = -Σ cost = -Σ ‖x‖²
        let aggregate: f64 = -norms.iter().sum::<f64>();
        assert_eq!(outcome.history.len(), 1);
        assert!((outcome.history.as_slice()[0] - aggregate).abs() < 1e-9);
    }

    #[test]
    fn test_iteration_cap_finalizes_once() {
        let gens = vec![vec![vec![1.0, 2.0], vec![0.5, 0.5]]];
        let recorder = MetricsRecorder::new(MemoryStore::default());
        let mut trainer = TrainingLoop::new(Scripted::cycling(gens), NegNorm, recorder, settings(5, 50));
        let outcome = trainer.run().unwrap();

        assert_eq!(outcome.terminal, TrainState::IterationLimitReached);
        assert_eq!(outcome.iterations, 5);
        assert_eq!(trainer.optimizer().reported.lock().unwrap().len(), 5);
        let store = trainer.recorder().store();
        assert_eq!(store.summaries.len(), 1);
        assert_eq!(store.converged.len(), 1);
        assert_eq!(store.summaries[0].terminal_state, "iteration_limit_reached");
        assert_eq!(store.histories.last().unwrap().len(), 5);
    }

    #[test]
    fn test_failed_rollout_gets_worst_case_cost() {
        let mut gen: Vec<Vec<f64>> = (0..8).map(|i| vec![i as f64, 1.0]).collect();
        gen[3][0] = 666.0;
        let scripted = Scripted::cycling(vec![gen]);
        let reported = scripted.reported.clone();
        let recorder = MetricsRecorder::new(MemoryStore::default());
        let mut trainer = TrainingLoop::new(scripted, FailsOnMarker, recorder, settings(1, 50));
        trainer.run().unwrap();

        let reported = reported.lock().unwrap();
        assert_eq!(reported.len(), 1);
        let costs = reported[0].costs().unwrap();
        assert_eq!(costs.len(), 8);
        for (i, cost) in costs.iter().enumerate() {
            if i == 3 {
                assert_eq!(*cost, 1e6);
            } else {
                assert_eq!(*cost, -(i as f64 + 1.0));
            }
        }
        // Params stayed aligned with their costs
        assert_eq!(reported[0].candidates[3].params, vec![666.0, 1.0]);
    }

    #[test]
    fn test_environment_fault_through_runner_gets_failure_cost() {
        // Linear 1→2 policy on obs [1.0]: logits = [w0 + b0, w1 + b1]
        let gen = vec![vec![1.0, 0.0, 0.0, 0.0], vec![0.0, 1.0, 0.0, 0.0], vec![2.0, 0.0, 0.0, 0.0]];
        let scripted = Scripted::cycling(vec![gen]);
        let reported = scripted.reported.clone();
        let recorder = MetricsRecorder::new(MemoryStore::default());
        let mut trainer = TrainingLoop::new(scripted, picky_runner(1, 1), recorder, settings(1, 50));
        let outcome = trainer.run().unwrap();

        let costs = reported.lock().unwrap()[0].costs().unwrap();
        assert_eq!(costs, vec![-3.0, 1e6, -3.0]);
        let best = outcome.best.unwrap();
        assert_eq!(best.fitness, -3.0);
        assert_eq!(best.params, vec![1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_oversized_observation_fails_only_the_rollout() {
        // Declares 2 observation values, emits 3
        let gen: Vec<Vec<f64>> = (0..8).map(|i| vec![i as f64 * 0.1; 6]).collect();
        let scripted = Scripted::cycling(vec![gen]);
        let reported = scripted.reported.clone();
        let recorder = MetricsRecorder::new(MemoryStore::default());
        let mut trainer = TrainingLoop::new(scripted, picky_runner(2, 3), recorder, settings(2, 50));
        let outcome = trainer.run().unwrap();

        assert_eq!(outcome.terminal, TrainState::IterationLimitReached);
        assert_eq!(outcome.iterations, 2);
        let reported = reported.lock().unwrap();
        assert_eq!(reported.len(), 2);
        assert!(reported[0].costs().unwrap().iter().all(|c| *c == 1e6));
    }

    #[test]
    fn test_failure_cost_never_beats_finished_candidates() {
        let gen = vec![vec![-5e6, 0.0], vec![666.0, 0.0], vec![-2e6, 0.0]];
        let scripted = Scripted::cycling(vec![gen]);
        let reported = scripted.reported.clone();
        let recorder = MetricsRecorder::new(MemoryStore::default());
        let mut trainer = TrainingLoop::new(scripted, FailsOnMarker, recorder, settings(1, 50));
        let outcome = trainer.run().unwrap();

        let costs = reported.lock().unwrap()[0].costs().unwrap();
        assert_eq!(costs, vec![5e6, 5e6, 2e6]);
        assert_eq!(outcome.best.unwrap().params, vec![-2e6, 0.0]);
    }

    #[test]
    fn test_converged_optimizer_runs_zero_generations() {
        let cfg = CmaEsConfig { max_generations: Some(0), ..CmaEsConfig::default() };
        let recorder = MetricsRecorder::new(MemoryStore::default());
        let mut trainer = TrainingLoop::new(CmaEs::new(4, &cfg), NegNorm, recorder, settings(10, 5));
        let outcome = trainer.run().unwrap();

        assert_eq!(outcome.terminal, TrainState::Converged);
        assert_eq!(outcome.iterations, 0);
        assert!(outcome.best.is_none());
        let store = trainer.recorder().store();
        assert!(store.converged.is_empty());
        assert_eq!(store.histories, vec![Vec::<f64>::new()]);
        assert_eq!(store.summaries.len(), 1);
    }

    #[test]
    fn test_best_matches_union_of_generations() {
        let recorder = MetricsRecorder::new(MemoryStore::default());
        let mut trainer = TrainingLoop::new(seeded_cma(6), NegNorm, recorder, settings(12, 50));
        let outcome = trainer.run().unwrap();

        let all: Vec<&Vec<f64>> = trainer
            .optimizer()
            .proposed
            .iter()
            .flat_map(|g| g.candidates.iter().map(|c| &c.params))
            .collect();
        assert_eq!(all.len(), 12 * 6);
        let norm = |p: &Vec<f64>| p.iter().map(|v| v * v).sum::<f64>();
        let expected = all.iter().copied().min_by(|a, b| norm(a).total_cmp(&norm(b))).unwrap();
        assert_eq!(&outcome.best.unwrap().params, expected);
    }

    #[test]
    fn test_checkpoints_hold_full_history() {
        let gens = vec![vec![vec![1.0], vec![2.0]], vec![vec![0.5], vec![3.0]]];
        let recorder = MetricsRecorder::new(MemoryStore::default());
        let mut trainer = TrainingLoop::new(Scripted::cycling(gens), NegNorm, recorder, settings(7, 3));
        trainer.run().unwrap();

        let store = trainer.recorder().store();
        let iterations: Vec<usize> = store.snapshots.iter().map(|(k, _)| *k).collect();
        assert_eq!(iterations, vec![3, 6]);
        // Two checkpoint histories plus the final one
        let lens: Vec<usize> = store.histories.iter().map(Vec::len).collect();
        assert_eq!(lens, vec![3, 6, 7]);
        assert_eq!(store.histories[0], vec![-5.0, -9.25, -5.0]);
        // Best came from generation 2 (0.5² = 0.25)
        assert_eq!(store.snapshots[0].1, vec![0.5]);
        assert_eq!(store.converged, vec![vec![0.5]]);
    }

    #[test]
    fn test_checkpoint_write_failure_keeps_running() {
        let gens = vec![vec![vec![1.0], vec![2.0]]];
        let store = MemoryStore { fail_writes: true, ..MemoryStore::default() };
        let mut trainer = TrainingLoop::new(
            Scripted::cycling(gens),
            NegNorm,
            MetricsRecorder::new(store),
            settings(4, 1),
        );
        let result = trainer.run();
        // Checkpoints all failed; final history write fails too and is reported
        assert!(matches!(result, Err(TrainError::Finalize(_))));
        assert_eq!(trainer.iteration(), 4);
    }

    #[test]
    fn test_nan_reward_is_fatal() {
        struct NanAt(usize);
        impl FitnessEvaluator for NanAt {
            type Worker = ();
            fn spawn_worker(&self) {}
            fn total_reward(&self, _: &mut (), params: &[f64]) -> Result<f64, RolloutError> {
                Ok(if params[0] as usize == self.0 { f64::NAN } else { 1.0 })
            }
        }
        let gens = vec![vec![vec![0.0], vec![1.0], vec![2.0]]];
        let scripted = Scripted::cycling(gens);
        let reported = scripted.reported.clone();
        let recorder = MetricsRecorder::new(MemoryStore::default());
        let mut trainer = TrainingLoop::new(scripted, NanAt(2), recorder, settings(3, 50));
        let err = trainer.run().unwrap_err();
        assert!(matches!(err, TrainError::Divergence { iteration: 1, candidate: 2, .. }));
        assert!(reported.lock().unwrap().is_empty());
    }

    #[test]
    fn test_shape_mismatch_is_fatal() {
        struct WrongShape;
        impl FitnessEvaluator for WrongShape {
            type Worker = ();
            fn spawn_worker(&self) {}
            fn total_reward(&self, _: &mut (), params: &[f64]) -> Result<f64, RolloutError> {
                Err(crate::error::ShapeMismatch { expected: 3, actual: params.len() }.into())
            }
        }
        let gens = vec![vec![vec![0.0], vec![1.0]]];
        let recorder = MetricsRecorder::new(MemoryStore::default());
        let mut trainer = TrainingLoop::new(Scripted::cycling(gens), WrongShape, recorder, settings(3, 50));
        assert!(matches!(trainer.run(), Err(TrainError::Shape(_))));
    }

    #[test]
    fn test_stop_flag_interrupts_between_generations() {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let gens = vec![vec![vec![1.0], vec![2.0]]];
        let recorder = MetricsRecorder::new(MemoryStore::default());
        let mut trainer = TrainingLoop::new(Scripted::cycling(gens), NegNorm, recorder, settings(100, 50))
            .with_stop_flag(stop)
            .on_generation(move |r| {
                if r.iteration == 3 {
                    flag.store(true, Ordering::Relaxed);
                }
            });
        let outcome = trainer.run().unwrap();
        assert_eq!(outcome.terminal, TrainState::Interrupted);
        assert_eq!(outcome.iterations, 3);
        assert_eq!(trainer.recorder().store().summaries.len(), 1);
    }

    #[test]
    fn test_cma_on_cartpole_improves() {
        let handle = EnvRegistry::with_builtins().resolve("CartPole-v1").unwrap();
        let arch = Architecture::for_env(4, &[], ActionSpace::Discrete(2)).unwrap();
        let runner = RolloutRunner::new(handle, arch.clone(), 500, 1, 0);
        let cma = CmaEs::new(arch.n_params(), &CmaEsConfig { seed: 5, ..CmaEsConfig::default() });
        let recorder = MetricsRecorder::new(MemoryStore::default());
        let mut trainer = TrainingLoop::new(cma, runner, recorder, settings(30, 10));
        let outcome = trainer.run().unwrap();

        let best = outcome.best.unwrap();
        assert_eq!(best.params.len(), 10);
        assert!(best.fitness <= -100.0, "linear CartPole policy should balance, got {}", best.fitness);
    }
}
