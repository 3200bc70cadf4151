//! Generation loop of a single GA run.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};
use serde::Serialize;

use super::{
    EvolutionError, GenerationRecord, LayoutRng, LayoutSnapshot, Population,
    PopulationCheckpoint, RunLogWriter,
};
use crate::schema::{EngineConfig, Problem, RunParameters};

/// Lifecycle of a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum DriverPhase {
    /// Population not built yet.
    #[default]
    Initializing,
    /// Population built, no generation evaluated yet.
    Running,
    /// Last generation was not judged stagnant.
    Improving,
    /// Last generation was judged stagnant; the next mutation is boosted.
    Stagnant,
    /// Generation limit passed.
    Terminated,
}

/// Sliding window of the most recent best scores.
#[derive(Debug, Clone)]
pub struct StagnationWindow {
    scores: VecDeque<u64>,
    capacity: usize,
}

impl StagnationWindow {
    /// Create an empty window.
    pub fn new(capacity: usize) -> Self {
        Self {
            scores: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a best score, evicting the oldest one when full.
    pub fn push(&mut self, score: u64) {
        if self.scores.len() == self.capacity {
            self.scores.pop_front();
        }
        self.scores.push_back(score);
    }

    /// Whether the window holds `capacity` scores.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.scores.len() == self.capacity
    }

    /// A full window whose mean equals `current` exactly.
    pub fn is_stagnant(&self, current: u64) -> bool {
        if !self.is_full() || self.scores.is_empty() {
            return false;
        }
        let sum: u128 = self.scores.iter().map(|&s| s as u128).sum();
        sum == current as u128 * self.scores.len() as u128
    }
}

/// Outcome of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Run identifier.
    pub run_id: u64,
    /// Generations evaluated.
    pub generations: u64,
    /// Best score seen in any generation.
    pub best_score: u64,
    /// Layout that achieved the best score.
    pub best_layout: LayoutSnapshot,
    /// Generations judged stagnant.
    pub stagnant_generations: u64,
    /// Wall time of the run.
    pub elapsed_seconds: f64,
}

/// Runs the generation loop for one set of run parameters.
pub struct EvolutionDriver {
    params: RunParameters,
    engine: EngineConfig,
    problem: Arc<Problem>,
    rng: LayoutRng,
    population: Option<Population>,
    window: StagnationWindow,
    phase: DriverPhase,
    best: Option<(u64, LayoutSnapshot)>,
    stagnant_generations: u64,
    last_mutation: Option<(f64, usize)>,
    checkpoint_path: Option<PathBuf>,
}

impl EvolutionDriver {
    /// Create a driver. Parameters are validated here.
    pub fn new(
        params: RunParameters,
        engine: EngineConfig,
        problem: Arc<Problem>,
        seed: u64,
    ) -> Result<Self, EvolutionError> {
        params.validate()?;
        engine.validate()?;
        let window = StagnationWindow::new(engine.stagnation_window);

        Ok(Self {
            params,
            engine,
            problem,
            rng: LayoutRng::new(seed),
            population: None,
            window,
            phase: DriverPhase::Initializing,
            best: None,
            stagnant_generations: 0,
            last_mutation: None,
            checkpoint_path: None,
        })
    }

    /// Save the population to `path` every `checkpoint_interval` generations.
    pub fn with_checkpoint_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint_path = Some(path.into());
        self
    }

    /// Run parameters.
    pub fn params(&self) -> &RunParameters {
        &self.params
    }

    /// Current phase.
    pub fn phase(&self) -> DriverPhase {
        self.phase
    }

    /// Current population, once initialized.
    pub fn population(&self) -> Option<&Population> {
        self.population.as_ref()
    }

    /// Mutation chance and count used by the most recent mutation pass.
    pub fn last_mutation(&self) -> Option<(f64, usize)> {
        self.last_mutation
    }

    /// Build the random generation-0 population.
    pub fn initialize(&mut self) -> Result<(), EvolutionError> {
        let population = self
            .rng
            .initial_population(Arc::clone(&self.problem), self.params.population_size)?;
        self.population = Some(population);
        self.window = StagnationWindow::new(self.engine.stagnation_window);
        self.best = None;
        self.stagnant_generations = 0;
        self.phase = DriverPhase::Running;
        Ok(())
    }

    /// Continue from a saved population instead of a random one.
    ///
    /// The saved generation is evaluated again by the next step. Stagnation
    /// history and the best score start over.
    pub fn resume(&mut self, population: Population) -> Result<(), EvolutionError> {
        let expected = self.problem.machine_count();
        if let Some(layout) = population.layouts().iter().find(|l| l.len() != expected) {
            return Err(EvolutionError::CheckpointMismatch {
                expected,
                actual: layout.len(),
            });
        }
        if population.is_empty() {
            return Err(EvolutionError::EmptyPopulation);
        }

        info!(
            "Run {}: resuming at generation {}",
            self.params.id,
            population.generation()
        );
        self.population = Some(population);
        self.window = StagnationWindow::new(self.engine.stagnation_window);
        self.best = None;
        self.stagnant_generations = 0;
        self.last_mutation = None;
        self.phase = DriverPhase::Running;
        Ok(())
    }

    /// Current population in saveable form.
    pub fn checkpoint(&self) -> Option<PopulationCheckpoint> {
        self.population.as_ref().map(Population::checkpoint)
    }

    /// Whether the generation limit has been passed.
    pub fn should_stop(&self) -> bool {
        match &self.population {
            Some(population) => {
                !self.params.is_unbounded() && population.generation() > self.params.max_generations
            }
            None => false,
        }
    }

    /// Mutation chance and count for a generation.
    ///
    /// A stagnant generation doubles both; the boost applies to that
    /// generation's mutation pass only.
    pub fn mutation_parameters(&self, stagnant: bool) -> (f64, usize) {
        if stagnant {
            (
                (self.params.mutation_rate * 2.0).min(1.0),
                self.params.mutation_count * 2,
            )
        } else {
            (self.params.mutation_rate, self.params.mutation_count)
        }
    }

    /// Evaluate the current generation, report it, then breed the next one.
    ///
    /// The callback runs before breeding; an error from it aborts the step.
    /// On checkpoint generations the evaluated population is saved after the
    /// callback.
    pub fn step<F>(&mut self, callback: &mut F) -> Result<GenerationRecord, EvolutionError>
    where
        F: FnMut(&GenerationRecord) -> Result<(), EvolutionError>,
    {
        if self.population.is_none() {
            self.initialize()?;
        }

        let (record, stagnant) = self.evaluate_generation()?;
        callback(&record)?;
        self.save_checkpoint(record.generation)?;
        self.breed(stagnant)?;
        Ok(record)
    }

    /// Sort the population, update the stagnation window and build the log
    /// record for the current generation.
    fn evaluate_generation(&mut self) -> Result<(GenerationRecord, bool), EvolutionError> {
        let population = self
            .population
            .as_mut()
            .ok_or(EvolutionError::EmptyPopulation)?;
        let generation = population.generation();
        let best_score = population.sort_by_fitness(self.engine.overlap_penalty)?;
        let best_layout = population
            .best_layout()
            .ok_or(EvolutionError::EmptyPopulation)?
            .snapshot();

        self.window.push(best_score);
        let stagnant = self.window.is_stagnant(best_score);
        if stagnant {
            self.stagnant_generations += 1;
            debug!(
                "Run {}: generation {} stagnant at {}",
                self.params.id, generation, best_score
            );
        }

        let final_generation =
            !self.params.is_unbounded() && generation == self.params.max_generations;
        let snapshot_due = generation % self.engine.snapshot_interval == 0 || final_generation;

        if self.best.as_ref().is_none_or(|(score, _)| best_score < *score) {
            self.best = Some((best_score, best_layout.clone()));
        }

        let record = GenerationRecord {
            generation,
            best_score,
            best_layout: snapshot_due.then_some(best_layout),
        };

        self.phase = if stagnant {
            DriverPhase::Stagnant
        } else {
            DriverPhase::Improving
        };

        Ok((record, stagnant))
    }

    fn save_checkpoint(&self, generation: u64) -> Result<(), EvolutionError> {
        let interval = self.engine.checkpoint_interval;
        let (Some(path), Some(population)) = (&self.checkpoint_path, &self.population) else {
            return Ok(());
        };
        if interval == 0 || generation % interval != 0 {
            return Ok(());
        }
        population.checkpoint().save(path)?;
        debug!(
            "Run {}: saved generation {} to {}",
            self.params.id,
            generation,
            path.display()
        );
        Ok(())
    }

    /// Select parents, recombine and mutate into the next generation.
    fn breed(&mut self, stagnant: bool) -> Result<(), EvolutionError> {
        let (chance, count) = self.mutation_parameters(stagnant);
        let population = self
            .population
            .as_ref()
            .ok_or(EvolutionError::EmptyPopulation)?;

        let parents = self.rng.select(
            &self.params.method,
            population,
            self.engine.parents_per_generation,
            self.engine.overlap_penalty,
        )?;
        let mut next = self
            .rng
            .crossover(population, &parents, self.params.cross_chance)?;
        self.rng.mutate(&mut next, chance, count)?;

        self.last_mutation = Some((chance, count));
        self.population = Some(next);
        Ok(())
    }

    /// Run until the generation limit, reporting every generation.
    pub fn run_with_callback<F>(&mut self, mut callback: F) -> Result<RunSummary, EvolutionError>
    where
        F: FnMut(&GenerationRecord) -> Result<(), EvolutionError>,
    {
        let start_time = Instant::now();
        info!(
            "Run {}: {} population={} mutation={}x{} cross={} max_generations={}",
            self.params.id,
            self.params.method.tag(),
            self.params.population_size,
            self.params.mutation_rate,
            self.params.mutation_count,
            self.params.cross_chance,
            self.params.max_generations
        );

        if self.population.is_none() {
            self.initialize()?;
        }
        let mut generations = 0;
        while !self.should_stop() {
            let record = self.step(&mut callback)?;
            generations += 1;
            debug!(
                "Run {}: generation {} best {}",
                self.params.id, record.generation, record.best_score
            );
        }
        self.phase = DriverPhase::Terminated;

        let (best_score, best_layout) = self.best.clone().ok_or(EvolutionError::EmptyPopulation)?;
        let elapsed_seconds = start_time.elapsed().as_secs_f64();
        info!(
            "Run {}: finished after {} generations with best score {} ({:.2}s)",
            self.params.id, generations, best_score, elapsed_seconds
        );

        Ok(RunSummary {
            run_id: self.params.id,
            generations,
            best_score,
            best_layout,
            stagnant_generations: self.stagnant_generations,
            elapsed_seconds,
        })
    }

    /// Run until the generation limit, writing every generation to a log.
    pub fn run_to_log(&mut self, log: &mut RunLogWriter) -> Result<RunSummary, EvolutionError> {
        self.run_with_callback(|record| log.write_record(record).map_err(EvolutionError::from))
    }

    /// Run until the generation limit (blocking).
    pub fn run(&mut self) -> Result<RunSummary, EvolutionError> {
        self.run_with_callback(|_| Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::Layout;
    use crate::schema::{Board, Connection, SelectionMethod};
    use std::io;
    use tempfile::tempdir;

    fn problem(machines: usize, width: u32, height: u32) -> Arc<Problem> {
        let connections = (0..machines - 1)
            .map(|i| Connection {
                source: i,
                target: i + 1,
                amount: 1,
                cost: 1 + i as u64,
            })
            .collect();
        Arc::new(Problem::new(connections, Board { width, height }).unwrap())
    }

    fn params(method: SelectionMethod, max_generations: u64) -> RunParameters {
        RunParameters {
            id: 1,
            method,
            population_size: 10,
            mutation_rate: 0.3,
            mutation_count: 2,
            cross_chance: 0.8,
            max_generations,
        }
    }

    #[test]
    fn test_stagnation_window() {
        let mut window = StagnationWindow::new(3);
        window.push(5);
        window.push(5);
        assert!(!window.is_stagnant(5));

        window.push(5);
        assert!(window.is_full());
        assert!(window.is_stagnant(5));

        window.push(4);
        assert!(!window.is_stagnant(4));
        window.push(4);
        window.push(4);
        assert!(window.is_stagnant(4));
    }

    #[test]
    fn test_run_generation_count_and_log_cadence() {
        let mut driver = EvolutionDriver::new(
            params(SelectionMethod::Tournament { sample_size: 3.0 }, 25),
            EngineConfig::default(),
            problem(6, 4, 4),
            42,
        )
        .unwrap();
        assert_eq!(driver.phase(), DriverPhase::Initializing);

        let mut records = Vec::new();
        let summary = driver
            .run_with_callback(|record| {
                records.push(record.clone());
                Ok(())
            })
            .unwrap();

        assert_eq!(driver.phase(), DriverPhase::Terminated);
        assert_eq!(summary.generations, 26);
        assert_eq!(records.len(), 26);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.generation, i as u64);
            let expect_snapshot = i % 10 == 0 || i == 25;
            assert_eq!(record.best_layout.is_some(), expect_snapshot);
        }

        let min = records.iter().map(|r| r.best_score).min().unwrap();
        assert_eq!(summary.best_score, min);
        let best = Layout::from_snapshot(&summary.best_layout).unwrap();
        assert_eq!(
            best.fitness(driver.problem.connections(), 10_000).unwrap(),
            summary.best_score
        );
    }

    #[test]
    fn test_roulette_run_keeps_population_valid() {
        let mut driver = EvolutionDriver::new(
            params(SelectionMethod::Roulette, 15),
            EngineConfig::default(),
            problem(8, 3, 3),
            7,
        )
        .unwrap();
        let summary = driver.run().unwrap();
        assert_eq!(summary.generations, 16);

        let population = driver.population().unwrap();
        assert_eq!(population.len(), 10);
        assert_eq!(population.generation(), 16);
        for layout in population.layouts() {
            assert!(Layout::from_machines(layout.machines().to_vec(), 7).is_ok());
        }
    }

    #[test]
    fn test_stagnation_doubles_mutation_for_one_pass() {
        // Two machines on a 2x1 board: every layout costs 1, so the best
        // score never changes and the run is stagnant once the window fills.
        let mut run = params(SelectionMethod::Tournament { sample_size: 2.0 }, 0);
        run.mutation_rate = 0.25;
        run.mutation_count = 1;
        run.cross_chance = 0.0;
        let mut driver =
            EvolutionDriver::new(run, EngineConfig::default(), problem(2, 2, 1), 3).unwrap();

        let mut noop = |_: &GenerationRecord| -> Result<(), EvolutionError> { Ok(()) };
        for generation in 0..15u64 {
            let record = driver.step(&mut noop).unwrap();
            assert_eq!(record.best_score, 1);
            if generation < 9 {
                assert_eq!(driver.phase(), DriverPhase::Improving);
                assert_eq!(driver.last_mutation(), Some((0.25, 1)));
            } else {
                assert_eq!(driver.phase(), DriverPhase::Stagnant);
                assert_eq!(driver.last_mutation(), Some((0.5, 2)));
            }
        }

        assert_eq!(driver.mutation_parameters(false), (0.25, 1));
        assert_eq!(driver.mutation_parameters(true), (0.5, 2));
    }

    #[test]
    fn test_boosted_chance_is_capped() {
        let mut run = params(SelectionMethod::Roulette, 5);
        run.mutation_rate = 0.8;
        let driver =
            EvolutionDriver::new(run, EngineConfig::default(), problem(3, 3, 3), 1).unwrap();
        assert_eq!(driver.mutation_parameters(true), (1.0, 4));
    }

    #[test]
    fn test_callback_error_aborts_run() {
        let mut driver = EvolutionDriver::new(
            params(SelectionMethod::Roulette, 50),
            EngineConfig::default(),
            problem(4, 3, 3),
            5,
        )
        .unwrap();

        let mut calls = 0;
        let result = driver.run_with_callback(|_| {
            calls += 1;
            if calls == 3 {
                Err(io::Error::other("disk full").into())
            } else {
                Ok(())
            }
        });

        assert!(matches!(result, Err(EvolutionError::Io(_))));
        assert_eq!(calls, 3);
        assert_ne!(driver.phase(), DriverPhase::Terminated);
    }

    #[test]
    fn test_invalid_sample_size_fails_run() {
        let driver = EvolutionDriver::new(
            params(SelectionMethod::Tournament { sample_size: 20.0 }, 5),
            EngineConfig::default(),
            problem(4, 3, 3),
            5,
        );
        let mut driver = driver.unwrap();
        assert!(matches!(
            driver.run(),
            Err(EvolutionError::InvalidSampleSize {
                sample: 20,
                population: 10
            })
        ));
    }

    #[test]
    fn test_invalid_params_rejected() {
        let mut run = params(SelectionMethod::Roulette, 5);
        run.population_size = 0;
        assert!(matches!(
            EvolutionDriver::new(run, EngineConfig::default(), problem(3, 3, 3), 1),
            Err(EvolutionError::Config(_))
        ));
    }

    fn place_all(driver: &mut EvolutionDriver, positions: [(i32, i32); 3]) {
        let population = driver.population.as_mut().unwrap();
        for layout in population.layouts_mut() {
            for (id, &(x, y)) in positions.iter().enumerate() {
                layout.set_position(id, x, y).unwrap();
            }
        }
    }

    #[test]
    fn test_improvement_ends_stagnation_boost() {
        // Without mutation or crossover the population never changes on its
        // own, so the best score only moves when the test moves machines.
        let mut run = params(SelectionMethod::Tournament { sample_size: 2.0 }, 0);
        run.mutation_rate = 0.0;
        run.mutation_count = 1;
        run.cross_chance = 0.0;
        let mut driver =
            EvolutionDriver::new(run, EngineConfig::default(), problem(3, 3, 1), 11).unwrap();
        driver.initialize().unwrap();
        // Connection 0-1 costs 1, connection 1-2 costs 2 * 2.
        place_all(&mut driver, [(1, 0), (0, 0), (2, 0)]);

        let mut noop = |_: &GenerationRecord| -> Result<(), EvolutionError> { Ok(()) };
        for generation in 0..12u64 {
            let record = driver.step(&mut noop).unwrap();
            assert_eq!(record.best_score, 5);
            if generation < 9 {
                assert_eq!(driver.phase(), DriverPhase::Improving);
                assert_eq!(driver.last_mutation(), Some((0.0, 1)));
            } else {
                assert_eq!(driver.phase(), DriverPhase::Stagnant);
                assert_eq!(driver.last_mutation(), Some((0.0, 2)));
            }
        }

        place_all(&mut driver, [(0, 0), (1, 0), (2, 0)]);
        let record = driver.step(&mut noop).unwrap();
        assert_eq!(record.best_score, 3);
        assert_eq!(driver.phase(), DriverPhase::Improving);
        assert_eq!(driver.last_mutation(), Some((0.0, 1)));

        driver.step(&mut noop).unwrap();
        assert_eq!(driver.phase(), DriverPhase::Improving);
        assert_eq!(driver.last_mutation(), Some((0.0, 1)));
        assert_eq!(driver.stagnant_generations, 3);
    }

    #[test]
    fn test_checkpoint_and_resume() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run_1.json");
        let engine = EngineConfig {
            checkpoint_interval: 10,
            ..EngineConfig::default()
        };
        let problem = problem(5, 3, 3);

        let mut driver = EvolutionDriver::new(
            params(SelectionMethod::Roulette, 30),
            engine.clone(),
            Arc::clone(&problem),
            8,
        )
        .unwrap()
        .with_checkpoint_path(&path);
        let result = driver.run_with_callback(|record| {
            if record.generation == 15 {
                Err(io::Error::other("killed").into())
            } else {
                Ok(())
            }
        });
        assert!(result.is_err());

        let checkpoint = PopulationCheckpoint::load(&path).unwrap();
        assert_eq!(checkpoint.generation, 10);
        assert_eq!(checkpoint.layouts.len(), 10);

        let mut resumed = EvolutionDriver::new(
            params(SelectionMethod::Roulette, 30),
            engine,
            Arc::clone(&problem),
            9,
        )
        .unwrap();
        resumed
            .resume(Population::restore(problem, &checkpoint).unwrap())
            .unwrap();
        assert_eq!(resumed.phase(), DriverPhase::Running);

        let mut generations = Vec::new();
        let summary = resumed
            .run_with_callback(|record| {
                generations.push(record.generation);
                Ok(())
            })
            .unwrap();
        assert_eq!(summary.generations, 21);
        assert_eq!(generations, (10..=30).collect::<Vec<u64>>());
    }

    #[test]
    fn test_resume_rejects_other_problem() {
        let mut small = EvolutionDriver::new(
            params(SelectionMethod::Roulette, 5),
            EngineConfig::default(),
            problem(3, 3, 3),
            1,
        )
        .unwrap();
        small.initialize().unwrap();
        let checkpoint = small.checkpoint().unwrap();

        let large = problem(4, 3, 3);
        let mut driver = EvolutionDriver::new(
            params(SelectionMethod::Roulette, 5),
            EngineConfig::default(),
            Arc::clone(&large),
            1,
        )
        .unwrap();
        let restored = Population::restore(small.problem.clone(), &checkpoint).unwrap();
        assert!(matches!(
            driver.resume(restored),
            Err(EvolutionError::CheckpointMismatch {
                expected: 4,
                actual: 3
            })
        ));
        assert_eq!(driver.phase(), DriverPhase::Initializing);
    }
}
