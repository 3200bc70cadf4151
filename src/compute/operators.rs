//! Genetic operators: random placement, selection, crossover with repair
//! and mutation.
//!
//! Every operator that produces or modifies a layout leaves it a valid
//! permutation of machine identifiers.

use std::sync::Arc;

use log::debug;
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand::seq::index;

use super::{EvolutionError, GenerationRecord, Layout, Machine, Population, RunLogWriter};
use crate::schema::{Board, Problem, SelectionMethod};

/// Tournament draws allowed per requested winner before falling back to
/// a ranked scan of the population.
const TOURNAMENT_ATTEMPTS_PER_WINNER: usize = 64;

/// Outcome of a single mutation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStep {
    /// The machine moved to a free cell (or stayed on its own cell).
    Relocated { machine: usize },
    /// The target cell was taken; the two machines exchanged positions.
    Swapped { machine: usize, other: usize },
}

/// Random number generator wrapper for layout operations.
pub struct LayoutRng {
    rng: StdRng,
}

impl LayoutRng {
    /// Create from seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Generate a layout with machines on distinct random cells and a
    /// shuffled gene order.
    pub fn random_layout(&mut self, problem: &Problem) -> Result<Layout, EvolutionError> {
        let board = problem.board();
        let count = problem.machine_count();
        if board.cells() < count {
            return Err(EvolutionError::BoardTooSmall {
                cells: board.cells(),
                machines: count,
            });
        }

        let mut ids: Vec<usize> = (0..count).collect();
        ids.shuffle(&mut self.rng);

        let cells = index::sample(&mut self.rng, board.cells(), count);
        let machines = ids
            .into_iter()
            .zip(cells.iter())
            .map(|(id, cell)| {
                let x = (cell % board.width as usize) as i32;
                let y = (cell / board.width as usize) as i32;
                Machine::new(id, x, y)
            })
            .collect();

        Layout::from_machines(machines, problem.max_id())
    }

    /// Build a full generation-0 population of random layouts.
    pub fn initial_population(
        &mut self,
        problem: Arc<Problem>,
        size: usize,
    ) -> Result<Population, EvolutionError> {
        let mut population = Population::new(Arc::clone(&problem), size);
        for _ in 0..size {
            population.push(self.random_layout(&problem)?);
        }
        Ok(population)
    }

    /// Score `count` independent random layouts as a reference for what the
    /// search achieves. Every layout is logged with its index in place of a
    /// generation. Returns the best score, or `None` when `count` is 0.
    pub fn random_baseline(
        &mut self,
        problem: &Problem,
        count: u64,
        overlap_penalty: u64,
        log: &mut RunLogWriter,
    ) -> Result<Option<u64>, EvolutionError> {
        let mut best: Option<u64> = None;
        for index in 0..count {
            let layout = self.random_layout(problem)?;
            let score = layout.fitness(problem.connections(), overlap_penalty)?;
            log.write_record(&GenerationRecord {
                generation: index,
                best_score: score,
                best_layout: Some(layout.snapshot()),
            })?;
            best = Some(best.map_or(score, |b| b.min(score)));
        }
        Ok(best)
    }

    /// Select parents with the given method.
    pub fn select(
        &mut self,
        method: &SelectionMethod,
        population: &Population,
        number_of_results: usize,
        overlap_penalty: u64,
    ) -> Result<Vec<Layout>, EvolutionError> {
        match method {
            SelectionMethod::Tournament { sample_size } => self.tournament(
                population,
                *sample_size,
                number_of_results,
                overlap_penalty,
            ),
            SelectionMethod::Roulette => {
                self.roulette(population, number_of_results, overlap_penalty)
            }
        }
    }

    /// Tournament selection.
    ///
    /// Each round draws `sample_size` distinct layouts and keeps the
    /// fittest; rounds repeat until `number_of_results` mutually unequal
    /// winners are found. A sample size below 1 is a fraction of the
    /// population. A sample size resolving to 0 returns the whole
    /// population.
    ///
    /// When the draws keep producing layouts already selected, the
    /// remaining winners are taken from the fittest distinct layouts. A
    /// population with fewer distinct layouts than requested yields fewer
    /// winners.
    pub fn tournament(
        &mut self,
        population: &Population,
        sample_size: f64,
        number_of_results: usize,
        overlap_penalty: u64,
    ) -> Result<Vec<Layout>, EvolutionError> {
        let layouts = population.layouts();
        if layouts.is_empty() {
            return Err(EvolutionError::EmptyPopulation);
        }

        let sample = resolve_sample_size(sample_size, layouts.len());
        if sample == 0 {
            return Ok(layouts.to_vec());
        }
        if sample > layouts.len() {
            return Err(EvolutionError::InvalidSampleSize {
                sample,
                population: layouts.len(),
            });
        }

        let scores = layouts
            .iter()
            .map(|layout| population.fitness_of(layout, overlap_penalty))
            .collect::<Result<Vec<_>, EvolutionError>>()?;

        let mut winners: Vec<usize> = Vec::with_capacity(number_of_results);
        let is_new = |winners: &[usize], candidate: usize| {
            winners.iter().all(|&w| layouts[w] != layouts[candidate])
        };

        let mut attempts = 0;
        let max_attempts = TOURNAMENT_ATTEMPTS_PER_WINNER * number_of_results;
        while winners.len() < number_of_results && attempts < max_attempts {
            attempts += 1;
            let drawn = index::sample(&mut self.rng, layouts.len(), sample);
            let Some(best) = drawn.iter().min_by_key(|&i| scores[i]) else {
                break;
            };
            if is_new(&winners, best) {
                winners.push(best);
            }
        }

        if winners.len() < number_of_results {
            let mut ranked: Vec<usize> = (0..layouts.len()).collect();
            ranked.sort_by_key(|&i| scores[i]);
            for candidate in ranked {
                if winners.len() >= number_of_results {
                    break;
                }
                if is_new(&winners, candidate) {
                    winners.push(candidate);
                }
            }
            if winners.len() < number_of_results {
                debug!(
                    "Tournament found {} distinct winners of {} requested",
                    winners.len(),
                    number_of_results
                );
            }
        }

        Ok(winners.into_iter().map(|i| layouts[i].clone()).collect())
    }

    /// Roulette wheel selection.
    ///
    /// Layout weight is `(total / fitness)^3` where `total` is the summed
    /// fitness of the population, so cheaper layouts are strongly favoured.
    /// Exactly `number_of_results` layouts are drawn with replacement;
    /// the same layout can be returned more than once.
    pub fn roulette(
        &mut self,
        population: &Population,
        number_of_results: usize,
        overlap_penalty: u64,
    ) -> Result<Vec<Layout>, EvolutionError> {
        let layouts = population.layouts();
        if layouts.is_empty() {
            return Err(EvolutionError::EmptyPopulation);
        }

        let scores = layouts
            .iter()
            .map(|layout| population.fitness_of(layout, overlap_penalty))
            .collect::<Result<Vec<_>, EvolutionError>>()?;
        let total = scores.iter().fold(0u64, |acc, &s| acc.saturating_add(s));

        let weights: Vec<f64> = if total == 0 {
            vec![1.0; scores.len()]
        } else {
            scores
                .iter()
                .map(|&score| (total as f64 / score.max(1) as f64).powi(3))
                .collect()
        };
        let wheel = WeightedIndex::new(&weights)?;

        Ok((0..number_of_results)
            .map(|_| layouts[wheel.sample(&mut self.rng)].clone())
            .collect())
    }

    /// Produce the next generation from the selected parents.
    ///
    /// With probability `1 - cross_chance` the next generation is made of
    /// value copies of the parents, cycling through them. Otherwise each
    /// offspring takes every gene slot from a uniformly chosen parent and
    /// is then repaired against one randomly chosen reference parent.
    pub fn crossover(
        &mut self,
        population: &Population,
        parents: &[Layout],
        cross_chance: f64,
    ) -> Result<Population, EvolutionError> {
        if parents.is_empty() {
            return Err(EvolutionError::NoParents);
        }

        let mut next = population.next_generation();
        let target = next.target_size();

        if self.rng.r#gen::<f64>() >= cross_chance {
            for i in 0..target {
                next.push(parents[i % parents.len()].clone());
            }
            return Ok(next);
        }

        let genes = population.problem().machine_count();
        for _ in 0..target {
            let draft: Vec<Machine> = (0..genes)
                .filter_map(|slot| {
                    let parent = &parents[self.rng.gen_range(0..parents.len())];
                    parent.slot(slot).copied()
                })
                .collect();
            let reference = &parents[self.rng.gen_range(0..parents.len())];
            next.push(repair(draft, reference)?);
        }

        Ok(next)
    }

    /// Mutate each layout with probability `chance`, applying `count`
    /// steps to each mutated layout. Returns the number of mutated layouts.
    pub fn mutate(
        &mut self,
        population: &mut Population,
        chance: f64,
        count: usize,
    ) -> Result<usize, EvolutionError> {
        let board = population.board();
        let mut mutated = 0;
        for layout in population.layouts_mut() {
            if self.rng.r#gen::<f64>() < chance {
                for _ in 0..count {
                    self.mutation_step(layout, board)?;
                }
                mutated += 1;
            }
        }
        Ok(mutated)
    }

    /// Move one random machine to a random cell, swapping with the
    /// occupant if the cell is taken by another machine.
    pub fn mutation_step(
        &mut self,
        layout: &mut Layout,
        board: Board,
    ) -> Result<MutationStep, EvolutionError> {
        if layout.is_empty() {
            return Err(EvolutionError::EmptyLayout);
        }
        let slot = self.rng.gen_range(0..layout.len());
        let machine = layout.machines()[slot].id();
        let x = self.rng.gen_range(0..board.width as i32);
        let y = self.rng.gen_range(0..board.height as i32);

        match layout.occupant(x, y, machine) {
            Some(other) => {
                layout.swap_positions(machine, other)?;
                Ok(MutationStep::Swapped { machine, other })
            }
            None => {
                layout.set_position(machine, x, y)?;
                Ok(MutationStep::Relocated { machine })
            }
        }
    }
}

/// Resolve a tournament sample size against a population size.
///
/// Values below 1 are fractions of the population, rounded to nearest.
pub fn resolve_sample_size(sample_size: f64, population: usize) -> usize {
    if sample_size < 1.0 {
        (population as f64 * sample_size).round() as usize
    } else {
        sample_size.round() as usize
    }
}

/// Turn a crossover draft into a valid layout.
///
/// Keeps the first occurrence of each identifier in draft order, then
/// appends every missing identifier with the reference parent's machine.
pub fn repair(draft: Vec<Machine>, reference: &Layout) -> Result<Layout, EvolutionError> {
    let max_id = reference.max_id();
    let mut seen = vec![false; max_id + 1];
    let mut machines = Vec::with_capacity(max_id + 1);

    for machine in draft {
        if let Some(flag) = seen.get_mut(machine.id())
            && !*flag
        {
            *flag = true;
            machines.push(machine);
        }
    }

    for (id, present) in seen.iter().enumerate() {
        if !present {
            machines.push(*reference.machine(id)?);
        }
    }

    if machines.len() != max_id + 1 {
        return Err(EvolutionError::RepairFailed {
            expected: max_id + 1,
            actual: machines.len(),
        });
    }

    Layout::from_machines(machines, max_id)
}
