//! Population of layouts for one generation.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::{EvolutionError, Layout, LayoutSnapshot};
use crate::schema::{Board, Problem};

/// The layouts of one generation together with the shared problem.
///
/// The best score is a cache derived from the layouts: it is filled by
/// [`Population::sort_by_fitness`] and dropped whenever membership or a
/// member changes.
#[derive(Debug, Clone)]
pub struct Population {
    generation: u64,
    target_size: usize,
    problem: Arc<Problem>,
    layouts: Vec<Layout>,
    best_score: Option<u64>,
}

impl Population {
    /// Create an empty generation-0 population.
    pub fn new(problem: Arc<Problem>, target_size: usize) -> Self {
        Self {
            generation: 0,
            target_size,
            problem,
            layouts: Vec::with_capacity(target_size),
            best_score: None,
        }
    }

    /// Empty container for the following generation.
    pub fn next_generation(&self) -> Self {
        Self {
            generation: self.generation + 1,
            target_size: self.target_size,
            problem: Arc::clone(&self.problem),
            layouts: Vec::with_capacity(self.target_size),
            best_score: None,
        }
    }

    /// Generation number.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of layouts a full generation holds.
    #[inline]
    pub fn target_size(&self) -> usize {
        self.target_size
    }

    /// Shared problem.
    #[inline]
    pub fn problem(&self) -> &Arc<Problem> {
        &self.problem
    }

    /// Board of the shared problem.
    #[inline]
    pub fn board(&self) -> Board {
        self.problem.board()
    }

    /// Current number of layouts.
    #[inline]
    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    /// Whether the population holds no layouts.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }

    /// Whether the population reached its target size.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.layouts.len() >= self.target_size
    }

    /// Layouts in current order.
    #[inline]
    pub fn layouts(&self) -> &[Layout] {
        &self.layouts
    }

    /// Layouts for modification. Drops the cached best score.
    pub fn layouts_mut(&mut self) -> &mut [Layout] {
        self.best_score = None;
        &mut self.layouts
    }

    /// Add a layout. Drops the cached best score.
    pub fn push(&mut self, layout: Layout) {
        self.best_score = None;
        self.layouts.push(layout);
    }

    /// Fitness of a layout against the shared problem.
    pub fn fitness_of(&self, layout: &Layout, overlap_penalty: u64) -> Result<u64, EvolutionError> {
        layout.fitness(self.problem.connections(), overlap_penalty)
    }

    /// Sort layouts by fitness, best first, and return the best score.
    pub fn sort_by_fitness(&mut self, overlap_penalty: u64) -> Result<u64, EvolutionError> {
        if self.layouts.is_empty() {
            return Err(EvolutionError::EmptyPopulation);
        }

        let scores = self
            .layouts
            .iter()
            .map(|layout| self.fitness_of(layout, overlap_penalty))
            .collect::<Result<Vec<_>, EvolutionError>>()?;
        let mut scored: Vec<(u64, Layout)> = scores.into_iter().zip(self.layouts.drain(..)).collect();
        scored.sort_by_key(|(score, _)| *score);

        let best = scored[0].0;
        self.layouts = scored.into_iter().map(|(_, layout)| layout).collect();
        self.best_score = Some(best);
        Ok(best)
    }

    /// Best score, if the population was sorted since its last change.
    #[inline]
    pub fn best_score(&self) -> Option<u64> {
        self.best_score
    }

    /// Best layout, if the population was sorted since its last change.
    pub fn best_layout(&self) -> Option<&Layout> {
        self.best_score.and(self.layouts.first())
    }

    /// Capture the population, keeping each layout's gene order.
    pub fn checkpoint(&self) -> PopulationCheckpoint {
        PopulationCheckpoint {
            generation: self.generation,
            target_size: self.target_size,
            layouts: self.layouts.iter().map(Layout::gene_snapshot).collect(),
        }
    }

    /// Rebuild a population from a checkpoint taken on the same problem.
    pub fn restore(
        problem: Arc<Problem>,
        checkpoint: &PopulationCheckpoint,
    ) -> Result<Self, EvolutionError> {
        if checkpoint.layouts.is_empty() {
            return Err(EvolutionError::EmptyPopulation);
        }

        let mut layouts = Vec::with_capacity(checkpoint.layouts.len());
        for snapshot in &checkpoint.layouts {
            let layout = Layout::from_snapshot(snapshot)?;
            if layout.len() != problem.machine_count() {
                return Err(EvolutionError::CheckpointMismatch {
                    expected: problem.machine_count(),
                    actual: layout.len(),
                });
            }
            layouts.push(layout);
        }

        Ok(Self {
            generation: checkpoint.generation,
            target_size: checkpoint.target_size,
            problem,
            layouts,
            best_score: None,
        })
    }
}

/// Saved population of a run in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PopulationCheckpoint {
    pub generation: u64,
    pub target_size: usize,
    pub layouts: Vec<LayoutSnapshot>,
}

impl PopulationCheckpoint {
    /// Write the checkpoint as JSON, replacing any previous one.
    ///
    /// The file is written next to its destination and renamed into place,
    /// so readers see either the old or the new checkpoint.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), EvolutionError> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut file = NamedTempFile::new_in(dir)?;
        serde_json::to_writer(&mut file, self)?;
        file.flush()?;
        file.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Read a checkpoint.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, EvolutionError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Read a checkpoint if one exists.
    pub fn load_if_exists<P: AsRef<Path>>(path: P) -> Result<Option<Self>, EvolutionError> {
        match Self::load(path) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(EvolutionError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}
