//! Compute module - the genetic algorithm for facility layouts.
//!
//! # Overview
//!
//! - **Layouts** (`layout`): chromosomes assigning machines to cells
//! - **Populations** (`population`): the layouts of one generation and
//!   their checkpoints
//! - **Operators** (`operators`): selection, crossover with repair, mutation
//! - **Driver** (`driver`): the generation loop of a single run
//! - **Run log** (`runlog`): per-generation log writer and reader
//! - **Sweep** (`sweep`): many runs in parallel with completion markers

mod driver;
mod layout;
mod operators;
mod population;
mod runlog;
mod sweep;

pub use driver::{DriverPhase, EvolutionDriver, RunSummary, StagnationWindow};
pub use layout::{Layout, LayoutSnapshot, Machine, MachineSnapshot, UNPLACED};
pub use operators::{LayoutRng, MutationStep, repair, resolve_sample_size};
pub use population::{Population, PopulationCheckpoint};
pub use runlog::{GenerationRecord, RunLogError, RunLogWriter, read_run_log};
pub use sweep::{CompletionMarkers, RunOutcome, RunStatus, Sweep, SweepReport};

use crate::schema::{MachineId, ProblemError, RunConfigError};

/// Errors raised while evolving layouts.
#[derive(Debug, thiserror::Error)]
pub enum EvolutionError {
    #[error("Unknown machine id {0}")]
    UnknownMachineId(MachineId),
    #[error("Machine id {0} appears more than once")]
    DuplicateMachineId(MachineId),
    #[error("Machine id {0} is missing")]
    MissingMachineId(MachineId),
    #[error("Tournament sample size {sample} exceeds population size {population}")]
    InvalidSampleSize { sample: usize, population: usize },
    #[error("Repair produced {actual} machines, expected {expected}")]
    RepairFailed { expected: usize, actual: usize },
    #[error("Board has {cells} cells but {machines} machines must be placed")]
    BoardTooSmall { cells: usize, machines: usize },
    #[error("Population is empty")]
    EmptyPopulation,
    #[error("Layout is empty")]
    EmptyLayout,
    #[error("No parents selected")]
    NoParents,
    #[error("Checkpoint layouts have {actual} machines, the problem has {expected}")]
    CheckpointMismatch { expected: usize, actual: usize },
    #[error("Invalid checkpoint: {0}")]
    Checkpoint(#[from] serde_json::Error),
    #[error("Invalid roulette weights: {0}")]
    Weights(#[from] rand::distributions::WeightedError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Problem error: {0}")]
    Problem(#[from] ProblemError),
    #[error("Configuration error: {0}")]
    Config(#[from] RunConfigError),
}
