//! Facility layout - genetic search for machine placements.
//!
//! Machines exchange material with each other. Placing them on a grid
//! costs `amount * cost * manhattan_distance` per connection, and this
//! crate searches for placements that minimize the total with a genetic
//! algorithm, running many parameter combinations side by side.
//!
//! # Architecture
//!
//! The crate is split into two main modules:
//!
//! - `schema`: Problem input (flows, costs, board) and run configuration
//! - `compute`: Layouts, genetic operators, the run driver and the sweep
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use facility_layout::{
//!     compute::EvolutionDriver,
//!     schema::{EngineConfig, Problem, ProblemSource, RunParameters, SelectionMethod},
//! };
//!
//! let problem = Arc::new(Problem::load(&ProblemSource::default()).unwrap());
//! let params = RunParameters {
//!     id: 1,
//!     method: SelectionMethod::Tournament { sample_size: 0.2 },
//!     population_size: 30,
//!     mutation_rate: 0.3,
//!     mutation_count: 1,
//!     cross_chance: 0.8,
//!     max_generations: 100,
//! };
//!
//! let mut driver = EvolutionDriver::new(params, EngineConfig::default(), problem, 42).unwrap();
//! let summary = driver.run().unwrap();
//! println!("Best score after {} generations: {}", summary.generations, summary.best_score);
//! ```

pub mod compute;
pub mod schema;

// Re-export commonly used types
pub use compute::{EvolutionDriver, Layout, RunSummary, Sweep, SweepReport};
pub use schema::{Problem, RunParameters, SweepConfig};
