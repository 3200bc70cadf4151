//! Schema module - problem description and run configuration types.

mod problem;
mod run;

pub use problem::*;
pub use run::*;
