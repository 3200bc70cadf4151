//! Run and sweep configuration types.
//!
//! A sweep is a static list of [`RunParameters`], each driving one
//! independent GA run. Runs can be listed explicitly, expanded from a
//! [`ParameterGrid`], or read from a semicolon-separated feed file.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::ProblemSource;

/// Parent selection method for one run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum SelectionMethod {
    /// Tournament selection. A sample size below 1 is a fraction of the
    /// population size.
    Tournament {
        #[serde(default = "default_sample_size")]
        sample_size: f64,
    },
    /// Roulette wheel selection with cubic inverse-fitness weights.
    Roulette,
}

impl SelectionMethod {
    /// Short name used in log file names.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Tournament { .. } => "tournament",
            Self::Roulette => "roulette",
        }
    }
}

impl Default for SelectionMethod {
    fn default() -> Self {
        Self::Tournament {
            sample_size: default_sample_size(),
        }
    }
}

fn default_sample_size() -> f64 {
    5.0
}

/// Parameters of a single GA run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParameters {
    /// Unique run identifier; keys the log file and completion marker.
    pub id: u64,
    /// Selection method (flattened: `"method": "tournament", "sample_size": 5`).
    #[serde(flatten)]
    pub method: SelectionMethod,
    /// Number of layouts per generation.
    pub population_size: usize,
    /// Probability that a layout is mutated in a generation.
    pub mutation_rate: f64,
    /// Mutation steps applied to a mutated layout.
    pub mutation_count: usize,
    /// Probability that a generation is produced by recombination.
    pub cross_chance: f64,
    /// Last generation to run (0 = unbounded).
    #[serde(default)]
    pub max_generations: u64,
}

impl RunParameters {
    /// Whether this run has no generation limit.
    #[inline]
    pub fn is_unbounded(&self) -> bool {
        self.max_generations == 0
    }

    /// Validate run parameters.
    pub fn validate(&self) -> Result<(), RunConfigError> {
        if self.population_size < 2 {
            return Err(RunConfigError::PopulationTooSmall {
                run_id: self.id,
                size: self.population_size,
            });
        }

        let check_rate = |value: f64, name: &'static str| {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(RunConfigError::InvalidRate {
                    run_id: self.id,
                    name,
                    value,
                })
            }
        };
        check_rate(self.mutation_rate, "mutation_rate")?;
        check_rate(self.cross_chance, "cross_chance")?;

        if let SelectionMethod::Tournament { sample_size } = self.method
            && !(sample_size.is_finite() && sample_size >= 0.0)
        {
            return Err(RunConfigError::InvalidSampleSize {
                run_id: self.id,
                value: sample_size,
            });
        }

        Ok(())
    }
}

/// Engine settings shared by every run of a sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fitness penalty per overlapping machine pair.
    #[serde(default = "default_overlap_penalty")]
    pub overlap_penalty: u64,
    /// Every Nth generation the best layout is written to the log.
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: u64,
    /// Number of trailing best scores checked for stagnation.
    #[serde(default = "default_stagnation_window")]
    pub stagnation_window: usize,
    /// Parents selected per generation.
    #[serde(default = "default_parents")]
    pub parents_per_generation: usize,
    /// Every Nth generation the population is saved so an interrupted run
    /// can continue from it (0 = never). Must be a multiple of
    /// `snapshot_interval`.
    #[serde(default)]
    pub checkpoint_interval: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            overlap_penalty: default_overlap_penalty(),
            snapshot_interval: default_snapshot_interval(),
            stagnation_window: default_stagnation_window(),
            parents_per_generation: default_parents(),
            checkpoint_interval: 0,
        }
    }
}

fn default_overlap_penalty() -> u64 {
    10_000
}
fn default_snapshot_interval() -> u64 {
    10
}
fn default_stagnation_window() -> usize {
    10
}
fn default_parents() -> usize {
    2
}

impl EngineConfig {
    /// Validate engine settings.
    pub fn validate(&self) -> Result<(), RunConfigError> {
        if self.snapshot_interval == 0 {
            return Err(RunConfigError::InvalidEngine(
                "snapshot_interval must be positive".into(),
            ));
        }
        if self.stagnation_window == 0 {
            return Err(RunConfigError::InvalidEngine(
                "stagnation_window must be positive".into(),
            ));
        }
        if self.parents_per_generation == 0 {
            return Err(RunConfigError::InvalidEngine(
                "parents_per_generation must be positive".into(),
            ));
        }
        if self.checkpoint_interval % self.snapshot_interval != 0 {
            return Err(RunConfigError::InvalidEngine(format!(
                "checkpoint_interval {} must be a multiple of snapshot_interval {}",
                self.checkpoint_interval, self.snapshot_interval
            )));
        }
        Ok(())
    }
}

/// Cartesian product of parameter values, expanded into runs with
/// sequential identifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterGrid {
    /// Identifier of the first expanded run.
    #[serde(default = "default_first_id")]
    pub first_id: u64,
    pub methods: Vec<SelectionMethod>,
    pub max_generations: Vec<u64>,
    pub population_sizes: Vec<usize>,
    pub mutation_rates: Vec<f64>,
    pub mutation_counts: Vec<usize>,
    pub cross_chances: Vec<f64>,
}

fn default_first_id() -> u64 {
    1
}

impl ParameterGrid {
    /// Number of runs the grid expands to.
    pub fn len(&self) -> usize {
        self.methods.len()
            * self.max_generations.len()
            * self.population_sizes.len()
            * self.mutation_rates.len()
            * self.mutation_counts.len()
            * self.cross_chances.len()
    }

    /// Whether the grid expands to no runs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Expand into run parameters.
    pub fn expand(&self) -> Vec<RunParameters> {
        let mut runs = Vec::with_capacity(self.len());
        let mut id = self.first_id;

        for &max_generations in &self.max_generations {
            for &population_size in &self.population_sizes {
                for &mutation_rate in &self.mutation_rates {
                    for &mutation_count in &self.mutation_counts {
                        for &cross_chance in &self.cross_chances {
                            for &method in &self.methods {
                                runs.push(RunParameters {
                                    id,
                                    method,
                                    population_size,
                                    mutation_rate,
                                    mutation_count,
                                    cross_chance,
                                    max_generations,
                                });
                                id += 1;
                            }
                        }
                    }
                }
            }
        }

        runs
    }
}

/// Top-level sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Problem input files and board.
    pub problem: ProblemSource,
    /// Directory for run logs and completion markers.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Number of runs executed concurrently.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Engine settings shared by all runs.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Explicitly listed runs.
    #[serde(default)]
    pub runs: Vec<RunParameters>,
    /// Grid of runs to expand.
    #[serde(default)]
    pub grid: Option<ParameterGrid>,
    /// Semicolon run-parameter feed to read.
    #[serde(default)]
    pub runs_feed: Option<PathBuf>,
    /// Base random seed; each run derives its own from it.
    #[serde(default)]
    pub random_seed: Option<u64>,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("results")
}
fn default_workers() -> usize {
    6
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            problem: ProblemSource::default(),
            output_dir: default_output_dir(),
            workers: default_workers(),
            engine: EngineConfig::default(),
            runs: vec![RunParameters {
                id: 0,
                method: SelectionMethod::default(),
                population_size: 50,
                mutation_rate: 0.3,
                mutation_count: 2,
                cross_chance: 0.8,
                max_generations: 100,
            }],
            grid: Some(ParameterGrid {
                first_id: 1,
                methods: vec![
                    SelectionMethod::Tournament { sample_size: 0.1 },
                    SelectionMethod::Roulette,
                ],
                max_generations: vec![50, 100],
                population_sizes: vec![20, 40],
                mutation_rates: vec![0.1, 0.3],
                mutation_counts: vec![1, 2],
                cross_chances: vec![0.5, 0.9],
            }),
            runs_feed: None,
            random_seed: None,
        }
    }
}

impl SweepConfig {
    /// Read a sweep configuration from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, RunConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| RunConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| RunConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Validate sweep-level settings.
    pub fn validate(&self) -> Result<(), RunConfigError> {
        if self.workers == 0 {
            return Err(RunConfigError::NoWorkers);
        }
        self.engine.validate()
    }

    /// Collect every run of the sweep: explicit runs, then the grid, then
    /// the feed. Each run is validated and identifiers must be unique.
    pub fn resolve_runs(&self) -> Result<Vec<RunParameters>, RunConfigError> {
        let mut runs = self.runs.clone();
        if let Some(grid) = &self.grid {
            runs.extend(grid.expand());
        }
        if let Some(feed) = &self.runs_feed {
            runs.extend(read_feed(feed)?);
        }

        let mut seen = HashSet::with_capacity(runs.len());
        for run in &runs {
            run.validate()?;
            if !seen.insert(run.id) {
                return Err(RunConfigError::DuplicateRunId(run.id));
            }
        }

        Ok(runs)
    }
}

/// Read a semicolon run-parameter feed from a file.
pub fn read_feed<P: AsRef<Path>>(path: P) -> Result<Vec<RunParameters>, RunConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| RunConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_feed(&content)
}

/// Parse a semicolon run-parameter feed.
///
/// Line format:
/// `id;method;max_generations;population_size;mutation_rate;mutation_count;cross_chance[;sample_size]`
/// where method is `t`/`tournament` or `r`/`roulette`. A trailing `;` and
/// blank lines are accepted.
pub fn parse_feed(content: &str) -> Result<Vec<RunParameters>, RunConfigError> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| parse_feed_line(line, index + 1))
        .collect()
}

fn parse_feed_line(line: &str, line_no: usize) -> Result<RunParameters, RunConfigError> {
    let mut fields: Vec<&str> = line.trim().split(';').map(str::trim).collect();
    if fields.last().is_some_and(|f| f.is_empty()) {
        fields.pop();
    }

    let invalid = |reason: String| RunConfigError::InvalidFeedLine {
        line: line_no,
        reason,
    };

    if fields.len() < 7 {
        return Err(invalid(format!("expected at least 7 fields, got {}", fields.len())));
    }

    fn field<T: std::str::FromStr>(value: &str, name: &str) -> Result<T, String> {
        value
            .parse()
            .map_err(|_| format!("invalid {name}: {value:?}"))
    }

    let method = match fields[1].to_ascii_lowercase().as_str() {
        "t" | "tournament" => {
            let raw = fields
                .get(7)
                .ok_or_else(|| invalid("tournament run needs a sample size".into()))?;
            SelectionMethod::Tournament {
                sample_size: field(raw, "sample_size").map_err(&invalid)?,
            }
        }
        "r" | "roulette" => SelectionMethod::Roulette,
        other => return Err(invalid(format!("unknown method {other:?}"))),
    };

    Ok(RunParameters {
        id: field(fields[0], "id").map_err(&invalid)?,
        method,
        max_generations: field(fields[2], "max_generations").map_err(&invalid)?,
        population_size: field(fields[3], "population_size").map_err(&invalid)?,
        mutation_rate: field(fields[4], "mutation_rate").map_err(&invalid)?,
        mutation_count: field(fields[5], "mutation_count").map_err(&invalid)?,
        cross_chance: field(fields[6], "cross_chance").map_err(&invalid)?,
    })
}

/// Run configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum RunConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("Failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Run {run_id}: population size {size} must be at least 2")]
    PopulationTooSmall { run_id: u64, size: usize },
    #[error("Run {run_id}: {name} {value} must be within [0, 1]")]
    InvalidRate {
        run_id: u64,
        name: &'static str,
        value: f64,
    },
    #[error("Run {run_id}: invalid tournament sample size {value}")]
    InvalidSampleSize { run_id: u64, value: f64 },
    #[error("Duplicate run id {0}")]
    DuplicateRunId(u64),
    #[error("Feed line {line}: {reason}")]
    InvalidFeedLine { line: usize, reason: String },
    #[error("Worker count must be positive")]
    NoWorkers,
    #[error("Invalid engine settings: {0}")]
    InvalidEngine(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(id: u64) -> RunParameters {
        RunParameters {
            id,
            method: SelectionMethod::Roulette,
            population_size: 10,
            mutation_rate: 0.2,
            mutation_count: 1,
            cross_chance: 0.5,
            max_generations: 20,
        }
    }

    #[test]
    fn test_default_config_valid() {
        let config = SweepConfig::default();
        assert!(config.validate().is_ok());
        let runs = config.resolve_runs().unwrap();
        assert_eq!(runs.len(), 1 + 64);
    }

    #[test]
    fn test_serialization() {
        let config = SweepConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: SweepConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.runs, config.runs);
        assert_eq!(parsed.workers, 6);
    }

    #[test]
    fn test_flattened_method() {
        let json = r#"{
            "id": 7, "method": "tournament", "sample_size": 0.25,
            "population_size": 40, "mutation_rate": 0.1, "mutation_count": 2,
            "cross_chance": 0.9
        }"#;
        let parsed: RunParameters = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.method, SelectionMethod::Tournament { sample_size: 0.25 });
        assert!(parsed.is_unbounded());

        let json = r#"{
            "id": 8, "method": "roulette", "population_size": 40,
            "mutation_rate": 0.1, "mutation_count": 2, "cross_chance": 0.9,
            "max_generations": 30
        }"#;
        let parsed: RunParameters = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.method, SelectionMethod::Roulette);
        assert_eq!(parsed.max_generations, 30);
    }

    #[test]
    fn test_validation() {
        assert!(run(1).validate().is_ok());

        let mut bad = run(1);
        bad.population_size = 1;
        assert!(matches!(
            bad.validate(),
            Err(RunConfigError::PopulationTooSmall { .. })
        ));

        let mut bad = run(1);
        bad.cross_chance = 1.5;
        assert!(matches!(
            bad.validate(),
            Err(RunConfigError::InvalidRate {
                name: "cross_chance",
                ..
            })
        ));

        let mut bad = run(1);
        bad.method = SelectionMethod::Tournament { sample_size: -1.0 };
        assert!(matches!(
            bad.validate(),
            Err(RunConfigError::InvalidSampleSize { .. })
        ));
    }

    #[test]
    fn test_engine_validation() {
        assert!(EngineConfig::default().validate().is_ok());

        let engine = EngineConfig {
            checkpoint_interval: 30,
            ..Default::default()
        };
        assert!(engine.validate().is_ok());

        let engine = EngineConfig {
            checkpoint_interval: 15,
            ..Default::default()
        };
        assert!(matches!(
            engine.validate(),
            Err(RunConfigError::InvalidEngine(_))
        ));

        let engine = EngineConfig {
            snapshot_interval: 0,
            ..Default::default()
        };
        assert!(matches!(
            engine.validate(),
            Err(RunConfigError::InvalidEngine(_))
        ));
    }

    #[test]
    fn test_grid_expansion() {
        let grid = ParameterGrid {
            first_id: 100,
            methods: vec![SelectionMethod::Roulette],
            max_generations: vec![10, 20],
            population_sizes: vec![10],
            mutation_rates: vec![0.1, 0.2],
            mutation_counts: vec![1],
            cross_chances: vec![0.5],
        };
        let runs = grid.expand();
        assert_eq!(runs.len(), grid.len());
        assert_eq!(runs.len(), 4);
        assert_eq!(runs[0].id, 100);
        assert_eq!(runs[3].id, 103);
        assert_eq!(runs[3].max_generations, 20);
        assert_eq!(runs[3].mutation_rate, 0.2);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let config = SweepConfig {
            runs: vec![run(1), run(1)],
            grid: None,
            ..Default::default()
        };
        assert!(matches!(
            config.resolve_runs(),
            Err(RunConfigError::DuplicateRunId(1))
        ));
    }

    #[test]
    fn test_parse_feed() {
        let feed = "1;t;100;50;0.3;2;0.8;0.1;\n\n2;r;0;20;0.05;1;0.5\n";
        let runs = parse_feed(feed).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].method, SelectionMethod::Tournament { sample_size: 0.1 });
        assert_eq!(runs[0].population_size, 50);
        assert_eq!(runs[1].method, SelectionMethod::Roulette);
        assert!(runs[1].is_unbounded());
    }

    #[test]
    fn test_parse_feed_errors() {
        let err = parse_feed("1;r;10;20;0.1;1;0.5\n2;x;10;20;0.1;1;0.5").unwrap_err();
        assert!(matches!(err, RunConfigError::InvalidFeedLine { line: 2, .. }));

        let err = parse_feed("1;t;10;20;0.1;1;0.5").unwrap_err();
        assert!(matches!(err, RunConfigError::InvalidFeedLine { line: 1, .. }));

        let err = parse_feed("1;r;10;many;0.1;1;0.5").unwrap_err();
        assert!(matches!(err, RunConfigError::InvalidFeedLine { line: 1, .. }));
    }
}
