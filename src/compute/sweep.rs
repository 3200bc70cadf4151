//! Parameter sweep: many independent runs on a bounded worker pool.
//!
//! A run that finishes writes a completion marker. Markers are checked
//! before dispatch, so re-invoking a sweep only retries runs that failed
//! or never started.

use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};
use rayon::prelude::*;
use tempfile::NamedTempFile;

use super::{
    EvolutionDriver, EvolutionError, LayoutRng, Population, PopulationCheckpoint, RunLogWriter,
    RunSummary,
};
use crate::schema::{EngineConfig, Problem, RunParameters, SweepConfig};

/// Completion markers, one file per finished run.
#[derive(Debug, Clone)]
pub struct CompletionMarkers {
    dir: PathBuf,
}

impl CompletionMarkers {
    /// Use (and create) a marker directory.
    pub fn new<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Marker file of a run.
    pub fn marker_path(&self, run_id: u64) -> PathBuf {
        self.dir.join(format!("{run_id}.finished"))
    }

    /// Whether a run has a marker.
    pub fn is_complete(&self, run_id: u64) -> bool {
        self.marker_path(run_id).exists()
    }

    /// Create the marker of a run, holding its summary as JSON.
    ///
    /// Creation is atomic create-if-absent. Returns `false` if the marker
    /// already existed.
    pub fn mark_complete(&self, run_id: u64, summary: &RunSummary) -> io::Result<bool> {
        self.write_marker(run_id, |file| {
            serde_json::to_writer(file, summary).map_err(io::Error::other)
        })
    }

    /// The body is written to a temporary file in the marker directory and
    /// linked into place only once complete, so a failed write leaves no
    /// marker behind.
    fn write_marker<F>(&self, run_id: u64, write_body: F) -> io::Result<bool>
    where
        F: FnOnce(&mut NamedTempFile) -> io::Result<()>,
    {
        let mut file = NamedTempFile::new_in(&self.dir)?;
        write_body(&mut file)?;
        file.flush()?;

        match file.persist_noclobber(self.marker_path(run_id)) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.error),
        }
    }

    /// Identifiers of every run with a marker.
    pub fn completed(&self) -> io::Result<HashSet<u64>> {
        let mut ids = HashSet::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "finished")
                && let Some(id) = path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .and_then(|stem| stem.parse().ok())
            {
                ids.insert(id);
            }
        }
        Ok(ids)
    }
}

/// What happened to one run of a sweep.
#[derive(Debug, Clone)]
pub enum RunStatus {
    /// The run finished and its marker was written.
    Completed(RunSummary),
    /// A marker already existed; the run was not dispatched.
    Skipped,
    /// The run aborted; no marker was written.
    Failed(String),
}

/// Outcome of one run of a sweep.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: u64,
    pub status: RunStatus,
}

/// Outcomes of every run of a sweep, in run-list order.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub outcomes: Vec<RunOutcome>,
}

impl SweepReport {
    /// Number of runs that completed in this invocation.
    pub fn completed(&self) -> usize {
        self.count(|s| matches!(s, RunStatus::Completed(_)))
    }

    /// Number of runs skipped because they had finished earlier.
    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, RunStatus::Skipped))
    }

    /// Number of runs that failed.
    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, RunStatus::Failed(_)))
    }

    /// Best completed run, if any.
    pub fn best(&self) -> Option<&RunSummary> {
        self.outcomes
            .iter()
            .filter_map(|o| match &o.status {
                RunStatus::Completed(summary) => Some(summary),
                _ => None,
            })
            .min_by_key(|summary| summary.best_score)
    }

    fn count(&self, predicate: impl Fn(&RunStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| predicate(&o.status)).count()
    }
}

/// A static list of runs sharing one problem.
pub struct Sweep {
    problem: Arc<Problem>,
    runs: Vec<RunParameters>,
    engine: EngineConfig,
    output_dir: PathBuf,
    workers: usize,
    random_seed: Option<u64>,
    markers: CompletionMarkers,
}

impl Sweep {
    /// Create a sweep writing logs to `output_dir` and markers to
    /// `output_dir/finished`.
    pub fn new<P: AsRef<Path>>(
        problem: Arc<Problem>,
        runs: Vec<RunParameters>,
        engine: EngineConfig,
        output_dir: P,
        workers: usize,
    ) -> io::Result<Self> {
        let output_dir = output_dir.as_ref().to_path_buf();
        let markers = CompletionMarkers::new(output_dir.join("finished"))?;
        Ok(Self {
            problem,
            runs,
            engine,
            output_dir,
            workers: workers.max(1),
            random_seed: None,
            markers,
        })
    }

    /// Derive per-run seeds from a base seed instead of entropy.
    pub fn with_random_seed(mut self, seed: Option<u64>) -> Self {
        self.random_seed = seed;
        self
    }

    /// Build a sweep from its configuration, loading the problem.
    pub fn from_config(config: &SweepConfig) -> Result<Self, EvolutionError> {
        config.validate()?;
        let runs = config.resolve_runs()?;
        let problem = Arc::new(Problem::load(&config.problem)?);
        info!(
            "Loaded problem: {} machines, {} connections, board {}x{}",
            problem.machine_count(),
            problem.connections().len(),
            problem.board().width,
            problem.board().height
        );

        Ok(Self::new(
            problem,
            runs,
            config.engine.clone(),
            &config.output_dir,
            config.workers,
        )?
        .with_random_seed(config.random_seed))
    }

    /// All runs of the sweep.
    pub fn runs(&self) -> &[RunParameters] {
        &self.runs
    }

    /// Completion markers of the sweep.
    pub fn markers(&self) -> &CompletionMarkers {
        &self.markers
    }

    /// Runs without a completion marker.
    pub fn pending(&self) -> Vec<&RunParameters> {
        self.runs
            .iter()
            .filter(|run| !self.markers.is_complete(run.id))
            .collect()
    }

    /// Log file of a run.
    pub fn log_path(&self, run: &RunParameters) -> PathBuf {
        self.output_dir
            .join(format!("run_{}_{}.log", run.id, run.method.tag()))
    }

    /// Population checkpoint of a run.
    pub fn checkpoint_path(&self, run: &RunParameters) -> PathBuf {
        self.output_dir
            .join("checkpoints")
            .join(format!("run_{}.json", run.id))
    }

    /// Log file of the random baseline.
    pub fn baseline_path(&self) -> PathBuf {
        self.output_dir.join("random_baseline.log")
    }

    /// Seed for a run's random number generator.
    pub fn run_seed(&self, run_id: u64) -> u64 {
        match self.random_seed {
            Some(base) => base ^ run_id.wrapping_mul(0x9E37_79B9_7F4A_7C15),
            None => rand::random(),
        }
    }

    /// Execute one run: write its log and, if it finishes, its marker.
    ///
    /// With checkpoints enabled, a run interrupted earlier continues from
    /// its last saved population and keeps the log lines before it.
    pub fn execute(&self, run: &RunParameters) -> Result<RunSummary, EvolutionError> {
        let mut driver = EvolutionDriver::new(
            run.clone(),
            self.engine.clone(),
            Arc::clone(&self.problem),
            self.run_seed(run.id),
        )?;
        if self.engine.checkpoint_interval > 0 {
            driver = driver.with_checkpoint_path(self.checkpoint_path(run));
        }

        let mut log = match self.saved_population(run) {
            Some(population) => {
                let log = RunLogWriter::resume(self.log_path(run), population.generation())?;
                driver.resume(population)?;
                log
            }
            None => RunLogWriter::create(self.log_path(run))?,
        };

        let summary = driver.run_to_log(&mut log)?;
        log.finish()?;
        self.markers.mark_complete(run.id, &summary)?;
        self.remove_checkpoint(run);
        Ok(summary)
    }

    /// Population saved by an earlier attempt of a run. A checkpoint that
    /// cannot be used is ignored and the run starts over.
    fn saved_population(&self, run: &RunParameters) -> Option<Population> {
        if self.engine.checkpoint_interval == 0 {
            return None;
        }
        let path = self.checkpoint_path(run);
        let restored = PopulationCheckpoint::load_if_exists(&path).and_then(|checkpoint| {
            checkpoint
                .map(|c| Population::restore(Arc::clone(&self.problem), &c))
                .transpose()
        });
        match restored {
            Ok(population) => population,
            Err(e) => {
                warn!(
                    "Run {}: ignoring checkpoint {}: {}",
                    run.id,
                    path.display(),
                    e
                );
                None
            }
        }
    }

    fn remove_checkpoint(&self, run: &RunParameters) {
        let path = self.checkpoint_path(run);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Run {}: could not remove checkpoint {}: {}",
                run.id,
                path.display(),
                e
            ),
        }
    }

    /// Score `count` random layouts into the baseline log. Returns the best
    /// score, or `None` when `count` is 0.
    pub fn random_baseline(&self, count: u64) -> Result<Option<u64>, EvolutionError> {
        let path = self.baseline_path();
        let mut log = RunLogWriter::create(&path)?;
        let mut rng = LayoutRng::new(self.random_seed.unwrap_or_else(rand::random));
        let best = rng.random_baseline(&self.problem, count, self.engine.overlap_penalty, &mut log)?;
        log.finish()?;
        info!(
            "Random baseline: {} layouts written to {}",
            count,
            path.display()
        );
        Ok(best)
    }

    /// Skip a finished run, or execute it with failures contained.
    fn dispatch(&self, run: &RunParameters) -> RunOutcome {
        if self.markers.is_complete(run.id) {
            info!("Run {}: already finished, skipping", run.id);
            return RunOutcome {
                run_id: run.id,
                status: RunStatus::Skipped,
            };
        }

        let status = match panic::catch_unwind(AssertUnwindSafe(|| self.execute(run))) {
            Ok(Ok(summary)) => RunStatus::Completed(summary),
            Ok(Err(e)) => {
                warn!("Run {}: failed: {}", run.id, e);
                RunStatus::Failed(e.to_string())
            }
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!("Run {}: panicked: {}", run.id, message);
                RunStatus::Failed(format!("panicked: {message}"))
            }
        };

        RunOutcome {
            run_id: run.id,
            status,
        }
    }

    /// Run every pending run on a pool of `workers` threads.
    pub fn run(&self) -> Result<SweepReport, EvolutionError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("sweep-worker-{i}"))
            .build()
            .map_err(io::Error::other)?;

        info!(
            "Sweep: {} runs ({} pending) on {} workers",
            self.runs.len(),
            self.pending().len(),
            self.workers
        );

        let outcomes: Vec<RunOutcome> = pool.install(|| {
            self.runs
                .par_iter()
                .with_max_len(1)
                .map(|run| self.dispatch(run))
                .collect()
        });
        let report = SweepReport { outcomes };

        info!(
            "Sweep finished: {} completed, {} skipped, {} failed",
            report.completed(),
            report.skipped(),
            report.failed()
        );
        Ok(report)
    }
}
