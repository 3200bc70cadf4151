//! Facility layout CLI - Run a parameter sweep from JSON configuration.

#[cfg(feature = "dhat-heap")]
#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

use std::path::{Path, PathBuf};
use std::time::Instant;

use facility_layout::{
    compute::{RunStatus, Sweep},
    schema::SweepConfig,
};

fn main() {
    #[cfg(feature = "dhat-heap")]
    let _profiler = dhat::Profiler::new_heap();

    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <sweep.json>", args[0]);
        eprintln!("       {} --baseline <sweep.json> [count]", args[0]);
        eprintln!();
        eprintln!("Run a facility layout parameter sweep from JSON configuration.");
        eprintln!();
        eprintln!("Arguments:");
        eprintln!("  sweep.json  Path to sweep configuration file");
        eprintln!("  count       Random layouts scored by --baseline (default: 10000)");
        eprintln!();
        eprintln!("Example configuration is generated with --example flag.");
        std::process::exit(1);
    }

    if args[1] == "--example" {
        print_example_config();
        return;
    }

    if args[1] == "--baseline" {
        let Some(path) = args.get(2) else {
            eprintln!("Error: --baseline requires a configuration file");
            std::process::exit(1);
        };
        let count = match args.get(3).map(|v| v.parse::<u64>()) {
            None => DEFAULT_BASELINE_COUNT,
            Some(Ok(count)) => count,
            Some(Err(e)) => {
                eprintln!("Error: invalid layout count: {}", e);
                std::process::exit(1);
            }
        };
        run_baseline(Path::new(path), count);
        return;
    }

    let config_path = PathBuf::from(&args[1]);
    let (config, sweep) = load_sweep(&config_path);

    println!("Facility Layout Sweep");
    println!("=====================");
    println!(
        "Flows: {}  Costs: {}",
        config.problem.flow_path.display(),
        config.problem.cost_path.display()
    );
    println!(
        "Board: {}x{}",
        config.problem.board.width, config.problem.board.height
    );
    println!(
        "Runs: {} ({} pending)",
        sweep.runs().len(),
        sweep.pending().len()
    );
    println!("Workers: {}", config.workers);
    println!("Output: {}", config.output_dir.display());
    println!();

    let start = Instant::now();
    let report = sweep.run().unwrap_or_else(|e| {
        eprintln!("Error running sweep: {}", e);
        std::process::exit(1);
    });

    for outcome in &report.outcomes {
        match &outcome.status {
            RunStatus::Completed(summary) => println!(
                "  Run {}: best {} after {} generations ({:.2}s)",
                outcome.run_id, summary.best_score, summary.generations, summary.elapsed_seconds
            ),
            RunStatus::Skipped => println!("  Run {}: already finished", outcome.run_id),
            RunStatus::Failed(reason) => println!("  Run {}: FAILED: {}", outcome.run_id, reason),
        }
    }

    println!();
    println!(
        "Completed: {}  Skipped: {}  Failed: {}",
        report.completed(),
        report.skipped(),
        report.failed()
    );
    if let Some(best) = report.best() {
        println!("Best: run {} with score {}", best.run_id, best.best_score);
    }
    println!("Time: {:.2}s", start.elapsed().as_secs_f32());

    if report.failed() > 0 {
        std::process::exit(2);
    }
}

const DEFAULT_BASELINE_COUNT: u64 = 10_000;

fn load_sweep(path: &Path) -> (SweepConfig, Sweep) {
    let config = SweepConfig::load(path).unwrap_or_else(|e| {
        eprintln!("Error loading config: {}", e);
        std::process::exit(1);
    });

    let sweep = Sweep::from_config(&config).unwrap_or_else(|e| {
        eprintln!("Error preparing sweep: {}", e);
        std::process::exit(1);
    });
    (config, sweep)
}

fn run_baseline(path: &Path, count: u64) {
    let (_, sweep) = load_sweep(path);

    let start = Instant::now();
    match sweep.random_baseline(count) {
        Ok(Some(best)) => println!("Best of {} random layouts: {}", count, best),
        Ok(None) => println!("No random layouts scored"),
        Err(e) => {
            eprintln!("Error running baseline: {}", e);
            std::process::exit(1);
        }
    }
    println!("Log: {}", sweep.baseline_path().display());
    println!("Time: {:.2}s", start.elapsed().as_secs_f32());
}

fn print_example_config() {
    let config = SweepConfig::default();
    match serde_json::to_string_pretty(&config) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Error serializing example config: {}", e);
            std::process::exit(1);
        }
    }
}
