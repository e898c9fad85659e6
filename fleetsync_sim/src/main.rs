//! FleetSync DST Simulator CLI
//!
//! Run deterministic simulation tests with fault scenarios.

use clap::Parser;
use fleetsync_core::FleetConfig;
use fleetsync_sim::scenarios::ScenarioId;
use fleetsync_sim::{ScenarioResult, ScenarioRunner};
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// FleetSync Deterministic Simulation Testing CLI
#[derive(Parser, Debug)]
#[command(name = "fleetsync-sim")]
#[command(about = "Run deterministic simulation tests for the FleetSync engine", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Roster size
    #[arg(short = 'n', long, default_value = "6")]
    drivers: usize,

    /// Scenario to run (live_takeover, out_of_order, malformed_flood, pause_resume,
    /// surface_faults, stale_feed, fleet_scale, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Simulation duration in seconds
    #[arg(short, long, default_value = "60", value_parser = parse_duration)]
    duration: f64,

    /// Engine configuration file (JSON)
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export simulation frames to a JSON file
    #[arg(long)]
    export: Option<String>,
}

/// Durations must be finite and non-negative.
fn parse_duration(arg: &str) -> Result<f64, String> {
    let secs: f64 = arg.parse().map_err(|e| format!("`{arg}` is not a number: {e}"))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("`{arg}` is not a finite, non-negative number of seconds"));
    }
    Ok(secs)
}

fn init_tracing(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let builder = FmtSubscriber::builder().with_max_level(level);

    let result = match EnvFilter::try_from_default_env() {
        Ok(filter) => tracing::subscriber::set_global_default(builder.with_env_filter(filter).finish()),
        Err(_) => tracing::subscriber::set_global_default(builder.finish()),
    };
    if let Err(e) = result {
        eprintln!("Failed to set tracing subscriber: {e}");
    }
}

fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    if !args.json {
        info!("FleetSync DST Simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        match args.scenario.parse() {
            Ok(scenario) => vec![scenario],
            Err(e) => {
                eprintln!("Error: {}", e);
                let names: Vec<&str> = ScenarioId::all().iter().map(|s| s.name()).collect();
                eprintln!("Available scenarios: {}, all", names.join(", "));
                std::process::exit(1);
            }
        }
    };

    let fleet = match &args.config {
        Some(path) => match FleetConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => FleetConfig::default(),
    };

    // Determine base seed
    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(42)
    } else {
        args.seed
    };

    // Handle --export mode
    if let Some(export_path) = &args.export {
        if scenarios.len() > 1 {
            eprintln!("Error: --export only supports a single scenario, not 'all'");
            std::process::exit(1);
        }

        let result = ScenarioRunner::new(base_seed, args.drivers)
            .with_duration(args.duration)
            .with_fleet_config(fleet)
            .run_with_export(scenarios[0], export_path);

        if result.passed {
            info!("✓ {} (seed={}) PASSED - exported to {}", result.scenario, base_seed, export_path);
        } else {
            error!(
                "✗ {} FAILED: {}",
                result.scenario,
                result.failure_reason.as_deref().unwrap_or("unknown")
            );
            std::process::exit(1);
        }
        return;
    }

    // Track results
    let mut all_results: Vec<ScenarioResult> = Vec::new();
    let mut failed_count = 0;

    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);

        let runner = ScenarioRunner::new(seed, args.drivers)
            .with_duration(args.duration)
            .with_fleet_config(fleet.clone());

        for scenario in &scenarios {
            let result = runner.run(*scenario);

            if !args.json {
                if result.passed {
                    info!(
                        "✓ {} (seed={}) PASSED | drivers={} marker_ops={} malformed={}",
                        scenario.name(),
                        seed,
                        result.final_driver_count,
                        result.metrics.marker_ops,
                        result.metrics.malformed_ignored
                    );
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }

            if !result.passed {
                failed_count += 1;
            }

            all_results.push(result);
        }
    }

    // Summary
    let total = all_results.len();
    let passed = total - failed_count;

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": passed,
            "failed": failed_count,
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "steps": r.total_ticks,
                    "time_secs": r.final_time_secs,
                    "drivers": r.final_driver_count,
                    "failure_reason": r.failure_reason,
                    "metrics": r.metrics,
                })
            }).collect::<Vec<_>>(),
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{}", json),
            Err(e) => error!("Failed to encode summary: {}", e),
        }
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if failed_count == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);

            for result in &all_results {
                if !result.passed {
                    error!(
                        "  - {} seed={}: {}",
                        result.scenario.name(),
                        result.seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }
        }
    }

    // Exit with proper code for CI
    if failed_count > 0 {
        std::process::exit(1);
    }
}
