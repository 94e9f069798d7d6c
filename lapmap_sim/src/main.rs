//! lapmap circuit simulator CLI
//!
//! Runs seeded end-to-end races: mapping lap, loop closure, map filtering,
//! localization. Exits non-zero when any run fails its criteria.

use clap::Parser;
use lapmap_sim::{RaceResult, RaceRunner, TrackConfig};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// lapmap deterministic circuit simulation
#[derive(Parser, Debug)]
#[command(name = "lapmap-sim")]
#[command(about = "Drive the cone-SLAM engine around a simulated circuit", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = derive from wall clock)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Number of seeds to run (for CI sweeps)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Lap budget per run (mapping lap included)
    #[arg(short, long, default_value = "2.0")]
    laps: f64,

    /// Centerline radius of the circuit in metres
    #[arg(short, long, default_value = "20.0")]
    radius: f64,

    /// Number of cone pairs lining the circuit
    #[arg(short, long, default_value = "15")]
    cone_pairs: usize,

    /// Vehicle speed in m/s
    #[arg(long, default_value = "10.0")]
    speed: f64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(42)
    } else {
        args.seed
    };

    let mut results: Vec<RaceResult> = Vec::new();
    let mut failed = 0usize;

    for offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(offset as u64);
        let track = TrackConfig {
            radius: args.radius,
            cone_pairs: args.cone_pairs,
            speed: args.speed,
            ..TrackConfig::default()
        };
        let mut runner = RaceRunner::new(seed, track, args.laps);
        let result = runner.run();

        if !args.json {
            if result.passed() {
                info!(
                    "✓ seed={} PASSED: {} map cones, {:.2} m mean map error",
                    seed, result.map_size, result.mean_map_error
                );
            } else {
                error!(
                    "✗ seed={} FAILED: {}",
                    seed,
                    result.failure_reason().unwrap_or_default()
                );
            }
        }
        if !result.passed() {
            failed += 1;
        }
        results.push(result);
    }

    if args.json {
        let summary = serde_json::json!({
            "total": results.len(),
            "passed": results.len() - failed,
            "failed": failed,
            "results": results,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).unwrap_or_default()
        );
    } else if failed == 0 {
        info!("✅ All {} runs passed!", results.len());
    } else {
        error!("❌ {}/{} runs failed!", failed, results.len());
    }

    if failed > 0 {
        std::process::exit(1);
    }
}
