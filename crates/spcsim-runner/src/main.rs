//! # spcsim
//!
//! CLI runner for the SPC MAC simulator.

use spcsim_runner::metrics_export;
use spcsim_runner::{EventLoop, RunnerError, SimTime, SimulationStats};

use clap::{Parser, Subcommand, ValueEnum};
use spcsim_common::metric_defs;
use spcsim_model::{build_simulation, default_scenario_yaml, load_model, load_models};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Duration Parsing
// ============================================================================

/// Parse a duration string with units into seconds.
///
/// Supported formats:
/// - Plain number: `2.5` (seconds)
/// - With unit suffix: `500ms`, `250us`, `2s`, `1m`
/// - Combined units: `1m30s`, `1s500ms`
fn parse_duration(s: &str) -> Result<f64, String> {
    let s = s.trim();

    if let Ok(secs) = s.parse::<f64>() {
        return Ok(secs);
    }

    let mut total_seconds: f64 = 0.0;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(format!("Invalid duration format: '{}'", s));
        }
        let (number, tail) = rest.split_at(number_len);
        let value: f64 = number
            .parse()
            .map_err(|_| format!("Invalid number '{}' in duration '{}'", number, s))?;

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_len);
        let multiplier = match unit {
            "" | "s" => 1.0,
            "us" => 1e-6,
            "ms" => 1e-3,
            "m" => 60.0,
            "h" => 3600.0,
            _ => {
                return Err(format!(
                    "Unknown duration unit '{}' in '{}'. Use us, ms, s, m or h.",
                    unit, s
                ))
            }
        };
        total_seconds += value * multiplier;
        rest = next;
    }

    if total_seconds <= 0.0 {
        return Err(format!("Duration must be positive: '{}'", s));
    }
    Ok(total_seconds)
}

// ============================================================================
// CLI Configuration
// ============================================================================

/// Output format for metrics at end of simulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum MetricsOutputFormat {
    /// JSON format for programmatic consumption.
    Json,
    /// Prometheus text exposition format.
    Prometheus,
}

/// SPCSim - superposition-coding MAC simulator
#[derive(Parser, Debug)]
#[command(name = "spcsim")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a simulation from YAML scenario files
    Run(RunnerConfig),
    /// List all recorded metrics with descriptions and labels
    Metrics,
    /// Print the default configuration as YAML
    Defaults,
}

/// Configuration for running a simulation
#[derive(Parser, Debug)]
pub struct RunnerConfig {
    /// Path(s) to YAML scenario file(s). Multiple files are merged in order (later overrides earlier).
    #[arg(required = true)]
    pub models: Vec<PathBuf>,

    /// Simulated time, overriding the scenario's duration.
    /// Accepts plain seconds or units: 2, 500ms, 2s, 1m30s
    #[arg(short, long, value_parser = parse_duration)]
    pub duration: Option<f64>,

    /// Random seed (default: the scenario's seed)
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Output trace file path (JSON)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Output format for metrics at end of simulation.
    #[arg(long, value_enum)]
    pub metrics_output: Option<MetricsOutputFormat>,

    /// File path to write metrics (stdout if not specified).
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,
}

impl RunnerConfig {
    /// True when the statistics summary can go to stdout without mixing with metrics.
    fn prints_stats(&self) -> bool {
        self.metrics_output.is_none() || self.metrics_file.is_some()
    }
}

// ============================================================================
// Summary Output
// ============================================================================

/// Print the final summary table with per-node statistics.
fn print_summary_table(event_loop: &EventLoop) {
    let widths = [14, 10, 10, 10, 12, 14];
    let rule = |left: &str, mid: &str, right: &str| {
        let cells: Vec<String> = widths.iter().map(|w| "─".repeat(*w + 2)).collect();
        format!("{}{}{}", left, cells.join(mid), right)
    };

    eprintln!();
    eprintln!("{}", rule("┌", "┬", "┐"));
    eprintln!(
        "│ {:^14} │ {:^10} │ {:^10} │ {:^10} │ {:^12} │ {:^14} │",
        "Node", "Address", "TX frames", "SPC", "Delivered", "Throughput"
    );
    eprintln!("{}", rule("├", "┼", "┤"));
    for node_info in event_loop.node_infos() {
        let stats = event_loop
            .node_stats()
            .get(&node_info.name)
            .cloned()
            .unwrap_or_default();
        eprintln!(
            "│ {:14} │ {:>10} │ {:>10} │ {:>10} │ {:>12} │ {:>9.1} kbps │",
            node_info.name,
            node_info.address.to_string(),
            stats.frames_sent,
            stats.spc_frames_sent,
            stats.packets_delivered,
            stats.throughput_bps / 1e3
        );
    }
    eprintln!("{}", rule("└", "┴", "┘"));
    let _ = std::io::stderr().flush();
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Run a simulation with the given configuration.
pub fn run_simulation(config: &RunnerConfig) -> Result<SimulationStats, RunnerError> {
    let metrics_recorder = if config.metrics_output.is_some() {
        let recorder = Arc::new(metrics_export::InMemoryRecorder::new());
        match metrics::set_global_recorder((*recorder).clone()) {
            Ok(()) => Some(recorder),
            Err(e) => {
                warn!("Failed to set metrics recorder: {}", e);
                None
            }
        }
    } else {
        None
    };

    let model = if config.models.len() == 1 {
        load_model(&config.models[0])?
    } else {
        let paths: Vec<&Path> = config.models.iter().map(|p| p.as_path()).collect();
        load_models(&paths)?
    };
    info!(
        "Loaded scenario with {} nodes from {} file(s)",
        model.nodes().len(),
        config.models.len()
    );

    let seed = config.seed.unwrap_or(model.simulation().seed);
    info!("Using seed: {}", seed);

    let simulation = build_simulation(&model, seed)?;
    info!("Built simulation with {} entities", simulation.entities.len());

    let duration = match config.duration {
        Some(secs) => SimTime::from_secs(secs),
        None => simulation.duration,
    };

    let trace_output: Option<Box<dyn Write>> = match config.output {
        Some(ref path) => Some(Box::new(std::io::BufWriter::new(std::fs::File::create(path)?))),
        None => None,
    };

    let mut event_loop = EventLoop::new(simulation, trace_output);
    let stats = event_loop.run_with_progress(duration, |progress| {
        info!(
            "{:5.1}% simulated {:.3}s of {:.3}s, {} events, {:.1}s wall",
            progress.progress_percent,
            progress.sim_time.as_secs_f64(),
            progress.target_time.as_secs_f64(),
            progress.events_processed,
            progress.wall_elapsed.as_secs_f64()
        );
    })?;

    if config.verbose {
        print_summary_table(&event_loop);
        eprintln!("Simulation complete!");
        eprintln!("  Total events: {}", stats.total_events);
        eprintln!("  Frames TX: {}", stats.frames_transmitted);
        eprintln!("  SPC frames TX: {}", stats.spc_frames_transmitted);
        eprintln!("  Packets delivered: {}", stats.packets_delivered);
        eprintln!("  Wall time: {}ms", stats.wall_time_ms);
    }

    if let (Some(format), Some(recorder)) = (config.metrics_output, metrics_recorder) {
        let mut writer: Box<dyn Write> = match &config.metrics_file {
            Some(path) => Box::new(std::fs::File::create(path)?),
            None => Box::new(std::io::stdout()),
        };
        let snapshot = recorder.snapshot(duration);
        match format {
            MetricsOutputFormat::Json => metrics_export::export_json(&snapshot, &mut writer)?,
            MetricsOutputFormat::Prometheus => {
                metrics_export::export_prometheus(&snapshot, &mut writer)?
            }
        }
        if let Some(ref path) = config.metrics_file {
            info!("Metrics exported to: {}", path.display());
        }
    }

    Ok(stats)
}

fn main() -> Result<(), RunnerError> {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run(config) if config.verbose => "debug",
        _ => "warn",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Run(config) => {
            let stats = run_simulation(&config)?;
            if config.prints_stats() {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
        }
        Commands::Metrics => print_metrics_info(),
        Commands::Defaults => print!("{}", default_scenario_yaml()?),
    }

    Ok(())
}

/// Print information about all recorded metrics
fn print_metrics_info() {
    println!("SPCSim Metrics");
    println!("==============\n");
    println!("Every metric carries a `node` label with the node's scenario name.\n");

    let categories = [
        ("MAC", "spcsim.mac."),
        ("Queue", "spcsim.queue."),
        ("PHY", "spcsim.phy."),
        ("Application", "spcsim.app."),
    ];

    for (category_name, prefix) in categories {
        println!("## {}\n", category_name);
        for metric in metric_defs::ALL.iter().filter(|m| m.name.starts_with(prefix)) {
            println!("  {}", metric.name);
            println!("    Type: {}", metric.kind);
            let unit_str = metric.unit_str();
            if !unit_str.is_empty() {
                println!("    Unit: {}", unit_str);
            }
            println!("    Description: {}", metric.description);
            if !metric.labels.is_empty() {
                println!("    Extra labels: {}", metric.labels.join(", "));
            }
            println!();
        }
    }

    println!("## Usage\n");
    println!("  spcsim run scenarios/three_nodes.yaml --duration 2s --metrics-output prometheus\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("2"), Ok(2.0));
        assert_eq!(parse_duration("2.5s"), Ok(2.5));
        assert_eq!(parse_duration("1m30s"), Ok(90.0));
        assert!((parse_duration("500ms").unwrap() - 0.5).abs() < 1e-12);
        assert!((parse_duration("1s250ms").unwrap() - 1.25).abs() < 1e-12);
        assert!((parse_duration("750us").unwrap() - 0.00075).abs() < 1e-12);
    }

    #[test]
    fn test_parse_duration_errors() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("ms").is_err());
        assert!(parse_duration("3d").is_err());
        assert!(parse_duration("0s").is_err());
    }

    #[test]
    fn test_cli_run_parse() {
        let cli = Cli::try_parse_from([
            "spcsim",
            "run",
            "base.yaml",
            "overlay.yaml",
            "--duration",
            "250ms",
            "--seed",
            "9",
            "--metrics-output",
            "prometheus",
        ])
        .unwrap();
        let Commands::Run(config) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(config.models.len(), 2);
        assert_eq!(config.seed, Some(9));
        assert!((config.duration.unwrap() - 0.25).abs() < 1e-12);
        assert_eq!(config.metrics_output, Some(MetricsOutputFormat::Prometheus));
        assert!(!config.prints_stats());
    }

    #[test]
    fn test_cli_requires_model() {
        assert!(Cli::try_parse_from(["spcsim", "run"]).is_err());
        assert!(Cli::try_parse_from(["spcsim", "defaults"]).is_ok());
    }
}
