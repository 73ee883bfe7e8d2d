//! Trace output integration tests for the spcsim binary.
//!
//! These tests run the binary on scenario files and check the JSON trace and
//! the statistics printed on stdout.

use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

use serde::Deserialize;

// ============================================================================
// JSON Deserialization Types for Trace Output
// ============================================================================

/// A trace entry from the output file.
///
/// Fields that only some entry types carry are optional.
#[derive(Debug, Deserialize, Clone)]
struct TraceEntry {
    origin: String,
    #[allow(dead_code)]
    origin_id: String,
    timestamp: String,
    /// Entry type: "FRAME", "PACKET", "TIMER"
    #[serde(rename = "type")]
    entry_type: String,
    #[serde(default)]
    direction: Option<String>,
    #[serde(default)]
    frame_types: Option<Vec<String>>,
    #[serde(default)]
    superposed: Option<bool>,
    #[serde(default)]
    sender: Option<String>,
    #[serde(default)]
    uid: Option<u64>,
    #[serde(default)]
    size: Option<u32>,
    #[serde(default)]
    start_time_s: Option<f64>,
    #[serde(default)]
    end_time_s: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Stats {
    total_events: u64,
    frames_transmitted: u64,
    packets_requested: u64,
    packets_delivered: u64,
    bytes_delivered: u64,
    simulation_time_us: u64,
}

// ============================================================================
// Test Helper Functions
// ============================================================================

const SCENARIO: &str = r#"
simulation:
  seed: 5
  duration_s: 1.0
propagation:
  loss:
    model: fixed
    default_loss_db: 95.0
    pairs:
      - { from: ap, to: near, loss_db: 60.0, symmetric: true }
      - { from: ap, to: far, loss_db: 75.0, symmetric: true }
nodes:
  - name: ap
    traffic:
      - type: spc_sender
        destinations: [near, far]
        packet_size: 2000
        mean_interval_s: 0.005
  - name: near
    position: { x: 10.0, y: 0.0 }
  - name: far
    position: { x: 60.0, y: 0.0 }
"#;

struct RunOutput {
    trace: Vec<TraceEntry>,
    stats: Stats,
}

/// Run the binary on `scenario` and collect the trace and statistics.
fn run_and_collect(dir: &Path, scenario: &str, seed: u64, duration: &str) -> RunOutput {
    let binary = env!("CARGO_BIN_EXE_spcsim");

    let scenario_path = dir.join("scenario.yaml");
    fs::write(&scenario_path, scenario).expect("Failed to write scenario");
    let output_path = dir.join(format!("trace_{}.json", seed));

    let output = Command::new(binary)
        .arg("run")
        .arg(&scenario_path)
        .arg("--seed")
        .arg(seed.to_string())
        .arg("--duration")
        .arg(duration)
        .arg("--output")
        .arg(&output_path)
        .output()
        .expect("Failed to execute spcsim");

    if !output.status.success() {
        panic!(
            "Simulation failed:\nstdout: {}\nstderr: {}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let trace_json = fs::read_to_string(&output_path).expect("Failed to read trace output file");
    RunOutput {
        trace: serde_json::from_str(&trace_json).expect("Failed to parse trace JSON"),
        stats: serde_json::from_slice(&output.stdout).expect("Failed to parse stats JSON"),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_trace_contains_transmissions_and_deliveries() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let run = run_and_collect(temp_dir.path(), SCENARIO, 5, "500ms");

    assert_eq!(run.stats.simulation_time_us, 500_000);
    assert!(run.stats.total_events > 0);
    assert!(run.stats.frames_transmitted > 0);
    assert!(run.stats.packets_delivered > 0);
    assert!(run.stats.packets_delivered <= run.stats.packets_requested);

    let tx: Vec<&TraceEntry> = run
        .trace
        .iter()
        .filter(|e| e.entry_type == "FRAME" && e.direction.as_deref() == Some("TX"))
        .collect();
    assert!(!tx.is_empty());
    assert!(tx.iter().any(|e| e.origin == "ap"
        && e.frame_types
            .as_ref()
            .is_some_and(|types| types.iter().any(|t| t == "RTS_SPC"))));
    for entry in &tx {
        let (start, end) = (entry.start_time_s.unwrap(), entry.end_time_s.unwrap());
        assert!(end > start);
        assert!(entry.timestamp.starts_with("2025-01-01T"));
        let superposed = entry.superposed.unwrap();
        assert_eq!(superposed, entry.frame_types.as_ref().unwrap().len() == 2);
    }

    // RX frames name the transmitter.
    assert!(run
        .trace
        .iter()
        .filter(|e| e.entry_type == "FRAME" && e.direction.as_deref() == Some("RX"))
        .all(|e| e.sender.is_some()));

    // Every delivery matches the size of a requested packet with the same uid.
    let requested: std::collections::HashMap<u64, u32> = run
        .trace
        .iter()
        .filter(|e| e.entry_type == "PACKET" && e.direction.as_deref() == Some("TX"))
        .map(|e| (e.uid.unwrap(), e.size.unwrap()))
        .collect();
    let delivered: Vec<&TraceEntry> = run
        .trace
        .iter()
        .filter(|e| e.entry_type == "PACKET" && e.direction.as_deref() == Some("RX"))
        .collect();
    assert_eq!(delivered.len() as u64, run.stats.packets_delivered);
    let mut bytes = 0u64;
    for entry in delivered {
        assert!(entry.origin == "near" || entry.origin == "far");
        let uid = entry.uid.unwrap();
        assert_eq!(requested.get(&uid).copied(), entry.size);
        bytes += u64::from(entry.size.unwrap());
    }
    assert_eq!(bytes, run.stats.bytes_delivered);
}

#[test]
fn test_same_seed_gives_same_trace() {
    let first_dir = TempDir::new().expect("Failed to create temp dir");
    let second_dir = TempDir::new().expect("Failed to create temp dir");
    let first = run_and_collect(first_dir.path(), SCENARIO, 17, "300ms");
    let second = run_and_collect(second_dir.path(), SCENARIO, 17, "300ms");

    assert_eq!(first.trace.len(), second.trace.len());
    for (a, b) in first.trace.iter().zip(&second.trace) {
        assert_eq!(a.timestamp, b.timestamp);
        assert_eq!(a.origin, b.origin);
        assert_eq!(a.entry_type, b.entry_type);
        assert_eq!(a.uid, b.uid);
    }
    assert_eq!(first.stats.packets_delivered, second.stats.packets_delivered);
}

#[test]
fn test_defaults_command_prints_yaml() {
    let output = Command::new(env!("CARGO_BIN_EXE_spcsim"))
        .arg("defaults")
        .output()
        .expect("Failed to execute spcsim");
    assert!(output.status.success());
    let yaml = String::from_utf8_lossy(&output.stdout);
    assert!(yaml.contains("simulation:"));
    assert!(yaml.contains("cw_max: 1023"));
    assert!(yaml.contains("model: log_distance"));
}

#[test]
fn test_unknown_field_is_rejected() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let scenario_path = temp_dir.path().join("bad.yaml");
    fs::write(&scenario_path, "nodes:\n  - name: a\n    mac:\n      cw_mim: 3\n").unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_spcsim"))
        .arg("run")
        .arg(&scenario_path)
        .output()
        .expect("Failed to execute spcsim");
    assert!(!output.status.success());
}
