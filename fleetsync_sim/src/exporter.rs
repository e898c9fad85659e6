//! JSON exporter for offline inspection of simulation runs.
//!
//! Exports periodic frames of the fleet (store and markers) as JSON so a run
//! can be replayed on a map or diffed between seeds.

use fleetsync_core::{DriverLocationRecord, DriverStatus, LocationSource};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;

/// A single frame of simulation data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimFrame {
    /// Simulation time in seconds
    pub time_sec: f64,

    /// Store contents at this instant
    pub drivers: Vec<DriverFrame>,

    /// Markers rendered on the surface
    pub markers: usize,

    /// Events since the previous frame (pauses, device errors, ...)
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub events: Vec<SimEvent>,
}

/// One driver in a frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverFrame {
    pub id: u64,
    pub lat: f64,
    pub lng: f64,
    pub source: LocationSource,
    pub status: DriverStatus,
    pub last_update_ms: u64,
    pub has_marker: bool,
}

impl DriverFrame {
    pub fn new(record: &DriverLocationRecord, has_marker: bool) -> Self {
        Self {
            id: record.driver_id.get(),
            lat: record.position.lat,
            lng: record.position.lng,
            source: record.source,
            status: record.status,
            last_update_ms: record.last_update.as_millis(),
            has_marker,
        }
    }
}

/// Simulation event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimEvent {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

impl SimEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: None,
        }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: Some("warn".to_string()),
        }
    }
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Duration in seconds
    pub duration_sec: f64,

    /// All frames
    pub frames: Vec<SimFrame>,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            duration_sec: 0.0,
            frames: Vec::new(),
            passed: false,
            failure_reason: None,
        }
    }

    /// Adds a frame.
    pub fn add_frame(&mut self, frame: SimFrame) {
        self.duration_sec = frame.time_sec;
        self.frames.push(frame);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, failure_reason: Option<String>) {
        self.passed = passed;
        self.failure_reason = failure_reason;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
