//! Samples collected during one discharge test.

use super::StopReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Telemetry of one controller cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Terminal voltage in volts.
    pub voltage: f64,
    /// Load current in amperes.
    pub current: f64,
    /// Dissipated power in watts.
    pub power: f64,
    /// Capacity discharged since the start of the test, in ampere-hours.
    pub capacity: f64,
    /// Test duration reported by the instrument, in minutes.
    pub elapsed_minutes: f64,
    /// Host wall-clock time at which the sample was completed.
    pub timestamp: DateTime<Utc>,
}

/// Ordered record of one test run on one cell.
///
/// Samples are append-only. The session is owned by the controller and lent to the
/// export sink once the test has ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSession {
    cell_id: String,
    started_at: DateTime<Utc>,
    samples: Vec<Sample>,
    stop_reason: Option<StopReason>,
}

impl TestSession {
    /// Start an empty session for `cell_id`, stamped now.
    pub fn new(cell_id: impl Into<String>) -> Self {
        Self::started_at(cell_id, Utc::now())
    }

    /// Start an empty session with an explicit start time.
    pub fn started_at(cell_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            cell_id: cell_id.into(),
            started_at,
            samples: Vec::new(),
            stop_reason: None,
        }
    }

    /// Identifier of the cell under test.
    pub fn cell_id(&self) -> &str {
        &self.cell_id
    }

    /// When the session was created.
    pub fn start_time(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Samples in collection order.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True before the first sample.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Why the test ended, once it has.
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    pub(crate) fn push(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    pub(crate) fn set_stop_reason(&mut self, reason: StopReason) {
        self.stop_reason = Some(reason);
    }

    /// Voltages in collection order.
    pub fn voltages(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.voltage).collect()
    }

    /// Currents in collection order.
    pub fn currents(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.current).collect()
    }

    /// Capacity of the last sample, if any.
    pub fn final_capacity(&self) -> Option<f64> {
        self.samples.last().map(|s| s.capacity)
    }

    /// Default export name: `{YYYY-MM-DD}-cell-{cell_id}` using the start date.
    pub fn default_destination(&self) -> String {
        format!(
            "{}-cell-{}",
            self.started_at.format("%Y-%m-%d"),
            self.cell_id
        )
    }
}
