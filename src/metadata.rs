//! Run metadata structures.
//!
//! One [`RunMetadata`] record is written per measurement run, alongside the
//! tabular data. It is written once at run start (status `Running`) so a
//! crash still leaves an inspectable sidecar, and rewritten at finalize with
//! the end time and terminal status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal (and transient) status of a measurement run.
///
/// `Running` only ever appears on disk for runs that were never finalized,
/// i.e. the process died mid-acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Acquisition in progress (initial sidecar write)
    Running,
    /// Ran to the end of its setpoints/duration
    Completed,
    /// Stopped by an interrupt request; partial data is valid data
    Interrupted,
    /// Aborted by an instrument or storage error; partial data preserved
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "Running"),
            RunStatus::Completed => write!(f, "Completed"),
            RunStatus::Interrupted => write!(f, "Interrupted"),
            RunStatus::Failed => write!(f, "Failed"),
        }
    }
}

impl RunStatus {
    /// True for statuses that mean the run finished without error.
    pub fn is_ok(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Interrupted)
    }
}

/// Kind of measurement run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepType {
    /// Single-row measurement
    Measure,
    /// Time-series watch
    Watch,
    /// One swept axis
    Sweep1d,
    /// Slow/fast nested axes
    Sweep2d,
}

/// A followed parameter as recorded in metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowedColumn {
    /// Column name (parameter display name)
    pub name: String,
    /// Gain divisor applied to raw readings
    pub gain: f64,
}

/// A swept axis as recorded in metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisInfo {
    /// Setpoint column name (settable parameter name)
    pub name: String,
    /// Setpoints in sweep order
    pub setpoints: Vec<f64>,
    /// Post-write delay before reading, seconds
    pub delay_s: f64,
}

/// Full metadata record for one run (`metadata.json` sidecar).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Kind of run
    pub sweep_type: SweepType,
    /// Column names in data-file order: time, axes, followed parameters
    pub columns: Vec<String>,
    /// Followed parameters with their gains, in registration order
    pub followed: Vec<FollowedColumn>,
    /// Swept axes, slow before fast; empty for measure/watch
    #[serde(default)]
    pub axes: Vec<AxisInfo>,
    /// Serpentine fast-axis traversal (megasweep) rather than raster
    #[serde(default)]
    pub serpentine: bool,
    /// Inter-row delay for watch runs, seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watch_delay_s: Option<f64>,
    /// Maximum watch duration, seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_duration_s: Option<f64>,
    /// Operator comments attached to the station
    #[serde(default)]
    pub comments: Vec<String>,
    /// Run start timestamp
    pub start_time: DateTime<Utc>,
    /// Run end timestamp; absent until finalize
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Run status; `Running` on disk means the run never finalized
    pub status: RunStatus,
    /// Error message for failed runs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Version of this crate that produced the run
    pub software_version: String,
}

impl RunMetadata {
    /// Create a new record stamped with the current time and `Running`.
    pub fn new(sweep_type: SweepType, columns: Vec<String>, followed: Vec<FollowedColumn>) -> Self {
        Self {
            sweep_type,
            columns,
            followed,
            axes: Vec::new(),
            serpentine: false,
            watch_delay_s: None,
            max_duration_s: None,
            comments: Vec::new(),
            start_time: Utc::now(),
            end_time: None,
            status: RunStatus::Running,
            error: None,
            software_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Attach a swept axis (slow before fast for 2D runs).
    pub fn with_axis(mut self, axis: AxisInfo) -> Self {
        self.axes.push(axis);
        self
    }

    /// Attach operator comments.
    pub fn with_comments(mut self, comments: Vec<String>) -> Self {
        self.comments = comments;
        self
    }

    /// Stamp the end time and terminal status.
    pub fn finish(&mut self, status: RunStatus) {
        self.end_time = Some(Utc::now());
        self.status = status;
    }

    /// Wall-clock duration, if the run has finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_roundtrip() {
        let mut md = RunMetadata::new(
            SweepType::Sweep1d,
            vec!["time".into(), "gate".into(), "current".into()],
            vec![FollowedColumn {
                name: "current".into(),
                gain: 100.0,
            }],
        )
        .with_axis(AxisInfo {
            name: "gate".into(),
            setpoints: vec![0.0, 0.1, 0.2],
            delay_s: 1.0,
        });
        md.finish(RunStatus::Completed);

        let json = serde_json::to_string_pretty(&md).unwrap();
        let back: RunMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, md);
        assert!(back.status.is_ok());
        assert!(back.duration().is_some());
    }

    #[test]
    fn test_running_status_means_unfinalized() {
        let md = RunMetadata::new(SweepType::Measure, vec!["time".into()], vec![]);
        assert_eq!(md.status, RunStatus::Running);
        assert!(md.end_time.is_none());
        assert!(!md.status.is_ok());
    }
}
