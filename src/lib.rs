//! Parameter sweep orchestration for laboratory measurements.
//!
//! A [`Station`](station::Station) follows a set of gettable instrument
//! parameters and drives settable ones through setpoints, writing every
//! acquired row to a numbered run directory and broadcasting it to live
//! consumers such as the [plot bridge](plot::LivePlot).
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use sweep_station::config::Settings;
//! use sweep_station::instrument::mock::{MockDac, MockDmm};
//! use sweep_station::station::Station;
//!
//! # async fn demo() -> Result<(), sweep_station::error::SweepError> {
//! let mut station = Station::new(Settings::with_basedir("/data/cooldown7"))?;
//! let gate = Arc::new(MockDac::new("gate"));
//! let dmm = Arc::new(MockDmm::tracking("current", gate.output(), 1e-6, 0.0));
//! station.follow_param(dmm, 100.0)?;
//!
//! let setpoints: Vec<f64> = (0..=100).map(|i| i as f64 * 0.01).collect();
//! let result = station
//!     .sweep(gate, &setpoints, Duration::from_millis(100))
//!     .await?;
//! println!("run {} -> {}", result.id, result.data_path.display());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod metadata;
pub mod parameter;
pub mod plot;
pub mod station;
pub mod store;

pub use config::Settings;
pub use error::{AppResult, SweepError};
pub use metadata::{RunMetadata, RunStatus, SweepType};
pub use parameter::{FollowedParameter, GettableParameter, Rampable, SettableParameter};
pub use plot::{LivePlot, PlotFrame, PlotSink};
pub use station::{InterruptHandle, RowEvent, Station, SweepResult};
pub use store::{list_runs, run_info, RunReader, RunWriter};
