//! Sweep a mock gate DAC while a mock DMM tracks it, printing live rows.
//!
//! ```text
//! cargo run --example mock_sweep
//! SWEEP_STORAGE__BASEDIR=/data/runs cargo run --example mock_sweep
//! ```

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use sweep_station::config::Settings;
use sweep_station::instrument::mock::{MockDac, MockDmm};
use sweep_station::plot::{LivePlot, PlotFrame, PlotSink};
use sweep_station::station::Station;
use sweep_station::store::RunReader;
use sweep_station::RunStatus;

/// Prints the newest point of every trace on each redraw.
struct ConsoleSink;

impl PlotSink for ConsoleSink {
    fn begin(&mut self, columns: &[String]) {
        println!("columns: {}", columns.join("\t"));
    }

    fn redraw(&mut self, frame: &PlotFrame) {
        for (name, points) in &frame.traces {
            if let Some((x, y)) = points.last() {
                println!("  {name}: ({x:.3}, {y:.6})  [{} pts]", points.len());
            }
        }
    }

    fn finished(&mut self, status: RunStatus, frame: &PlotFrame) {
        let total: usize = frame.traces.values().map(Vec::len).sum();
        println!("run finished: {status}, {total} plotted points");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().unwrap_or_else(|_| Settings::with_basedir("./runs"));
    sweep_station::logging::init(&settings);
    let basedir = settings.storage.basedir.clone();

    let mut station = Station::new(settings)?;

    // A gate DAC and a DMM measuring 2x the gate voltage with a little
    // noise, as if across a 1:2 divider.
    let gate = Arc::new(MockDac::new("gate"));
    let dmm = Arc::new(MockDmm::tracking("current", gate.output(), 2.0, 0.01));
    station.follow_param(dmm, 1.0)?;

    let bridge = LivePlot::new()
        .line("gate", &["current"])
        .attach(station.subscribe(), ConsoleSink);

    let setpoints: Vec<f64> = (0..=50).map(|i| i as f64 * 0.02).collect();
    let result = station
        .sweep(gate, &setpoints, Duration::from_millis(20))
        .await?;

    println!(
        "run {}: {} rows, {} -> {}",
        result.id,
        result.rows,
        result.status,
        result.data_path.display()
    );

    // Read it back to show the stored data matches.
    let reader = RunReader::open(&basedir, result.id)?;
    let data = reader.all_data()?;
    println!(
        "readback: {} rows, first = {:?}, last = {:?}",
        data.len(),
        data.first(),
        data.last()
    );

    drop(station);
    bridge.await?;
    Ok(())
}
