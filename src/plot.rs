//! Live plot bridge over the station's row stream.
//!
//! A [`LivePlot`] subscribes to the broadcast row stream and forwards
//! accumulated series to a [`PlotSink`] (terminal renderer, GUI panel,
//! whatever). It runs on its own task, so a slow or stalled sink can never
//! block acquisition: if the bridge falls behind the channel capacity it
//! skips the dropped rows and keeps going with what remains. Backlogged
//! events are drained in batches with one redraw per batch rather than one
//! per row.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::metadata::RunStatus;
use crate::station::RowEvent;

/// Accumulated series for the run currently being drawn.
///
/// Line traces are keyed by their y column name, heatmap grids by their z
/// column name.
#[derive(Debug, Clone, Default)]
pub struct PlotFrame {
    /// (x, y) pairs per trace, in acquisition order
    pub traces: BTreeMap<String, Vec<(f64, f64)>>,
    /// (x, y, z) triples per grid, in acquisition order
    pub grids: BTreeMap<String, Vec<(f64, f64, f64)>>,
}

impl PlotFrame {
    fn clear(&mut self) {
        self.traces.clear();
        self.grids.clear();
    }

    fn is_empty(&self) -> bool {
        self.traces.is_empty() && self.grids.is_empty()
    }
}

/// Receives accumulated plot data from a [`LivePlot`].
///
/// All methods run on the bridge task; they may block briefly without
/// affecting acquisition.
pub trait PlotSink: Send {
    /// A run started; `columns` is the row layout.
    fn begin(&mut self, columns: &[String]) {
        let _ = columns;
    }

    /// Redraw with the current frame. Called once per drained batch of
    /// rows, not once per row.
    fn redraw(&mut self, frame: &PlotFrame);

    /// The run ended with `status`; `frame` holds the final series.
    fn finished(&mut self, status: RunStatus, frame: &PlotFrame) {
        let _ = (status, frame);
    }
}

/// What to plot from the row stream.
enum PlotSpec {
    Line { x: String, ys: Vec<String> },
    Heatmap { x: String, y: String, z: String },
}

/// A `PlotSpec` with column names resolved to row indices for one run.
enum ResolvedSpec {
    Line { x: usize, ys: Vec<(String, usize)> },
    Heatmap { x: usize, y: usize, z: (String, usize) },
}

/// Declarative plot configuration plus the bridge spawner.
///
/// ```no_run
/// # use sweep_station::plot::{LivePlot, PlotSink};
/// # use sweep_station::station::Station;
/// # fn demo(station: &Station, sink: impl PlotSink + 'static) {
/// LivePlot::new()
///     .line("gate", &["current"])
///     .attach(station.subscribe(), sink);
/// # }
/// ```
#[derive(Default)]
pub struct LivePlot {
    specs: Vec<PlotSpec>,
}

impl LivePlot {
    /// An empty configuration; add plots with [`line`](Self::line) and
    /// [`heatmap`](Self::heatmap).
    pub fn new() -> Self {
        Self::default()
    }

    /// Plot each of `ys` against `x` as a line trace named after the y
    /// column.
    pub fn line(mut self, x: impl Into<String>, ys: &[&str]) -> Self {
        self.specs.push(PlotSpec::Line {
            x: x.into(),
            ys: ys.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    /// Plot `z` on an (`x`, `y`) grid, for 2D sweeps.
    pub fn heatmap(
        mut self,
        x: impl Into<String>,
        y: impl Into<String>,
        z: impl Into<String>,
    ) -> Self {
        self.specs.push(PlotSpec::Heatmap {
            x: x.into(),
            y: y.into(),
            z: z.into(),
        });
        self
    }

    /// Spawn the bridge task consuming `rx` and driving `sink`.
    ///
    /// The task ends when the sending side is dropped; it survives across
    /// multiple runs on the same stream, resetting the frame at each
    /// `RunStarted`.
    pub fn attach(
        self,
        rx: broadcast::Receiver<RowEvent>,
        sink: impl PlotSink + 'static,
    ) -> JoinHandle<()> {
        tokio::spawn(bridge_loop(self.specs, rx, sink))
    }
}

async fn bridge_loop(
    specs: Vec<PlotSpec>,
    mut rx: broadcast::Receiver<RowEvent>,
    mut sink: impl PlotSink,
) {
    let mut resolved: Vec<ResolvedSpec> = Vec::new();
    let mut frame = PlotFrame::default();

    loop {
        // Block for the next event, then drain whatever else is queued so
        // one redraw covers the whole backlog.
        let first = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(dropped = n, "plot bridge lagged, skipping rows");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let mut batch = vec![first];
        let mut closed = false;
        loop {
            match rx.try_recv() {
                Ok(event) => batch.push(event),
                Err(broadcast::error::TryRecvError::Empty) => break,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(dropped = n, "plot bridge lagged, skipping rows");
                }
                Err(broadcast::error::TryRecvError::Closed) => {
                    closed = true;
                    break;
                }
            }
        }

        let mut rows_applied = false;
        for event in batch {
            match event {
                RowEvent::RunStarted { run_id, columns } => {
                    resolved = resolve(&specs, &columns);
                    frame.clear();
                    debug!(run = run_id, plots = resolved.len(), "plot bridge begin");
                    sink.begin(&columns);
                }
                RowEvent::Row(row) => {
                    apply_row(&resolved, &row, &mut frame);
                    rows_applied = true;
                }
                RowEvent::RunEnded { run_id, status } => {
                    if rows_applied {
                        sink.redraw(&frame);
                        rows_applied = false;
                    }
                    debug!(run = run_id, %status, "plot bridge finished");
                    sink.finished(status, &frame);
                }
            }
        }
        if rows_applied {
            sink.redraw(&frame);
        }
        if closed {
            break;
        }
    }

    if !frame.is_empty() {
        debug!("plot bridge shutting down");
    }
}

/// Map requested column names to indices for this run's layout. Specs
/// naming columns the run does not produce are skipped with a warning.
fn resolve(specs: &[PlotSpec], columns: &[String]) -> Vec<ResolvedSpec> {
    let index: HashMap<&str, usize> = columns
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();

    let mut resolved = Vec::new();
    for spec in specs {
        match spec {
            PlotSpec::Line { x, ys } => {
                let Some(&xi) = index.get(x.as_str()) else {
                    warn!(column = %x, "plot x column missing from run, skipping");
                    continue;
                };
                let ys: Vec<(String, usize)> = ys
                    .iter()
                    .filter_map(|y| match index.get(y.as_str()) {
                        Some(&yi) => Some((y.clone(), yi)),
                        None => {
                            warn!(column = %y, "plot y column missing from run, skipping");
                            None
                        }
                    })
                    .collect();
                if !ys.is_empty() {
                    resolved.push(ResolvedSpec::Line { x: xi, ys });
                }
            }
            PlotSpec::Heatmap { x, y, z } => {
                match (
                    index.get(x.as_str()),
                    index.get(y.as_str()),
                    index.get(z.as_str()),
                ) {
                    (Some(&xi), Some(&yi), Some(&zi)) => resolved.push(ResolvedSpec::Heatmap {
                        x: xi,
                        y: yi,
                        z: (z.clone(), zi),
                    }),
                    _ => warn!(
                        x = %x, y = %y, z = %z,
                        "heatmap columns missing from run, skipping"
                    ),
                }
            }
        }
    }
    resolved
}

/// Indices come from the last `RunStarted` the bridge saw; if that event
/// was lost to channel overflow, rows from a narrower follow-up run can be
/// shorter than the resolved layout. Such rows are skipped, never indexed.
fn apply_row(resolved: &[ResolvedSpec], row: &Arc<Vec<f64>>, frame: &mut PlotFrame) {
    for spec in resolved {
        match spec {
            ResolvedSpec::Line { x, ys } => {
                let Some(&xv) = row.get(*x) else {
                    warn!(len = row.len(), "row shorter than plotted layout, skipping");
                    continue;
                };
                for (name, yi) in ys {
                    let Some(&yv) = row.get(*yi) else {
                        warn!(len = row.len(), "row shorter than plotted layout, skipping");
                        continue;
                    };
                    frame.traces.entry(name.clone()).or_default().push((xv, yv));
                }
            }
            ResolvedSpec::Heatmap { x, y, z } => {
                let (name, zi) = z;
                let (Some(&xv), Some(&yv), Some(&zv)) =
                    (row.get(*x), row.get(*y), row.get(*zi))
                else {
                    warn!(len = row.len(), "row shorter than plotted layout, skipping");
                    continue;
                };
                frame.grids.entry(name.clone()).or_default().push((xv, yv, zv));
            }
        }
    }
}
