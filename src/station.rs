//! The sweep engine.
//!
//! A [`Station`] is a collection of followed parameters that can be
//! measured. It supports single-shot measurement (`measure`), time series
//! (`watch`), 1D sweeps (`sweep`, `multisweep`), and nested 2D sweeps
//! (`sweep2d` raster, `megasweep` serpentine).
//!
//! # Execution model
//!
//! One sequential acquisition task drives instruments synchronously: write
//! setpoint, wait the configured delay, read every followed parameter, and
//! append the row to the result store. Rows are appended in strict
//! acquisition order. The same rows fan out over a broadcast channel as
//! [`RowEvent`]s for the live plot bridge (or any other consumer); sending
//! never blocks, so a slow consumer can never stall acquisition.
//!
//! # Interruption and failure
//!
//! An [`InterruptHandle`] flag is observed between points, never during an
//! instrument call. Interruption finalizes the run as `Interrupted` and is
//! returned as a normal result; partial data is valid data. Any instrument
//! error aborts the sweep before the partial row is written, finalizes the
//! run as `Failed`, and re-surfaces the error to the caller with no retry.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::{AppResult, SweepError};
use crate::metadata::{AxisInfo, FollowedColumn, RunMetadata, RunStatus, SweepType};
use crate::parameter::{FollowedParameter, GettableParameter, SettableParameter};
use crate::store::{RunWriter, DATA_FILE_COMPRESSED};

/// Capacity of the row broadcast channel. Consumers that fall further
/// behind than this skip rows (allowed; plotting is best-effort).
const ROW_CHANNEL_CAPACITY: usize = 1024;

/// Events published on the station's row stream.
#[derive(Debug, Clone)]
pub enum RowEvent {
    /// A run began; carries the column layout for the rows that follow.
    RunStarted {
        /// Run ID in the result store
        run_id: u64,
        /// Column names in row order
        columns: Arc<Vec<String>>,
    },
    /// One acquired row, in column order.
    Row(Arc<Vec<f64>>),
    /// The run finished with the given status.
    RunEnded {
        /// Run ID in the result store
        run_id: u64,
        /// Terminal status
        status: RunStatus,
    },
}

/// Requests a graceful stop of the running operation.
///
/// Cloneable and thread-safe; typically wired to a Ctrl-C or GUI stop
/// button. The engine observes the request between points.
#[derive(Debug, Clone)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    /// Ask the engine to stop after the point in progress.
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a stop has been requested.
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of a completed (or interrupted, or failed-then-recovered) run.
#[derive(Debug, Clone)]
pub struct SweepResult {
    /// Run ID in the result store
    pub id: u64,
    /// Run directory
    pub dir: PathBuf,
    /// Path of the finalized data file
    pub data_path: PathBuf,
    /// Terminal status (`Completed` or `Interrupted`)
    pub status: RunStatus,
    /// Number of rows acquired
    pub rows: u64,
    /// Finalized metadata record
    pub metadata: RunMetadata,
}

impl SweepResult {
    /// True if the run was stopped early by an interrupt request.
    pub fn interrupted(&self) -> bool {
        self.status == RunStatus::Interrupted
    }
}

type Hook = Box<dyn Fn() + Send + Sync>;

/// A station: followed parameters, sweep operations, and the row stream.
pub struct Station {
    settings: Settings,
    params: Vec<FollowedParameter>,
    comments: Vec<String>,
    run_befores: Vec<Hook>,
    run_afters: Vec<Hook>,
    interrupt: Arc<AtomicBool>,
    rows_tx: broadcast::Sender<RowEvent>,
}

impl std::fmt::Debug for Station {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Station")
            .field("settings", &self.settings)
            .field("params", &self.params)
            .field("comments", &self.comments)
            .finish_non_exhaustive()
    }
}

impl Station {
    /// Create a station over validated settings.
    pub fn new(settings: Settings) -> AppResult<Self> {
        settings.validate()?;
        let (rows_tx, _) = broadcast::channel(ROW_CHANNEL_CAPACITY);
        Ok(Self {
            settings,
            params: Vec::new(),
            comments: Vec::new(),
            run_befores: Vec::new(),
            run_afters: Vec::new(),
            interrupt: Arc::new(AtomicBool::new(false)),
            rows_tx,
        })
    }

    /// Follow a parameter: include it in every acquired row, dividing raw
    /// readings by `gain`.
    pub fn follow_param(
        &mut self,
        param: Arc<dyn GettableParameter>,
        gain: f64,
    ) -> AppResult<&mut Self> {
        self.params.push(FollowedParameter::new(param, gain)?);
        Ok(self)
    }

    /// Attach an operator comment, recorded in every run's metadata.
    pub fn add_comment(&mut self, comment: impl Into<String>) {
        self.comments.push(comment.into());
    }

    /// Register a hook executed before each point is read.
    pub fn run_before(&mut self, hook: impl Fn() + Send + Sync + 'static) {
        self.run_befores.push(Box::new(hook));
    }

    /// Register a hook executed after each point is committed.
    pub fn run_after(&mut self, hook: impl Fn() + Send + Sync + 'static) {
        self.run_afters.push(Box::new(hook));
    }

    /// Subscribe to the row stream.
    pub fn subscribe(&self) -> broadcast::Receiver<RowEvent> {
        self.rows_tx.subscribe()
    }

    /// Handle for requesting a graceful stop of the current operation.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle(Arc::clone(&self.interrupt))
    }

    /// Acquire a single row with elapsed time 0.
    pub async fn measure(&self) -> AppResult<SweepResult> {
        let metadata = self.base_metadata(SweepType::Measure, Vec::new());
        let mut run = self.begin(metadata)?;

        self.fire(&self.run_befores);
        let values = match self.read_followed().await {
            Ok(values) => values,
            Err(err) => return Err(self.fail(run, err)),
        };
        let mut row = vec![0.0];
        row.extend(values);
        if let Err(err) = run.append(row) {
            return Err(self.fail(run, err));
        }
        self.fire(&self.run_afters);

        self.finish(run, RunStatus::Completed)
    }

    /// Acquire rows every `delay` until `max_duration` elapses (if given)
    /// or an interrupt is requested.
    pub async fn watch(
        &self,
        delay: Duration,
        max_duration: Option<Duration>,
    ) -> AppResult<SweepResult> {
        let mut metadata = self.base_metadata(SweepType::Watch, Vec::new());
        metadata.watch_delay_s = Some(delay.as_secs_f64());
        metadata.max_duration_s = max_duration.map(|d| d.as_secs_f64());
        let mut run = self.begin(metadata)?;

        let mut status = RunStatus::Completed;
        loop {
            if let Some(max) = max_duration {
                if run.started.elapsed() >= max {
                    break;
                }
            }
            sleep(delay).await;

            self.fire(&self.run_befores);
            let values = match self.read_followed().await {
                Ok(values) => values,
                Err(err) => return Err(self.fail(run, err)),
            };
            let mut row = vec![run.started.elapsed().as_secs_f64()];
            row.extend(values);
            if let Err(err) = run.append(row) {
                return Err(self.fail(run, err));
            }

            if self.interrupt.load(Ordering::SeqCst) {
                status = RunStatus::Interrupted;
                break;
            }
            self.fire(&self.run_afters);
        }

        self.finish(run, status)
    }

    /// 1D sweep: drive `axis` through `setpoints` in order, waiting `delay`
    /// after each write before reading the followed parameters.
    pub async fn sweep(
        &self,
        axis: Arc<dyn SettableParameter>,
        setpoints: &[f64],
        delay: Duration,
    ) -> AppResult<SweepResult> {
        let axis_info = AxisInfo {
            name: axis.name().to_string(),
            setpoints: setpoints.to_vec(),
            delay_s: delay.as_secs_f64(),
        };
        let metadata = self
            .base_metadata(SweepType::Sweep1d, vec![axis.name().to_string()])
            .with_axis(axis_info);
        let mut run = self.begin(metadata)?;

        let mut status = RunStatus::Completed;
        for &setpoint in setpoints {
            if let Err(err) = axis.set(setpoint).await {
                return Err(self.fail(run, err));
            }
            sleep(delay).await;

            match self.acquire_point(&mut run, &[setpoint]).await {
                Ok(()) => {}
                Err(err) => return Err(self.fail(run, err)),
            }
            if self.interrupt.load(Ordering::SeqCst) {
                status = RunStatus::Interrupted;
                break;
            }
            self.fire(&self.run_afters);
        }

        self.finish(run, status)
    }

    /// Drive several axes in lockstep over one setpoint index.
    ///
    /// `setpoint_lists[i]` belongs to `axes[i]`; all lists must have the
    /// same length.
    pub async fn multisweep(
        &self,
        axes: &[Arc<dyn SettableParameter>],
        setpoint_lists: &[Vec<f64>],
        delay: Duration,
    ) -> AppResult<SweepResult> {
        let steps = lockstep_steps("multisweep", axes, setpoint_lists)?;

        let mut metadata = self.base_metadata(
            SweepType::Sweep1d,
            axes.iter().map(|a| a.name().to_string()).collect(),
        );
        for (axis, list) in axes.iter().zip(setpoint_lists) {
            metadata = metadata.with_axis(AxisInfo {
                name: axis.name().to_string(),
                setpoints: list.clone(),
                delay_s: delay.as_secs_f64(),
            });
        }
        let mut run = self.begin(metadata)?;

        let mut status = RunStatus::Completed;
        for step in 0..steps {
            let setpoints: Vec<f64> = setpoint_lists.iter().map(|list| list[step]).collect();
            for (axis, &setpoint) in axes.iter().zip(&setpoints) {
                if let Err(err) = axis.set(setpoint).await {
                    return Err(self.fail(run, err));
                }
            }
            sleep(delay).await;

            match self.acquire_point(&mut run, &setpoints).await {
                Ok(()) => {}
                Err(err) => return Err(self.fail(run, err)),
            }
            if self.interrupt.load(Ordering::SeqCst) {
                status = RunStatus::Interrupted;
                break;
            }
            self.fire(&self.run_afters);
        }

        self.finish(run, status)
    }

    /// Nested 2D raster sweep: for each slow setpoint, run the full fast
    /// sweep from its first setpoint.
    #[allow(clippy::too_many_arguments)]
    pub async fn sweep2d(
        &self,
        slow: Arc<dyn SettableParameter>,
        slow_setpoints: &[f64],
        fast: Arc<dyn SettableParameter>,
        fast_setpoints: &[f64],
        slow_delay: Duration,
        fast_delay: Duration,
    ) -> AppResult<SweepResult> {
        self.run_2d(
            std::slice::from_ref(&slow),
            &[slow_setpoints.to_vec()],
            std::slice::from_ref(&fast),
            &[fast_setpoints.to_vec()],
            slow_delay,
            fast_delay,
            false,
        )
        .await
    }

    /// Nested 2D serpentine sweep: the fast-axis order reverses on
    /// alternate slow steps, so the fast parameter is never reverted
    /// between outer iterations. Same data shape as [`sweep2d`](Self::sweep2d);
    /// only the traversal order differs. Preferred when settling behavior
    /// favors continuous scanning.
    #[allow(clippy::too_many_arguments)]
    pub async fn megasweep(
        &self,
        slow: Arc<dyn SettableParameter>,
        slow_setpoints: &[f64],
        fast: Arc<dyn SettableParameter>,
        fast_setpoints: &[f64],
        slow_delay: Duration,
        fast_delay: Duration,
    ) -> AppResult<SweepResult> {
        self.run_2d(
            std::slice::from_ref(&slow),
            &[slow_setpoints.to_vec()],
            std::slice::from_ref(&fast),
            &[fast_setpoints.to_vec()],
            slow_delay,
            fast_delay,
            true,
        )
        .await
    }

    /// Serpentine 2D sweep with several lockstep parameters per axis.
    ///
    /// The 2D counterpart of [`multisweep`](Self::multisweep):
    /// `slow_setpoint_lists[i]` belongs to `slow_axes[i]` (likewise for
    /// fast), lists within a group must share one length, and every slow
    /// step drives all slow axes before the fast group traverses. Columns
    /// are `time`, the slow axes, the fast axes, then followed parameters.
    #[allow(clippy::too_many_arguments)]
    pub async fn multimegasweep(
        &self,
        slow_axes: &[Arc<dyn SettableParameter>],
        slow_setpoint_lists: &[Vec<f64>],
        fast_axes: &[Arc<dyn SettableParameter>],
        fast_setpoint_lists: &[Vec<f64>],
        slow_delay: Duration,
        fast_delay: Duration,
    ) -> AppResult<SweepResult> {
        self.run_2d(
            slow_axes,
            slow_setpoint_lists,
            fast_axes,
            fast_setpoint_lists,
            slow_delay,
            fast_delay,
            true,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_2d(
        &self,
        slow_axes: &[Arc<dyn SettableParameter>],
        slow_lists: &[Vec<f64>],
        fast_axes: &[Arc<dyn SettableParameter>],
        fast_lists: &[Vec<f64>],
        slow_delay: Duration,
        fast_delay: Duration,
        serpentine: bool,
    ) -> AppResult<SweepResult> {
        let slow_steps = lockstep_steps("slow axis group", slow_axes, slow_lists)?;
        let fast_steps = lockstep_steps("fast axis group", fast_axes, fast_lists)?;

        let axis_names: Vec<String> = slow_axes
            .iter()
            .chain(fast_axes)
            .map(|a| a.name().to_string())
            .collect();
        let mut metadata = self.base_metadata(SweepType::Sweep2d, axis_names);
        for (axis, list) in slow_axes.iter().zip(slow_lists) {
            metadata = metadata.with_axis(AxisInfo {
                name: axis.name().to_string(),
                setpoints: list.clone(),
                delay_s: slow_delay.as_secs_f64(),
            });
        }
        for (axis, list) in fast_axes.iter().zip(fast_lists) {
            metadata = metadata.with_axis(AxisInfo {
                name: axis.name().to_string(),
                setpoints: list.clone(),
                delay_s: fast_delay.as_secs_f64(),
            });
        }
        metadata.serpentine = serpentine;
        let mut run = self.begin(metadata)?;

        let mut status = RunStatus::Completed;
        'outer: for outer in 0..slow_steps {
            for (axis, list) in slow_axes.iter().zip(slow_lists) {
                if let Err(err) = axis.set(list[outer]).await {
                    return Err(self.fail(run, err));
                }
            }
            sleep(slow_delay).await;

            let mut order: Vec<usize> = (0..fast_steps).collect();
            if serpentine && outer % 2 == 1 {
                order.reverse();
            }
            for inner in order {
                for (axis, list) in fast_axes.iter().zip(fast_lists) {
                    if let Err(err) = axis.set(list[inner]).await {
                        return Err(self.fail(run, err));
                    }
                }
                sleep(fast_delay).await;

                let mut setpoints: Vec<f64> =
                    slow_lists.iter().map(|list| list[outer]).collect();
                setpoints.extend(fast_lists.iter().map(|list| list[inner]));
                match self.acquire_point(&mut run, &setpoints).await {
                    Ok(()) => {}
                    Err(err) => return Err(self.fail(run, err)),
                }
                if self.interrupt.load(Ordering::SeqCst) {
                    status = RunStatus::Interrupted;
                    break 'outer;
                }
                self.fire(&self.run_afters);
            }
        }

        self.finish(run, status)
    }

    // ------------------------------------------------------------------
    // Run plumbing
    // ------------------------------------------------------------------

    fn column_names(&self, axis_names: &[String]) -> Vec<String> {
        let mut columns = Vec::with_capacity(1 + axis_names.len() + self.params.len());
        columns.push("time".to_string());
        columns.extend(axis_names.iter().cloned());
        columns.extend(self.params.iter().map(|p| p.name().to_string()));
        columns
    }

    fn base_metadata(&self, sweep_type: SweepType, axis_names: Vec<String>) -> RunMetadata {
        let followed = self
            .params
            .iter()
            .map(|p| FollowedColumn {
                name: p.name().to_string(),
                gain: p.gain(),
            })
            .collect();
        RunMetadata::new(sweep_type, self.column_names(&axis_names), followed)
            .with_comments(self.comments.clone())
    }

    fn begin(&self, metadata: RunMetadata) -> AppResult<ActiveRun> {
        self.interrupt.store(false, Ordering::SeqCst);
        let writer = RunWriter::allocate(
            &self.settings.storage.basedir,
            self.settings.storage.max_run_id,
            self.settings.storage.flush_every,
        )?;
        writer.write_metadata(&metadata)?;

        info!(
            run = writer.id(),
            sweep_type = ?metadata.sweep_type,
            columns = metadata.columns.len(),
            "starting run"
        );
        let columns = Arc::new(metadata.columns.clone());
        let _ = self.rows_tx.send(RowEvent::RunStarted {
            run_id: writer.id(),
            columns,
        });

        Ok(ActiveRun {
            writer,
            metadata,
            started: Instant::now(),
            rows_tx: self.rows_tx.clone(),
        })
    }

    /// Wait-free point body shared by the sweep loops: read all followed
    /// parameters and commit one row with the current setpoints.
    async fn acquire_point(&self, run: &mut ActiveRun, setpoints: &[f64]) -> AppResult<()> {
        self.fire(&self.run_befores);
        let values = self.read_followed().await?;
        let mut row = Vec::with_capacity(1 + setpoints.len() + values.len());
        row.push(run.started.elapsed().as_secs_f64());
        row.extend_from_slice(setpoints);
        row.extend(values);
        run.append(row)
    }

    /// Read every followed parameter sequentially, in registration order.
    ///
    /// Instruments are not read concurrently: lock-step timing over a
    /// shared hardware link would be corrupted by interleaved traffic.
    async fn read_followed(&self) -> AppResult<Vec<f64>> {
        let mut values = Vec::with_capacity(self.params.len());
        for param in &self.params {
            values.push(param.read().await?);
        }
        Ok(values)
    }

    fn fire(&self, hooks: &[Hook]) {
        for hook in hooks {
            hook();
        }
    }

    fn finish(&self, run: ActiveRun, status: RunStatus) -> AppResult<SweepResult> {
        let result = run.finish(status, None)?;
        info!(
            run = result.id,
            rows = result.rows,
            status = %result.status,
            "run finished"
        );
        Ok(result)
    }

    /// Finalize a failed run and hand the original error back.
    fn fail(&self, run: ActiveRun, err: SweepError) -> SweepError {
        let run_id = run.writer.id();
        if let Err(finalize_err) = run.finish(RunStatus::Failed, Some(err.to_string())) {
            warn!(
                run = run_id,
                error = %finalize_err,
                "failed to finalize aborted run"
            );
        }
        err
    }
}

/// Validate a lockstep axis group: one setpoint list per axis, all lists
/// sharing one length. Returns the step count.
fn lockstep_steps(
    what: &str,
    axes: &[Arc<dyn SettableParameter>],
    lists: &[Vec<f64>],
) -> AppResult<usize> {
    if axes.is_empty() || axes.len() != lists.len() {
        return Err(SweepError::Configuration(format!(
            "{what} needs one setpoint list per axis (got {} axes, {} lists)",
            axes.len(),
            lists.len()
        )));
    }
    let steps = lists[0].len();
    if lists.iter().any(|list| list.len() != steps) {
        return Err(SweepError::Configuration(format!(
            "{what}: not all setpoint lists have the same length"
        )));
    }
    Ok(steps)
}

/// State of one in-flight run.
struct ActiveRun {
    writer: RunWriter,
    metadata: RunMetadata,
    started: Instant,
    rows_tx: broadcast::Sender<RowEvent>,
}

impl ActiveRun {
    fn append(&mut self, row: Vec<f64>) -> AppResult<()> {
        self.writer.add_row(&row)?;
        let _ = self.rows_tx.send(RowEvent::Row(Arc::new(row)));
        Ok(())
    }

    fn finish(mut self, status: RunStatus, error: Option<String>) -> AppResult<SweepResult> {
        self.metadata.error = error;
        self.metadata.finish(status);

        let id = self.writer.id();
        let dir = self.writer.dir().to_path_buf();
        let rows = self.writer.rows_written();
        self.writer.finalize(&self.metadata)?;
        let _ = self.rows_tx.send(RowEvent::RunEnded { run_id: id, status });

        Ok(SweepResult {
            id,
            data_path: dir.join(DATA_FILE_COMPRESSED),
            dir,
            status,
            rows,
            metadata: self.metadata,
        })
    }
}
