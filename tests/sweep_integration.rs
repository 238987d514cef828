//! End-to-end tests driving a station with mock instruments and checking
//! what lands in the result store and on the row stream.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sweep_station::config::Settings;
use sweep_station::error::SweepError;
use sweep_station::instrument::mock::{FailingParameter, MockDac, MockDmm};
use sweep_station::metadata::{RunStatus, SweepType};
use sweep_station::parameter::SettableParameter;
use sweep_station::plot::{LivePlot, PlotFrame, PlotSink};
use sweep_station::station::{RowEvent, Station};
use sweep_station::store::{list_runs, RunReader};

fn station(basedir: &std::path::Path) -> Station {
    Station::new(Settings::with_basedir(basedir)).unwrap()
}

#[tokio::test]
async fn sweep_rows_are_in_setpoint_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut st = station(dir.path());

    let gate = Arc::new(MockDac::new("gate"));
    let dmm = Arc::new(MockDmm::tracking("current", gate.output(), 2.0, 0.0));
    st.follow_param(dmm, 1.0).unwrap();

    let setpoints = [0.0, 0.1, 0.2, 0.3];
    let result = st
        .sweep(gate.clone(), &setpoints, Duration::ZERO)
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.rows, 4);
    assert_eq!(gate.history(), setpoints.to_vec());

    let reader = RunReader::open(dir.path(), result.id).unwrap();
    assert_eq!(
        reader.metadata().columns,
        vec!["time", "gate", "current"]
    );
    let data = reader.all_data().unwrap();
    assert_eq!(data.len(), 4);
    for (row, &sp) in data.iter().zip(&setpoints) {
        // time, setpoint, followed value
        assert_eq!(row.len(), 3);
        assert_eq!(row[1], sp);
        assert!((row[2] - 2.0 * sp).abs() < 1e-12);
    }
}

#[tokio::test]
async fn sweep2d_rasters_and_megasweep_serpentines() {
    let dir = tempfile::tempdir().unwrap();
    let mut st = station(dir.path());
    st.follow_param(Arc::new(MockDmm::constant("sig", 0.0)), 1.0)
        .unwrap();

    let slow = Arc::new(MockDac::new("slow"));
    let fast = Arc::new(MockDac::new("fast"));
    let result = st
        .sweep2d(
            slow.clone(),
            &[0.0, 1.0],
            fast.clone(),
            &[0.0, 1.0, 2.0],
            Duration::ZERO,
            Duration::ZERO,
        )
        .await
        .unwrap();
    assert_eq!(result.rows, 6);
    // Raster: the fast axis restarts from its first setpoint on every
    // slow step.
    assert_eq!(fast.history(), vec![0.0, 1.0, 2.0, 0.0, 1.0, 2.0]);

    let fast2 = Arc::new(MockDac::new("fast"));
    let slow2 = Arc::new(MockDac::new("slow"));
    let result = st
        .megasweep(
            slow2,
            &[0.0, 1.0, 2.0],
            fast2.clone(),
            &[0.0, 1.0, 2.0],
            Duration::ZERO,
            Duration::ZERO,
        )
        .await
        .unwrap();
    assert_eq!(result.rows, 9);
    assert!(result.metadata.serpentine);
    // Serpentine: odd slow steps traverse the fast axis in reverse.
    assert_eq!(
        fast2.history(),
        vec![0.0, 1.0, 2.0, 2.0, 1.0, 0.0, 0.0, 1.0, 2.0]
    );

    // Rows carry (time, slow, fast, sig) with the serpentine order intact.
    let reader = RunReader::open(dir.path(), result.id).unwrap();
    let data = reader.all_data().unwrap();
    assert_eq!(data[3][1], 1.0);
    assert_eq!(data[3][2], 2.0);
    assert_eq!(data[5][2], 0.0);
}

#[tokio::test]
async fn multisweep_drives_axes_in_lockstep() {
    let dir = tempfile::tempdir().unwrap();
    let mut st = station(dir.path());
    st.follow_param(Arc::new(MockDmm::counter("n", 0.0, 1.0)), 1.0)
        .unwrap();

    let a = Arc::new(MockDac::new("v_a"));
    let b = Arc::new(MockDac::new("v_b"));
    let result = st
        .multisweep(
            &[a.clone(), b.clone()],
            &[vec![0.0, 1.0, 2.0], vec![0.0, -1.0, -2.0]],
            Duration::ZERO,
        )
        .await
        .unwrap();

    assert_eq!(result.rows, 3);
    assert_eq!(a.history(), vec![0.0, 1.0, 2.0]);
    assert_eq!(b.history(), vec![0.0, -1.0, -2.0]);

    let reader = RunReader::open(dir.path(), result.id).unwrap();
    assert_eq!(
        reader.metadata().columns,
        vec!["time", "v_a", "v_b", "n"]
    );
    let data = reader.all_data().unwrap();
    assert_eq!(data[2][1], 2.0);
    assert_eq!(data[2][2], -2.0);
}

#[tokio::test]
async fn multimegasweep_serpentines_lockstep_axis_groups() {
    let dir = tempfile::tempdir().unwrap();
    let mut st = station(dir.path());
    st.follow_param(Arc::new(MockDmm::constant("sig", 0.0)), 1.0)
        .unwrap();

    let slow = Arc::new(MockDac::new("b_field"));
    let fast_a = Arc::new(MockDac::new("v_a"));
    let fast_b = Arc::new(MockDac::new("v_b"));
    let slow_axes: Vec<Arc<dyn SettableParameter>> = vec![slow.clone()];
    let fast_axes: Vec<Arc<dyn SettableParameter>> = vec![fast_a.clone(), fast_b.clone()];

    let result = st
        .multimegasweep(
            &slow_axes,
            &[vec![0.0, 1.0]],
            &fast_axes,
            &[vec![0.0, 1.0, 2.0], vec![0.0, -1.0, -2.0]],
            Duration::ZERO,
            Duration::ZERO,
        )
        .await
        .unwrap();

    assert_eq!(result.rows, 6);
    assert!(result.metadata.serpentine);
    // Both fast axes traverse together and reverse on the odd slow step.
    assert_eq!(fast_a.history(), vec![0.0, 1.0, 2.0, 2.0, 1.0, 0.0]);
    assert_eq!(fast_b.history(), vec![0.0, -1.0, -2.0, -2.0, -1.0, 0.0]);
    assert_eq!(slow.history(), vec![0.0, 1.0]);

    let reader = RunReader::open(dir.path(), result.id).unwrap();
    assert_eq!(
        reader.metadata().columns,
        vec!["time", "b_field", "v_a", "v_b", "sig"]
    );
    let data = reader.all_data().unwrap();
    // The second slow step starts where the fast group left off.
    assert_eq!(data[3][1], 1.0);
    assert_eq!(data[3][2], 2.0);
    assert_eq!(data[3][3], -2.0);

    // A group with fewer lists than axes fails before any allocation.
    let before = sweep_station::store::list_runs(dir.path()).unwrap().len();
    let err = st
        .multimegasweep(
            &slow_axes,
            &[vec![0.0]],
            &fast_axes,
            &[vec![0.0]],
            Duration::ZERO,
            Duration::ZERO,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SweepError::Configuration(_)));
    assert_eq!(
        sweep_station::store::list_runs(dir.path()).unwrap().len(),
        before
    );
}

#[tokio::test]
async fn gain_division_lands_in_stored_rows() {
    let dir = tempfile::tempdir().unwrap();
    let mut st = station(dir.path());
    st.follow_param(Arc::new(MockDmm::constant("current", 5.0)), 100.0)
        .unwrap();

    let result = st.measure().await.unwrap();
    let reader = RunReader::open(dir.path(), result.id).unwrap();
    let data = reader.all_data().unwrap();
    assert!((data[0][1] - 0.05).abs() < 1e-12);
    assert_eq!(reader.metadata().followed[0].gain, 100.0);
}

#[tokio::test]
async fn instrument_failure_finalizes_failed_with_partial_data() {
    let dir = tempfile::tempdir().unwrap();
    let mut st = station(dir.path());
    st.follow_param(Arc::new(FailingParameter::after("flaky", 2, 7.0)), 1.0)
        .unwrap();

    let gate = Arc::new(MockDac::new("gate"));
    let err = st
        .sweep(gate, &[0.0, 1.0, 2.0, 3.0], Duration::ZERO)
        .await
        .unwrap_err();
    assert!(err.is_instrument());

    let runs = list_runs(dir.path()).unwrap();
    assert_eq!(runs.len(), 1);
    let (id, metadata) = &runs[0];
    assert_eq!(metadata.status, RunStatus::Failed);
    assert!(metadata.error.as_deref().unwrap().contains("flaky"));

    // Two good rows committed; the failing third point wrote nothing.
    let data = RunReader::open(dir.path(), *id).unwrap().all_data().unwrap();
    assert_eq!(data.len(), 2);
    assert_eq!(data[1][1], 1.0);
}

#[tokio::test]
async fn interrupt_finalizes_interrupted_and_returns_ok() {
    let dir = tempfile::tempdir().unwrap();
    let mut st = station(dir.path());
    st.follow_param(Arc::new(MockDmm::counter("n", 0.0, 1.0)), 1.0)
        .unwrap();

    let handle = st.interrupt_handle();
    let mut rx = st.subscribe();
    tokio::spawn(async move {
        // Stop after the second row is on the stream.
        let mut rows = 0;
        while let Ok(event) = rx.recv().await {
            if matches!(event, RowEvent::Row(_)) {
                rows += 1;
                if rows == 2 {
                    handle.request();
                    break;
                }
            }
        }
    });

    let result = st
        .watch(Duration::from_millis(1), None)
        .await
        .unwrap();
    assert!(result.interrupted());
    assert_eq!(result.status, RunStatus::Interrupted);
    assert!(result.rows >= 2);

    let reader = RunReader::open(dir.path(), result.id).unwrap();
    assert_eq!(reader.metadata().status, RunStatus::Interrupted);
    assert_eq!(reader.all_data().unwrap().len() as u64, result.rows);
}

#[tokio::test]
async fn watch_respects_max_duration() {
    let dir = tempfile::tempdir().unwrap();
    let mut st = station(dir.path());
    st.follow_param(Arc::new(MockDmm::constant("v", 1.0)), 1.0)
        .unwrap();

    let result = st
        .watch(Duration::from_millis(1), Some(Duration::from_millis(20)))
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Completed);
    assert!(result.rows >= 1);
    assert_eq!(result.metadata.sweep_type, SweepType::Watch);
    assert_eq!(result.metadata.max_duration_s, Some(0.02));
}

#[tokio::test]
async fn run_ids_increment_across_operations() {
    let dir = tempfile::tempdir().unwrap();
    let mut st = station(dir.path());
    st.follow_param(Arc::new(MockDmm::constant("v", 1.0)), 1.0)
        .unwrap();

    let first = st.measure().await.unwrap();
    let second = st.measure().await.unwrap();
    assert_eq!(first.id, 0);
    assert_eq!(second.id, 1);

    let runs = list_runs(dir.path()).unwrap();
    assert_eq!(runs.iter().map(|(id, _)| *id).collect::<Vec<_>>(), [0, 1]);
}

#[tokio::test]
async fn comments_and_hooks_are_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let mut st = station(dir.path());
    st.follow_param(Arc::new(MockDmm::constant("v", 1.0)), 1.0)
        .unwrap();
    st.add_comment("cooldown 7, sample B3");

    let after = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&after);
    st.run_after(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let gate = Arc::new(MockDac::new("gate"));
    let result = st.sweep(gate, &[0.0, 1.0], Duration::ZERO).await.unwrap();
    assert_eq!(
        result.metadata.comments,
        vec!["cooldown 7, sample B3".to_string()]
    );
    assert_eq!(after.load(Ordering::SeqCst), 2);
}

#[derive(Default, Clone)]
struct RecordingSink {
    frames: Arc<Mutex<Vec<PlotFrame>>>,
    finished: Arc<Mutex<Option<RunStatus>>>,
}

impl PlotSink for RecordingSink {
    fn redraw(&mut self, frame: &PlotFrame) {
        self.frames.lock().unwrap().push(frame.clone());
    }

    fn finished(&mut self, status: RunStatus, _frame: &PlotFrame) {
        *self.finished.lock().unwrap() = Some(status);
    }
}

#[tokio::test]
async fn plot_bridge_sees_every_committed_row() {
    let dir = tempfile::tempdir().unwrap();
    let mut st = station(dir.path());

    let gate = Arc::new(MockDac::new("gate"));
    let dmm = Arc::new(MockDmm::tracking("current", gate.output(), 3.0, 0.0));
    st.follow_param(dmm, 1.0).unwrap();

    let sink = RecordingSink::default();
    let frames = Arc::clone(&sink.frames);
    let finished = Arc::clone(&sink.finished);
    let bridge = LivePlot::new()
        .line("gate", &["current"])
        .attach(st.subscribe(), sink);

    let setpoints = [0.0, 0.5, 1.0];
    let result = st.sweep(gate, &setpoints, Duration::ZERO).await.unwrap();
    assert_eq!(result.rows, 3);

    // Station dropped ends the stream and the bridge task with it.
    drop(st);
    bridge.await.unwrap();

    let frames = frames.lock().unwrap();
    let last = frames.last().unwrap();
    let trace = &last.traces["current"];
    assert_eq!(trace.len(), 3);
    assert_eq!(trace[1], (0.5, 1.5));
    assert_eq!(*finished.lock().unwrap(), Some(RunStatus::Completed));
}

struct StallingSink;

impl PlotSink for StallingSink {
    fn redraw(&mut self, _frame: &PlotFrame) {
        // A renderer stuck for longer than the whole sweep.
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_sink_never_stalls_acquisition() {
    let dir = tempfile::tempdir().unwrap();
    let mut st = station(dir.path());
    st.follow_param(Arc::new(MockDmm::constant("v", 1.0)), 1.0)
        .unwrap();

    let bridge = LivePlot::new()
        .line("time", &["v"])
        .attach(st.subscribe(), StallingSink);

    let gate = Arc::new(MockDac::new("gate"));
    let setpoints: Vec<f64> = (0..20).map(f64::from).collect();
    let result = st.sweep(gate, &setpoints, Duration::ZERO).await.unwrap();

    // Every row committed regardless of how far the sink fell behind.
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.rows, 20);

    drop(st);
    bridge.await.unwrap();
}

#[tokio::test]
async fn empty_setpoints_produce_completed_empty_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut st = station(dir.path());
    st.follow_param(Arc::new(MockDmm::constant("v", 1.0)), 1.0)
        .unwrap();

    let gate = Arc::new(MockDac::new("gate"));
    let result = st.sweep(gate, &[], Duration::ZERO).await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.rows, 0);

    let reader = RunReader::open(dir.path(), result.id).unwrap();
    assert!(reader.all_data().unwrap().is_empty());
}

#[tokio::test]
async fn configuration_errors_never_allocate_a_run() {
    let dir = tempfile::tempdir().unwrap();
    let st = station(dir.path());

    let a: Arc<dyn sweep_station::parameter::SettableParameter> =
        Arc::new(MockDac::new("a"));
    let err = st
        .multisweep(&[a], &[vec![0.0], vec![1.0]], Duration::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, SweepError::Configuration(_)));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
