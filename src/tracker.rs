use crate::error::{HeadTrackerError, TrackerResult};
use crate::filters::{EkfConfig, OrientationEkf, OrientationEkfState};
use crate::head_transform::HeadTransform;
use crate::sensor_receiver::{SampleSink, SensorEvent, SensorSource, WorkerMessage};
use crate::types::Matrix4d;
use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Instant;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub ekf: EkfConfig,
    /// Extra look-ahead added to the time since the last gyro event (s)
    pub prediction_lead_secs: f64,
    /// Feed magnetometer samples to the filter
    pub enable_magnetometer: bool,
    /// Remap portrait device axes to landscape before filtering
    pub landscape_remap: bool,
    /// Capacity of the sample queue between source and worker
    pub channel_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            ekf: EkfConfig::default(),
            prediction_lead_secs: 1.0 / 30.0,
            enable_magnetometer: false,
            landscape_remap: true,
            channel_capacity: 512,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> TrackerResult<()> {
        self.ekf.validate()?;
        if !self.prediction_lead_secs.is_finite() || self.prediction_lead_secs < 0.0 {
            return Err(HeadTrackerError::InvalidConfig(format!(
                "prediction_lead_secs must be finite and non-negative, got {}",
                self.prediction_lead_secs
            )));
        }
        if self.channel_capacity == 0 {
            return Err(HeadTrackerError::InvalidConfig(
                "channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Everything behind the tracker's single lock
struct TrackerState {
    ekf: OrientationEkf,
    /// Wall-clock arrival of the most recent gyro sample
    last_gyro_event: Option<Instant>,
}

impl TrackerState {
    fn reset(&mut self) {
        self.ekf.reset();
        self.last_gyro_event = None;
    }
}

struct Worker {
    tx: Sender<WorkerMessage>,
    handle: JoinHandle<()>,
    /// Locked so the tracker can be shared across threads
    source: Mutex<Box<dyn SensorSource>>,
}

/// Thread-safe head tracker.
///
/// Samples arrive either through a registered [`SensorSource`] (delivered on
/// the tracker's own worker thread) or directly via
/// [`HeadTracker::process_sensor_event`]. Every filter access goes through
/// one mutex, so readers always see a consistent state.
pub struct HeadTracker {
    config: TrackerConfig,
    state: Arc<Mutex<TrackerState>>,
    ekf_to_head: Matrix4d,
    worker: Option<Worker>,
}

impl HeadTracker {
    pub fn new(config: TrackerConfig) -> TrackerResult<Self> {
        config.validate()?;
        let ekf = OrientationEkf::with_config(config.ekf.clone())?;

        // +90° about X: filter frame (Z up) to head frame (Y up)
        #[rustfmt::skip]
        let ekf_to_head = Matrix4d::new(
            1.0, 0.0, 0.0, 0.0,
            0.0, 0.0, -1.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        );

        Ok(Self {
            config,
            state: Arc::new(Mutex::new(TrackerState {
                ekf,
                last_gyro_event: None,
            })),
            ekf_to_head,
            worker: None,
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Reset the filter and start consuming samples from `source`.
    /// No-op if already tracking.
    pub fn start_tracking(&mut self, source: Box<dyn SensorSource>) -> TrackerResult<()> {
        if self.worker.is_some() {
            debug!("start_tracking called while already tracking");
            return Ok(());
        }

        self.lock_state()?.reset();

        let (tx, rx) = channel::bounded(self.config.channel_capacity);
        let state = Arc::clone(&self.state);
        let config = self.config.clone();
        let handle = thread::Builder::new()
            .name("head-tracker-sensors".to_string())
            .spawn(move || run_worker(rx, state, config))
            .map_err(|e| {
                HeadTrackerError::Internal(format!("Failed to spawn sensor worker: {}", e))
            })?;

        let mut source = source;
        if let Err(e) = source.register(SampleSink::new(tx.clone())) {
            let _ = tx.send(WorkerMessage::Shutdown);
            let _ = handle.join();
            return Err(e);
        }

        self.worker = Some(Worker {
            tx,
            handle,
            source: Mutex::new(source),
        });
        info!("head tracking started");
        Ok(())
    }

    /// Unregister the source, drain the worker and join it. No-op if not tracking.
    pub fn stop_tracking(&mut self) -> TrackerResult<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        // Source first, so nothing is pushed after the shutdown message
        let mut source = worker
            .source
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        source.unregister();
        if worker.tx.send(WorkerMessage::Shutdown).is_err() {
            debug!("sensor worker already exited");
        }
        worker.handle.join().map_err(|_| {
            HeadTrackerError::Internal("Sensor worker panicked".to_string())
        })?;

        info!("head tracking stopped");
        Ok(())
    }

    pub fn is_tracking(&self) -> bool {
        self.worker.is_some()
    }

    /// Validate, remap and feed one sample to the filter on the caller's thread.
    pub fn process_sensor_event(&self, event: &SensorEvent) -> TrackerResult<()> {
        dispatch(&self.state, &self.config, event)
    }

    /// Head view predicted for the current instant.
    pub fn last_head_view(&self) -> TrackerResult<HeadTransform> {
        self.head_view_at(Instant::now())
    }

    /// Head view predicted for `now`: extrapolated by the time since the last
    /// gyro event plus the configured lead, then mapped into the head frame.
    pub fn head_view_at(&self, now: Instant) -> TrackerResult<HeadTransform> {
        let state = self.lock_state()?;
        let since_gyro = state
            .last_gyro_event
            .map(|t| now.saturating_duration_since(t).as_secs_f64())
            .unwrap_or(0.0);
        let predicted = state
            .ekf
            .predicted_orientation(since_gyro + self.config.prediction_lead_secs);
        Ok(HeadTransform::new(predicted * self.ekf_to_head))
    }

    pub fn reset(&self) -> TrackerResult<()> {
        self.lock_state()?.reset();
        Ok(())
    }

    pub fn is_ready(&self) -> TrackerResult<bool> {
        Ok(self.lock_state()?.ekf.is_ready())
    }

    pub fn orientation(&self) -> TrackerResult<Matrix4d> {
        Ok(self.lock_state()?.ekf.orientation())
    }

    pub fn predicted_orientation(&self, seconds_after_last_gyro: f64) -> TrackerResult<Matrix4d> {
        Ok(self
            .lock_state()?
            .ekf
            .predicted_orientation(seconds_after_last_gyro))
    }

    pub fn heading_degrees(&self) -> TrackerResult<f64> {
        Ok(self.lock_state()?.ekf.heading_degrees())
    }

    pub fn set_heading_degrees(&self, heading: f64) -> TrackerResult<()> {
        self.lock_state()?.ekf.set_heading_degrees(heading);
        Ok(())
    }

    pub fn filter_state(&self) -> TrackerResult<OrientationEkfState> {
        Ok(self.lock_state()?.ekf.state())
    }

    fn lock_state(&self) -> TrackerResult<MutexGuard<'_, TrackerState>> {
        lock(&self.state)
    }
}

impl Drop for HeadTracker {
    fn drop(&mut self) {
        if let Err(e) = self.stop_tracking() {
            warn!("failed to stop tracking on drop: {}", e);
        }
    }
}

fn lock(state: &Mutex<TrackerState>) -> TrackerResult<MutexGuard<'_, TrackerState>> {
    state
        .lock()
        .map_err(|_| HeadTrackerError::Internal("Failed to acquire tracker state lock".to_string()))
}

fn dispatch(
    state: &Mutex<TrackerState>,
    config: &TrackerConfig,
    event: &SensorEvent,
) -> TrackerResult<()> {
    event.validate()?;

    if matches!(event, SensorEvent::Mag(_)) && !config.enable_magnetometer {
        return Ok(());
    }

    let event = if config.landscape_remap {
        event.to_landscape()
    } else {
        *event
    };

    let mut state = lock(state)?;
    match event {
        SensorEvent::Accel(s) => state.ekf.process_acc(&s.vector(), s.timestamp_ns),
        SensorEvent::Gyro(s) => {
            state.last_gyro_event = Some(Instant::now());
            state.ekf.process_gyro(&s.vector(), s.timestamp_ns);
        }
        SensorEvent::Mag(s) => state.ekf.process_mag(&s.vector(), s.timestamp_ns),
    }
    Ok(())
}

fn run_worker(rx: Receiver<WorkerMessage>, state: Arc<Mutex<TrackerState>>, config: TrackerConfig) {
    debug!("sensor worker started");
    let mut rejected: u64 = 0;

    for message in rx.iter() {
        match message {
            WorkerMessage::Sample(event) => {
                if let Err(e) = dispatch(&state, &config, &event) {
                    if e.is_rejected_sample() {
                        rejected += 1;
                        warn!("dropping sensor sample: {}", e);
                    } else {
                        warn!("sensor worker error: {}", e);
                    }
                }
            }
            WorkerMessage::Shutdown => break,
        }
    }

    debug!("sensor worker exiting ({} samples rejected)", rejected);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor_receiver::{ReplaySource, SensorSample};
    use crate::so3;
    use crate::types::{Matrix3x3d, Vector3d};
    use approx::assert_relative_eq;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    const MS: i64 = 1_000_000;

    /// Source that records lifecycle calls and pushes nothing
    struct ProbeSource {
        registered: Arc<AtomicBool>,
        unregistered: Arc<AtomicBool>,
        fail_register: bool,
    }

    impl ProbeSource {
        fn new() -> (Self, Arc<AtomicBool>, Arc<AtomicBool>) {
            let registered = Arc::new(AtomicBool::new(false));
            let unregistered = Arc::new(AtomicBool::new(false));
            (
                Self {
                    registered: Arc::clone(&registered),
                    unregistered: Arc::clone(&unregistered),
                    fail_register: false,
                },
                registered,
                unregistered,
            )
        }
    }

    impl SensorSource for ProbeSource {
        fn register(&mut self, _sink: SampleSink) -> TrackerResult<()> {
            if self.fail_register {
                return Err(HeadTrackerError::SensorFailed("no such sensor".to_string()));
            }
            self.registered.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn unregister(&mut self) {
            self.unregistered.store(true, Ordering::SeqCst);
        }
    }

    fn accel(x: f64, y: f64, z: f64, ts: i64) -> SensorEvent {
        SensorEvent::Accel(SensorSample::new(x, y, z, ts))
    }

    fn gyro(x: f64, y: f64, z: f64, ts: i64) -> SensorEvent {
        SensorEvent::Gyro(SensorSample::new(x, y, z, ts))
    }

    fn mag(x: f64, y: f64, z: f64, ts: i64) -> SensorEvent {
        SensorEvent::Mag(SensorSample::new(x, y, z, ts))
    }

    fn rotation_block(m: &Matrix4d) -> Matrix3x3d {
        m.fixed_view::<3, 3>(0, 0).into_owned()
    }

    #[test]
    fn test_new_tracker_is_idle() {
        let tracker = HeadTracker::new(TrackerConfig::default()).unwrap();
        assert!(!tracker.is_tracking());
        assert!(!tracker.is_ready().unwrap());
        assert_eq!(tracker.orientation().unwrap(), Matrix4d::identity());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = TrackerConfig {
            channel_capacity: 0,
            ..TrackerConfig::default()
        };
        assert!(matches!(
            HeadTracker::new(config),
            Err(HeadTrackerError::InvalidConfig(_))
        ));

        let config = TrackerConfig {
            prediction_lead_secs: -0.1,
            ..TrackerConfig::default()
        };
        assert!(HeadTracker::new(config).is_err());
    }

    #[test]
    fn test_start_and_stop_are_idempotent() {
        let mut tracker = HeadTracker::new(TrackerConfig::default()).unwrap();
        let (first, registered, unregistered) = ProbeSource::new();
        let (second, second_registered, _) = ProbeSource::new();

        tracker.start_tracking(Box::new(first)).unwrap();
        tracker.start_tracking(Box::new(second)).unwrap();
        assert!(tracker.is_tracking());
        assert!(registered.load(Ordering::SeqCst));
        assert!(!second_registered.load(Ordering::SeqCst));

        tracker.stop_tracking().unwrap();
        tracker.stop_tracking().unwrap();
        assert!(!tracker.is_tracking());
        assert!(unregistered.load(Ordering::SeqCst));
    }

    #[test]
    fn test_failed_registration_leaves_tracker_idle() {
        let mut tracker = HeadTracker::new(TrackerConfig::default()).unwrap();
        let (mut source, _, _) = ProbeSource::new();
        source.fail_register = true;

        assert!(matches!(
            tracker.start_tracking(Box::new(source)),
            Err(HeadTrackerError::SensorFailed(_))
        ));
        assert!(!tracker.is_tracking());
    }

    #[test]
    fn test_drop_unregisters_source() {
        let (source, _, unregistered) = ProbeSource::new();
        {
            let mut tracker = HeadTracker::new(TrackerConfig::default()).unwrap();
            tracker.start_tracking(Box::new(source)).unwrap();
        }
        assert!(unregistered.load(Ordering::SeqCst));
    }

    #[test]
    fn test_start_resets_filter() {
        let mut tracker = HeadTracker::new(TrackerConfig::default()).unwrap();
        tracker.process_sensor_event(&accel(0.0, 9.81, 0.0, MS)).unwrap();
        assert!(tracker.is_ready().unwrap());

        let (source, _, _) = ProbeSource::new();
        tracker.start_tracking(Box::new(source)).unwrap();
        assert!(!tracker.is_ready().unwrap());
        tracker.stop_tracking().unwrap();
    }

    #[test]
    fn test_replay_through_worker_makes_filter_ready() {
        let mut events = vec![accel(0.0, 9.81, 0.0, MS)];
        for i in 0..100 {
            events.push(gyro(0.0, 0.0, 0.2, (i + 2) * 5 * MS));
        }

        let mut tracker = HeadTracker::new(TrackerConfig::default()).unwrap();
        tracker
            .start_tracking(Box::new(ReplaySource::new(events)))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let state = tracker.filter_state().unwrap();
            if state.ready && state.gyro_updates == 99 {
                break;
            }
            assert!(Instant::now() < deadline, "worker never processed the replay");
            thread::sleep(Duration::from_millis(5));
        }

        tracker.stop_tracking().unwrap();
        assert!(tracker.is_ready().unwrap());
    }

    #[test]
    fn test_rejects_invalid_samples() {
        let config = TrackerConfig {
            enable_magnetometer: true,
            ..TrackerConfig::default()
        };
        let tracker = HeadTracker::new(config).unwrap();

        assert!(matches!(
            tracker.process_sensor_event(&mag(0.0, 0.0, 0.0, MS)),
            Err(HeadTrackerError::InvalidSample(_))
        ));
        assert!(tracker
            .process_sensor_event(&gyro(f64::NAN, 0.0, 0.0, MS))
            .is_err());
        assert_eq!(tracker.orientation().unwrap(), Matrix4d::identity());
    }

    #[test]
    fn test_magnetometer_ignored_unless_enabled() {
        let tracker = HeadTracker::new(TrackerConfig::default()).unwrap();
        tracker.process_sensor_event(&accel(0.0, 9.81, 0.0, MS)).unwrap();
        for i in 0..5 {
            tracker
                .process_sensor_event(&mag(0.3, 0.5, -0.8, (i + 2) * MS))
                .unwrap();
        }
        assert_eq!(tracker.filter_state().unwrap().mag_updates, 0);

        let config = TrackerConfig {
            enable_magnetometer: true,
            ..TrackerConfig::default()
        };
        let tracker = HeadTracker::new(config).unwrap();
        tracker.process_sensor_event(&accel(0.0, 9.81, 0.0, MS)).unwrap();
        for i in 0..5 {
            tracker
                .process_sensor_event(&mag(0.3, 0.5, -0.8, (i + 2) * MS))
                .unwrap();
        }
        assert_eq!(tracker.filter_state().unwrap().mag_updates, 4);
    }

    #[test]
    fn test_landscape_remap_applied_before_filter() {
        let tracker = HeadTracker::new(TrackerConfig::default()).unwrap();
        // Portrait +Y becomes landscape -X
        tracker.process_sensor_event(&accel(0.0, 9.81, 0.0, MS)).unwrap();
        let r = rotation_block(&tracker.orientation().unwrap());
        assert_relative_eq!(r * Vector3d::z(), -Vector3d::x(), epsilon = 1e-12);

        let config = TrackerConfig {
            landscape_remap: false,
            ..TrackerConfig::default()
        };
        let tracker = HeadTracker::new(config).unwrap();
        tracker.process_sensor_event(&accel(0.0, 9.81, 0.0, MS)).unwrap();
        let r = rotation_block(&tracker.orientation().unwrap());
        assert_relative_eq!(r * Vector3d::z(), Vector3d::y(), epsilon = 1e-12);
    }

    #[test]
    fn test_head_view_applies_ekf_to_head_transform() {
        let tracker = HeadTracker::new(TrackerConfig::default()).unwrap();
        tracker.process_sensor_event(&accel(0.0, 9.81, 0.0, MS)).unwrap();

        // No gyro yet, so prediction is the current estimate
        let view = tracker.last_head_view().unwrap();
        let expected = tracker.orientation().unwrap() * tracker.ekf_to_head;
        assert_relative_eq!(*view.head_view(), expected, epsilon = 1e-12);

        let block = rotation_block(view.head_view());
        assert_relative_eq!(block.transpose() * block, Matrix3x3d::identity(), epsilon = 1e-12);
        assert_relative_eq!(block.determinant(), 1.0, epsilon = 1e-12);
        assert_eq!(view.translation(), Vector3d::zeros());
    }

    #[test]
    fn test_head_view_predicts_with_lead() {
        let tracker = HeadTracker::new(TrackerConfig::default()).unwrap();
        tracker.process_sensor_event(&accel(0.0, 9.81, 0.0, MS)).unwrap();
        tracker.process_sensor_event(&gyro(0.0, 0.0, 1.0, 2 * MS)).unwrap();

        let start = Instant::now();
        let view = tracker.head_view_at(start).unwrap();
        let rotation = rotation_block(&tracker.orientation().unwrap());

        // Gyro remapped (0, 0, 1) → (0, 0, 1); look-ahead is at least the lead
        let lead = tracker.config().prediction_lead_secs;
        let to_head = rotation_block(&tracker.ekf_to_head);
        let extrapolated = rotation_block(view.head_view()) * to_head.transpose();
        let motion = extrapolated * rotation.transpose();
        let angle = so3::log(&motion).norm();
        assert!(angle >= lead - 1e-9);
        assert!(angle < lead + 1.0);
    }

    #[test]
    fn test_producer_and_renderer_share_tracker() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HeadTracker>();

        let tracker = Arc::new(HeadTracker::new(TrackerConfig::default()).unwrap());

        let producer = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                tracker.process_sensor_event(&accel(0.0, 9.81, 0.0, MS)).unwrap();
                for i in 0..500 {
                    tracker
                        .process_sensor_event(&gyro(0.1, -0.2, 0.3, (i + 2) * MS))
                        .unwrap();
                }
            })
        };

        let renderer = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                for _ in 0..200 {
                    let view = tracker.last_head_view().unwrap();
                    let block = rotation_block(view.head_view());
                    assert_relative_eq!(
                        block.transpose() * block,
                        Matrix3x3d::identity(),
                        epsilon = 1e-9
                    );
                }
            })
        };

        producer.join().unwrap();
        renderer.join().unwrap();
        assert_eq!(tracker.filter_state().unwrap().gyro_updates, 499);
    }

    #[test]
    fn test_heading_pass_through() {
        let tracker = HeadTracker::new(TrackerConfig::default()).unwrap();
        tracker.process_sensor_event(&accel(0.0, 9.81, 0.0, MS)).unwrap();
        tracker.set_heading_degrees(45.0).unwrap();
        assert_relative_eq!(tracker.heading_degrees().unwrap(), 45.0, epsilon = 1e-9);

        tracker.reset().unwrap();
        assert!(!tracker.is_ready().unwrap());
    }
}
