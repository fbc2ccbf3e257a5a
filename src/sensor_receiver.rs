use crate::error::{HeadTrackerError, TrackerResult};
use crate::types::Vector3d;
use crossbeam::channel::{Receiver, Sender, TrySendError};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Longest sleep between two paced replay events
const MAX_REPLAY_GAP: Duration = Duration::from_millis(250);

/// Raw three-axis reading from a motion sensor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Monotonic sensor clock, nanoseconds
    pub timestamp_ns: i64,
}

impl SensorSample {
    pub fn new(x: f64, y: f64, z: f64, timestamp_ns: i64) -> Self {
        Self {
            x,
            y,
            z,
            timestamp_ns,
        }
    }

    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn vector(&self) -> Vector3d {
        Vector3d::new(self.x, self.y, self.z)
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    fn is_zero(&self) -> bool {
        self.x == 0.0 && self.y == 0.0 && self.z == 0.0
    }

    /// Portrait device axes to landscape: (x, y, z) → (−y, x, z)
    fn remapped_to_landscape(&self) -> Self {
        Self::new(-self.y, self.x, self.z, self.timestamp_ns)
    }
}

/// Sensor reading tagged with the sensor that produced it.
///
/// Serialized as `{"sensor": "accel", "x": .., "y": .., "z": .., "timestamp_ns": ..}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "sensor", rename_all = "lowercase")]
pub enum SensorEvent {
    /// Specific force, m/s²
    Accel(SensorSample),
    /// Angular velocity, rad/s
    Gyro(SensorSample),
    /// Magnetic field, any consistent unit
    Mag(SensorSample),
}

impl SensorEvent {
    pub fn sample(&self) -> &SensorSample {
        match self {
            SensorEvent::Accel(s) | SensorEvent::Gyro(s) | SensorEvent::Mag(s) => s,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SensorEvent::Accel(_) => "accelerometer",
            SensorEvent::Gyro(_) => "gyroscope",
            SensorEvent::Mag(_) => "magnetometer",
        }
    }

    pub fn timestamp_ns(&self) -> i64 {
        self.sample().timestamp_ns
    }

    /// Boundary check before a sample may reach the filter.
    pub fn validate(&self) -> TrackerResult<()> {
        let sample = self.sample();
        if !sample.is_finite() {
            return Err(HeadTrackerError::InvalidSample(format!(
                "{} reading has non-finite components",
                self.kind()
            )));
        }
        if sample.timestamp_ns <= 0 {
            return Err(HeadTrackerError::InvalidSample(format!(
                "{} timestamp must be positive, got {}",
                self.kind(),
                sample.timestamp_ns
            )));
        }
        match self {
            SensorEvent::Accel(s) | SensorEvent::Mag(s) if s.is_zero() => {
                Err(HeadTrackerError::InvalidSample(format!(
                    "{} reading is all zeros",
                    self.kind()
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn to_landscape(&self) -> Self {
        match self {
            SensorEvent::Accel(s) => SensorEvent::Accel(s.remapped_to_landscape()),
            SensorEvent::Gyro(s) => SensorEvent::Gyro(s.remapped_to_landscape()),
            SensorEvent::Mag(s) => SensorEvent::Mag(s.remapped_to_landscape()),
        }
    }
}

/// Messages consumed by the tracker's sensor worker
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    Sample(SensorEvent),
    Shutdown,
}

/// Producer handle given to a [`SensorSource`] on registration.
#[derive(Clone)]
pub struct SampleSink {
    tx: Sender<WorkerMessage>,
    dropped: Arc<AtomicU64>,
}

impl SampleSink {
    pub fn new(tx: Sender<WorkerMessage>) -> Self {
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bounded sink plus the receiving end, for driving a source without a tracker
    pub fn bounded(capacity: usize) -> (Self, Receiver<WorkerMessage>) {
        let (tx, rx) = crossbeam::channel::bounded(capacity);
        (Self::new(tx), rx)
    }

    /// Non-blocking push. Returns false if the sample was dropped.
    pub fn push(&self, event: SensorEvent) -> bool {
        match self.tx.try_send(WorkerMessage::Sample(event)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 100 == 0 {
                    warn!(
                        "sensor queue full, dropped {} {} samples so far",
                        dropped,
                        event.kind()
                    );
                }
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("sensor worker gone, dropping {} sample", event.kind());
                false
            }
        }
    }

    /// Blocking push for producers that prefer backpressure over dropping.
    /// Returns false once the worker has gone away.
    pub fn push_blocking(&self, event: SensorEvent) -> bool {
        self.tx.send(WorkerMessage::Sample(event)).is_ok()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Something that delivers sensor samples into a sink until unregistered.
pub trait SensorSource: Send {
    fn register(&mut self, sink: SampleSink) -> TrackerResult<()>;

    /// Stop delivering. Must not return while the source can still push.
    fn unregister(&mut self);
}

/// Replays a recorded event stream on its own producer thread.
pub struct ReplaySource {
    events: Arc<Vec<SensorEvent>>,
    realtime: bool,
    stop: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    producer: Option<JoinHandle<()>>,
}

impl ReplaySource {
    pub fn new(events: Vec<SensorEvent>) -> Self {
        Self {
            events: Arc::new(events),
            realtime: false,
            stop: Arc::new(AtomicBool::new(false)),
            finished: Arc::new(AtomicBool::new(false)),
            producer: None,
        }
    }

    /// Pace delivery by the recorded timestamps instead of replaying as fast as possible.
    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// True once every event has been handed to the sink
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

impl SensorSource for ReplaySource {
    fn register(&mut self, sink: SampleSink) -> TrackerResult<()> {
        if self.producer.is_some() {
            return Err(HeadTrackerError::SensorFailed(
                "replay source is already registered".to_string(),
            ));
        }

        self.stop.store(false, Ordering::Release);
        self.finished.store(false, Ordering::Release);

        let events = Arc::clone(&self.events);
        let stop = Arc::clone(&self.stop);
        let finished = Arc::clone(&self.finished);
        let realtime = self.realtime;

        let handle = thread::Builder::new()
            .name("replay-source".to_string())
            .spawn(move || {
                let mut previous_ts: Option<i64> = None;
                for event in events.iter() {
                    if stop.load(Ordering::Acquire) {
                        debug!("replay stopped early");
                        return;
                    }

                    if realtime {
                        if let Some(prev) = previous_ts {
                            let gap_ns = event.timestamp_ns().saturating_sub(prev);
                            if gap_ns > 0 {
                                let gap = Duration::from_nanos(gap_ns as u64).min(MAX_REPLAY_GAP);
                                thread::sleep(gap);
                            }
                        }
                        previous_ts = Some(event.timestamp_ns());
                        sink.push(*event);
                    } else if !sink.push_blocking(*event) {
                        return;
                    }
                }
                finished.store(true, Ordering::Release);
                info!(
                    "replay finished: {} events, {} dropped",
                    events.len(),
                    sink.dropped()
                );
            })
            .map_err(|e| {
                HeadTrackerError::SensorFailed(format!("failed to spawn replay thread: {}", e))
            })?;

        self.producer = Some(handle);
        Ok(())
    }

    fn unregister(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.producer.take() {
            if handle.join().is_err() {
                warn!("replay thread panicked");
            }
        }
    }
}

impl Drop for ReplaySource {
    fn drop(&mut self) {
        self.unregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_magnitude() {
        let accel = SensorSample::new(3.0, 4.0, 0.0, 1);
        assert_eq!(accel.magnitude(), 5.0);
        assert_eq!(accel.vector(), Vector3d::new(3.0, 4.0, 0.0));
    }

    #[test]
    fn test_validate_rejects_bad_samples() {
        let zero_mag = SensorEvent::Mag(SensorSample::new(0.0, 0.0, 0.0, 10));
        assert!(matches!(
            zero_mag.validate(),
            Err(HeadTrackerError::InvalidSample(_))
        ));

        let zero_acc = SensorEvent::Accel(SensorSample::new(0.0, 0.0, 0.0, 10));
        assert!(zero_acc.validate().is_err());

        let nan_gyro = SensorEvent::Gyro(SensorSample::new(f64::NAN, 0.0, 0.0, 10));
        assert!(nan_gyro.validate().is_err());

        let inf_acc = SensorEvent::Accel(SensorSample::new(0.0, f64::INFINITY, 9.8, 10));
        assert!(inf_acc.validate().is_err());

        let bad_ts = SensorEvent::Accel(SensorSample::new(0.0, 0.0, 9.8, 0));
        assert!(bad_ts.validate().is_err());
    }

    #[test]
    fn test_gyro_at_rest_is_valid() {
        let still = SensorEvent::Gyro(SensorSample::new(0.0, 0.0, 0.0, 10));
        assert!(still.validate().is_ok());
    }

    #[test]
    fn test_landscape_remap() {
        let event = SensorEvent::Accel(SensorSample::new(1.0, 2.0, 3.0, 7));
        assert_eq!(
            event.to_landscape(),
            SensorEvent::Accel(SensorSample::new(-2.0, 1.0, 3.0, 7))
        );
    }

    #[test]
    fn test_event_json_format() {
        let event: SensorEvent = serde_json::from_str(
            r#"{"sensor":"gyro","x":0.1,"y":-0.2,"z":0.3,"timestamp_ns":1000}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            SensorEvent::Gyro(SensorSample::new(0.1, -0.2, 0.3, 1000))
        );

        let json = serde_json::to_string(&SensorEvent::Mag(SensorSample::new(1.0, 0.0, 0.0, 5)))
            .unwrap();
        assert!(json.contains(r#""sensor":"mag""#));
    }

    #[test]
    fn test_sink_drops_when_full() {
        let (sink, rx) = SampleSink::bounded(1);
        let event = SensorEvent::Gyro(SensorSample::new(0.0, 0.0, 0.0, 1));

        assert!(sink.push(event));
        assert!(!sink.push(event));
        assert_eq!(sink.dropped(), 1);

        drop(rx);
        assert!(!sink.push(event));
        assert!(!sink.push_blocking(event));
        assert_eq!(sink.dropped(), 2);
    }

    #[test]
    fn test_replay_delivers_all_events_in_order() {
        let events: Vec<SensorEvent> = (1..=50)
            .map(|i| SensorEvent::Gyro(SensorSample::new(0.0, 0.0, i as f64, i * 1_000_000)))
            .collect();
        let (sink, rx) = SampleSink::bounded(4);

        let mut source = ReplaySource::new(events.clone());
        source.register(sink).unwrap();

        let received: Vec<SensorEvent> = rx
            .iter()
            .take(events.len())
            .filter_map(|m| match m {
                WorkerMessage::Sample(e) => Some(e),
                WorkerMessage::Shutdown => None,
            })
            .collect();
        source.unregister();

        assert_eq!(received, events);
        assert!(source.is_finished());
    }

    #[test]
    fn test_replay_register_twice_fails() {
        let (sink, _rx) = SampleSink::bounded(8);
        let mut source = ReplaySource::new(Vec::new());
        source.register(sink.clone()).unwrap();
        assert!(matches!(
            source.register(sink),
            Err(HeadTrackerError::SensorFailed(_))
        ));
        source.unregister();
    }
}
