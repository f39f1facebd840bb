//! Visual odometry engine: state machine, observer registry, dispatch.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::FlowConfig;
use crate::link::VehicleLink;
use crate::video::{Frame, FrameDistributor, OverlayState};

use super::flow::FlowComputer;
use super::sample::{HoldMode, MotionObserver, MotionSample};

/// Engine activity. Only one active state at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Not processing frames.
    Idle,
    /// Full position hold.
    PositionHold,
    /// Lateral-only hold during the takeoff throttle ramp.
    TakeoffHold,
}

struct Inner {
    state: EngineState,
    flow: FlowComputer,
}

type SharedObserver = Arc<Mutex<dyn MotionObserver>>;

/// Turns frames into [`MotionSample`]s and dispatches them synchronously to
/// registered observers, in registration order.
///
/// Frame processing runs inside the distributor's subscriber callback, so
/// flow latency directly gates capture cadence. That is the intended
/// trade-off: samples are delivered in capture order, never duplicated.
pub struct OpticalFlowEngine {
    inner: Mutex<Inner>,
    observers: Mutex<Vec<SharedObserver>>,
    overlay: Arc<OverlayState>,
    link: Option<Arc<VehicleLink>>,
}

impl OpticalFlowEngine {
    pub fn new(
        config: FlowConfig,
        overlay: Arc<OverlayState>,
        link: Option<Arc<VehicleLink>>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: EngineState::Idle,
                flow: FlowComputer::new(config),
            }),
            observers: Mutex::new(Vec::new()),
            overlay,
            link,
        }
    }

    /// Register an observer. A second registration of the same observer is
    /// a no-op, so at most one active subscription exists per observer.
    pub fn register_observer(&self, observer: SharedObserver) {
        let mut observers = self.observers.lock();
        if observers.iter().any(|o| Arc::ptr_eq(o, &observer)) {
            debug!("observer already registered");
            return;
        }
        observers.push(observer);
    }

    pub fn remove_observer(&self, observer: &SharedObserver) {
        self.observers.lock().retain(|o| !Arc::ptr_eq(o, observer));
    }

    pub fn state(&self) -> EngineState {
        self.inner.lock().state
    }

    /// Begin full position hold. No-op while already active.
    pub fn start_position_hold(&self) {
        self.start(EngineState::PositionHold);
    }

    /// Begin lateral-only hold for the takeoff ramp.
    pub fn start_takeoff_hold(&self) {
        self.start(EngineState::TakeoffHold);
    }

    fn start(&self, state: EngineState) {
        let mut inner = self.inner.lock();
        if inner.state != EngineState::Idle {
            debug!("engine already active in {:?}", inner.state);
            return;
        }
        // The previous frame is stale by now; never flow against it.
        inner.flow.reset();
        inner.state = state;
        info!("optical flow engine started in {state:?}");
    }

    /// Return to idle and discard the previous frame, so the next start
    /// cannot compute a false displacement. Idempotent; takes effect by the
    /// next processed frame.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        if inner.state != EngineState::Idle {
            info!("optical flow engine stopped");
        }
        inner.state = EngineState::Idle;
        inner.flow.reset();
    }

    /// Subscribe the engine to a frame distributor.
    pub fn attach(self: &Arc<Self>, distributor: &FrameDistributor) {
        let engine = Arc::clone(self);
        distributor.subscribe("optical-flow", move |frame| {
            engine.process_frame(&frame);
            Ok(())
        });
    }

    /// Process one captured frame: flow, overlay, barometer, dispatch.
    pub fn process_frame(&self, frame: &Frame) {
        let (measurement, mode) = {
            let mut inner = self.inner.lock();
            let mode = match inner.state {
                EngineState::Idle => return,
                EngineState::TakeoffHold => HoldMode::TakeoffHold,
                EngineState::PositionHold => HoldMode::Hold,
            };
            match inner.flow.process(&frame.mat) {
                Ok(m) => (m, mode),
                Err(e) => {
                    warn!("flow computation failed: {e:#}");
                    return;
                }
            }
        };

        // Display decoration only; control never depends on it.
        self.overlay.set_flow(measurement.field.clone());

        // Best-effort barometer alongside the frame; a miss degrades the
        // fused estimate instead of aborting control.
        let barometer = self.link.as_ref().and_then(|l| l.barometer_altitude());

        let sample = MotionSample {
            dx: measurement.dx,
            dy: measurement.dy,
            scale_change: measurement.scale_change,
            timestamp: frame.timestamp,
            mode,
            barometer,
        };

        let observers: Vec<SharedObserver> = self.observers.lock().clone();
        for observer in &observers {
            observer.lock().on_motion(&sample);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::Mat;
    use std::time::Instant;

    struct Recorder {
        name: &'static str,
        samples: Arc<Mutex<Vec<MotionSample>>>,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    impl MotionObserver for Recorder {
        fn on_motion(&mut self, sample: &MotionSample) {
            self.samples.lock().push(*sample);
            self.order.lock().push(self.name);
        }
    }

    fn engine() -> Arc<OpticalFlowEngine> {
        Arc::new(OpticalFlowEngine::new(
            FlowConfig::default(),
            Arc::new(OverlayState::new()),
            None,
        ))
    }

    fn recorder(
        name: &'static str,
        order: &Arc<Mutex<Vec<&'static str>>>,
    ) -> (Arc<Mutex<Recorder>>, Arc<Mutex<Vec<MotionSample>>>) {
        let samples = Arc::new(Mutex::new(Vec::new()));
        let rec = Arc::new(Mutex::new(Recorder {
            name,
            samples: Arc::clone(&samples),
            order: Arc::clone(order),
        }));
        (rec, samples)
    }

    fn frame(offset: i32) -> Frame {
        let mut rows = vec![vec![0u8; 64]; 64];
        for (cx, cy) in [(16i32, 16i32), (40, 24), (24, 44), (44, 48)] {
            for y in (cy - 3)..(cy + 3) {
                for x in (cx - 3 + offset)..(cx + 3 + offset) {
                    rows[y as usize][x as usize] = 255;
                }
            }
        }
        Frame {
            mat: Mat::from_slice_2d(&rows).unwrap(),
            timestamp: Instant::now(),
        }
    }

    #[test]
    fn test_idle_engine_dispatches_nothing() {
        let engine = engine();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (rec, samples) = recorder("a", &order);
        engine.register_observer(rec);

        engine.process_frame(&frame(0));
        assert!(samples.lock().is_empty());
    }

    #[test]
    fn test_first_sample_after_start_is_zero_motion() {
        let engine = engine();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (rec, samples) = recorder("a", &order);
        engine.register_observer(rec);

        engine.start_position_hold();
        engine.process_frame(&frame(0));

        let samples = samples.lock();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].dx, 0.0);
        assert_eq!(samples[0].dy, 0.0);
        assert_eq!(samples[0].mode, HoldMode::Hold);
    }

    #[test]
    fn test_restart_never_flows_against_stale_frame() {
        let engine = engine();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (rec, samples) = recorder("a", &order);
        engine.register_observer(rec);

        engine.start_position_hold();
        engine.process_frame(&frame(0));
        engine.process_frame(&frame(3));
        engine.stop();
        engine.start_position_hold();
        // Large apparent shift relative to the pre-stop frame; must not be
        // measured because the previous frame was discarded.
        engine.process_frame(&frame(8));

        let samples = samples.lock();
        assert_eq!(samples.len(), 3);
        assert!(samples[1].dx > 2.0, "motion before stop: {}", samples[1].dx);
        assert_eq!(samples[2].dx, 0.0);
        assert_eq!(samples[2].dy, 0.0);
    }

    #[test]
    fn test_takeoff_hold_flags_samples() {
        let engine = engine();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (rec, samples) = recorder("a", &order);
        engine.register_observer(rec);

        engine.start_takeoff_hold();
        assert_eq!(engine.state(), EngineState::TakeoffHold);
        engine.process_frame(&frame(0));
        assert_eq!(samples.lock()[0].mode, HoldMode::TakeoffHold);
    }

    #[test]
    fn test_start_while_active_is_a_no_op() {
        let engine = engine();
        engine.start_takeoff_hold();
        engine.start_position_hold();
        assert_eq!(engine.state(), EngineState::TakeoffHold);
    }

    #[test]
    fn test_observers_notified_in_registration_order() {
        let engine = engine();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (first, _) = recorder("first", &order);
        let (second, _) = recorder("second", &order);
        engine.register_observer(first);
        engine.register_observer(second);

        engine.start_position_hold();
        engine.process_frame(&frame(0));
        assert_eq!(*order.lock(), vec!["first", "second"]);
    }

    #[test]
    fn test_duplicate_registration_is_single_subscription() {
        let engine = engine();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (rec, samples) = recorder("a", &order);
        engine.register_observer(Arc::clone(&rec));
        engine.register_observer(rec);

        engine.start_position_hold();
        engine.process_frame(&frame(0));
        assert_eq!(samples.lock().len(), 1);
    }

    #[test]
    fn test_removed_observer_stops_receiving() {
        let engine = engine();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (rec, samples) = recorder("a", &order);
        let handle: SharedObserver = rec;
        engine.register_observer(Arc::clone(&handle));

        engine.start_position_hold();
        engine.process_frame(&frame(0));
        engine.remove_observer(&handle);
        engine.process_frame(&frame(0));
        assert_eq!(samples.lock().len(), 1);
    }
}
