//! Frame fan-out and the capture/display thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use opencv::highgui;
use opencv::prelude::*;
use parking_lot::Mutex;
use tracing::{info, warn};

use super::overlay::OverlayState;
use super::source::{Frame, FrameSource};

const WINDOW_NAME: &str = "flowpilot";
/// Pause after a capture miss before retrying.
const CAPTURE_BACKOFF: Duration = Duration::from_millis(100);

type SubscriberFn = Box<dyn FnMut(Frame) -> Result<()> + Send>;

struct Subscriber {
    name: String,
    callback: SubscriberFn,
}

/// A buffered consumer outside the control loop. When the buffer is full
/// the oldest frame is dropped, never the capture thread's time.
struct Tap {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
}

/// Fans captured frames out to subscribers and the optional display sink.
///
/// Subscribers run synchronously on the capture thread in subscription
/// order; a failing subscriber is logged and skipped, never propagated.
pub struct FrameDistributor {
    subscribers: Mutex<Vec<Subscriber>>,
    taps: Mutex<Vec<Tap>>,
    tap_capacity: usize,
    overlay: Arc<OverlayState>,
    display: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FrameDistributor {
    pub fn new(tap_capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            taps: Mutex::new(Vec::new()),
            tap_capacity,
            overlay: Arc::new(OverlayState::new()),
            display: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Shared overlay sink for display decorations.
    pub fn overlay(&self) -> Arc<OverlayState> {
        Arc::clone(&self.overlay)
    }

    /// Append a subscriber; frames arrive in subscription order.
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        callback: impl FnMut(Frame) -> Result<()> + Send + 'static,
    ) {
        let name = name.into();
        info!("frame subscriber '{name}' added");
        self.subscribers.lock().push(Subscriber {
            name,
            callback: Box::new(callback),
        });
    }

    pub fn unsubscribe(&self, name: &str) -> bool {
        let mut subs = self.subscribers.lock();
        let before = subs.len();
        subs.retain(|s| s.name != name);
        before != subs.len()
    }

    /// Open a buffered frame tap with drop-oldest backpressure.
    pub fn open_tap(&self) -> Receiver<Frame> {
        let (tx, rx) = bounded(self.tap_capacity);
        let out = rx.clone();
        self.taps.lock().push(Tap { tx, rx });
        out
    }

    /// Show or hide the live display window with overlay compositing.
    pub fn set_display(&self, on: bool) {
        self.display.store(on, Ordering::SeqCst);
    }

    pub fn display_active(&self) -> bool {
        self.display.load(Ordering::SeqCst)
    }

    /// Spawn the capture thread, consuming the source. The source owns the
    /// only device handle, so a second start without a new source cannot
    /// exist.
    pub fn start(self: &Arc<Self>, source: FrameSource) {
        self.shutdown.store(false, Ordering::SeqCst);
        let this = Arc::clone(self);
        let handle = thread::spawn(move || this.capture_loop(source));
        *self.handle.lock() = Some(handle);
    }

    /// Stop the capture thread and wait for it. Idempotent.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
            info!("video pipeline stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }

    fn capture_loop(&self, mut source: FrameSource) {
        info!("capture loop started");
        let mut window_open = false;
        while !self.shutdown.load(Ordering::SeqCst) {
            match source.read() {
                Ok(Some(frame)) => {
                    self.dispatch(&frame);
                    self.display_tick(&frame, &mut window_open);
                }
                Ok(None) => thread::sleep(CAPTURE_BACKOFF),
                Err(e) => {
                    warn!("capture error: {e:#}");
                    thread::sleep(CAPTURE_BACKOFF);
                }
            }
        }
        if window_open {
            let _ = highgui::destroy_window(WINDOW_NAME);
        }
        info!("capture loop ended");
    }

    /// Copy the frame to every subscriber and tap.
    fn dispatch(&self, frame: &Frame) {
        let mut subscribers = self.subscribers.lock();
        for sub in subscribers.iter_mut() {
            if let Err(e) = (sub.callback)(frame.clone()) {
                warn!("subscriber '{}' failed: {e:#}", sub.name);
            }
        }
        drop(subscribers);

        self.taps.lock().retain(|tap| {
            // Only the tap's internal receiver left: the consumer is gone.
            if tap.rx.receiver_count() <= 1 {
                return false;
            }
            match tap.tx.try_send(frame.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(frame)) => {
                    // Drop the oldest buffered frame, keep the new one.
                    let _ = tap.rx.try_recv();
                    let _ = tap.tx.try_send(frame);
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
    }

    fn display_tick(&self, frame: &Frame, window_open: &mut bool) {
        if !self.display.load(Ordering::SeqCst) {
            if *window_open {
                let _ = highgui::destroy_window(WINDOW_NAME);
                *window_open = false;
            }
            return;
        }
        if let Err(e) = self.display_frame(frame, window_open) {
            warn!("display error: {e:#}");
        }
    }

    fn display_frame(&self, frame: &Frame, window_open: &mut bool) -> Result<()> {
        if !*window_open {
            highgui::named_window(WINDOW_NAME, highgui::WINDOW_AUTOSIZE)?;
            *window_open = true;
        }
        let mut display = frame.mat.clone();
        self.overlay.apply(&mut display)?;
        highgui::imshow(WINDOW_NAME, &display)?;
        // 'q' closes the display without touching capture.
        if highgui::wait_key(1)? == i32::from(b'q') {
            self.display.store(false, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for FrameDistributor {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}
