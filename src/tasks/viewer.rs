//! Backend driver: runs one [`RenderBackend`] on its own thread and feeds it
//! from the signal bus.

use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, error, info, warn};

use crate::buffer::RollingBuffer;
use crate::bus::{Publisher, SignalBus, Subscription};
use crate::error::BackendError;
use crate::events::{BackendId, SignalKind, Tier};
use crate::render::{Direction, Frame, RenderBackend};

/// Signals a backend driver listens to. `session_ended` always arrives.
#[must_use]
pub fn wants(kind: &SignalKind) -> bool {
    matches!(
        kind,
        SignalKind::Navigate { .. } | SignalKind::FrameReady { .. } | SignalKind::DecodeFailed { .. }
    )
}

/// Reports a backend failure noticed outside `display` and `advance`, such as
/// a viewer process exiting on its own.
#[derive(Clone)]
pub struct FailureReporter {
    backend_id: BackendId,
    publisher: Arc<Publisher>,
}

impl FailureReporter {
    #[must_use]
    pub fn new(backend_id: BackendId, bus: &SignalBus) -> Self {
        Self {
            backend_id,
            publisher: Arc::new(bus.publisher(&format!("backend-{backend_id}-monitor"))),
        }
    }

    /// Safe to call from any thread outside the async runtime.
    pub fn report(&self, detail: impl Into<String>) {
        let detail = detail.into();
        error!(backend = %self.backend_id, %detail, "backend failed");
        self.publisher.blocking_publish(SignalKind::BackendError {
            backend_id: self.backend_id,
            detail,
        });
    }
}

pub type BackendBuilder = Box<dyn FnOnce() -> Result<Box<dyn RenderBackend>, BackendError> + Send>;

/// Construct a backend on a dedicated thread and drive it until the session ends.
///
/// `subscription` must be created before the controller publishes anything the
/// backend needs to see; it is normally `bus.subscribe(wants)`.
pub fn spawn(
    backend_id: BackendId,
    bus: &SignalBus,
    subscription: Subscription,
    buffer: Option<Arc<RollingBuffer>>,
    build: BackendBuilder,
) -> std::io::Result<JoinHandle<()>> {
    let publisher = bus.publisher(&format!("backend-{backend_id}"));
    std::thread::Builder::new()
        .name(format!("backend-{backend_id}"))
        .spawn(move || {
            let backend = match build() {
                Ok(backend) => backend,
                Err(err) => {
                    error!(backend = %backend_id, %err, "backend failed to start");
                    publisher.blocking_publish(SignalKind::BackendError {
                        backend_id,
                        detail: err.to_string(),
                    });
                    return;
                }
            };
            Driver {
                backend_id,
                backend,
                buffer,
                publisher,
                position: 0,
                shown: None,
            }
            .run(subscription);
        })
}

struct Driver {
    backend_id: BackendId,
    backend: Box<dyn RenderBackend>,
    buffer: Option<Arc<RollingBuffer>>,
    publisher: Publisher,
    position: usize,
    /// What the backend last accepted: index, tier if pixels, failed if placeholder.
    shown: Option<(usize, Option<Tier>, bool)>,
}

fn shown_key(frame: &Frame) -> (usize, Option<Tier>, bool) {
    match frame {
        Frame::Pixels { index, tier, .. } => (*index, Some(*tier), false),
        Frame::Placeholder { index, failed } => (*index, None, *failed),
        Frame::Listed { index } => (*index, None, false),
    }
}

impl Driver {
    fn frame(&self, index: usize) -> Frame {
        match &self.buffer {
            Some(buffer) => Frame::from_buffer(buffer, index),
            None => Frame::Listed { index },
        }
    }

    fn navigate(&mut self, delta: i64, position: usize) -> Result<(), BackendError> {
        self.position = position;
        if delta.abs() == 1 {
            if let Some(direction) = Direction::of(delta) {
                self.backend.advance(direction)?;
            }
        }
        self.show(self.frame(position))
    }

    fn show(&mut self, frame: Frame) -> Result<(), BackendError> {
        let key = shown_key(&frame);
        self.backend.display(frame)?;
        self.shown = Some(key);
        Ok(())
    }

    /// Frame notifications for other slots may have displaced the one for the
    /// current slot, so every notification re-checks the current slot.
    fn refresh(&mut self) -> Result<(), BackendError> {
        let frame = self.frame(self.position);
        if self.shown == Some(shown_key(&frame)) {
            return Ok(());
        }
        self.show(frame)
    }

    fn run(mut self, mut subscription: Subscription) {
        info!(backend = %self.backend_id, "backend ready");
        self.publisher.blocking_publish(SignalKind::BackendReady {
            backend_id: self.backend_id,
        });

        let mut outcome = self.show(self.frame(0));
        loop {
            if let Err(err) = outcome {
                if err.is_fatal() {
                    error!(backend = %self.backend_id, %err, "backend failed");
                    self.publisher.blocking_publish(SignalKind::BackendError {
                        backend_id: self.backend_id,
                        detail: err.to_string(),
                    });
                    break;
                }
                warn!(backend = %self.backend_id, %err, "frame not shown");
            }
            let Some(signal) = subscription.blocking_recv() else {
                break;
            };
            outcome = match signal.kind {
                SignalKind::Navigate { delta, position } => self.navigate(delta, position),
                SignalKind::FrameReady { .. } | SignalKind::DecodeFailed { .. } => self.refresh(),
                SignalKind::SessionEnded { session_id, .. } => {
                    debug!(backend = %self.backend_id, session = %session_id, "session ended");
                    break;
                }
                _ => Ok(()),
            };
        }

        if let Err(err) = self.backend.close() {
            warn!(backend = %self.backend_id, %err, "backend did not close cleanly");
        }
        info!(backend = %self.backend_id, "backend closed");
    }
}
