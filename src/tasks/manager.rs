//! Session controller: builds the playback sequence, starts the selected
//! backend, and drives navigation until the session ends.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::buffer::{RollingBuffer, SequenceSource};
use crate::bus::{DeliveryPolicy, Publisher, SignalBus, Subscription};
use crate::config::{BackendKind, Configuration, ViewerOptions};
use crate::decode::ImageDecoder;
use crate::error::{BackendError, SessionError};
use crate::events::{BackendId, EndReason, SessionId, SignalKind};
use crate::loader::{Loader, PlaybackSequence};
use crate::render::RenderBackend;
use crate::render::accelerated::AcceleratedBackend;
use crate::render::external::ExternalViewer;
use crate::render::gpu::WgpuTarget;
use crate::store::RootId;
use crate::tasks::viewer::FailureReporter;
use crate::tasks::{prefetch, viewer};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// What a backend gets to build itself from.
pub struct BackendContext {
    pub sequence: PlaybackSequence,
    pub loader: Arc<Mutex<Loader>>,
    /// Present for the accelerated backend only.
    pub buffer: Option<Arc<RollingBuffer>>,
    pub viewer: ViewerOptions,
    /// Reports failures the backend notices on its own threads.
    pub failures: FailureReporter,
}

pub type BackendFactory =
    Box<dyn FnOnce(BackendContext) -> Result<Box<dyn RenderBackend>, BackendError> + Send>;

/// The stock backend for `kind`.
#[must_use]
pub fn default_backend(kind: BackendKind) -> BackendFactory {
    match kind {
        BackendKind::External => Box::new(|ctx: BackendContext| {
            let failures = ctx.failures;
            let viewer = {
                let loader = ctx.loader.lock().unwrap_or_else(PoisonError::into_inner);
                ExternalViewer::spawn(&ctx.viewer, &loader, &ctx.sequence)?
            };
            let viewer = viewer.on_exit(move |detail| failures.report(detail))?;
            Ok(Box::new(viewer) as Box<dyn RenderBackend>)
        }),
        BackendKind::Accelerated => Box::new(|ctx: BackendContext| {
            let buffer = ctx.buffer.ok_or_else(|| {
                BackendError::Fatal("accelerated backend started without a decode buffer".into())
            })?;
            let target = WgpuTarget::new(ctx.viewer.canvas_width, ctx.viewer.canvas_height)?;
            Ok(Box::new(AcceleratedBackend::new(target, buffer)) as Box<dyn RenderBackend>)
        }),
    }
}

/// Serializes position changes so `navigate` signals leave in position order.
struct Navigator {
    position: tokio::sync::Mutex<usize>,
    len: usize,
    buffer: Option<Arc<RollingBuffer>>,
    publisher: Publisher,
}

impl Navigator {
    async fn to(&self, target: usize) -> usize {
        let mut position = self.position.lock().await;
        let target = target.min(self.len.saturating_sub(1));
        if target == *position {
            return target;
        }
        if let Some(buffer) = &self.buffer {
            buffer.navigate_to(target);
        }
        let delta = i64::try_from(target).unwrap_or(i64::MAX)
            - i64::try_from(*position).unwrap_or(i64::MAX);
        *position = target;
        self.publisher
            .publish(SignalKind::Navigate {
                delta,
                position: target,
            })
            .await;
        target
    }

    async fn by(&self, delta: i64) -> usize {
        let current = *self.position.lock().await;
        let magnitude = usize::try_from(delta.unsigned_abs()).unwrap_or(usize::MAX);
        let target = if delta >= 0 {
            current.saturating_add(magnitude)
        } else {
            current.saturating_sub(magnitude)
        };
        self.to(target).await
    }

    /// Timer step: forward, jumping back to the start after the last image.
    async fn tick(&self) -> usize {
        let current = *self.position.lock().await;
        if current + 1 >= self.len {
            self.to(0).await
        } else {
            self.to(current + 1).await
        }
    }
}

/// A running slideshow.
pub struct SessionHandle {
    session_id: SessionId,
    sequence: PlaybackSequence,
    loader: Arc<Mutex<Loader>>,
    bus: SignalBus,
    navigator: Arc<Navigator>,
    publisher: Arc<Publisher>,
    buffer: Option<Arc<RollingBuffer>>,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    backend: Option<JoinHandle<()>>,
    ended: watch::Receiver<Option<EndReason>>,
}

/// Start a session over the active images of `roots` with the configured backend.
///
/// An empty active set is not an error: the handle comes back already ended,
/// with an empty sequence and no backend started.
pub async fn start_session(
    loader: Arc<Mutex<Loader>>,
    roots: &[RootId],
    config: &Configuration,
) -> Result<SessionHandle, SessionError> {
    let factory = default_backend(config.session.backend);
    start_session_with(loader, roots, config, factory).await
}

/// [`start_session`] with a caller-supplied backend.
#[instrument(skip_all, fields(roots = roots.len(), backend = ?config.session.backend))]
pub async fn start_session_with(
    loader: Arc<Mutex<Loader>>,
    roots: &[RootId],
    config: &Configuration,
    factory: BackendFactory,
) -> Result<SessionHandle, SessionError> {
    let sequence = loader
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .start_session(roots)?;
    let session_id = SessionId(NEXT_SESSION.fetch_add(1, Ordering::Relaxed));
    let bus = SignalBus::new(config.bus.capacity, DeliveryPolicy::default());
    let publisher = Arc::new(bus.publisher("controller"));
    let cancel = CancellationToken::new();
    if sequence.is_empty() {
        info!(session = %session_id, "no active images; session ends at once");
        publisher
            .publish(SignalKind::SessionEnded {
                session_id,
                reason: EndReason::Stopped,
            })
            .await;
        let (_, ended) = watch::channel(Some(EndReason::Stopped));
        return Ok(SessionHandle {
            session_id,
            navigator: Arc::new(Navigator {
                position: tokio::sync::Mutex::new(0),
                len: 0,
                buffer: None,
                publisher: bus.publisher("navigator"),
            }),
            sequence,
            loader,
            bus,
            publisher,
            buffer: None,
            cancel,
            tasks: JoinSet::new(),
            backend: None,
            ended,
        });
    }
    let mut tasks = JoinSet::new();
    let mut control = bus.subscribe(|k| {
        matches!(
            k,
            SignalKind::BackendReady { .. } | SignalKind::BackendError { .. }
        )
    });

    let buffer = match config.session.backend {
        BackendKind::Accelerated => {
            let mut source = SequenceSource::new(Arc::clone(&loader), sequence.clone());
            if let Some(dir) = &config.buffer.thumbnail_cache_dir {
                source = source.with_thumbnail_cache(dir);
            }
            let (buffer, queues) = RollingBuffer::new(Arc::new(source), &config.buffer);
            tasks.spawn(prefetch::run(
                Arc::clone(&buffer),
                queues,
                Arc::new(ImageDecoder::new(config.buffer.thumbnail_max_dimension)),
                bus.publisher("prefetch"),
                cancel.clone(),
                config.buffer.max_concurrent_decodes,
            ));
            Some(buffer)
        }
        BackendKind::External => None,
    };

    let backend_id = BackendId(1);
    let context = BackendContext {
        sequence: sequence.clone(),
        loader: Arc::clone(&loader),
        buffer: buffer.clone(),
        viewer: config.viewer.clone(),
        failures: FailureReporter::new(backend_id, &bus),
    };
    let backend = viewer::spawn(
        backend_id,
        &bus,
        bus.subscribe(viewer::wants),
        buffer.clone(),
        Box::new(move || factory(context)),
    )
    .map_err(|err| BackendError::Fatal(format!("failed to start backend thread: {err}")))?;

    let (ended_tx, ended) = watch::channel(None);
    let mut handle = SessionHandle {
        session_id,
        navigator: Arc::new(Navigator {
            position: tokio::sync::Mutex::new(0),
            len: sequence.len(),
            buffer: buffer.clone(),
            publisher: bus.publisher("navigator"),
        }),
        sequence,
        loader,
        bus,
        publisher,
        buffer,
        cancel,
        tasks,
        backend: Some(backend),
        ended,
    };

    let ready_timeout = config.session.ready_timeout;
    match timeout(ready_timeout, control.recv()).await {
        Ok(Some(signal)) => match signal.kind {
            SignalKind::BackendReady { backend_id } => {
                info!(session = %session_id, backend = %backend_id, "backend ready");
            }
            SignalKind::BackendError { detail, .. } => {
                handle.shutdown(EndReason::BackendFailed(detail.clone())).await;
                return Err(BackendError::Fatal(detail).into());
            }
            _ => {}
        },
        Ok(None) => {
            handle.shutdown(EndReason::Stopped).await;
            return Err(BackendError::Fatal("bus closed before backend was ready".into()).into());
        }
        Err(_) => {
            handle.shutdown(EndReason::Stopped).await;
            return Err(SessionError::BackendTimeout(ready_timeout));
        }
    }

    handle
        .publisher
        .publish(SignalKind::SessionStarted { session_id })
        .await;
    info!(session = %session_id, images = handle.sequence.len(), "session started");

    handle.tasks.spawn(watch_backend(
        session_id,
        control,
        Arc::clone(&handle.publisher),
        handle.cancel.clone(),
        ended_tx,
    ));
    if let Some(period) = config.session.timer {
        handle.tasks.spawn(run_timer(
            period,
            Arc::clone(&handle.navigator),
            handle.cancel.clone(),
        ));
    }
    Ok(handle)
}

/// Ends the session on the first `backend_error` and records why it ended.
async fn watch_backend(
    session_id: SessionId,
    mut control: Subscription,
    publisher: Arc<Publisher>,
    cancel: CancellationToken,
    ended: watch::Sender<Option<EndReason>>,
) {
    while let Some(signal) = control.recv().await {
        match signal.kind {
            SignalKind::BackendError { backend_id, detail } => {
                warn!(session = %session_id, backend = %backend_id, %detail, "backend failed; ending session");
                publisher
                    .publish(SignalKind::SessionEnded {
                        session_id,
                        reason: EndReason::BackendFailed(detail),
                    })
                    .await;
            }
            SignalKind::SessionEnded { reason, .. } => {
                ended.send_replace(Some(reason));
                break;
            }
            _ => {}
        }
    }
    cancel.cancel();
}

async fn run_timer(period: Duration, navigator: Arc<Navigator>, cancel: CancellationToken) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let position = navigator.tick().await;
                debug!(position, "timer advanced");
            }
        }
    }
}

impl SessionHandle {
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.session_id
    }

    /// The fixed order of this session.
    #[must_use]
    pub const fn sequence(&self) -> &PlaybackSequence {
        &self.sequence
    }

    /// Bus of this session, for observers.
    #[must_use]
    pub const fn bus(&self) -> &SignalBus {
        &self.bus
    }

    #[must_use]
    pub const fn buffer(&self) -> Option<&Arc<RollingBuffer>> {
        self.buffer.as_ref()
    }

    pub async fn position(&self) -> usize {
        *self.navigator.position.lock().await
    }

    /// Move by `delta`, clamped to the sequence. Returns the new position.
    pub async fn navigate(&self, delta: i64) -> usize {
        self.navigator.by(delta).await
    }

    /// Jump to `index`, clamped to the sequence.
    pub async fn jump(&self, index: usize) -> usize {
        self.navigator.to(index).await
    }

    /// Flip a root's active flag. The running sequence is unaffected; the next
    /// session sees the change.
    pub async fn toggle_folder(&self, root_id: RootId, active: bool) -> Result<(), SessionError> {
        self.loader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .store_mut()
            .set_root_active(root_id, active)?;
        info!(session = %self.session_id, root = %root_id, active, "folder toggled");
        self.publisher
            .publish(SignalKind::FolderToggled { root_id, active })
            .await;
        Ok(())
    }

    /// `true` once the session has ended for any reason.
    #[must_use]
    pub fn has_ended(&self) -> bool {
        self.bus.has_ended()
    }

    /// Wait until the session ends on its own (backend failure) or is stopped elsewhere.
    pub async fn wait(&mut self) -> EndReason {
        let reason = match self.ended.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone(),
            Err(_) => None,
        };
        reason.unwrap_or(EndReason::Stopped)
    }

    /// Stop the session and release everything it started.
    pub async fn stop(mut self) -> EndReason {
        self.shutdown(EndReason::Stopped).await;
        self.ended.borrow().clone().unwrap_or(EndReason::Stopped)
    }

    async fn shutdown(&mut self, reason: EndReason) {
        self.publisher
            .publish(SignalKind::SessionEnded {
                session_id: self.session_id,
                reason,
            })
            .await;
        self.cancel.cancel();
        if let Some(buffer) = &self.buffer {
            buffer.shutdown();
        }
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(err) = joined {
                warn!(%err, "session task failed");
            }
        }
        if let Some(backend) = self.backend.take() {
            match tokio::task::spawn_blocking(move || backend.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => warn!("backend thread panicked"),
                Err(err) => warn!(%err, "failed to join backend thread"),
            }
        }
        info!(session = %self.session_id, "session stopped");
    }
}

/// Stop `handle`'s session. Returns why it ended.
pub async fn stop_session(handle: SessionHandle) -> EndReason {
    handle.stop().await
}
