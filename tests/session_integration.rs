use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use draw_this::config::{BackendKind, Configuration};
use draw_this::error::{BackendError, SessionError};
use draw_this::events::{EndReason, SignalKind, Tier};
use draw_this::loader::Loader;
use draw_this::render::{Direction, Frame, RenderBackend};
use draw_this::store::{IndexStore, RootId};
use draw_this::tasks::manager::{BackendContext, BackendFactory, start_session, start_session_with};
use image::{Rgba, RgbaImage};
use tempfile::tempdir;
use tokio::time::timeout;

#[derive(Debug, Clone, PartialEq)]
enum Shown {
    Pixels(usize, Tier),
    Placeholder(usize),
    Listed(usize),
}

/// Records every displayed frame; `fail_at` makes that index fatal.
struct Recorder {
    shown: Arc<Mutex<Vec<Shown>>>,
    fail_at: Option<usize>,
    /// Stall the first display, as a backend still opening its window would.
    first_delay: Option<Duration>,
}

impl RenderBackend for Recorder {
    fn display(&mut self, frame: Frame) -> Result<(), BackendError> {
        if let Some(delay) = self.first_delay.take() {
            std::thread::sleep(delay);
        }
        if self.fail_at == Some(frame.index()) {
            return Err(BackendError::Fatal("viewer window closed".into()));
        }
        let shown = match frame {
            Frame::Pixels { index, tier, .. } => Shown::Pixels(index, tier),
            Frame::Placeholder { index, .. } => Shown::Placeholder(index),
            Frame::Listed { index } => Shown::Listed(index),
        };
        self.shown.lock().unwrap().push(shown);
        Ok(())
    }

    fn advance(&mut self, _direction: Direction) -> Result<(), BackendError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), BackendError> {
        Ok(())
    }
}

fn recorder(fail_at: Option<usize>) -> (Arc<Mutex<Vec<Shown>>>, BackendFactory) {
    slow_recorder(fail_at, None)
}

fn slow_recorder(
    fail_at: Option<usize>,
    first_delay: Option<Duration>,
) -> (Arc<Mutex<Vec<Shown>>>, BackendFactory) {
    let shown = Arc::new(Mutex::new(Vec::new()));
    let backend = Recorder {
        shown: Arc::clone(&shown),
        fail_at,
        first_delay,
    };
    let factory: BackendFactory =
        Box::new(move |_ctx: BackendContext| Ok(Box::new(backend) as Box<dyn RenderBackend>));
    (shown, factory)
}

fn config(backend: BackendKind) -> Configuration {
    let mut cfg = Configuration::default();
    cfg.session.backend = backend;
    cfg.session.timer = None;
    cfg.session.shuffle_seed = Some(3);
    cfg.session.ready_timeout = Duration::from_secs(5);
    cfg
}

fn index_with_roots(dir: &Path, per_root: &[usize]) -> (IndexStore, Vec<RootId>) {
    let mut store = IndexStore::open_in_memory(16).unwrap();
    let now = Utc::now();
    let mut roots = Vec::new();
    for (n, &count) in per_root.iter().enumerate() {
        let root_dir = dir.join(format!("root-{n}"));
        std::fs::create_dir_all(&root_dir).unwrap();
        let root = store.add_root(&root_dir).unwrap();
        for i in 0..count {
            let path = root_dir.join(format!("{i}.png"));
            RgbaImage::from_pixel(8, 6, Rgba([n as u8 * 40, i as u8, 0, 255]))
                .save(&path)
                .unwrap();
            store.upsert(root.id, &path, None, now).unwrap();
        }
        store.flush().unwrap();
        roots.push(root.id);
    }
    (store, roots)
}

async fn wait_for(shown: &Arc<Mutex<Vec<Shown>>>, mut done: impl FnMut(&[Shown]) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if done(&shown.lock().unwrap()) {
            return;
        }
        assert!(Instant::now() < deadline, "backend never showed the expected frames");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn toggling_a_folder_only_affects_the_next_session() {
    let tmp = tempdir().unwrap();
    let (store, roots) = index_with_roots(tmp.path(), &[5, 5]);
    let loader = Arc::new(Mutex::new(Loader::new(store, Some(3))));
    let cfg = config(BackendKind::External);

    let (_, factory) = recorder(None);
    let session = start_session_with(Arc::clone(&loader), &roots, &cfg, factory)
        .await
        .unwrap();
    let before = session.sequence().clone();
    assert_eq!(before.len(), 10);

    let mut toggles = session
        .bus()
        .subscribe(|k| matches!(k, SignalKind::FolderToggled { .. }));
    session.toggle_folder(roots[1], false).await.unwrap();
    let signal = timeout(Duration::from_secs(5), toggles.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        signal.kind,
        SignalKind::FolderToggled { root_id, active: false } if root_id == roots[1]
    ));

    // The running order is fixed for the life of the session.
    assert_eq!(session.sequence(), &before);
    assert_eq!(session.navigate(9).await, 9);
    assert_eq!(session.stop().await, EndReason::Stopped);

    let (_, factory) = recorder(None);
    let next = start_session_with(Arc::clone(&loader), &roots, &cfg, factory)
        .await
        .unwrap();
    assert_eq!(next.sequence().len(), 5);
    {
        let loader = loader.lock().unwrap();
        let records = loader.block(next.sequence(), 0, 5).unwrap();
        assert!(records.iter().all(|r| r.root_id == roots[0]));
    }
    next.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_selection_yields_an_ended_empty_session() {
    let tmp = tempdir().unwrap();
    let (store, roots) = index_with_roots(tmp.path(), &[0]);
    let loader = Arc::new(Mutex::new(Loader::new(store, None)));
    let (shown, factory) = recorder(None);

    let mut session = start_session_with(loader, &roots, &config(BackendKind::External), factory)
        .await
        .unwrap();
    assert!(session.sequence().is_empty());
    assert!(session.has_ended());
    assert_eq!(session.navigate(3).await, 0);
    assert_eq!(session.jump(5).await, 0);
    let reason = timeout(Duration::from_secs(1), session.wait()).await.unwrap();
    assert_eq!(reason, EndReason::Stopped);
    assert!(shown.lock().unwrap().is_empty());
    assert_eq!(session.stop().await, EndReason::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backend_failure_ends_the_session() {
    let tmp = tempdir().unwrap();
    let (store, roots) = index_with_roots(tmp.path(), &[4]);
    let loader = Arc::new(Mutex::new(Loader::new(store, None)));
    let (shown, factory) = recorder(Some(2));

    let mut session = start_session_with(loader, &roots, &config(BackendKind::External), factory)
        .await
        .unwrap();
    session.navigate(1).await;
    session.navigate(1).await;

    let reason = timeout(Duration::from_secs(5), session.wait()).await.unwrap();
    assert!(matches!(reason, EndReason::BackendFailed(ref detail) if detail.contains("window closed")));
    assert!(session.has_ended());
    assert_eq!(
        *shown.lock().unwrap(),
        vec![Shown::Listed(0), Shown::Listed(1)]
    );
    assert!(matches!(session.stop().await, EndReason::BackendFailed(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_backends_time_out() {
    let tmp = tempdir().unwrap();
    let (store, roots) = index_with_roots(tmp.path(), &[2]);
    let loader = Arc::new(Mutex::new(Loader::new(store, None)));
    let mut cfg = config(BackendKind::External);
    cfg.session.ready_timeout = Duration::from_millis(100);

    let (_, inner) = recorder(None);
    let factory: BackendFactory = Box::new(move |ctx| {
        std::thread::sleep(Duration::from_millis(400));
        inner(ctx)
    });
    let result = start_session_with(loader, &roots, &cfg, factory).await;
    assert!(matches!(result, Err(SessionError::BackendTimeout(d)) if d == Duration::from_millis(100)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timer_walks_the_sequence_and_wraps() {
    let tmp = tempdir().unwrap();
    let (store, roots) = index_with_roots(tmp.path(), &[3]);
    let loader = Arc::new(Mutex::new(Loader::new(store, None)));
    let mut cfg = config(BackendKind::External);
    cfg.session.timer = Some(Duration::from_millis(30));
    let (shown, factory) = recorder(None);

    let session = start_session_with(loader, &roots, &cfg, factory).await.unwrap();
    let expected = [0, 1, 2, 0].map(Shown::Listed);
    wait_for(&shown, |s| s.len() >= 4).await;
    session.stop().await;
    assert_eq!(&shown.lock().unwrap()[..4], &expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn accelerated_sessions_display_decoded_pixels() {
    let tmp = tempdir().unwrap();
    let (store, roots) = index_with_roots(tmp.path(), &[3]);
    let loader = Arc::new(Mutex::new(Loader::new(store, Some(1))));
    let (shown, factory) = recorder(None);

    let session = start_session_with(loader, &roots, &config(BackendKind::Accelerated), factory)
        .await
        .unwrap();
    assert!(session.buffer().is_some());
    wait_for(&shown, |s| s.contains(&Shown::Pixels(0, Tier::Full))).await;

    assert_eq!(session.navigate(1).await, 1);
    wait_for(&shown, |s| s.contains(&Shown::Pixels(1, Tier::Full))).await;
    assert_eq!(session.position().await, 1);
    session.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn frames_decoded_behind_a_busy_backend_still_reach_it() {
    let tmp = tempdir().unwrap();
    let (store, roots) = index_with_roots(tmp.path(), &[8]);
    let loader = Arc::new(Mutex::new(Loader::new(store, Some(1))));
    let mut cfg = config(BackendKind::Accelerated);
    cfg.bus.capacity = 2;
    cfg.buffer.window_radius = 4;

    // While the first display stalls, every slot in the window decodes and the
    // backend's queue keeps only the latest frame notification.
    let (shown, factory) = slow_recorder(None, Some(Duration::from_millis(500)));
    let session = start_session_with(loader, &roots, &cfg, factory).await.unwrap();
    wait_for(&shown, |s| s.contains(&Shown::Pixels(0, Tier::Full))).await;
    assert_eq!(session.position().await, 0);
    session.stop().await;
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn viewer_exit_ends_an_untimed_session() {
    let tmp = tempdir().unwrap();
    let lists = tempdir().unwrap();
    let (store, roots) = index_with_roots(tmp.path(), &[3]);
    let loader = Arc::new(Mutex::new(Loader::new(store, None)));
    let mut cfg = config(BackendKind::External);
    cfg.viewer.command = "sh".into();
    cfg.viewer.args = vec!["-c".into(), "sleep 0.5; exit 0".into()];
    cfg.viewer.filelist_dir = Some(lists.path().to_path_buf());

    let mut session = start_session(loader, &roots, &cfg).await.unwrap();
    let reason = timeout(Duration::from_secs(5), session.wait())
        .await
        .expect("viewer exit noticed without any navigation");
    assert!(matches!(reason, EndReason::BackendFailed(ref detail) if detail.contains("viewer exited")));
    assert!(matches!(session.stop().await, EndReason::BackendFailed(_)));
    assert_eq!(std::fs::read_dir(lists.path()).unwrap().count(), 0);
}
