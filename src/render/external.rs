//! Backend that drives an already-installed slideshow viewer (feh by default).
//!
//! The viewer is spawned on a generated filelist in sequence order and stepped
//! with `SIGUSR1` (next) and `SIGUSR2` (previous). It wraps around at both ends.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::ViewerOptions;
use crate::error::BackendError;
use crate::loader::{Loader, PlaybackSequence};
use crate::render::{Direction, Frame, RenderBackend};

const FILELIST_BLOCK: usize = 512;
const REAP_INTERVAL: Duration = Duration::from_millis(100);

static NEXT_FILELIST: AtomicU64 = AtomicU64::new(1);

/// Control channel to the viewer process.
pub trait ViewerRemote: Send {
    fn step(&mut self, direction: Direction) -> Result<(), BackendError>;
    fn terminate(&mut self) -> Result<(), BackendError>;
}

/// A spawned viewer process.
pub struct ProcessRemote {
    child: Arc<Mutex<Child>>,
    pid: u32,
    /// Set once we kill the viewer ourselves; its exit is then expected.
    stopping: Arc<AtomicBool>,
}

impl ProcessRemote {
    pub fn spawn(options: &ViewerOptions, filelist: &Path) -> Result<Self, BackendError> {
        let child = Command::new(&options.command)
            .args(&options.args)
            .arg("--filelist")
            .arg(filelist)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|err| {
                BackendError::Fatal(format!(
                    "failed to start viewer {}: {err}",
                    options.command.display()
                ))
            })?;
        let pid = child.id();
        info!(pid, command = %options.command.display(), "viewer started");
        Ok(Self {
            child: Arc::new(Mutex::new(child)),
            pid,
            stopping: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Call `on_exit` from a reaper thread if the viewer exits on its own.
    pub fn watch<F>(&self, on_exit: F) -> Result<(), BackendError>
    where
        F: FnOnce(String) + Send + 'static,
    {
        let child = Arc::clone(&self.child);
        let stopping = Arc::clone(&self.stopping);
        std::thread::Builder::new()
            .name(format!("viewer-reaper-{}", self.pid))
            .spawn(move || {
                loop {
                    if stopping.load(Ordering::SeqCst) {
                        return;
                    }
                    let state = lock_child(&child).try_wait();
                    let detail = match state {
                        Ok(None) => {
                            std::thread::sleep(REAP_INTERVAL);
                            continue;
                        }
                        Ok(Some(status)) => format!("viewer exited: {status}"),
                        Err(err) => format!("viewer state unknown: {err}"),
                    };
                    if !stopping.load(Ordering::SeqCst) {
                        warn!(%detail, "viewer went away");
                        on_exit(detail);
                    }
                    return;
                }
            })
            .map(|_| ())
            .map_err(|err| BackendError::Fatal(format!("failed to watch viewer: {err}")))
    }

    fn ensure_running(&self) -> Result<(), BackendError> {
        match lock_child(&self.child).try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => Err(BackendError::Fatal(format!("viewer exited: {status}"))),
            Err(err) => Err(BackendError::Fatal(format!("viewer state unknown: {err}"))),
        }
    }
}

fn lock_child(child: &Mutex<Child>) -> MutexGuard<'_, Child> {
    child.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ViewerRemote for ProcessRemote {
    fn step(&mut self, direction: Direction) -> Result<(), BackendError> {
        self.ensure_running()?;
        send_signal(self.pid, direction)
    }

    fn terminate(&mut self) -> Result<(), BackendError> {
        self.stopping.store(true, Ordering::SeqCst);
        if self.ensure_running().is_err() {
            return Ok(());
        }
        let mut child = lock_child(&self.child);
        child
            .kill()
            .and_then(|()| child.wait().map(|_| ()))
            .map_err(|err| BackendError::Fatal(format!("failed to stop viewer: {err}")))
    }
}

impl Drop for ProcessRemote {
    fn drop(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, direction: Direction) -> Result<(), BackendError> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let signal = match direction {
        Direction::Forward => Signal::SIGUSR1,
        Direction::Backward => Signal::SIGUSR2,
    };
    let raw = i32::try_from(pid)
        .map_err(|_| BackendError::Fatal(format!("viewer pid {pid} out of range")))?;
    kill(Pid::from_raw(raw), signal)
        .map_err(|err| BackendError::Fatal(format!("failed to signal viewer: {err}")))
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _direction: Direction) -> Result<(), BackendError> {
    Err(BackendError::Fatal(
        "viewer navigation requires POSIX signals".into(),
    ))
}

/// Write the sequence's paths, one per line, reading the index a block at a time.
///
/// Every entry must still resolve: a missing record would shift every later
/// line away from its sequence position. On failure the partial file is removed.
pub fn write_filelist(
    loader: &Loader,
    sequence: &PlaybackSequence,
    path: &Path,
) -> Result<usize, BackendError> {
    let written = fill_filelist(loader, sequence, path).inspect_err(|_| {
        if let Err(err) = std::fs::remove_file(path) {
            debug!(path = %path.display(), %err, "no partial filelist to remove");
        }
    })?;
    debug!(entries = written, path = %path.display(), "filelist written");
    Ok(written)
}

fn fill_filelist(
    loader: &Loader,
    sequence: &PlaybackSequence,
    path: &Path,
) -> Result<usize, BackendError> {
    let io_err = |err: std::io::Error| {
        BackendError::Fatal(format!("failed to write filelist {}: {err}", path.display()))
    };
    let mut out = BufWriter::new(File::create(path).map_err(io_err)?);
    let mut written = 0;
    let mut start = 0;
    while start < sequence.len() {
        let expected = FILELIST_BLOCK.min(sequence.len() - start);
        let block = loader
            .block(sequence, start, FILELIST_BLOCK)
            .map_err(|err| BackendError::Fatal(format!("failed to read sequence: {err}")))?;
        if block.len() != expected {
            return Err(BackendError::Fatal(format!(
                "{} of positions {start}..{} are no longer in the index",
                expected - block.len(),
                start + expected
            )));
        }
        for record in &block {
            out.write_all(record.path.as_os_str().as_encoded_bytes())
                .and_then(|()| out.write_all(b"\n"))
                .map_err(io_err)?;
        }
        written += block.len();
        start += FILELIST_BLOCK;
    }
    out.flush().map_err(io_err)?;
    Ok(written)
}

pub struct ExternalViewer<R: ViewerRemote> {
    remote: R,
    position: usize,
    len: usize,
    filelist: Option<PathBuf>,
}

impl ExternalViewer<ProcessRemote> {
    /// Write a filelist for `sequence` and spawn the configured viewer on it.
    pub fn spawn(
        options: &ViewerOptions,
        loader: &Loader,
        sequence: &PlaybackSequence,
    ) -> Result<Self, BackendError> {
        let dir = options
            .filelist_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let filelist = dir.join(format!(
            "draw-this-{}-{}.filelist",
            std::process::id(),
            NEXT_FILELIST.fetch_add(1, Ordering::Relaxed)
        ));
        let len = write_filelist(loader, sequence, &filelist)?;
        let remote = ProcessRemote::spawn(options, &filelist).inspect_err(|_| {
            if let Err(err) = std::fs::remove_file(&filelist) {
                warn!(path = %filelist.display(), %err, "failed to remove filelist");
            }
        })?;
        Ok(Self {
            remote,
            position: 0,
            len,
            filelist: Some(filelist),
        })
    }

    /// Report the viewer exiting on its own through `on_exit`, even while no
    /// navigation touches it.
    pub fn on_exit<F>(self, on_exit: F) -> Result<Self, BackendError>
    where
        F: FnOnce(String) + Send + 'static,
    {
        self.remote.watch(on_exit)?;
        Ok(self)
    }
}

impl<R: ViewerRemote> ExternalViewer<R> {
    /// A viewer already showing position 0 of a `len`-entry list.
    pub const fn with_remote(remote: R, len: usize) -> Self {
        Self {
            remote,
            position: 0,
            len,
            filelist: None,
        }
    }

    #[must_use]
    pub const fn position(&self) -> usize {
        self.position
    }

    fn step(&mut self, direction: Direction) -> Result<(), BackendError> {
        if self.len == 0 {
            return Ok(());
        }
        self.remote.step(direction)?;
        self.position = match direction {
            Direction::Forward => (self.position + 1) % self.len,
            Direction::Backward => (self.position + self.len - 1) % self.len,
        };
        Ok(())
    }
}

/// Steps and direction for the shorter way around a ring of `len` entries.
fn shortest_route(from: usize, to: usize, len: usize) -> (usize, Direction) {
    if len == 0 {
        return (0, Direction::Forward);
    }
    let forward = (to % len + len - from % len) % len;
    let backward = (len - forward) % len;
    if forward <= backward {
        (forward, Direction::Forward)
    } else {
        (backward, Direction::Backward)
    }
}

impl<R: ViewerRemote> RenderBackend for ExternalViewer<R> {
    fn display(&mut self, frame: Frame) -> Result<(), BackendError> {
        let target = frame.index();
        if target >= self.len {
            return Err(BackendError::Frame(format!(
                "position {target} outside filelist of {}",
                self.len
            )));
        }
        let (steps, direction) = shortest_route(self.position, target, self.len);
        for _ in 0..steps {
            self.step(direction)?;
        }
        Ok(())
    }

    fn advance(&mut self, direction: Direction) -> Result<(), BackendError> {
        self.step(direction)
    }

    fn close(&mut self) -> Result<(), BackendError> {
        let result = self.remote.terminate();
        if let Some(filelist) = self.filelist.take() {
            if let Err(err) = std::fs::remove_file(&filelist) {
                warn!(path = %filelist.display(), %err, "failed to remove filelist");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recorder {
        steps: Arc<Mutex<Vec<Direction>>>,
        dead: Arc<Mutex<bool>>,
    }

    impl ViewerRemote for Recorder {
        fn step(&mut self, direction: Direction) -> Result<(), BackendError> {
            if *self.dead.lock().unwrap() {
                return Err(BackendError::Fatal("viewer exited".into()));
            }
            self.steps.lock().unwrap().push(direction);
            Ok(())
        }

        fn terminate(&mut self) -> Result<(), BackendError> {
            *self.dead.lock().unwrap() = true;
            Ok(())
        }
    }

    #[test]
    fn route_takes_the_short_way_round() {
        assert_eq!(shortest_route(0, 3, 10), (3, Direction::Forward));
        assert_eq!(shortest_route(0, 8, 10), (2, Direction::Backward));
        assert_eq!(shortest_route(9, 0, 10), (1, Direction::Forward));
        assert_eq!(shortest_route(4, 4, 10), (0, Direction::Forward));
        assert_eq!(shortest_route(0, 5, 10), (5, Direction::Forward));
    }

    #[test]
    fn display_steps_the_viewer_to_the_position() {
        let rec = Recorder::default();
        let mut viewer = ExternalViewer::with_remote(rec.clone(), 10);
        viewer.advance(Direction::Forward).unwrap();
        viewer.display(Frame::Listed { index: 1 }).unwrap();
        assert_eq!(rec.steps.lock().unwrap().len(), 1);

        viewer.display(Frame::Listed { index: 8 }).unwrap();
        assert_eq!(viewer.position(), 8);
        let steps = rec.steps.lock().unwrap().clone();
        assert_eq!(&steps[1..], &[Direction::Backward; 3]);

        viewer.advance(Direction::Forward).unwrap();
        viewer.advance(Direction::Forward).unwrap();
        assert_eq!(viewer.position(), 0);

        assert!(matches!(
            viewer.display(Frame::Listed { index: 10 }),
            Err(BackendError::Frame(_))
        ));
    }

    #[test]
    fn dead_viewer_is_fatal() {
        let rec = Recorder::default();
        let mut viewer = ExternalViewer::with_remote(rec.clone(), 3);
        viewer.close().unwrap();
        let err = viewer.advance(Direction::Forward).unwrap_err();
        assert!(err.is_fatal());
    }

    #[cfg(unix)]
    #[test]
    fn signals_reach_a_live_process_and_exit_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let filelist = dir.path().join("list");
        std::fs::write(&filelist, "a\nb\n").unwrap();

        let patient = ViewerOptions {
            command: PathBuf::from("sh"),
            args: vec!["-c".into(), "trap '' USR1 USR2; exec sleep 30".into()],
            filelist_dir: None,
            ..ViewerOptions::default()
        };
        let mut viewer = ExternalViewer::with_remote(ProcessRemote::spawn(&patient, &filelist).unwrap(), 2);
        std::thread::sleep(std::time::Duration::from_millis(100));
        viewer.advance(Direction::Forward).unwrap();
        viewer.close().unwrap();

        let quitter = ViewerOptions {
            command: PathBuf::from("sh"),
            args: vec!["-c".into(), "exit 0".into()],
            filelist_dir: None,
            ..ViewerOptions::default()
        };
        let mut viewer = ExternalViewer::with_remote(ProcessRemote::spawn(&quitter, &filelist).unwrap(), 2);
        std::thread::sleep(std::time::Duration::from_millis(300));
        assert!(viewer.advance(Direction::Forward).unwrap_err().is_fatal());
    }

    #[cfg(unix)]
    #[test]
    fn exit_is_reported_without_any_navigation() {
        let dir = tempfile::tempdir().unwrap();
        let filelist = dir.path().join("list");
        std::fs::write(&filelist, "a\n").unwrap();
        let options = ViewerOptions {
            command: PathBuf::from("sh"),
            args: vec!["-c".into(), "exit 3".into()],
            ..ViewerOptions::default()
        };
        let remote = ProcessRemote::spawn(&options, &filelist).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        remote.watch(move |detail| tx.send(detail).unwrap()).unwrap();
        let detail = rx.recv_timeout(std::time::Duration::from_secs(3)).unwrap();
        assert!(detail.contains("viewer exited"), "{detail}");
    }

    #[cfg(unix)]
    #[test]
    fn stopping_the_viewer_is_not_an_exit() {
        let dir = tempfile::tempdir().unwrap();
        let filelist = dir.path().join("list");
        std::fs::write(&filelist, "a\n").unwrap();
        let options = ViewerOptions {
            command: PathBuf::from("sh"),
            args: vec!["-c".into(), "exec sleep 30".into()],
            ..ViewerOptions::default()
        };
        let mut remote = ProcessRemote::spawn(&options, &filelist).unwrap();
        let (tx, rx) = std::sync::mpsc::channel::<String>();
        remote.watch(move |detail| tx.send(detail).unwrap()).unwrap();
        remote.terminate().unwrap();
        assert!(rx.recv_timeout(std::time::Duration::from_millis(500)).is_err());
    }

    fn indexed(dir: &Path, n: usize) -> (Loader, PlaybackSequence, crate::store::RootId) {
        let mut store = crate::store::IndexStore::open_in_memory(8).unwrap();
        let root = store.add_root(dir).unwrap();
        let then = chrono::Utc::now() - chrono::Duration::hours(1);
        for i in 0..n {
            store
                .upsert(root.id, &dir.join(format!("{i}.jpg")), None, then)
                .unwrap();
        }
        store.flush().unwrap();
        let mut loader = Loader::new(store, Some(2));
        let sequence = loader.start_session(&[root.id]).unwrap();
        (loader, sequence, root.id)
    }

    #[test]
    fn filelist_keeps_one_line_per_position() {
        let dir = tempfile::tempdir().unwrap();
        let (loader, sequence, _) = indexed(dir.path(), 5);
        let filelist = dir.path().join("list");
        assert_eq!(write_filelist(&loader, &sequence, &filelist).unwrap(), 5);
        let lines: Vec<String> = std::fs::read_to_string(&filelist)
            .unwrap()
            .lines()
            .map(str::to_owned)
            .collect();
        let records = loader.block(&sequence, 0, 5).unwrap();
        let expected: Vec<String> = records
            .iter()
            .map(|r| r.path.display().to_string())
            .collect();
        assert_eq!(lines, expected);
    }

    #[test]
    fn records_gone_from_the_index_abort_the_filelist() {
        let dir = tempfile::tempdir().unwrap();
        let (mut loader, sequence, root) = indexed(dir.path(), 4);
        // Refresh one record, then prune the three never seen since.
        let now = chrono::Utc::now();
        let kept = loader.block(&sequence, 0, 1).unwrap().remove(0);
        loader
            .store_mut()
            .upsert(root, &kept.path, None, now)
            .unwrap();
        assert_eq!(loader.store_mut().prune_unseen(root, now).unwrap(), 3);

        let filelist = dir.path().join("list");
        let err = write_filelist(&loader, &sequence, &filelist).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("no longer in the index"), "{err}");
        assert!(!filelist.exists());
    }

    #[test]
    fn failed_viewer_start_leaves_no_filelist_behind() {
        let dir = tempfile::tempdir().unwrap();
        let lists = tempfile::tempdir().unwrap();
        let (loader, sequence, _) = indexed(dir.path(), 3);
        let options = ViewerOptions {
            command: PathBuf::from("/nonexistent/draw-this-viewer"),
            filelist_dir: Some(lists.path().to_path_buf()),
            ..ViewerOptions::default()
        };
        assert!(ExternalViewer::spawn(&options, &loader, &sequence).is_err());
        assert_eq!(std::fs::read_dir(lists.path()).unwrap().count(), 0);
    }

    #[test]
    fn missing_viewer_fails_to_start() {
        let options = ViewerOptions {
            command: PathBuf::from("/nonexistent/draw-this-viewer"),
            ..ViewerOptions::default()
        };
        let err = ProcessRemote::spawn(&options, Path::new("/tmp/none")).err().unwrap();
        assert!(err.is_fatal());
    }
}
