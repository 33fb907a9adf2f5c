//! Rolling decode buffer: a bounded window of decoded frames around the current position.
//!
//! The window always covers `[current - radius, current + radius]` clipped to the
//! sequence. Every slot in it is in exactly one state:
//!
//! ```text
//! absent -> pending-thumbnail -> thumbnail-ready -> pending-full -> full-ready
//!              \____________________ failed ______________/
//! ```
//!
//! Frames below the thumbnail threshold skip straight to `pending-full`. Decode
//! results carry the ticket issued when they were scheduled and are applied only
//! while the slot still waits on that ticket.

use std::collections::{BTreeMap, HashMap};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::BufferOptions;
use crate::decode::{DecodeJob, DecodedFrame};
use crate::error::DecodeError;
use crate::events::Tier;
use crate::loader::{Loader, PlaybackSequence};
use crate::scan::has_extension;
use crate::store::ImageRecord;

/// A sequence index resolved to something decodable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRequest {
    pub index: usize,
    pub path: PathBuf,
    /// On-disk size, used by the thumbnail-first policy. Zero when unknown.
    pub byte_len: u64,
    pub cached_thumbnail: Option<PathBuf>,
    /// Where a generated thumbnail should be kept, when none is cached yet.
    pub thumbnail_cache: Option<PathBuf>,
}

/// Outcome of resolving one sequence index.
pub type Resolution = Result<FrameRequest, DecodeError>;

/// Maps sequence indices to image files.
pub trait FrameSource: Send + Sync + 'static {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn resolve(&self, index: usize) -> Resolution;

    /// Resolve several indices at once. Sources backed by the index override
    /// this to read one block instead of one record per index.
    fn resolve_many(&self, indices: &[usize]) -> Vec<(usize, Resolution)> {
        indices.iter().map(|&index| (index, self.resolve(index))).collect()
    }

    /// A thumbnail for `index` was written to `thumbnail`.
    fn remember_thumbnail(&self, _index: usize, _thumbnail: &Path) {}
}

/// Frames of a playback sequence, looked up through the shared loader.
pub struct SequenceSource {
    loader: Arc<Mutex<Loader>>,
    sequence: PlaybackSequence,
    thumbnail_cache: Option<PathBuf>,
}

impl SequenceSource {
    #[must_use]
    pub const fn new(loader: Arc<Mutex<Loader>>, sequence: PlaybackSequence) -> Self {
        Self {
            loader,
            sequence,
            thumbnail_cache: None,
        }
    }

    /// Keep generated thumbnails under `dir`, one `<record id>.png` per image.
    #[must_use]
    pub fn with_thumbnail_cache(mut self, dir: impl Into<PathBuf>) -> Self {
        self.thumbnail_cache = Some(dir.into());
        self
    }

    fn loader(&self) -> MutexGuard<'_, Loader> {
        self.loader.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request_for(&self, index: usize, record: Option<ImageRecord>) -> Resolution {
        let record = record.ok_or_else(|| DecodeError::Unresolved {
            index,
            detail: "record is no longer indexed".into(),
        })?;
        let thumbnail_cache = match (&record.thumbnail, &self.thumbnail_cache) {
            (None, Some(dir)) => Some(dir.join(format!("{}.png", record.id.0))),
            _ => None,
        };
        Ok(FrameRequest {
            index,
            byte_len: file_len(&record.path),
            path: record.path,
            cached_thumbnail: record.thumbnail,
            thumbnail_cache,
        })
    }
}

impl FrameSource for SequenceSource {
    fn len(&self) -> usize {
        self.sequence.len()
    }

    fn resolve(&self, index: usize) -> Resolution {
        let record = self
            .loader()
            .resolve(&self.sequence, index)
            .map_err(|err| DecodeError::Unresolved {
                index,
                detail: err.to_string(),
            })?;
        self.request_for(index, record)
    }

    fn resolve_many(&self, indices: &[usize]) -> Vec<(usize, Resolution)> {
        let (Some(&lo), Some(&hi)) = (indices.iter().min(), indices.iter().max()) else {
            return Vec::new();
        };
        // One block read; file sizes are taken after the loader is released.
        let block = self.loader().block(&self.sequence, lo, hi - lo + 1);
        let mut by_id: HashMap<_, _> = match block {
            Ok(records) => records.into_iter().map(|r| (r.id, r)).collect(),
            Err(err) => {
                let detail = err.to_string();
                return indices
                    .iter()
                    .map(|&index| {
                        let detail = detail.clone();
                        (index, Err(DecodeError::Unresolved { index, detail }))
                    })
                    .collect();
            }
        };
        indices
            .iter()
            .map(|&index| {
                let record = self.sequence.id_at(index).and_then(|id| by_id.remove(&id));
                (index, self.request_for(index, record))
            })
            .collect()
    }

    fn remember_thumbnail(&self, index: usize, thumbnail: &Path) {
        let Some(id) = self.sequence.id_at(index) else {
            return;
        };
        if let Err(err) = self.loader().store_mut().set_thumbnail(id, Some(thumbnail)) {
            warn!(index, %err, path = %thumbnail.display(), "failed to record thumbnail");
        }
    }
}

/// A fixed list of paths.
#[derive(Debug, Clone, Default)]
pub struct PathListSource {
    paths: Vec<PathBuf>,
}

impl PathListSource {
    #[must_use]
    pub const fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }
}

impl FrameSource for PathListSource {
    fn len(&self) -> usize {
        self.paths.len()
    }

    fn resolve(&self, index: usize) -> Resolution {
        let path = self
            .paths
            .get(index)
            .ok_or_else(|| DecodeError::Unresolved {
                index,
                detail: "index out of range".into(),
            })?
            .clone();
        Ok(FrameRequest {
            index,
            byte_len: file_len(&path),
            path,
            cached_thumbnail: None,
            thumbnail_cache: None,
        })
    }
}

fn file_len(path: &std::path::Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// One scheduled decode. `job` is an error when the index could not be resolved.
#[derive(Debug)]
pub struct DecodeTask {
    pub index: usize,
    pub ticket: u64,
    pub tier: Tier,
    pub job: Result<DecodeJob, DecodeError>,
    /// Cancelled once the slot leaves the window.
    pub cancel: CancellationToken,
}

/// Receiving ends of the prefetch queues.
pub struct DecodeQueues {
    pub forward: UnboundedReceiver<DecodeTask>,
    pub backward: UnboundedReceiver<DecodeTask>,
}

/// Non-blocking answer to [`RollingBuffer::get`].
#[derive(Debug, Clone)]
pub enum Lookup {
    /// Best tier currently decoded.
    Ready { tier: Tier, frame: Arc<DecodedFrame> },
    Pending,
    Failed(String),
    /// Outside the window, or evicted under memory pressure.
    Absent,
}

/// Payload-free view of a slot, for inspection and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    Absent,
    PendingThumbnail,
    ThumbnailReady,
    PendingFull,
    FullReady,
    Failed,
}

/// Outcome of handing a decode result back to the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Applied(Tier),
    Failed(String),
    /// The slot left the window or stopped waiting on this ticket.
    Discarded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub applied: u64,
    pub discarded: u64,
    pub failed: u64,
    /// Tiers released to stay within the memory budget.
    pub evicted: u64,
    pub resident_bytes: u64,
}

#[derive(Debug)]
enum SlotState {
    Absent,
    PendingThumbnail {
        ticket: u64,
    },
    ThumbnailReady {
        thumb: Arc<DecodedFrame>,
    },
    PendingFull {
        ticket: u64,
        thumb: Option<Arc<DecodedFrame>>,
    },
    FullReady {
        full: Arc<DecodedFrame>,
        thumb: Option<Arc<DecodedFrame>>,
    },
    Failed {
        detail: String,
    },
}

impl SlotState {
    const fn phase(&self) -> SlotPhase {
        match self {
            Self::Absent => SlotPhase::Absent,
            Self::PendingThumbnail { .. } => SlotPhase::PendingThumbnail,
            Self::ThumbnailReady { .. } => SlotPhase::ThumbnailReady,
            Self::PendingFull { .. } => SlotPhase::PendingFull,
            Self::FullReady { .. } => SlotPhase::FullReady,
            Self::Failed { .. } => SlotPhase::Failed,
        }
    }

    fn resident_bytes(&self) -> u64 {
        let bytes = |f: &Option<Arc<DecodedFrame>>| f.as_ref().map_or(0, |f| f.byte_len());
        match self {
            Self::ThumbnailReady { thumb } => thumb.byte_len(),
            Self::PendingFull { thumb, .. } => bytes(thumb),
            Self::FullReady { full, thumb } => full.byte_len() + bytes(thumb),
            _ => 0,
        }
    }

    fn tiers(&self) -> impl Iterator<Item = (Tier, u64)> {
        let (full, thumb) = match self {
            Self::ThumbnailReady { thumb } => (None, Some(thumb)),
            Self::PendingFull { thumb, .. } => (None, thumb.as_ref()),
            Self::FullReady { full, thumb } => (Some(full), thumb.as_ref()),
            _ => (None, None),
        };
        full.map(|f| (Tier::Full, f.byte_len()))
            .into_iter()
            .chain(thumb.map(|t| (Tier::Thumbnail, t.byte_len())))
    }
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    request: Option<FrameRequest>,
    cancel: CancellationToken,
}

struct Window {
    len: usize,
    radius: usize,
    current: usize,
    budget: u64,
    thumbnail_threshold: u64,
    large_formats: Vec<String>,
    slots: BTreeMap<usize, Slot>,
    next_ticket: u64,
    stats: BufferStats,
}

impl Window {
    fn bounds(&self) -> Option<RangeInclusive<usize>> {
        self.bounds_around(self.current)
    }

    fn bounds_around(&self, current: usize) -> Option<RangeInclusive<usize>> {
        if self.len == 0 {
            return None;
        }
        let lo = current.saturating_sub(self.radius);
        let hi = current.saturating_add(self.radius).min(self.len - 1);
        Some(lo..=hi)
    }

    /// Indices a move to `target` would bring into the window.
    fn entering(&self, target: usize) -> Vec<usize> {
        let target = target.min(self.len.saturating_sub(1));
        self.bounds_around(target)
            .into_iter()
            .flatten()
            .filter(|i| !self.slots.contains_key(i))
            .collect()
    }

    fn ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn prefers_thumbnail(&self, request: &FrameRequest) -> bool {
        request.byte_len >= self.thumbnail_threshold
            || has_extension(&request.path, &self.large_formats)
    }

    /// `resolved` must hold a resolution for every index in [`entering`](Self::entering).
    fn move_to(
        &mut self,
        target: usize,
        resolved: &mut HashMap<usize, Resolution>,
    ) -> Vec<DecodeTask> {
        let mut tasks = Vec::new();
        if self.len == 0 {
            return tasks;
        }
        self.current = target.min(self.len - 1);
        let Some(bounds) = self.bounds() else {
            return tasks;
        };

        let current = self.current;
        let mut leaving: Vec<usize> = self
            .slots
            .keys()
            .copied()
            .filter(|i| !bounds.contains(i))
            .collect();
        leaving.sort_by_key(|i| std::cmp::Reverse(i.abs_diff(current)));
        for index in leaving {
            if let Some(slot) = self.slots.remove(&index) {
                slot.cancel.cancel();
                let released = slot.state.resident_bytes();
                self.stats.resident_bytes -= released;
                trace!(index, released, "slot left window");
            }
        }

        let mut entering: Vec<usize> = bounds.filter(|i| !self.slots.contains_key(i)).collect();
        entering.sort_by_key(|&i| (i.abs_diff(current), i < current));
        for index in entering {
            let resolution = resolved.remove(&index).unwrap_or_else(|| {
                Err(DecodeError::Unresolved {
                    index,
                    detail: "entered the window unresolved".into(),
                })
            });
            tasks.push(self.enter(index, resolution));
        }

        if let Some(task) = self.refresh_current() {
            tasks.push(task);
        }
        tasks
    }

    fn enter(&mut self, index: usize, resolution: Resolution) -> DecodeTask {
        let ticket = self.ticket();
        let cancel = CancellationToken::new();
        let (state, request, tier, job) = match resolution {
            Ok(request) => {
                let tier = if self.prefers_thumbnail(&request) {
                    Tier::Thumbnail
                } else {
                    Tier::Full
                };
                let state = match tier {
                    Tier::Thumbnail => SlotState::PendingThumbnail { ticket },
                    Tier::Full => SlotState::PendingFull {
                        ticket,
                        thumb: None,
                    },
                };
                let job = job_for(&request, tier);
                (state, Some(request), tier, Ok(job))
            }
            Err(err) => (
                SlotState::PendingFull {
                    ticket,
                    thumb: None,
                },
                None,
                Tier::Full,
                Err(err),
            ),
        };
        self.slots.insert(
            index,
            Slot {
                state,
                request,
                cancel: cancel.clone(),
            },
        );
        DecodeTask {
            index,
            ticket,
            tier,
            job,
            cancel,
        }
    }

    /// Re-schedule the full tier of a current slot that was downgraded or evicted.
    fn refresh_current(&mut self) -> Option<DecodeTask> {
        let index = self.current;
        let ticket = self.ticket();
        let slot = self.slots.get_mut(&index)?;
        let request = slot.request.clone()?;
        let thumb = match &slot.state {
            SlotState::ThumbnailReady { thumb } => Some(Arc::clone(thumb)),
            SlotState::Absent => None,
            _ => return None,
        };
        debug!(index, "re-scheduling full decode for current slot");
        slot.state = SlotState::PendingFull { ticket, thumb };
        Some(DecodeTask {
            index,
            ticket,
            tier: Tier::Full,
            job: Ok(job_for(&request, Tier::Full)),
            cancel: slot.cancel.clone(),
        })
    }

    fn complete(
        &mut self,
        index: usize,
        ticket: u64,
        result: Result<DecodedFrame, DecodeError>,
    ) -> (Completion, Option<DecodeTask>) {
        let expected = self.slots.get(&index).and_then(|slot| match slot.state {
            SlotState::PendingThumbnail { ticket } => Some((ticket, Tier::Thumbnail)),
            SlotState::PendingFull { ticket, .. } => Some((ticket, Tier::Full)),
            _ => None,
        });
        let tier = match expected {
            Some((expected, tier)) if expected == ticket => tier,
            _ => {
                self.stats.discarded += 1;
                trace!(index, ticket, "stale decode result discarded");
                return (Completion::Discarded, None);
            }
        };

        let frame = match result {
            Ok(frame) => Arc::new(frame),
            Err(err) => {
                let detail = err.to_string();
                if let Some(slot) = self.slots.get_mut(&index) {
                    self.stats.resident_bytes -= slot.state.resident_bytes();
                    slot.state = SlotState::Failed {
                        detail: detail.clone(),
                    };
                }
                self.stats.failed += 1;
                return (Completion::Failed(detail), None);
            }
        };

        let admitted = self.make_room(index, tier, frame.byte_len());
        let next_ticket = self.ticket();
        let Some(slot) = self.slots.get_mut(&index) else {
            return (Completion::Discarded, None);
        };
        let previous = std::mem::replace(&mut slot.state, SlotState::Absent);
        let mut follow_up = None;
        slot.state = match (tier, previous) {
            (Tier::Thumbnail, _) if admitted => {
                let request = slot.request.clone();
                if let Some(request) = request {
                    follow_up = Some(DecodeTask {
                        index,
                        ticket: next_ticket,
                        tier: Tier::Full,
                        job: Ok(job_for(&request, Tier::Full)),
                        cancel: slot.cancel.clone(),
                    });
                }
                SlotState::PendingFull {
                    ticket: next_ticket,
                    thumb: Some(Arc::clone(&frame)),
                }
            }
            (Tier::Thumbnail, _) => SlotState::Absent,
            (Tier::Full, SlotState::PendingFull { thumb, .. }) if admitted => SlotState::FullReady {
                full: Arc::clone(&frame),
                thumb,
            },
            (Tier::Full, SlotState::PendingFull { thumb: Some(thumb), .. }) => {
                SlotState::ThumbnailReady { thumb }
            }
            (Tier::Full, _) => SlotState::Absent,
        };

        if !admitted {
            self.stats.evicted += 1;
            debug!(index, ?tier, bytes = frame.byte_len(), "decoded frame does not fit budget");
            return (Completion::Discarded, None);
        }
        self.stats.resident_bytes += frame.byte_len();
        self.stats.applied += 1;
        (Completion::Applied(tier), follow_up)
    }

    /// Evict resident tiers, farthest first and full before thumbnail, until
    /// `incoming` bytes fit. Returns `false` when the incoming tier is itself the
    /// best eviction candidate.
    fn make_room(&mut self, index: usize, tier: Tier, incoming: u64) -> bool {
        while self.stats.resident_bytes + incoming > self.budget {
            let current = self.current;
            let rank = |i: usize, t: Tier| (i.abs_diff(current), t == Tier::Full, i);
            let victim = self
                .slots
                .iter()
                .flat_map(|(&i, slot)| slot.state.tiers().map(move |(t, _)| (i, t)))
                .max_by_key(|&(i, t)| rank(i, t));
            match victim {
                Some((i, t)) if rank(i, t) > rank(index, tier) => self.evict(i, t),
                _ => return false,
            }
        }
        true
    }

    fn evict(&mut self, index: usize, tier: Tier) {
        let Some(slot) = self.slots.get_mut(&index) else {
            return;
        };
        let before = slot.state.resident_bytes();
        let previous = std::mem::replace(&mut slot.state, SlotState::Absent);
        slot.state = match (tier, previous) {
            (Tier::Full, SlotState::FullReady { thumb: Some(thumb), .. }) => {
                SlotState::ThumbnailReady { thumb }
            }
            (Tier::Full, SlotState::FullReady { thumb: None, .. }) => SlotState::Absent,
            (Tier::Thumbnail, SlotState::FullReady { full, .. }) => {
                SlotState::FullReady { full, thumb: None }
            }
            (Tier::Thumbnail, SlotState::PendingFull { ticket, .. }) => {
                SlotState::PendingFull { ticket, thumb: None }
            }
            (Tier::Thumbnail, SlotState::ThumbnailReady { .. }) => SlotState::Absent,
            (_, other) => other,
        };
        let released = before - slot.state.resident_bytes();
        self.stats.resident_bytes -= released;
        self.stats.evicted += 1;
        debug!(index, ?tier, released, "evicted under memory pressure");
    }

    fn lookup(&self, index: usize) -> Lookup {
        let Some(slot) = self.slots.get(&index) else {
            return Lookup::Absent;
        };
        match &slot.state {
            SlotState::Absent => Lookup::Absent,
            SlotState::PendingThumbnail { .. } | SlotState::PendingFull { thumb: None, .. } => {
                Lookup::Pending
            }
            SlotState::ThumbnailReady { thumb } | SlotState::PendingFull { thumb: Some(thumb), .. } => {
                Lookup::Ready {
                    tier: Tier::Thumbnail,
                    frame: Arc::clone(thumb),
                }
            }
            SlotState::FullReady { full, .. } => Lookup::Ready {
                tier: Tier::Full,
                frame: Arc::clone(full),
            },
            SlotState::Failed { detail } => Lookup::Failed(detail.clone()),
        }
    }
}

fn job_for(request: &FrameRequest, tier: Tier) -> DecodeJob {
    DecodeJob {
        index: request.index,
        tier,
        path: request.path.clone(),
        cached_thumbnail: request.cached_thumbnail.clone(),
        thumbnail_cache: request.thumbnail_cache.clone(),
    }
}

/// Thread-safe handle shared by the controller, the prefetch task, and the accelerated backend.
pub struct RollingBuffer {
    window: Mutex<Window>,
    source: Arc<dyn FrameSource>,
    forward: UnboundedSender<DecodeTask>,
    backward: UnboundedSender<DecodeTask>,
}

impl RollingBuffer {
    /// A buffer positioned at index 0 with its initial window already scheduled.
    pub fn new(source: Arc<dyn FrameSource>, options: &BufferOptions) -> (Arc<Self>, DecodeQueues) {
        let (forward, forward_rx) = mpsc::unbounded_channel();
        let (backward, backward_rx) = mpsc::unbounded_channel();
        let window = Window {
            len: source.len(),
            radius: options.window_radius,
            current: 0,
            budget: options.memory_budget,
            thumbnail_threshold: options.thumbnail_threshold_bytes,
            large_formats: options.large_formats.clone(),
            slots: BTreeMap::new(),
            next_ticket: 0,
            stats: BufferStats::default(),
        };
        let buffer = Arc::new(Self {
            window: Mutex::new(window),
            source,
            forward,
            backward,
        });
        buffer.navigate_to(0);
        (
            buffer,
            DecodeQueues {
                forward: forward_rx,
                backward: backward_rx,
            },
        )
    }

    fn lock(&self) -> MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn current(&self) -> usize {
        self.lock().current
    }

    #[must_use]
    pub fn source(&self) -> &Arc<dyn FrameSource> {
        &self.source
    }

    /// Move by `delta`, clamped to the sequence. Returns the new position.
    pub fn navigate(&self, delta: i64) -> usize {
        let target = {
            let window = self.lock();
            let magnitude = usize::try_from(delta.unsigned_abs()).unwrap_or(usize::MAX);
            if delta >= 0 {
                window.current.saturating_add(magnitude)
            } else {
                window.current.saturating_sub(magnitude)
            }
        };
        self.navigate_to(target)
    }

    /// Jump to `index`, clamped to the sequence. Returns the new position.
    ///
    /// Entering indices are resolved with the window unlocked, so lookups and
    /// decode completions are never held up by the index.
    pub fn navigate_to(&self, index: usize) -> usize {
        let mut resolved = HashMap::new();
        loop {
            let mut window = self.lock();
            let missing: Vec<usize> = window
                .entering(index)
                .into_iter()
                .filter(|i| !resolved.contains_key(i))
                .collect();
            if missing.is_empty() {
                let tasks = window.move_to(index, &mut resolved);
                let current = window.current;
                for task in tasks {
                    self.enqueue(current, task);
                }
                return current;
            }
            drop(window);
            resolved.extend(self.source.resolve_many(&missing));
        }
    }

    /// Never blocks on decoding.
    #[must_use]
    pub fn get(&self, index: usize) -> Lookup {
        self.lock().lookup(index)
    }

    /// Apply a decode result if the slot is still waiting on `ticket`.
    pub fn complete(
        &self,
        index: usize,
        ticket: u64,
        result: Result<DecodedFrame, DecodeError>,
    ) -> Completion {
        let mut window = self.lock();
        let (completion, follow_up) = window.complete(index, ticket, result);
        if let Some(task) = follow_up {
            self.enqueue(window.current, task);
        }
        completion
    }

    #[must_use]
    pub fn phase(&self, index: usize) -> Option<SlotPhase> {
        self.lock().slots.get(&index).map(|slot| slot.state.phase())
    }

    /// Indices currently held by the window, ascending.
    #[must_use]
    pub fn resident(&self) -> Vec<usize> {
        self.lock().slots.keys().copied().collect()
    }

    #[must_use]
    pub fn bounds(&self) -> Option<RangeInclusive<usize>> {
        self.lock().bounds()
    }

    #[must_use]
    pub fn stats(&self) -> BufferStats {
        self.lock().stats
    }

    /// Cancel every scheduled decode.
    pub fn shutdown(&self) {
        for slot in self.lock().slots.values() {
            slot.cancel.cancel();
        }
    }

    fn enqueue(&self, current: usize, task: DecodeTask) {
        let queue = if task.index >= current {
            &self.forward
        } else {
            &self.backward
        };
        // The prefetch task may already be gone at session end.
        if queue.send(task).is_err() {
            trace!("prefetch queue closed");
        }
    }
}
