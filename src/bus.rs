//! Ordered, typed signal delivery between the session controller and render backends.
//!
//! Every subscriber owns a bounded queue. When a queue is full, the policy of
//! the incoming signal's kind decides: `Block` waits for space, `DropOldest`
//! evicts the oldest queued signal of the same kind, so the newest of each
//! droppable kind always survives. With none of its kind queued, a droppable
//! signal waits like `Block`. `session_ended` bypasses both and terminates every
//! queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::Stream;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::events::{SenderId, Signal, SignalKind, SignalTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Publisher waits until the subscriber has room.
    Block,
    /// Oldest queued signal of the same kind is discarded to make room.
    DropOldest,
}

#[derive(Debug, Clone)]
pub struct DeliveryPolicy {
    by_tag: HashMap<SignalTag, Delivery>,
}

impl DeliveryPolicy {
    #[must_use]
    pub fn with(mut self, tag: SignalTag, delivery: Delivery) -> Self {
        self.by_tag.insert(tag, delivery);
        self
    }

    #[must_use]
    pub fn for_tag(&self, tag: SignalTag) -> Delivery {
        self.by_tag.get(&tag).copied().unwrap_or(Delivery::Block)
    }
}

impl Default for DeliveryPolicy {
    /// Navigation and frame notifications only matter in their latest form.
    fn default() -> Self {
        Self {
            by_tag: HashMap::from([
                (SignalTag::Navigate, Delivery::DropOldest),
                (SignalTag::FrameReady, Delivery::DropOldest),
            ]),
        }
    }
}

type Filter = Box<dyn Fn(&SignalKind) -> bool + Send + Sync>;

#[derive(Default)]
struct QueueState {
    items: VecDeque<Signal>,
    /// `session_ended` has been enqueued; nothing else is accepted.
    terminated: bool,
    /// `session_ended` has been consumed; the sequence is over.
    finished: bool,
    /// The subscription was dropped.
    closed: bool,
    dropped: u64,
}

struct Queue {
    state: Mutex<QueueState>,
    filter: Filter,
    readable: Notify,
    writable: Notify,
}

impl Queue {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn offer(&self, signal: &Signal, capacity: usize, policy: &DeliveryPolicy) -> bool {
        let terminating = matches!(signal.kind, SignalKind::SessionEnded { .. });
        if !terminating && !(self.filter)(&signal.kind) {
            return false;
        }
        let delivery = policy.for_tag(signal.kind.tag());
        loop {
            let writable = self.writable.notified();
            {
                let mut st = self.lock();
                if st.closed || st.terminated {
                    return false;
                }
                if terminating {
                    st.items.push_back(signal.clone());
                    st.terminated = true;
                    drop(st);
                    self.readable.notify_waiters();
                    self.writable.notify_waiters();
                    return true;
                }
                if st.items.len() < capacity {
                    st.items.push_back(signal.clone());
                    drop(st);
                    self.readable.notify_waiters();
                    return true;
                }
                if delivery == Delivery::DropOldest {
                    let tag = signal.kind.tag();
                    let victim = st.items.iter().position(|s| s.kind.tag() == tag);
                    if let Some(pos) = victim {
                        if let Some(old) = st.items.remove(pos) {
                            debug!(sender = old.sender.0, seq = old.seq, kind = ?old.kind.tag(), "subscriber full; dropped oldest");
                        }
                        st.dropped += 1;
                        st.items.push_back(signal.clone());
                        drop(st);
                        self.readable.notify_waiters();
                        return true;
                    }
                }
            }
            trace!(kind = ?signal.kind.tag(), "subscriber full; publisher waiting");
            writable.await;
        }
    }
}

struct BusInner {
    capacity: usize,
    policy: DeliveryPolicy,
    subscribers: Mutex<Vec<Arc<Queue>>>,
    next_sender: AtomicU32,
    ended: AtomicBool,
}

/// Session-scoped signal bus. Cheap to clone.
#[derive(Clone)]
pub struct SignalBus {
    inner: Arc<BusInner>,
}

impl SignalBus {
    #[must_use]
    pub fn new(capacity: usize, policy: DeliveryPolicy) -> Self {
        Self {
            inner: Arc::new(BusInner {
                capacity: capacity.max(1),
                policy,
                subscribers: Mutex::new(Vec::new()),
                next_sender: AtomicU32::new(1),
                ended: AtomicBool::new(false),
            }),
        }
    }

    /// Register a new sender.
    #[must_use]
    pub fn publisher(&self, name: &str) -> Publisher {
        let id = SenderId(self.inner.next_sender.fetch_add(1, Ordering::Relaxed));
        debug!(sender = id.0, name, "publisher registered");
        Publisher {
            bus: self.clone(),
            id,
            seq: AtomicU64::new(0),
            order: tokio::sync::Mutex::new(()),
        }
    }

    /// Subscribe to signals accepted by `filter`. `session_ended` is always delivered.
    pub fn subscribe<F>(&self, filter: F) -> Subscription
    where
        F: Fn(&SignalKind) -> bool + Send + Sync + 'static,
    {
        let queue = Arc::new(Queue {
            state: Mutex::new(QueueState::default()),
            filter: Box::new(filter),
            readable: Notify::new(),
            writable: Notify::new(),
        });
        let mut subs = self.lock_subscribers();
        subs.push(Arc::clone(&queue));
        // Checked under the subscriber lock: either the terminating publish
        // snapshots this queue or its flag store is visible here.
        if self.has_ended() {
            let mut st = queue.lock();
            st.terminated = true;
            st.finished = true;
        }
        drop(subs);
        Subscription { queue }
    }

    pub fn subscribe_all(&self) -> Subscription {
        self.subscribe(|_| true)
    }

    /// `true` once `session_ended` has been published.
    #[must_use]
    pub fn has_ended(&self) -> bool {
        self.inner.ended.load(Ordering::SeqCst)
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, Vec<Arc<Queue>>> {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn live_queues(&self) -> Vec<Arc<Queue>> {
        let mut subs = self.lock_subscribers();
        subs.retain(|q| !q.lock().closed);
        subs.clone()
    }

    async fn deliver(&self, signal: &Signal) -> usize {
        let mut accepted = 0;
        for queue in self.live_queues() {
            if queue
                .offer(signal, self.inner.capacity, &self.inner.policy)
                .await
            {
                accepted += 1;
            }
        }
        accepted
    }
}

/// A sender on the bus. Signals from one publisher reach each subscriber in publish order.
pub struct Publisher {
    bus: SignalBus,
    id: SenderId,
    seq: AtomicU64,
    order: tokio::sync::Mutex<()>,
}

impl Publisher {
    #[must_use]
    pub const fn id(&self) -> SenderId {
        self.id
    }

    /// Publish `kind` to every matching subscriber. Returns how many accepted it.
    ///
    /// May wait on full subscribers for `Block` kinds. `session_ended` never
    /// waits and releases every waiting publisher.
    pub async fn publish(&self, kind: SignalKind) -> usize {
        if self.bus.has_ended() {
            trace!(kind = ?kind.tag(), "bus ended; signal discarded");
            return 0;
        }
        if matches!(kind, SignalKind::SessionEnded { .. }) {
            self.bus.inner.ended.store(true, Ordering::SeqCst);
            let signal = self.stamp(kind);
            return self.bus.deliver(&signal).await;
        }
        let _order = self.order.lock().await;
        let signal = self.stamp(kind);
        self.bus.deliver(&signal).await
    }

    /// [`publish`](Self::publish) for threads outside the async runtime.
    pub fn blocking_publish(&self, kind: SignalKind) -> usize {
        futures::executor::block_on(self.publish(kind))
    }

    fn stamp(&self, kind: SignalKind) -> Signal {
        Signal {
            sender: self.id,
            seq: self.seq.fetch_add(1, Ordering::AcqRel) + 1,
            kind,
        }
    }
}

/// One subscriber's lazy view of the bus. Ends after `session_ended`.
pub struct Subscription {
    queue: Arc<Queue>,
}

impl Subscription {
    /// Next signal, waiting if none is queued. `None` once the session has ended.
    pub async fn recv(&mut self) -> Option<Signal> {
        loop {
            let readable = self.queue.readable.notified();
            if let Some(next) = self.poll_queue() {
                return next;
            }
            readable.await;
        }
    }

    /// Next queued signal without waiting.
    pub fn try_recv(&mut self) -> Option<Signal> {
        self.poll_queue().flatten()
    }

    /// [`recv`](Self::recv) for threads outside the async runtime.
    pub fn blocking_recv(&mut self) -> Option<Signal> {
        futures::executor::block_on(self.recv())
    }

    /// Signals discarded for this subscriber under the drop-oldest policy.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.queue.lock().dropped
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.queue.lock().finished
    }

    pub fn into_stream(self) -> impl Stream<Item = Signal> {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|signal| (signal, sub))
        })
    }

    /// `Some(None)`: sequence over. `Some(Some(_))`: a signal. `None`: nothing queued yet.
    fn poll_queue(&self) -> Option<Option<Signal>> {
        let mut st = self.queue.lock();
        if st.finished {
            return Some(None);
        }
        let signal = st.items.pop_front()?;
        if matches!(signal.kind, SignalKind::SessionEnded { .. }) {
            st.finished = true;
            st.items.clear();
        }
        drop(st);
        self.queue.writable.notify_waiters();
        Some(Some(signal))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.lock().closed = true;
        self.queue.writable.notify_waiters();
    }
}
