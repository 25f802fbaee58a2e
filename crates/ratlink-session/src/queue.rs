use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use ratlink_frame::Frame;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Thread-safe FIFO. Every enqueue wakes blocked consumers.
pub struct BlockingQueue<T> {
    items: Mutex<VecDeque<T>>,
    ready: Condvar,
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BlockingQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    /// Append an item and wake consumers.
    pub fn enqueue(&self, item: T) {
        lock(&self.items).push_back(item);
        self.ready.notify_all();
    }

    /// Put an item back at the head of the queue.
    pub fn requeue(&self, item: T) {
        lock(&self.items).push_front(item);
        self.ready.notify_all();
    }

    /// Take the head item, waiting up to `timeout` (`None` waits forever).
    pub fn dequeue(&self, timeout: Option<Duration>) -> Option<T> {
        let mut items = lock(&self.items);
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            match deadline {
                None => items = self.ready.wait(items).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return None;
                    }
                    items = self
                        .ready
                        .wait_timeout(items, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }

    /// Take the head item if there is one.
    pub fn try_dequeue(&self) -> Option<T> {
        lock(&self.items).pop_front()
    }

    /// Look at the head item without removing it.
    pub fn peek_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        lock(&self.items).front().map(f)
    }

    /// Remove every item matching `pred`, preserving the order of the rest.
    pub fn drain_where(&self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut items = lock(&self.items);
        let mut kept = VecDeque::with_capacity(items.len());
        let mut drained = Vec::new();
        for item in items.drain(..) {
            if pred(&item) {
                drained.push(item);
            } else {
                kept.push_back(item);
            }
        }
        *items = kept;
        drained
    }

    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.items).is_empty()
    }

    /// Wake every blocked consumer without adding anything.
    pub fn wake(&self) {
        self.ready.notify_all();
    }
}

/// A resettable one-shot flag other threads can block on.
#[derive(Default)]
pub struct Signal {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag and wake every waiter.
    pub fn set(&self) {
        *lock(&self.set) = true;
        self.cond.notify_all();
    }

    /// Lower the flag.
    pub fn clear(&self) {
        *lock(&self.set) = false;
    }

    pub fn is_set(&self) -> bool {
        *lock(&self.set)
    }

    /// Block until the flag is raised. Returns `false` on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = lock(&self.set);
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |set| !*set)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

type SentHook = Box<dyn FnOnce() + Send>;

/// A frame waiting for the transporter, with its two completion signals.
///
/// `sent` fires each time the transporter writes the frame to the channel;
/// `acked` fires once the peer acknowledges it. A block is usually sent long
/// before it is acknowledged, and may be sent several times.
pub struct OutboundFrame {
    frame: Frame,
    owner: u8,
    sent: Signal,
    sent_at: Mutex<Option<Instant>>,
    on_sent: Mutex<Option<SentHook>>,
    acked: Signal,
}

impl OutboundFrame {
    /// Wrap `frame`, remembering the local session id that produced it.
    pub fn new(frame: Frame, owner: u8) -> Arc<Self> {
        Arc::new(Self {
            frame,
            owner,
            sent: Signal::new(),
            sent_at: Mutex::new(None),
            on_sent: Mutex::new(None),
            acked: Signal::new(),
        })
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Local id of the session that queued this frame (0 for control).
    pub fn owner(&self) -> u8 {
        self.owner
    }

    pub fn sent(&self) -> &Signal {
        &self.sent
    }

    pub fn acked(&self) -> &Signal {
        &self.acked
    }

    /// When the frame last went out on the channel.
    pub fn sent_at(&self) -> Option<Instant> {
        *lock(&self.sent_at)
    }

    /// Run `hook` the first time the frame goes out.
    pub fn on_sent(&self, hook: impl FnOnce() + Send + 'static) {
        *lock(&self.on_sent) = Some(Box::new(hook));
    }

    /// Record a write to the channel: stamp the time, fire `sent`, then run
    /// the pending hook if any.
    pub fn mark_sent(&self) {
        *lock(&self.sent_at) = Some(Instant::now());
        self.sent.set();
        let hook = lock(&self.on_sent).take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl std::fmt::Debug for OutboundFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundFrame")
            .field("session", &self.frame.session)
            .field("kind", &self.frame.kind)
            .field("seq", &self.frame.seq)
            .field("owner", &self.owner)
            .field("sent", &self.sent.is_set())
            .field("acked", &self.acked.is_set())
            .finish()
    }
}
