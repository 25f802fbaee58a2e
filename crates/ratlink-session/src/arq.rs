use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use ratlink_frame::Frame;
use tracing::{debug, warn};

use crate::error::{Result, SessionError};
use crate::link::LinkActivity;
use crate::queue::{BlockingQueue, OutboundFrame, Signal};
use crate::session::{wait_until, SessionCore, SessionState, WaitOutcome};

/// Acknowledgement frame type.
pub const T_ACK: u8 = 1;
/// Data block frame type.
pub const T_DAT: u8 = 4;
/// Acknowledgement request frame type (pipelined sessions only).
pub const T_REQACK: u8 = 5;

/// Tuning for the stop-and-wait and pipelined disciplines.
#[derive(Debug, Clone)]
pub struct ArqConfig {
    /// Largest payload per data block. Default: 1024.
    pub block_size: usize,
    /// Retransmissions allowed before the session gives up. Default: 10.
    pub max_retries: u32,
    /// Retransmission is held back while the channel carried inbound traffic
    /// this recently. Default: 3s.
    pub busy_window: Duration,
    /// Time since the last send before a block is retransmitted. Default: 8s.
    pub ack_timeout: Duration,
    /// Pipelined window: most blocks unacknowledged at once. Default: 8.
    pub out_limit: usize,
    /// Added to the pipelined ack timeout on each unanswered `REQACK`.
    /// Default: 2s.
    pub reqack_backoff: Duration,
    /// Close an open session after this long without traffic. Default: off.
    pub idle_timeout: Option<Duration>,
    /// How often the worker wakes with nothing to do. Default: 50ms.
    pub poll_interval: Duration,
}

impl Default for ArqConfig {
    fn default() -> Self {
        Self {
            block_size: 1024,
            max_retries: 10,
            busy_window: Duration::from_secs(3),
            ack_timeout: Duration::from_secs(8),
            out_limit: 8,
            reqack_backoff: Duration::from_secs(2),
            idle_timeout: None,
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl ArqConfig {
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_out_limit(mut self, out_limit: usize) -> Self {
        self.out_limit = out_limit;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Whether a block queued at `since` is due for retransmission.
    pub fn retry_due(&self, activity: &LinkActivity, since: Instant, extra: Duration) -> bool {
        if activity.busy_within(self.busy_window) {
            return false;
        }
        since.elapsed() >= self.ack_timeout + extra
    }
}

/// Split `buf` into blocks of at most `block_size` bytes. An empty buffer
/// still makes one (empty) block.
pub fn split_blocks(buf: &[u8], block_size: usize) -> Vec<Bytes> {
    if buf.is_empty() {
        return vec![Bytes::new()];
    }
    buf.chunks(block_size.max(1))
        .map(Bytes::copy_from_slice)
        .collect()
}

/// What a discipline's send stage did on one pass.
pub(crate) enum Pump {
    Idle,
    Active,
    Exhausted,
}

/// The part of an ARQ discipline that runs on the session worker.
pub(crate) trait Engine: Send + 'static {
    fn on_frame(&mut self, shared: &ArqShared, frame: Frame);
    fn pump(&mut self, shared: &ArqShared) -> Pump;
}

/// State shared between an ARQ session's handle and its worker.
pub(crate) struct ArqShared {
    pub core: SessionCore,
    pub config: ArqConfig,
    /// Blocks written but not yet taken by the worker.
    pub pending: BlockingQueue<Arc<OutboundFrame>>,
    /// In-order payloads ready for `read`.
    pub received: BlockingQueue<Bytes>,
    kick: Signal,
    enabled: AtomicBool,
    next_seq: Mutex<u8>,
}

impl ArqShared {
    pub fn new(core: SessionCore, config: ArqConfig) -> Self {
        Self {
            core,
            config,
            pending: BlockingQueue::new(),
            received: BlockingQueue::new(),
            kick: Signal::new(),
            enabled: AtomicBool::new(true),
            next_seq: Mutex::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Wake the worker.
    pub fn kick(&self) {
        self.kick.set();
    }

    pub fn deliver(&self, frame: Frame) {
        self.core.inbound().enqueue(frame);
        self.kick();
    }

    /// Queue `buf` as data blocks; with a timeout, wait for the last one to
    /// be acknowledged.
    pub fn write(&self, buf: &[u8], timeout: Option<Duration>) -> Result<()> {
        self.core.ensure_open()?;
        let last = {
            let mut next_seq = self.next_seq.lock().unwrap_or_else(PoisonError::into_inner);
            let mut last = None;
            for block in split_blocks(buf, self.config.block_size) {
                let frame = Frame::new(0, T_DAT, block).with_seq(u16::from(*next_seq));
                *next_seq = next_seq.wrapping_add(1);
                let entry = self.core.link().prepare(&self.core, frame);
                self.pending.enqueue(Arc::clone(&entry));
                last = Some(entry);
            }
            last
        };
        self.kick();

        let (Some(timeout), Some(last)) = (timeout, last) else {
            return Ok(());
        };
        let outcome = wait_until(
            Some(Instant::now() + timeout),
            self.config.poll_interval,
            |slice| last.acked().wait(slice).then_some(()),
            || self.is_closed(),
        );
        match outcome {
            WaitOutcome::Ready(()) => Ok(()),
            WaitOutcome::TimedOut => Err(SessionError::Timeout(timeout)),
            WaitOutcome::Closed => Err(self.closed_error()),
        }
    }

    /// Take the next in-order block, waiting up to `timeout` (`None` waits
    /// until data arrives or the session closes).
    pub fn read(&self, timeout: Option<Duration>) -> Result<Bytes> {
        let outcome = wait_until(
            timeout.map(|t| Instant::now() + t),
            self.config.poll_interval,
            |slice| self.received.dequeue(Some(slice)),
            || self.is_closed() && self.received.is_empty(),
        );
        match outcome {
            WaitOutcome::Ready(block) => Ok(block),
            WaitOutcome::TimedOut => Err(SessionError::Timeout(timeout.unwrap_or_default())),
            WaitOutcome::Closed => Err(self.closed_error()),
        }
    }

    fn is_closed(&self) -> bool {
        !self.is_enabled()
            || self.core.state() == SessionState::Closed
            || !self.core.link().is_online()
    }

    fn closed_error(&self) -> SessionError {
        if self.core.link().is_online() {
            SessionError::SessionClosed { id: self.core.id() }
        } else {
            SessionError::TransportDown
        }
    }

    /// Queue a session frame now, outside the block pipeline.
    pub fn send_now(&self, frame: Frame) {
        if let Err(err) = self.core.link().outgoing(&self.core, frame) {
            debug!(session = self.core.id(), error = %err, "dropping control reply");
        }
    }

    /// Retransmit a block or request.
    pub fn retransmit(&self, entry: &Arc<OutboundFrame>) {
        self.core.update_stats(|stats| stats.retries += 1);
        if let Err(err) = self.core.link().transmit(entry) {
            debug!(session = self.core.id(), error = %err, "retransmit refused");
        }
    }

    /// Stop the worker from the outside.
    pub fn shutdown(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.kick();
        self.core.set_state(SessionState::Closed);
    }

    /// Close from inside the worker and tell the registry why.
    fn give_up(&self, reason: &str) {
        if !self.enabled.swap(false, Ordering::SeqCst) {
            return;
        }
        warn!(session = self.core.id(), peer = %self.core.peer(), reason, "closing session");
        self.core.set_state(SessionState::Closed);
        self.core.link().report_closed(self.core.id(), reason);
    }
}

/// Worker loop shared by both ARQ disciplines: drain inbound frames, then
/// let the discipline send.
pub(crate) fn run(shared: Arc<ArqShared>, mut engine: impl Engine) {
    let mut last_activity = Instant::now();
    while shared.is_enabled() {
        if shared.kick.wait(shared.config.poll_interval) {
            shared.kick.clear();
        }
        while let Some(frame) = shared.core.inbound().try_dequeue() {
            last_activity = Instant::now();
            engine.on_frame(&shared, frame);
        }
        if !shared.is_enabled() {
            break;
        }
        if shared.core.state() != SessionState::Open {
            continue;
        }
        match engine.pump(&shared) {
            Pump::Idle => {}
            Pump::Active => last_activity = Instant::now(),
            Pump::Exhausted => {
                shared.give_up("retries exhausted");
                break;
            }
        }
        if let Some(idle) = shared.config.idle_timeout {
            if last_activity.elapsed() >= idle {
                shared.give_up("idle timeout");
                break;
            }
        }
    }
    debug!(session = shared.core.id(), "session worker stopped");
}

/// Join handle of a session worker.
pub(crate) struct Worker(Mutex<Option<JoinHandle<()>>>);

impl Worker {
    pub fn spawn(shared: &Arc<ArqShared>, engine: impl Engine) -> Result<Self> {
        let shared = Arc::clone(shared);
        let name = format!("ratlink-session-{}", shared.core.id());
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || run(shared, engine))?;
        Ok(Self(Mutex::new(Some(handle))))
    }

    /// Wait for the worker to finish. A worker closing its own session does
    /// not join itself.
    pub fn join(&self) {
        let handle = self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(handle) = handle else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!("session worker panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_respects_block_size() {
        let blocks = split_blocks(b"abcdefghij", 4);
        assert_eq!(blocks, vec![&b"abcd"[..], &b"efgh"[..], &b"ij"[..]]);
    }

    #[test]
    fn empty_write_is_one_empty_block() {
        assert_eq!(split_blocks(b"", 4), vec![Bytes::new()]);
    }

    #[test]
    fn retry_held_back_while_channel_busy() {
        let config = ArqConfig {
            busy_window: Duration::from_secs(60),
            ack_timeout: Duration::ZERO,
            ..ArqConfig::default()
        };
        let activity = LinkActivity::new();
        let since = Instant::now();
        assert!(config.retry_due(&activity, since, Duration::ZERO));
        activity.touch();
        assert!(!config.retry_due(&activity, since, Duration::ZERO));
    }

    #[test]
    fn retry_waits_for_timeout_plus_backoff() {
        let config = ArqConfig {
            ack_timeout: Duration::from_secs(60),
            ..ArqConfig::default()
        };
        let activity = LinkActivity::new();
        assert!(!config.retry_due(&activity, Instant::now(), Duration::ZERO));
    }
}
