use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ratlink_frame::Frame;
use tracing::{debug, warn};

use crate::arq::{ArqConfig, ArqShared, Engine, Pump, Worker, T_ACK, T_DAT, T_REQACK};
use crate::error::Result;
use crate::queue::OutboundFrame;
use crate::session::{Session, SessionCore};

/// Windowed ARQ session with selective acknowledgement.
///
/// Up to `out_limit` blocks are in flight at once. Each round sends every
/// unacknowledged block, then a `REQACK` listing their sequence numbers; the
/// peer's `ACK` lists the ones it holds and the rest go out again next round.
pub struct PipelinedSession {
    shared: Arc<ArqShared>,
    worker: Worker,
}

impl PipelinedSession {
    /// Wrap `core` and start its worker.
    pub fn spawn(core: SessionCore, config: ArqConfig) -> Result<Self> {
        let window = config.out_limit.clamp(1, 128);
        let shared = Arc::new(ArqShared::new(core, config));
        let engine = Pipeline {
            rx: Reassembly::new(window),
            window: Vec::new(),
            limit: window,
            round: None,
            next_round: 0,
        };
        let worker = Worker::spawn(&shared, engine)?;
        Ok(Self { shared, worker })
    }

    /// Queue `buf` for delivery. With a timeout, block until the peer has
    /// acknowledged all of it.
    pub fn write(&self, buf: &[u8], timeout: Option<Duration>) -> Result<()> {
        self.shared.write(buf, timeout)
    }

    /// Next block of the peer's data stream, in order.
    pub fn read(&self, timeout: Option<Duration>) -> Result<Bytes> {
        self.shared.read(timeout)
    }

    pub fn config(&self) -> &ArqConfig {
        &self.shared.config
    }
}

impl Session for PipelinedSession {
    fn core(&self) -> &SessionCore {
        &self.shared.core
    }

    fn deliver(&self, frame: Frame) {
        self.shared.deliver(frame);
    }

    fn close(&self) {
        self.shared.shutdown();
        self.worker.join();
    }
}

impl Drop for PipelinedSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Whether block `next` may join a window whose oldest block is `window[0]`.
///
/// The window never spans more than `limit` sequence numbers, and sequence 0
/// of a new cycle waits until every block of the previous cycle is
/// acknowledged: with 8-bit sequence numbers the receiver could not tell the
/// cycles apart.
pub(crate) fn admits(window: &[u8], next: u8, limit: usize) -> bool {
    if window.len() >= limit {
        return false;
    }
    let Some(&oldest) = window.first() else {
        return true;
    };
    if next == 0 {
        return false;
    }
    usize::from(next.wrapping_sub(oldest)) < limit
}

/// Where an incoming sequence number sits relative to the receive window.
#[derive(Debug, PartialEq, Eq)]
enum Position {
    /// Within the window, `offset` blocks after the next expected one.
    Window(u8),
    /// Already delivered.
    Behind,
    /// Further ahead than the window allows.
    Beyond,
}

/// Receive side: an out-of-order buffer flushed into order.
///
/// Holds at most `window` blocks, all within `window` sequence numbers of
/// the next expected one. When `expected` wraps from 255 to 0 the previous
/// cycle's numbers fall behind the window and read as duplicates.
pub(crate) struct Reassembly {
    expected: u8,
    window: u8,
    held: BTreeMap<u8, Bytes>,
}

impl Reassembly {
    pub fn new(window: usize) -> Self {
        Self {
            expected: 0,
            window: window.clamp(1, 128) as u8,
            held: BTreeMap::new(),
        }
    }

    fn position(&self, seq: u8) -> Position {
        let offset = seq.wrapping_sub(self.expected);
        if offset < self.window {
            Position::Window(offset)
        } else if offset >= 128 {
            Position::Behind
        } else {
            Position::Beyond
        }
    }

    /// Accept block `seq`. Returns whatever became deliverable, in order.
    pub fn accept(&mut self, seq: u8, data: Bytes) -> Vec<Bytes> {
        match self.position(seq) {
            Position::Window(_) => {
                self.held.entry(seq).or_insert(data);
            }
            Position::Behind => {
                debug!(seq, expected = self.expected, "duplicate block");
                return Vec::new();
            }
            Position::Beyond => {
                warn!(seq, expected = self.expected, window = self.window, "block beyond receive window, dropped");
                return Vec::new();
            }
        }
        let mut ready = Vec::new();
        while let Some(block) = self.held.remove(&self.expected) {
            ready.push(block);
            self.expected = self.expected.wrapping_add(1);
        }
        ready
    }

    /// Whether block `seq` is held or already delivered.
    pub fn has(&self, seq: u8) -> bool {
        match self.position(seq) {
            Position::Window(_) => self.held.contains_key(&seq),
            Position::Behind => true,
            Position::Beyond => false,
        }
    }

    #[cfg(test)]
    pub fn held(&self) -> usize {
        self.held.len()
    }
}

struct Round {
    id: u16,
    request: Arc<OutboundFrame>,
    retries: u32,
    backoff: Duration,
}

struct Pipeline {
    rx: Reassembly,
    window: Vec<Arc<OutboundFrame>>,
    limit: usize,
    round: Option<Round>,
    next_round: u16,
}

fn seq_of(entry: &OutboundFrame) -> u8 {
    entry.frame().seq as u8
}

impl Pipeline {
    fn fill_window(&mut self, shared: &ArqShared) {
        loop {
            let seqs: Vec<u8> = self.window.iter().map(|e| seq_of(e)).collect();
            let admit = shared
                .pending
                .peek_with(|entry| admits(&seqs, seq_of(entry), self.limit));
            if admit != Some(true) {
                return;
            }
            match shared.pending.try_dequeue() {
                Some(entry) => self.window.push(entry),
                None => return,
            }
        }
    }

    fn start_round(&mut self, shared: &ArqShared) -> Pump {
        self.fill_window(shared);
        if self.window.is_empty() {
            return Pump::Idle;
        }
        let outstanding = self.window.len();
        shared
            .core
            .update_stats(|stats| stats.max_outstanding = stats.max_outstanding.max(outstanding));

        let link = shared.core.link();
        for entry in &self.window {
            if let Err(err) = link.transmit(entry) {
                debug!(session = shared.core.id(), error = %err, "block not queued");
            }
        }
        let seqs: Vec<u8> = self.window.iter().map(|e| seq_of(e)).collect();
        let id = self.next_round;
        self.next_round = self.next_round.wrapping_add(1);
        let request = Frame::new(0, T_REQACK, seqs).with_seq(id);
        match link.outgoing(&shared.core, request) {
            Ok(request) => {
                self.round = Some(Round {
                    id,
                    request,
                    retries: 0,
                    backoff: Duration::ZERO,
                });
            }
            Err(err) => debug!(session = shared.core.id(), error = %err, "request not queued"),
        }
        Pump::Active
    }

    fn on_ack(&mut self, shared: &ArqShared, round: u16, seqs: &[u8]) {
        if self.round.as_ref().map(|r| r.id) != Some(round) {
            debug!(session = shared.core.id(), round, "stale ack");
            return;
        }
        self.round = None;
        self.window.retain(|entry| {
            if !seqs.contains(&seq_of(entry)) {
                return true;
            }
            let len = entry.frame().data.len() as u64;
            entry.acked().set();
            shared.core.update_stats(|stats| stats.sent += len);
            false
        });
    }
}

impl Engine for Pipeline {
    fn on_frame(&mut self, shared: &ArqShared, frame: Frame) {
        match frame.kind {
            T_DAT => {
                for block in self.rx.accept(frame.seq as u8, frame.data) {
                    let len = block.len() as u64;
                    shared.received.enqueue(block);
                    shared.core.update_stats(|stats| stats.recv += len);
                }
            }
            T_REQACK => {
                let have: Vec<u8> = frame.data.iter().copied().filter(|&s| self.rx.has(s)).collect();
                debug!(session = shared.core.id(), requested = frame.data.len(), have = have.len(), "answering ack request");
                shared.send_now(Frame::new(0, T_ACK, have).with_seq(frame.seq));
            }
            T_ACK => self.on_ack(shared, frame.seq, &frame.data),
            kind => warn!(session = shared.core.id(), kind, "unexpected frame type"),
        }
    }

    fn pump(&mut self, shared: &ArqShared) -> Pump {
        let Some(round) = self.round.as_mut() else {
            return self.start_round(shared);
        };
        // Blocks go out ahead of the request, so its send time starts the
        // round's ack timer.
        let sent_at = match round.request.sent_at() {
            Some(at) if round.request.sent().is_set() => at,
            _ => return Pump::Idle,
        };
        if !shared.config.retry_due(shared.core.link().activity(), sent_at, round.backoff) {
            return Pump::Idle;
        }
        if round.retries >= shared.config.max_retries {
            return Pump::Exhausted;
        }
        round.retries += 1;
        round.backoff += shared.config.reqack_backoff;
        debug!(session = shared.core.id(), round = round.id, retry = round.retries, "repeating ack request");
        shared.retransmit(&round.request);
        Pump::Active
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;
    use std::thread;

    use super::*;
    use crate::link::Link;
    use crate::session::{SessionKind, SessionState};

    fn block(n: u8) -> Bytes {
        Bytes::from(vec![n])
    }

    #[test]
    fn window_is_bounded_by_count_and_span() {
        assert!(admits(&[], 5, 4));
        assert!(admits(&[5, 6, 7], 8, 4));
        assert!(!admits(&[5, 6, 7, 8], 9, 4));
        // Oldest block 5 still outstanding: 9 would stretch the span to 5.
        assert!(!admits(&[5, 8], 9, 4));
    }

    #[test]
    fn new_cycle_waits_for_previous_to_drain() {
        assert!(!admits(&[254, 255], 0, 8));
        assert!(!admits(&[255], 0, 8));
        assert!(admits(&[], 0, 8));
        assert!(admits(&[0], 1, 8));
    }

    #[test]
    fn reordered_blocks_flush_in_order() {
        let mut rx = Reassembly::new(4);
        assert!(rx.accept(1, block(1)).is_empty());
        assert!(rx.accept(2, block(2)).is_empty());
        assert_eq!(rx.held(), 2);
        assert_eq!(rx.accept(0, block(0)), vec![block(0), block(1), block(2)]);
        assert_eq!(rx.held(), 0);
    }

    #[test]
    fn duplicates_are_dropped() {
        let mut rx = Reassembly::new(4);
        assert_eq!(rx.accept(0, block(0)), vec![block(0)]);
        assert!(rx.accept(0, block(0)).is_empty());
        assert!(rx.accept(2, block(2)).is_empty());
        assert!(rx.accept(2, block(9)).is_empty());
        assert_eq!(rx.accept(1, block(1)), vec![block(1), block(2)]);
    }

    #[test]
    fn blocks_beyond_window_are_refused() {
        let mut rx = Reassembly::new(4);
        assert!(rx.accept(4, block(4)).is_empty());
        assert_eq!(rx.held(), 0);
        assert!(!rx.has(4));
    }

    #[test]
    fn sequence_wraps_between_cycles() {
        let mut rx = Reassembly::new(8);
        for n in 0..=255u8 {
            assert_eq!(rx.accept(n, block(n)), vec![block(n)]);
        }
        // 255 is now behind, 0 starts the next cycle.
        assert!(rx.has(255));
        assert!(!rx.has(0));
        assert!(rx.accept(250, block(250)).is_empty());
        assert_eq!(rx.accept(0, block(100)), vec![block(100)]);
    }

    #[test]
    fn has_reports_held_and_delivered() {
        let mut rx = Reassembly::new(8);
        rx.accept(0, block(0));
        rx.accept(2, block(2));
        assert!(rx.has(0));
        assert!(!rx.has(1));
        assert!(rx.has(2));
    }

    #[test]
    fn round_timer_starts_when_the_request_goes_out() {
        let link = Link::new("N0CALL", Weak::new());
        let core = SessionCore::new(1, "bulk", "KD7ABC", SessionKind::Pipelined, Arc::clone(&link));
        core.set_state(SessionState::Open);
        let config = ArqConfig {
            ack_timeout: Duration::from_millis(50),
            busy_window: Duration::ZERO,
            ..ArqConfig::default()
        };
        let shared = ArqShared::new(core, config);
        let mut engine = Pipeline {
            rx: Reassembly::new(8),
            window: Vec::new(),
            limit: 8,
            round: None,
            next_round: 0,
        };

        shared.write(b"one block", None).unwrap();
        assert!(matches!(engine.pump(&shared), Pump::Active));
        let queued: Vec<_> = std::iter::from_fn(|| link.outbound().try_dequeue()).collect();
        let request = queued.last().unwrap();
        assert_eq!(request.frame().kind, T_REQACK);

        thread::sleep(Duration::from_millis(100));
        assert!(matches!(engine.pump(&shared), Pump::Idle));
        request.mark_sent();
        assert!(matches!(engine.pump(&shared), Pump::Idle));

        thread::sleep(Duration::from_millis(100));
        assert!(matches!(engine.pump(&shared), Pump::Active));
        assert_eq!(link.outbound().len(), 1);
        assert_eq!(shared.core.stats().retries, 1);
    }
}
