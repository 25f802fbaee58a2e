use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ratlink_frame::Frame;
use tracing::{debug, warn};

use crate::arq::{ArqConfig, ArqShared, Engine, Pump, Worker, T_ACK, T_DAT};
use crate::error::Result;
use crate::queue::OutboundFrame;
use crate::session::{Session, SessionCore};

/// Stop-and-wait ARQ session: at most one block unacknowledged at a time.
pub struct StatefulSession {
    shared: Arc<ArqShared>,
    worker: Worker,
}

impl StatefulSession {
    /// Wrap `core` and start its worker.
    pub fn spawn(core: SessionCore, config: ArqConfig) -> Result<Self> {
        let shared = Arc::new(ArqShared::new(core, config));
        let worker = Worker::spawn(&shared, StopAndWait::default())?;
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

impl Session for StatefulSession {
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

impl Drop for StatefulSession {
    fn drop(&mut self) {
        self.close();
    }
}

struct InFlight {
    entry: Arc<OutboundFrame>,
    seq: u8,
    retries: u32,
}

#[derive(Default)]
struct StopAndWait {
    expected: u8,
    in_flight: Option<InFlight>,
}

impl Engine for StopAndWait {
    fn on_frame(&mut self, shared: &ArqShared, frame: Frame) {
        let seq = frame.seq as u8;
        match frame.kind {
            T_DAT => {
                shared.send_now(Frame::new(0, T_ACK, Bytes::new()).with_seq(u16::from(seq)));
                if seq == self.expected {
                    let len = frame.data.len() as u64;
                    shared.received.enqueue(frame.data);
                    shared.core.update_stats(|stats| stats.recv += len);
                    self.expected = self.expected.wrapping_add(1);
                } else {
                    debug!(session = shared.core.id(), seq, expected = self.expected, "duplicate block");
                }
            }
            T_ACK => match &self.in_flight {
                Some(flight) if flight.seq == seq => {
                    let len = flight.entry.frame().data.len() as u64;
                    flight.entry.acked().set();
                    shared.core.update_stats(|stats| stats.sent += len);
                    self.in_flight = None;
                }
                _ => debug!(session = shared.core.id(), seq, "stale ack"),
            },
            kind => warn!(session = shared.core.id(), kind, "unexpected frame type"),
        }
    }

    fn pump(&mut self, shared: &ArqShared) -> Pump {
        if self.in_flight.is_none() {
            let Some(entry) = shared.pending.try_dequeue() else {
                return Pump::Idle;
            };
            if let Err(err) = shared.core.link().transmit(&entry) {
                debug!(session = shared.core.id(), error = %err, "block not queued");
            }
            shared
                .core
                .update_stats(|stats| stats.max_outstanding = stats.max_outstanding.max(1));
            self.in_flight = Some(InFlight {
                seq: entry.frame().seq as u8,
                entry,
                retries: 0,
            });
            return Pump::Active;
        }

        let Some(flight) = self.in_flight.as_mut() else {
            return Pump::Idle;
        };
        // The ack timer runs from the moment the block went on the air.
        let sent_at = match flight.entry.sent_at() {
            Some(at) if flight.entry.sent().is_set() => at,
            _ => return Pump::Idle,
        };
        if !shared.config.retry_due(shared.core.link().activity(), sent_at, Duration::ZERO) {
            return Pump::Idle;
        }
        if flight.retries >= shared.config.max_retries {
            return Pump::Exhausted;
        }
        flight.retries += 1;
        debug!(session = shared.core.id(), seq = flight.seq, retry = flight.retries, "resending block");
        shared.retransmit(&flight.entry);
        Pump::Active
    }
}
