use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use ratlink_channel::{ByteChannel, ChannelError};
use ratlink_frame::{armor, encode_frame, Deframer, Frame, FrameConfig, Inbound, BROADCAST};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::link::Link;
use crate::queue::OutboundFrame;

/// Session id of the warm-up filler frame. No session ever uses it.
pub const WARMUP_SESSION: u8 = 255;
/// Frame type of the warm-up filler frame.
pub const WARMUP_TYPE: u8 = 254;

/// Filler sent ahead of real data after the channel has been quiet, so
/// power-saving radios have time to open their receive path.
#[derive(Debug, Clone)]
pub struct Warmup {
    /// Quiet time after which the next transmission gets a preamble.
    /// Default: 3s.
    pub after_idle: Duration,
    /// Filler payload length in bytes. Default: 8.
    pub length: usize,
}

impl Default for Warmup {
    fn default() -> Self {
        Self {
            after_idle: Duration::from_secs(3),
            length: 8,
        }
    }
}

/// Configuration for the transporter.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Bytes requested per channel read. Default: 4096.
    pub read_chunk: usize,
    /// Force armored (`Some(true)`) or binary frames. Default: follow the
    /// channel's `is_eight_bit_clean`.
    pub armored: Option<bool>,
    /// Warm-up preamble; `None` disables it.
    pub warmup: Option<Warmup>,
    /// Minimum gap between two transmissions. Default: none.
    pub force_delay: Duration,
    /// Reconnect attempts after a channel error before giving up. Default: 5.
    pub reconnect_attempts: u32,
    /// Wait before reconnect attempt `n` is `n` times this. Default: 1s.
    pub reconnect_backoff: Duration,
    /// Frame decoding limits.
    pub frame: FrameConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            read_chunk: 4096,
            armored: None,
            warmup: Some(Warmup::default()),
            force_delay: Duration::ZERO,
            reconnect_attempts: 5,
            reconnect_backoff: Duration::from_secs(1),
            frame: FrameConfig::default(),
        }
    }
}

impl TransportConfig {
    pub fn without_warmup(mut self) -> Self {
        self.warmup = None;
        self
    }

    pub fn with_armored(mut self, armored: bool) -> Self {
        self.armored = Some(armored);
        self
    }
}

/// Owns the byte channel on a dedicated I/O thread.
///
/// Inbound bytes are deframed and handed to the frame handler; queued
/// outbound frames are written with their "sent" signal fired afterwards.
/// Channel errors trigger a bounded reconnect loop; if that fails the link
/// goes offline and the thread exits.
pub struct Transporter {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    link: Arc<Link>,
}

impl Transporter {
    /// Start serving `channel`. `handler` runs on the I/O thread for every
    /// frame and position sentence recovered from the channel.
    pub fn spawn<C, H>(channel: C, link: Arc<Link>, config: TransportConfig, handler: H) -> Result<Self>
    where
        C: ByteChannel + 'static,
        H: FnMut(Inbound) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let io = IoLoop {
            armored: config.armored.unwrap_or(!channel.is_eight_bit_clean()),
            channel,
            link: Arc::clone(&link),
            running: Arc::clone(&running),
            handler,
            last_tx: None,
            config,
        };
        let handle = thread::Builder::new()
            .name(format!("ratlink-transport-{}", link.local_call()))
            .spawn(move || io.run())?;
        Ok(Self {
            running,
            handle: Some(handle),
            link,
        })
    }

    /// Whether the I/O thread is still serving the channel.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.link.is_online()
    }

    /// Stop the I/O thread and wait for it.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("transporter thread panicked");
            }
        }
    }
}

impl Drop for Transporter {
    fn drop(&mut self) {
        self.stop();
    }
}

struct IoLoop<C, H> {
    channel: C,
    link: Arc<Link>,
    running: Arc<AtomicBool>,
    handler: H,
    armored: bool,
    last_tx: Option<Instant>,
    config: TransportConfig,
}

impl<C: ByteChannel, H: FnMut(Inbound)> IoLoop<C, H> {
    fn run(mut self) {
        let mut deframer = Deframer::with_config(self.armored, self.config.frame.clone());
        info!(channel = self.channel.name(), armored = self.armored, "transporter started");

        if !self.channel.is_connected() {
            if let Err(err) = self.channel.connect() {
                if !self.recover(&err) {
                    return self.fail(&err);
                }
            }
        }

        while self.running.load(Ordering::SeqCst) {
            match self.channel.read(self.config.read_chunk) {
                Ok(bytes) if !bytes.is_empty() => {
                    self.link.activity().touch();
                    for item in deframer.push(&bytes) {
                        (self.handler)(item);
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    if !self.recover(&err) {
                        return self.fail(&err);
                    }
                    continue;
                }
            }

            while self.running.load(Ordering::SeqCst) {
                let Some(entry) = self.link.outbound().try_dequeue() else {
                    break;
                };
                if let Err(err) = self.send(&entry) {
                    self.link.outbound().requeue(entry);
                    if !self.recover(&err) {
                        return self.fail(&err);
                    }
                }
            }
        }

        if let Err(err) = self.channel.disconnect() {
            debug!(error = %err, "disconnect on shutdown failed");
        }
        info!(channel = self.channel.name(), dropped = deframer.dropped(), "transporter stopped");
    }

    fn send(&mut self, entry: &Arc<OutboundFrame>) -> std::result::Result<(), ChannelError> {
        let Some(wire) = self.encode(entry.frame()) else {
            // Undeliverable; nothing will ever send it.
            return Ok(());
        };

        if let Some(last) = self.last_tx {
            let gap = last.elapsed();
            if gap < self.config.force_delay {
                thread::sleep(self.config.force_delay - gap);
            }
        }
        if let Some(warmup) = self.config.warmup.clone() {
            let idle = self.last_tx.is_none_or(|last| last.elapsed() >= warmup.after_idle);
            if idle {
                let filler = Frame::new(WARMUP_SESSION, WARMUP_TYPE, vec![0u8; warmup.length])
                    .uncompressed()
                    .with_src(self.link.local_call())
                    .with_dst(BROADCAST);
                if let Some(filler) = self.encode(&filler) {
                    debug!(bytes = filler.len(), "sending warm-up preamble");
                    self.channel.write_all(&filler)?;
                }
            }
        }

        self.channel.write_all(&wire)?;
        self.last_tx = Some(Instant::now());
        let frame = entry.frame();
        debug!(
            session = frame.session,
            kind = frame.kind,
            seq = frame.seq,
            dst = %frame.dst,
            bytes = wire.len(),
            "frame sent"
        );
        entry.mark_sent();
        Ok(())
    }

    fn encode(&self, frame: &Frame) -> Option<Vec<u8>> {
        let mut buf = BytesMut::new();
        if let Err(err) = encode_frame(frame, &mut buf) {
            warn!(session = frame.session, error = %err, "dropping unencodable frame");
            return None;
        }
        Some(if self.armored { armor(&buf) } else { buf.to_vec() })
    }

    /// Try to bring the channel back after `err`. Returns `false` if the
    /// error is fatal or every attempt failed.
    fn recover(&mut self, err: &ChannelError) -> bool {
        if !err.is_transient() || !self.channel.can_reconnect() {
            return false;
        }
        for attempt in 1..=self.config.reconnect_attempts {
            let delay = self.config.reconnect_backoff * attempt;
            warn!(
                channel = self.channel.name(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "channel error, reconnecting"
            );
            if !self.sleep_while_running(delay) {
                return false;
            }
            match self.channel.reconnect() {
                Ok(()) => {
                    info!(channel = self.channel.name(), attempt, "channel reconnected");
                    return true;
                }
                Err(retry_err) => debug!(error = %retry_err, "reconnect failed"),
            }
        }
        false
    }

    fn sleep_while_running(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        while self.running.load(Ordering::SeqCst) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            thread::sleep(remaining.min(Duration::from_millis(50)));
        }
        false
    }

    fn fail(&mut self, err: &ChannelError) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        error!(channel = self.channel.name(), error = %err, "channel lost, transporter disabled");
        self.link.set_online(false);
        self.running.store(false, Ordering::SeqCst);
    }
}
