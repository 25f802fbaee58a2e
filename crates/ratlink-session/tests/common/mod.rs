#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ratlink_channel::{ByteChannel, MemoryChannel, Result as ChannelResult};
use ratlink_session::{
    ArqConfig, ControlConfig, ManagerConfig, SessionEvent, SessionManager, TransportConfig,
};

/// Timings shrunk so a full handshake or retry cycle takes milliseconds.
pub fn fast_config() -> ManagerConfig {
    ManagerConfig {
        transport: TransportConfig {
            reconnect_attempts: 1,
            reconnect_backoff: Duration::from_millis(1),
            ..TransportConfig::default()
        }
        .without_warmup(),
        control: ControlConfig {
            new_attempts: 10,
            sent_wait: Duration::from_secs(2),
            answer_wait: Duration::from_millis(300),
            sync_wait: Duration::from_millis(500),
            end_attempts: 5,
            end_wait: Duration::from_millis(300),
        },
        arq: ArqConfig {
            block_size: 16,
            max_retries: 30,
            busy_window: Duration::from_millis(10),
            ack_timeout: Duration::from_millis(150),
            out_limit: 8,
            reqack_backoff: Duration::from_millis(20),
            idle_timeout: None,
            poll_interval: Duration::from_millis(5),
        },
    }
}

/// Which writes a [`FaultyChannel`] mangles. `n` means every n-th write.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    pub drop_every: Option<usize>,
    pub hold_every: Option<usize>,
    pub duplicate_every: Option<usize>,
}

impl Faults {
    pub fn lossy(n: usize) -> Self {
        Self {
            drop_every: Some(n),
            ..Self::default()
        }
    }

    pub fn reordering() -> Self {
        Self {
            hold_every: Some(4),
            duplicate_every: Some(5),
            ..Self::default()
        }
    }
}

fn hits(every: Option<usize>, count: usize) -> bool {
    every.is_some_and(|n| n > 0 && count % n == 0)
}

/// Reads before a held write is let through even if nothing follows it.
const HOLD_READS: usize = 10;

/// Memory channel that drops, delays or repeats whole writes.
///
/// The transporter writes one frame per write, so every fault hits exactly
/// one frame. A held frame goes out after the next write, which swaps the
/// two on the wire.
pub struct FaultyChannel {
    inner: MemoryChannel,
    faults: Faults,
    writes: usize,
    held: Option<(Vec<u8>, usize)>,
    blackhole: Arc<AtomicBool>,
}

impl FaultyChannel {
    pub fn new(inner: MemoryChannel, faults: Faults) -> Self {
        Self {
            inner,
            faults,
            writes: 0,
            held: None,
            blackhole: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Switch that silently discards every write while set.
    pub fn blackhole(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.blackhole)
    }

    fn release(&mut self) -> ChannelResult<()> {
        if let Some((held, _)) = self.held.take() {
            self.inner.write_all(&held)?;
        }
        Ok(())
    }
}

impl ByteChannel for FaultyChannel {
    fn connect(&mut self) -> ChannelResult<()> {
        self.inner.connect()
    }

    fn disconnect(&mut self) -> ChannelResult<()> {
        self.inner.disconnect()
    }

    fn read(&mut self, max: usize) -> ChannelResult<Vec<u8>> {
        if let Some((_, reads)) = self.held.as_mut() {
            *reads += 1;
            if *reads >= HOLD_READS {
                self.release()?;
            }
        }
        self.inner.read(max)
    }

    fn write(&mut self, data: &[u8]) -> ChannelResult<usize> {
        self.writes += 1;
        if self.blackhole.load(Ordering::SeqCst) || hits(self.faults.drop_every, self.writes) {
            return Ok(data.len());
        }
        if self.held.is_none() && hits(self.faults.hold_every, self.writes) {
            self.held = Some((data.to_vec(), 0));
            return Ok(data.len());
        }
        self.inner.write_all(data)?;
        if hits(self.faults.duplicate_every, self.writes) {
            self.inner.write_all(data)?;
        }
        self.release()?;
        Ok(data.len())
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// Two managers talking over a memory pipe with `faults` on both directions.
pub fn station_pair(
    config: ManagerConfig,
    faults: Faults,
) -> (SessionManager, SessionManager, Arc<AtomicBool>) {
    let (left, right) = MemoryChannel::pair();
    let left = FaultyChannel::new(left.with_read_timeout(Duration::from_millis(5)), faults.clone());
    let right = FaultyChannel::new(right.with_read_timeout(Duration::from_millis(5)), faults);
    let blackhole = left.blackhole();
    let a = SessionManager::start("N0CALL", left, config.clone()).expect("left station starts");
    let b = SessionManager::start("KD7ABC", right, config).expect("right station starts");
    (a, b, blackhole)
}

/// Record every session event a manager reports.
pub fn record_events(manager: &SessionManager) -> Arc<Mutex<Vec<SessionEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    manager.register_session_cb(move |event| sink.lock().unwrap().push(event.clone()));
    events
}

/// Poll `check` until it yields or `timeout` passes.
pub fn wait_for<T>(timeout: Duration, mut check: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = check() {
            return Some(value);
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// Deterministic test payload.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
}
