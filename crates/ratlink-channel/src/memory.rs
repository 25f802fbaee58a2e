use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::{ChannelError, Result};
use crate::traits::ByteChannel;

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Default)]
struct Pipe {
    data: Mutex<VecDeque<u8>>,
    ready: Condvar,
}

/// One end of an in-process duplex byte pipe.
///
/// Behaves like a perfect, 8-bit clean serial link: whatever one end writes
/// the other end reads, in order. Useful for simulations and tests.
pub struct MemoryChannel {
    rx: Arc<Pipe>,
    tx: Arc<Pipe>,
    connected: Arc<AtomicBool>,
    read_timeout: Duration,
    name: String,
}

impl MemoryChannel {
    /// Create two connected ends.
    pub fn pair() -> (Self, Self) {
        let a = Arc::new(Pipe::default());
        let b = Arc::new(Pipe::default());
        let left = Self {
            rx: Arc::clone(&a),
            tx: Arc::clone(&b),
            connected: Arc::new(AtomicBool::new(true)),
            read_timeout: DEFAULT_READ_TIMEOUT,
            name: "memory:left".to_string(),
        };
        let right = Self {
            rx: b,
            tx: a,
            connected: Arc::new(AtomicBool::new(true)),
            read_timeout: DEFAULT_READ_TIMEOUT,
            name: "memory:right".to_string(),
        };
        (left, right)
    }

    /// Override how long `read` waits for data.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

impl ByteChannel for MemoryChannel {
    fn connect(&mut self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn read(&mut self, max: usize) -> Result<Vec<u8>> {
        if !self.is_connected() {
            return Err(ChannelError::NotConnected);
        }
        let guard = self.rx.data.lock().map_err(|_| ChannelError::Shutdown)?;
        let (mut data, _) = self
            .rx
            .ready
            .wait_timeout_while(guard, self.read_timeout, |data| data.is_empty())
            .map_err(|_| ChannelError::Shutdown)?;
        let n = max.min(data.len());
        Ok(data.drain(..n).collect())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        if !self.is_connected() {
            return Err(ChannelError::NotConnected);
        }
        let mut pipe = self.tx.data.lock().map_err(|_| ChannelError::Shutdown)?;
        pipe.extend(data.iter().copied());
        self.tx.ready.notify_all();
        Ok(data.len())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("name", &self.name)
            .field("connected", &self.is_connected())
            .finish()
    }
}
