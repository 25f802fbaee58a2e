//! KISS framing for TNC modems.
//!
//! Wire format:
//! ```text
//! ┌──────┬──────────────────┬──────────────────────┬──────┐
//! │ FEND │ port<<4 | cmd    │ escaped payload      │ FEND │
//! │ 0xC0 │ (1B, cmd 0=data) │ C0→DB DC, DB→DB DD   │ 0xC0 │
//! └──────┴──────────────────┴──────────────────────┴──────┘
//! ```

use std::collections::VecDeque;

use bytes::{Buf, BytesMut};
use tracing::debug;

use crate::error::Result;
use crate::traits::ByteChannel;

/// Frame delimiter.
pub const FEND: u8 = 0xC0;
/// Escape introducer.
pub const FESC: u8 = 0xDB;
/// Escaped FEND.
pub const TFEND: u8 = 0xDC;
/// Escaped FESC.
pub const TFESC: u8 = 0xDD;

/// Command nibble for a data frame.
const CMD_DATA: u8 = 0x00;

/// Cap on buffered undelimited bytes before the oldest are discarded.
const MAX_PENDING: usize = 64 * 1024;

/// One decoded KISS data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KissFrame {
    /// TNC port the frame arrived on.
    pub port: u8,
    /// Unescaped payload.
    pub data: Vec<u8>,
}

/// Wrap `payload` as a KISS data frame for `port`.
pub fn kiss_encode(port: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(FEND);
    out.push((port << 4) & 0xF0);
    for &byte in payload {
        match byte {
            FEND => out.extend_from_slice(&[FESC, TFEND]),
            FESC => out.extend_from_slice(&[FESC, TFESC]),
            other => out.push(other),
        }
    }
    out.push(FEND);
    out
}

/// Incremental KISS decoder.
///
/// Bytes are pushed as they arrive; complete frames come out. An incomplete
/// trailing frame stays buffered until the closing FEND shows up.
#[derive(Debug, Default)]
pub struct KissDecoder {
    buf: BytesMut,
}

impl KissDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and collect every frame they complete.
    pub fn push(&mut self, data: &[u8]) -> Vec<KissFrame> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            let Some(start) = self.buf.iter().position(|&b| b == FEND) else {
                if !self.buf.is_empty() {
                    debug!(len = self.buf.len(), "discarding out-of-frame bytes");
                    self.buf.clear();
                }
                break;
            };
            if start > 0 {
                debug!(len = start, "discarding out-of-frame bytes");
                self.buf.advance(start);
            }

            let Some(end) = self.buf[1..].iter().position(|&b| b == FEND).map(|p| p + 1) else {
                if self.buf.len() > MAX_PENDING {
                    debug!(len = self.buf.len(), "kiss buffer overflow, dropping partial frame");
                    self.buf.clear();
                }
                break;
            };

            // The closing FEND stays in the buffer and opens the next frame.
            let body = self.buf.split_to(end);
            if body.len() > 1 {
                if let Some(frame) = unescape(&body[1..]) {
                    frames.push(frame);
                }
            }
        }

        frames
    }

    /// Number of buffered bytes not yet part of a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

fn unescape(body: &[u8]) -> Option<KissFrame> {
    let command = body[0];
    if command & 0x0F != CMD_DATA {
        debug!(command, "skipping non-data kiss command");
        return None;
    }

    let mut data = Vec::with_capacity(body.len() - 1);
    let mut escaped = false;
    for &byte in &body[1..] {
        if escaped {
            escaped = false;
            match byte {
                TFEND => data.push(FEND),
                TFESC => data.push(FESC),
                other => debug!(byte = other, "discarding unknown kiss escape"),
            }
        } else if byte == FESC {
            escaped = true;
        } else {
            data.push(byte);
        }
    }
    if escaped {
        debug!("discarding dangling kiss escape");
    }

    Some(KissFrame {
        port: command >> 4,
        data,
    })
}

/// A TNC link: KISS-frames every write on `port` and unwraps reads.
pub struct KissChannel<C> {
    inner: C,
    port: u8,
    decoder: KissDecoder,
    pending: VecDeque<u8>,
    name: String,
}

impl<C: ByteChannel> KissChannel<C> {
    /// Wrap `inner`, using TNC port 0.
    pub fn new(inner: C) -> Self {
        Self::with_port(inner, 0)
    }

    /// Wrap `inner`, sending and accepting frames on `port`.
    pub fn with_port(inner: C, port: u8) -> Self {
        let name = format!("kiss:{}", inner.name());
        Self {
            inner,
            port: port & 0x0F,
            decoder: KissDecoder::new(),
            pending: VecDeque::new(),
            name,
        }
    }

    /// Borrow the wrapped channel.
    pub fn get_ref(&self) -> &C {
        &self.inner
    }

    /// Consume the wrapper and return the inner channel.
    pub fn into_inner(self) -> C {
        self.inner
    }
}

impl<C: ByteChannel> ByteChannel for KissChannel<C> {
    fn connect(&mut self) -> Result<()> {
        self.inner.connect()
    }

    fn disconnect(&mut self) -> Result<()> {
        self.decoder = KissDecoder::new();
        self.pending.clear();
        self.inner.disconnect()
    }

    fn read(&mut self, max: usize) -> Result<Vec<u8>> {
        if self.pending.is_empty() {
            let raw = self.inner.read(max)?;
            for frame in self.decoder.push(&raw) {
                if frame.port != self.port {
                    debug!(port = frame.port, "ignoring kiss frame for other port");
                    continue;
                }
                self.pending.extend(frame.data);
            }
        }
        let n = max.min(self.pending.len());
        Ok(self.pending.drain(..n).collect())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.inner.write_all(&kiss_encode(self.port, data))?;
        Ok(data.len())
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn can_reconnect(&self) -> bool {
        self.inner.can_reconnect()
    }

    fn name(&self) -> &str {
        &self.name
    }
}
