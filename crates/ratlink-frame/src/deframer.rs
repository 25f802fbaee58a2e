use bytes::{Buf, BytesMut};
use tracing::{debug, warn};

use crate::armor::{decode_armored, find, EOB, SOB};
use crate::codec::{decode_frame, Frame, FrameConfig, MAGIC_COMPRESSED, MAGIC_RAW};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const MAX_BUFFER: usize = 256 * 1024;

/// Line prefixes of plain-text position reports that share the link.
const GPS_PREFIXES: [&str; 4] = ["$GP", "$GN", "$GL", "$$CRC"];

/// Something recovered from the raw byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A frame that passed every check.
    Frame(Frame),
    /// A plain-text position sentence found between frames.
    Gps(String),
}

/// Splits a raw byte stream into frames.
///
/// Handles partial reads internally: push bytes as they arrive and collect
/// whatever they complete. Frames that fail to decode are logged, counted and
/// dropped.
pub struct Deframer {
    buf: BytesMut,
    armored: bool,
    config: FrameConfig,
    dropped: u64,
}

impl Deframer {
    /// Create a deframer; `armored` selects `[SOB]`/`[EOB]` text mode.
    pub fn new(armored: bool) -> Self {
        Self::with_config(armored, FrameConfig::default())
    }

    /// Create a deframer with explicit configuration.
    pub fn with_config(armored: bool, config: FrameConfig) -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            armored,
            config,
            dropped: 0,
        }
    }

    /// Feed bytes from the link and collect everything they complete.
    pub fn push(&mut self, data: &[u8]) -> Vec<Inbound> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();
        if self.armored {
            self.extract_armored(&mut out);
        } else {
            self.extract_binary(&mut out);
        }
        if self.buf.len() > MAX_BUFFER {
            let excess = self.buf.len() - MAX_BUFFER / 2;
            warn!(discarded = excess, "deframer buffer overflow");
            self.buf.advance(excess);
        }
        out
    }

    /// Number of frames dropped as undecodable so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Bytes buffered but not yet consumed.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Switch between armored and binary mode. Buffered bytes are discarded.
    pub fn set_armored(&mut self, armored: bool) {
        self.armored = armored;
        self.buf.clear();
    }

    fn extract_armored(&mut self, out: &mut Vec<Inbound>) {
        loop {
            let Some(start) = find(&self.buf, SOB) else {
                self.drain_lines(self.buf.len(), true, out);
                return;
            };
            self.drain_lines(start, false, out);

            let Some(end) = find(&self.buf[SOB.len()..], EOB).map(|p| p + SOB.len()) else {
                return;
            };
            match decode_armored(&self.buf[..end + EOB.len()], self.config.max_payload_size) {
                Ok(frame) => {
                    self.buf.advance(end + EOB.len());
                    out.push(Inbound::Frame(frame));
                }
                Err(err) => {
                    self.dropped += 1;
                    debug!(error = %err, "dropping undecodable armored frame");
                    // A stray start marker pairs with the next frame's end
                    // marker; restart from the last start marker in the span.
                    match find(&self.buf[SOB.len()..end], SOB) {
                        Some(next) => self.buf.advance(SOB.len() + next),
                        None => self.buf.advance(end + EOB.len()),
                    }
                }
            }
        }
    }

    fn extract_binary(&mut self, out: &mut Vec<Inbound>) {
        loop {
            let Some(start) = self
                .buf
                .iter()
                .position(|&b| b == MAGIC_COMPRESSED || b == MAGIC_RAW)
            else {
                self.drain_lines(self.buf.len(), true, out);
                return;
            };
            self.drain_lines(start, false, out);

            match decode_frame(&mut self.buf, self.config.max_payload_size) {
                Ok(Some(frame)) => out.push(Inbound::Frame(frame)),
                Ok(None) => return,
                Err(err) => {
                    self.dropped += 1;
                    debug!(error = %err, "dropping undecodable frame, resynchronising");
                    self.buf.advance(1);
                }
            }
        }
    }

    /// Consume the first `upto` bytes as free text, reporting position
    /// sentences. With `keep_partial`, an unterminated last line stays
    /// buffered.
    fn drain_lines(&mut self, upto: usize, keep_partial: bool, out: &mut Vec<Inbound>) {
        let text = self.buf.split_to(upto);
        let mut rest = &text[..];
        while let Some(nl) = rest.iter().position(|&b| b == b'\n') {
            report_gps(&rest[..nl], out);
            rest = &rest[nl + 1..];
        }
        if rest.is_empty() {
            return;
        }
        if keep_partial {
            let mut kept = BytesMut::with_capacity(rest.len() + self.buf.len());
            kept.extend_from_slice(rest);
            kept.extend_from_slice(&self.buf);
            self.buf = kept;
        } else {
            report_gps(rest, out);
        }
    }
}

fn report_gps(line: &[u8], out: &mut Vec<Inbound>) {
    let Ok(line) = std::str::from_utf8(line) else {
        return;
    };
    let line = line.trim();
    if GPS_PREFIXES.iter().any(|prefix| line.starts_with(prefix)) {
        out.push(Inbound::Gps(line.to_string()));
    }
}
