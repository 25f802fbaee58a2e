//! Text-safe armoring for links that are not 8-bit clean.
//!
//! ```text
//! [SOB]<base64(header + payload)>[EOB]
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::BytesMut;

use crate::codec::{decode_exact, encode_frame, Frame};
use crate::error::{FrameError, Result};

/// Start-of-block marker.
pub const SOB: &[u8] = b"[SOB]";

/// End-of-block marker.
pub const EOB: &[u8] = b"[EOB]";

/// Wrap an encoded frame in base64 between the block markers.
pub fn armor(binary: &[u8]) -> Vec<u8> {
    let body = STANDARD.encode(binary);
    let mut out = Vec::with_capacity(SOB.len() + body.len() + EOB.len());
    out.extend_from_slice(SOB);
    out.extend_from_slice(body.as_bytes());
    out.extend_from_slice(EOB);
    out
}

/// Recover the binary frame from an armored buffer.
///
/// Uses the first `[SOB]` and the last `[EOB]`, so garbage on either side is
/// ignored. Whitespace a text link may have inserted is stripped.
pub fn unarmor(buf: &[u8]) -> Result<Vec<u8>> {
    let start = find(buf, SOB).ok_or(FrameError::MissingMarkers)? + SOB.len();
    let end = rfind(buf, EOB).ok_or(FrameError::MissingMarkers)?;
    if end < start {
        return Err(FrameError::MissingMarkers);
    }
    let body: Vec<u8> = buf[start..end]
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    Ok(STANDARD.decode(body)?)
}

/// Encode `frame` and armor it.
pub fn encode_armored(frame: &Frame) -> Result<Vec<u8>> {
    let mut binary = BytesMut::new();
    encode_frame(frame, &mut binary)?;
    Ok(armor(&binary))
}

/// Unarmor and decode one frame.
pub fn decode_armored(buf: &[u8], max_payload: usize) -> Result<Frame> {
    decode_exact(&unarmor(buf)?, max_payload)
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .rposition(|window| window == needle)
}
