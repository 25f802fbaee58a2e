use std::io::{Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::callsign::{self, CALLSIGN_LEN};
use crate::crc::crc16;
use crate::error::{FrameError, Result};

/// Header: magic (1) + seq (2) + session (1) + type (1) + checksum (2) +
/// length (2) + src (8) + dst (8) = 25 bytes.
pub const HEADER_SIZE: usize = 25;

/// Magic byte of a frame whose payload is zlib-compressed.
pub const MAGIC_COMPRESSED: u8 = 0xDD;

/// Magic byte of a frame whose payload is carried as-is.
pub const MAGIC_RAW: u8 = 0x22;

/// Default cap on a decoded (decompressed) payload: 64 KiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024;

/// One DDT2 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sequence number. ARQ sessions only use the low 8 bits.
    pub seq: u16,
    /// Session id the frame belongs to.
    pub session: u8,
    /// Frame type; meaning depends on the session discipline.
    pub kind: u8,
    /// Source call sign.
    pub src: String,
    /// Destination call sign.
    pub dst: String,
    /// Logical (uncompressed) payload.
    pub data: Bytes,
    /// Whether the payload is compressed on the wire.
    pub compress: bool,
}

impl Frame {
    /// Create a compressed frame for `session` with the given type and data.
    pub fn new(session: u8, kind: u8, data: impl Into<Bytes>) -> Self {
        Self {
            seq: 0,
            session,
            kind,
            src: String::new(),
            dst: String::new(),
            data: data.into(),
            compress: true,
        }
    }

    /// Set the sequence number.
    pub fn with_seq(mut self, seq: u16) -> Self {
        self.seq = seq;
        self
    }

    /// Set the destination call sign.
    pub fn with_dst(mut self, dst: impl Into<String>) -> Self {
        self.dst = dst.into();
        self
    }

    /// Set the source call sign.
    pub fn with_src(mut self, src: impl Into<String>) -> Self {
        self.src = src.into();
        self
    }

    /// Send the payload uncompressed.
    pub fn uncompressed(mut self) -> Self {
        self.compress = false;
        self
    }
}

/// Encode a frame into the binary wire format.
///
/// Wire format (big-endian):
/// ```text
/// ┌───────┬─────┬─────────┬──────┬──────────┬────────┬──────┬──────┬──────────┐
/// │ magic │ seq │ session │ type │ checksum │ length │ src  │ dst  │ payload  │
/// │ 1B    │ 2B  │ 1B      │ 1B   │ 2B       │ 2B     │ 8B   │ 8B   │ length B │
/// └───────┴─────┴─────────┴──────┴──────────┴────────┴──────┴──────┴──────────┘
/// ```
/// `checksum` and `length` describe the payload as it appears on the wire.
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    let src_call = callsign::pack(&frame.src)?;
    let dst_call = callsign::pack(&frame.dst)?;

    let (magic, payload) = if frame.compress {
        (MAGIC_COMPRESSED, compress(&frame.data)?)
    } else {
        (MAGIC_RAW, frame.data.to_vec())
    };
    if payload.len() > u16::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: u16::MAX as usize,
        });
    }

    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_u8(magic);
    dst.put_u16(frame.seq);
    dst.put_u8(frame.session);
    dst.put_u8(frame.kind);
    dst.put_u16(crc16(&payload));
    dst.put_u16(payload.len() as u16);
    dst.put_slice(&src_call);
    dst.put_slice(&dst_call);
    dst.put_slice(&payload);
    Ok(())
}

/// Decode a frame from the front of a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer. On error nothing is
/// consumed, so a stream decoder can skip a byte and resynchronise.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.is_empty() {
        return Ok(None);
    }
    let magic = src[0];
    if magic != MAGIC_COMPRESSED && magic != MAGIC_RAW {
        return Err(FrameError::InvalidMagic(magic));
    }
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let mut header = &src[1..HEADER_SIZE];
    let seq = header.get_u16();
    let session = header.get_u8();
    let kind = header.get_u8();
    let checksum = header.get_u16();
    let length = header.get_u16() as usize;
    let frame_src = callsign::unpack(&src[9..9 + CALLSIGN_LEN])?;
    let frame_dst = callsign::unpack(&src[17..17 + CALLSIGN_LEN])?;

    let total = HEADER_SIZE + length;
    if src.len() < total {
        return Ok(None);
    }

    let payload = &src[HEADER_SIZE..total];
    let actual = crc16(payload);
    if actual != checksum {
        return Err(FrameError::ChecksumMismatch {
            expected: checksum,
            actual,
        });
    }

    let compressed = magic == MAGIC_COMPRESSED;
    let data = if compressed {
        decompress(payload, max_payload)?
    } else {
        if payload.len() > max_payload {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: max_payload,
            });
        }
        payload.to_vec()
    };

    src.advance(total);
    Ok(Some(Frame {
        seq,
        session,
        kind,
        src: frame_src,
        dst: frame_dst,
        data: Bytes::from(data),
        compress: compressed,
    }))
}

/// Decode exactly one frame from a complete buffer.
pub fn decode_exact(buf: &[u8], max_payload: usize) -> Result<Frame> {
    let mut src = BytesMut::from(buf);
    match decode_frame(&mut src, max_payload)? {
        Some(frame) => Ok(frame),
        None => Err(FrameError::Truncated {
            needed: expected_len(buf),
            available: buf.len(),
        }),
    }
}

fn expected_len(buf: &[u8]) -> usize {
    if buf.len() < HEADER_SIZE {
        return HEADER_SIZE;
    }
    HEADER_SIZE + u16::from_be_bytes([buf[7], buf[8]]) as usize
}

fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 16), Compression::best());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn decompress(data: &[u8], max_payload: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .take(max_payload as u64 + 1)
        .read_to_end(&mut out)?;
    if out.len() > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: out.len(),
            max: max_payload,
        });
    }
    Ok(out)
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum decoded payload size in bytes. Default: 64 KiB.
    pub max_payload_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(data: &[u8]) -> Frame {
        Frame::new(3, 4, data.to_vec())
            .with_seq(17)
            .with_src("N0CALL")
            .with_dst("KD7ABC")
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let frame = sample(b"hello, ratlink!");
        let mut buf = BytesMut::new();
        encode_frame(&frame, &mut buf).unwrap();

        assert_eq!(buf[0], MAGIC_COMPRESSED);
        let decoded = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_roundtrip_payload_sizes() {
        for size in [0usize, 1, 2, 255, 256, 1024, 4096] {
            let data: Vec<u8> = (0..size).map(|i| (i * 7 % 251) as u8).collect();
            let frame = sample(&data);
            let mut buf = BytesMut::new();
            encode_frame(&frame, &mut buf).unwrap();
            let decoded = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
                .unwrap()
                .unwrap();
            assert_eq!(decoded.data.as_ref(), data.as_slice(), "size {size}");
        }
    }

    #[test]
    fn test_header_layout() {
        let frame = sample(b"x").uncompressed();
        let mut buf = BytesMut::new();
        encode_frame(&frame, &mut buf).unwrap();

        assert_eq!(buf.len(), HEADER_SIZE + 1);
        assert_eq!(buf[0], MAGIC_RAW);
        assert_eq!(&buf[1..3], &[0, 17]);
        assert_eq!(buf[3], 3);
        assert_eq!(buf[4], 4);
        assert_eq!(&buf[5..7], &crc16(b"x").to_be_bytes());
        assert_eq!(&buf[7..9], &[0, 1]);
        assert_eq!(&buf[9..17], b"N0CALL\0\0");
        assert_eq!(&buf[17..25], b"KD7ABC\0\0");
        assert_eq!(buf[25], b'x');
    }

    #[test]
    fn test_payload_compressed_even_when_it_grows() {
        let frame = sample(b"x");
        let mut buf = BytesMut::new();
        encode_frame(&frame, &mut buf).unwrap();
        assert_eq!(buf[0], MAGIC_COMPRESSED);
        assert!(buf.len() > HEADER_SIZE + 1);
        let decoded = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        assert!(decoded.compress);
        assert_eq!(decoded.data.as_ref(), b"x");
    }

    #[test]
    fn test_checksum_covers_compressed_payload() {
        let frame = sample(b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        let mut buf = BytesMut::new();
        encode_frame(&frame, &mut buf).unwrap();
        let checksum = u16::from_be_bytes([buf[5], buf[6]]);
        assert_eq!(checksum, crc16(&buf[HEADER_SIZE..]));
        let length = u16::from_be_bytes([buf[7], buf[8]]) as usize;
        assert_eq!(length, buf.len() - HEADER_SIZE);
        assert!(length < frame.data.len());
    }

    #[test]
    fn test_decode_incomplete() {
        let mut buf = BytesMut::new();
        encode_frame(&sample(b"hello"), &mut buf).unwrap();
        let full = buf.len();

        let mut header_only = BytesMut::from(&buf[..10]);
        assert!(decode_frame(&mut header_only, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .is_none());

        buf.truncate(full - 1);
        assert!(decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().is_none());
    }

    #[test]
    fn test_decode_invalid_magic() {
        let mut buf = BytesMut::from(&[0xFF; HEADER_SIZE][..]);
        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(FrameError::InvalidMagic(0xFF))));
    }

    #[test]
    fn test_decode_corrupt_payload_rejected_without_consuming() {
        let mut buf = BytesMut::new();
        encode_frame(&sample(b"payload"), &mut buf).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0x01;
        let len = buf.len();

        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(FrameError::ChecksumMismatch { .. })));
        assert_eq!(buf.len(), len);
    }

    #[test]
    fn test_payload_cap_enforced_after_decompression() {
        let frame = sample(&[0u8; 8192]);
        let mut buf = BytesMut::new();
        encode_frame(&frame, &mut buf).unwrap();
        let result = decode_frame(&mut buf, 1024);
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { .. })));
    }

    #[test]
    fn test_long_callsign_rejected() {
        let frame = sample(b"x").with_dst("WAYTOOLONG");
        let mut buf = BytesMut::new();
        assert!(matches!(
            encode_frame(&frame, &mut buf),
            Err(FrameError::CallsignTooLong(_))
        ));
    }

    #[test]
    fn test_multiple_frames() {
        let mut buf = BytesMut::new();
        encode_frame(&sample(b"first"), &mut buf).unwrap();
        encode_frame(&sample(b"second").with_seq(18), &mut buf).unwrap();

        let f1 = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        let f2 = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        assert_eq!(f1.data.as_ref(), b"first");
        assert_eq!((f2.seq, f2.data.as_ref()), (18, b"second".as_ref()));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_exact_reports_truncation() {
        let mut buf = BytesMut::new();
        encode_frame(&sample(b"hello"), &mut buf).unwrap();
        let err = decode_exact(&buf[..buf.len() - 2], DEFAULT_MAX_PAYLOAD).unwrap_err();
        assert!(matches!(err, FrameError::Truncated { .. }));
    }
}
