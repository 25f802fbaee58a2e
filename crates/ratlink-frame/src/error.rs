/// Errors that can occur during frame encoding/decoding.
///
/// None of these are fatal to a link: a frame that fails to decode is dropped.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header contains an unknown magic byte.
    #[error("invalid frame magic 0x{0:02x}")]
    InvalidMagic(u8),

    /// The payload checksum does not match the header.
    #[error("checksum mismatch (header 0x{expected:04x}, computed 0x{actual:04x})")]
    ChecksumMismatch { expected: u16, actual: u16 },

    /// Fewer bytes than the header promises.
    #[error("truncated frame (need {needed} bytes, have {available})")]
    Truncated { needed: usize, available: usize },

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A call sign does not fit in its 8-byte field.
    #[error("call sign too long: {0:?}")]
    CallsignTooLong(String),

    /// A call sign field is not printable ASCII.
    #[error("invalid call sign field")]
    InvalidCallsign,

    /// An armored buffer lacks its `[SOB]`/`[EOB]` markers.
    #[error("missing [SOB]/[EOB] markers")]
    MissingMarkers,

    /// The armored body is not valid base64.
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Compressing or decompressing the payload failed.
    #[error("compression error: {0}")]
    Compression(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FrameError>;
