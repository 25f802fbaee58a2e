//! DDT2 wire frames for ratlink.
//!
//! Every block that crosses the radio link is one DDT2 frame:
//! - A 25-byte big-endian header (magic, sequence, session, type, CRC-16,
//!   payload length, source and destination call signs)
//! - A zlib-compressed payload
//!
//! Links that are not 8-bit clean carry frames base64-armored between
//! `[SOB]` and `[EOB]` markers. The [`Deframer`] splits a raw byte stream back
//! into frames and passes through any plain-text position reports it finds.

pub mod armor;
pub mod callsign;
pub mod codec;
pub mod crc;
pub mod deframer;
pub mod error;

#[cfg(feature = "async")]
pub mod async_codec;

pub use armor::{armor, decode_armored, encode_armored, unarmor, EOB, SOB};
pub use callsign::{is_broadcast, BROADCAST, CALLSIGN_LEN};
pub use codec::{
    decode_exact, decode_frame, encode_frame, Frame, FrameConfig, DEFAULT_MAX_PAYLOAD, HEADER_SIZE,
    MAGIC_COMPRESSED, MAGIC_RAW,
};
pub use crc::crc16;
pub use deframer::{Deframer, Inbound};
pub use error::{FrameError, Result};

#[cfg(feature = "async")]
pub use async_codec::Ddt2Codec;
