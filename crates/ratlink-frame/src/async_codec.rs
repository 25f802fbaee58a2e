use std::collections::VecDeque;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::armor::armor;
use crate::codec::{encode_frame, Frame, FrameConfig};
use crate::deframer::{Deframer, Inbound};
use crate::error::FrameError;

/// `tokio_util` codec for DDT2 frames over an async byte stream.
///
/// Decoding runs the same [`Deframer`] the blocking transporter uses, so
/// corrupt frames are dropped and the stream resynchronises. Position
/// sentences between frames are skipped.
pub struct Ddt2Codec {
    deframer: Deframer,
    armored: bool,
    ready: VecDeque<Frame>,
}

impl Ddt2Codec {
    /// Create a codec; `armored` selects `[SOB]`/`[EOB]` text mode.
    pub fn new(armored: bool) -> Self {
        Self::with_config(armored, FrameConfig::default())
    }

    /// Create a codec with explicit configuration.
    pub fn with_config(armored: bool, config: FrameConfig) -> Self {
        Self {
            deframer: Deframer::with_config(armored, config),
            armored,
            ready: VecDeque::new(),
        }
    }
}

impl Decoder for Ddt2Codec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if !src.is_empty() {
            let chunk = src.split();
            for item in self.deframer.push(&chunk) {
                match item {
                    Inbound::Frame(frame) => self.ready.push_back(frame),
                    Inbound::Gps(line) => debug!(line = %line, "skipping position sentence"),
                }
            }
        }
        Ok(self.ready.pop_front())
    }
}

impl Encoder<Frame> for Ddt2Codec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        if self.armored {
            let mut binary = BytesMut::new();
            encode_frame(&frame, &mut binary)?;
            dst.extend_from_slice(&armor(&binary));
            Ok(())
        } else {
            encode_frame(&frame, dst)
        }
    }
}
