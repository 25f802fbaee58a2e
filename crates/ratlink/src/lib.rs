//! Reliable multiplexed sessions over lossy amateur-radio links.
//!
//! ratlink moves chat, messages and files between stations that share one
//! slow, half-duplex channel. Everything on the air is a checksummed DDT2
//! frame; sessions multiplex over that channel and recover from loss with
//! their own ARQ discipline.
//!
//! # Crate Structure
//!
//! - [`channel`]: byte links to the radio (TCP tunnel, KISS TNC, in-memory)
//! - [`frame`]: DDT2 frame codec, base64 armoring and stream deframing
//! - [`session`]: session manager and the stateless, stateful and pipelined
//!   sessions (behind the `session` feature)

/// Re-export channel types.
pub mod channel {
    pub use ratlink_channel::*;
}

/// Re-export frame types.
pub mod frame {
    pub use ratlink_frame::*;
}

/// Re-export session types (requires `session` feature).
#[cfg(feature = "session")]
pub mod session {
    pub use ratlink_session::*;
}
