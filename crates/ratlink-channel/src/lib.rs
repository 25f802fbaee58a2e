//! Byte-channel abstraction for ratlink.
//!
//! Provides a unified interface over the links a station can talk through:
//! - TCP tunnels standing in for a radio (with optional text login)
//! - KISS-framed TNC modems, wrapping any other channel
//! - In-memory duplex pipes for simulation and tests
//!
//! This is the lowest layer of ratlink. Everything else builds on top of
//! the [`ByteChannel`] trait provided here.

pub mod error;
pub mod kiss;
pub mod memory;
pub mod tcp;
pub mod traits;

pub use error::{ChannelError, Result};
pub use kiss::{kiss_encode, KissChannel, KissDecoder, KissFrame};
pub use memory::MemoryChannel;
pub use tcp::{TcpChannel, TcpLogin};
pub use traits::ByteChannel;
