//! Multiplexed sessions over a shared radio link.
//!
//! This is the "just works" layer. Start a [`SessionManager`] on any
//! [`ByteChannel`](ratlink_channel::ByteChannel), then open sessions to other
//! stations:
//! - Stateless sessions for fire-and-forget chat and broadcasts
//! - Stateful sessions: stop-and-wait ARQ, one block in flight
//! - Pipelined sessions: windowed ARQ with selective acknowledgement
//!
//! Session 0 is the in-band control session that sets the others up and
//! tears them down. One transporter thread owns the channel; every ARQ
//! session runs its own worker thread.

pub mod arq;
pub mod control;
pub mod error;
pub mod link;
pub mod manager;
pub mod pipelined;
pub mod queue;
pub mod session;
pub mod stateful;
pub mod stateless;
pub mod transporter;

pub use arq::{split_blocks, ArqConfig};
pub use control::{ControlConfig, ControlSession};
pub use error::{Result, SessionError};
pub use link::{Link, LinkActivity};
pub use manager::{GpsHandler, ManagerConfig, Registry, MAX_SESSION_ID, SessionCallback, SessionEvent, SessionManager};
pub use pipelined::PipelinedSession;
pub use queue::{BlockingQueue, OutboundFrame, Signal};
pub use session::{
    FrameHandler, Session, SessionCore, SessionHandle, SessionInfo, SessionKind, SessionState,
    SessionStats,
};
pub use stateful::StatefulSession;
pub use stateless::{Datagram, StatelessSession};
pub use transporter::{TransportConfig, Transporter, Warmup};
