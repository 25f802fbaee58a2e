use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use ratlink_frame::{is_broadcast, Frame};
use serde::Serialize;
use tracing::info;

use crate::arq::ArqConfig;
use crate::error::{Result, SessionError};
use crate::link::Link;
use crate::pipelined::PipelinedSession;
use crate::queue::BlockingQueue;
use crate::stateful::StatefulSession;
use crate::stateless::StatelessSession;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// Closed. Both the initial and the terminal state.
    #[serde(rename = "CLSD")]
    Closed,
    /// Registered locally, handshake with the peer not yet confirmed.
    #[serde(rename = "SYNC")]
    Sync,
    /// Established; data may flow.
    #[serde(rename = "OPEN")]
    Open,
    /// Close requested, waiting for the peer to acknowledge.
    #[serde(rename = "CLSW")]
    CloseWait,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Closed => "CLSD",
            SessionState::Sync => "SYNC",
            SessionState::Open => "OPEN",
            SessionState::CloseWait => "CLSW",
        })
    }
}

/// The closed set of session disciplines a peer may ask for.
///
/// The tag travels in the new-session control frame type; unknown tags are
/// rejected rather than guessed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// Fire-and-forget datagrams.
    Stateless,
    /// Stop-and-wait ARQ.
    Stateful,
    /// Windowed ARQ with selective acknowledgement.
    Pipelined,
}

impl SessionKind {
    pub fn tag(self) -> u8 {
        match self {
            SessionKind::Stateless => 0,
            SessionKind::Stateful => 1,
            SessionKind::Pipelined => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(SessionKind::Stateless),
            1 => Some(SessionKind::Stateful),
            2 => Some(SessionKind::Pipelined),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionKind::Stateless => "stateless",
            SessionKind::Stateful => "stateful",
            SessionKind::Pipelined => "pipelined",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Payload bytes confirmed delivered (acknowledged, or written for
    /// stateless sessions).
    pub sent: u64,
    /// Payload bytes received in order.
    pub recv: u64,
    /// Retransmissions.
    pub retries: u64,
    /// Largest number of unacknowledged blocks seen at once.
    pub max_outstanding: usize,
}

/// Serializable snapshot of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: u8,
    pub remote_id: Option<u8>,
    pub name: String,
    pub peer: String,
    pub kind: SessionKind,
    pub state: SessionState,
    pub stats: SessionStats,
}

/// Callback that takes a session's inbound frames instead of its queue.
pub type FrameHandler = Arc<dyn Fn(Frame) + Send + Sync>;

struct StateCell {
    state: SessionState,
    generation: u64,
}

/// What every session discipline shares: identity, state machine, inbound
/// queue, counters and the link it talks through.
pub struct SessionCore {
    id: u8,
    name: String,
    peer: String,
    kind: SessionKind,
    remote_id: Mutex<Option<u8>>,
    state: Mutex<StateCell>,
    state_changed: Condvar,
    inbound: BlockingQueue<Frame>,
    stats: Mutex<SessionStats>,
    handler: Mutex<Option<FrameHandler>>,
    link: Arc<Link>,
}

impl SessionCore {
    /// Create a closed session core.
    pub fn new(
        id: u8,
        name: impl Into<String>,
        peer: impl Into<String>,
        kind: SessionKind,
        link: Arc<Link>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            peer: peer.into(),
            kind,
            remote_id: Mutex::new(None),
            state: Mutex::new(StateCell {
                state: SessionState::Closed,
                generation: 0,
            }),
            state_changed: Condvar::new(),
            inbound: BlockingQueue::new(),
            stats: Mutex::new(SessionStats::default()),
            handler: Mutex::new(None),
            link,
        }
    }

    /// Local session id.
    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The station this session talks to (`CQCQCQ` for broadcast).
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn is_broadcast(&self) -> bool {
        is_broadcast(&self.peer)
    }

    /// The peer's id for this conversation, once the handshake told us.
    pub fn remote_id(&self) -> Option<u8> {
        *lock(&self.remote_id)
    }

    pub fn set_remote_id(&self, id: u8) {
        *lock(&self.remote_id) = Some(id);
    }

    pub fn state(&self) -> SessionState {
        lock(&self.state).state
    }

    /// Move to `state` and wake everyone waiting on a state change.
    pub fn set_state(&self, state: SessionState) {
        let mut cell = lock(&self.state);
        if cell.state != state {
            info!(
                session = self.id,
                name = %self.name,
                from = %cell.state,
                to = %state,
                "session state change"
            );
        }
        cell.state = state;
        cell.generation += 1;
        drop(cell);
        self.state_changed.notify_all();
        self.inbound.wake();
    }

    /// Block until the state is next set, or `timeout` passes. Returns the
    /// state at wake-up.
    pub fn wait_for_state_change(&self, timeout: Duration) -> SessionState {
        let cell = lock(&self.state);
        let generation = cell.generation;
        let (cell, _) = self
            .state_changed
            .wait_timeout_while(cell, timeout, |cell| cell.generation == generation)
            .unwrap_or_else(PoisonError::into_inner);
        cell.state
    }

    /// Block until `done(state)` holds, or `timeout` passes. Returns the
    /// state at wake-up.
    pub fn wait_for_state(
        &self,
        mut done: impl FnMut(SessionState) -> bool,
        timeout: Duration,
    ) -> SessionState {
        let cell = lock(&self.state);
        let (cell, _) = self
            .state_changed
            .wait_timeout_while(cell, timeout, |cell| !done(cell.state))
            .unwrap_or_else(PoisonError::into_inner);
        cell.state
    }

    /// Fail unless the session is open and the transport is up.
    pub fn ensure_open(&self) -> Result<()> {
        if !self.link.is_online() {
            return Err(SessionError::TransportDown);
        }
        if self.state() != SessionState::Open {
            return Err(SessionError::SessionClosed { id: self.id });
        }
        Ok(())
    }

    /// Frames routed to this session and not yet consumed.
    pub fn inbound(&self) -> &BlockingQueue<Frame> {
        &self.inbound
    }

    pub fn stats(&self) -> SessionStats {
        *lock(&self.stats)
    }

    pub(crate) fn update_stats(&self, f: impl FnOnce(&mut SessionStats)) {
        f(&mut lock(&self.stats));
    }

    /// Route inbound frames to `handler` instead of the inbound queue.
    pub fn set_handler(&self, handler: impl Fn(Frame) + Send + Sync + 'static) {
        *lock(&self.handler) = Some(Arc::new(handler));
    }

    pub fn clear_handler(&self) {
        *lock(&self.handler) = None;
    }

    pub fn handler(&self) -> Option<FrameHandler> {
        lock(&self.handler).clone()
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            remote_id: self.remote_id(),
            name: self.name.clone(),
            peer: self.peer.clone(),
            kind: self.kind,
            state: self.state(),
            stats: self.stats(),
        }
    }
}

impl fmt::Debug for SessionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCore")
            .field("id", &self.id)
            .field("remote_id", &self.remote_id())
            .field("name", &self.name)
            .field("peer", &self.peer)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

/// One logical conversation multiplexed over the link.
pub trait Session: Send + Sync {
    fn core(&self) -> &SessionCore;

    /// Accept a frame the manager routed to this session.
    fn deliver(&self, frame: Frame) {
        self.core().inbound().enqueue(frame);
    }

    /// Stop the session and release its worker, if any. Idempotent.
    fn close(&self);
}

/// A registered session of any kind.
#[derive(Clone)]
pub enum SessionHandle {
    Stateless(Arc<StatelessSession>),
    Stateful(Arc<StatefulSession>),
    Pipelined(Arc<PipelinedSession>),
}

impl SessionHandle {
    /// Build and start the session discipline for `kind` around `core`.
    pub fn open(core: SessionCore, arq: &ArqConfig) -> Result<Self> {
        Ok(match core.kind() {
            SessionKind::Stateless => SessionHandle::Stateless(Arc::new(StatelessSession::new(core))),
            SessionKind::Stateful => {
                SessionHandle::Stateful(Arc::new(StatefulSession::spawn(core, arq.clone())?))
            }
            SessionKind::Pipelined => {
                SessionHandle::Pipelined(Arc::new(PipelinedSession::spawn(core, arq.clone())?))
            }
        })
    }

    pub fn session(&self) -> &dyn Session {
        match self {
            SessionHandle::Stateless(s) => s.as_ref(),
            SessionHandle::Stateful(s) => s.as_ref(),
            SessionHandle::Pipelined(s) => s.as_ref(),
        }
    }

    pub fn core(&self) -> &SessionCore {
        self.session().core()
    }

    pub fn id(&self) -> u8 {
        self.core().id()
    }

    pub fn state(&self) -> SessionState {
        self.core().state()
    }

    pub fn close(&self) {
        self.session().close();
    }

    pub fn stateless(&self) -> Result<&Arc<StatelessSession>> {
        match self {
            SessionHandle::Stateless(s) => Ok(s),
            _ => Err(self.wrong_kind()),
        }
    }

    pub fn stateful(&self) -> Result<&Arc<StatefulSession>> {
        match self {
            SessionHandle::Stateful(s) => Ok(s),
            _ => Err(self.wrong_kind()),
        }
    }

    pub fn pipelined(&self) -> Result<&Arc<PipelinedSession>> {
        match self {
            SessionHandle::Pipelined(s) => Ok(s),
            _ => Err(self.wrong_kind()),
        }
    }

    fn wrong_kind(&self) -> SessionError {
        SessionError::WrongKind {
            id: self.id(),
            actual: self.core().kind().as_str(),
        }
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.core(), f)
    }
}

/// Wait on `pending` until it yields or `deadline` passes, giving up early
/// once `closed()` holds.
pub(crate) fn wait_until<T>(
    deadline: Option<Instant>,
    poll: Duration,
    mut pending: impl FnMut(Duration) -> Option<T>,
    mut closed: impl FnMut() -> bool,
) -> WaitOutcome<T> {
    loop {
        let slice = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return WaitOutcome::TimedOut;
                }
                remaining.min(poll)
            }
            None => poll,
        };
        if let Some(value) = pending(slice) {
            return WaitOutcome::Ready(value);
        }
        if closed() {
            return WaitOutcome::Closed;
        }
    }
}

pub(crate) enum WaitOutcome<T> {
    Ready(T),
    TimedOut,
    Closed,
}
