use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ratlink_frame::Frame;
use tracing::{debug, info, warn};

use crate::arq::ArqConfig;
use crate::error::{Result, SessionError};
use crate::link::Link;
use crate::manager::Registry;
use crate::session::{SessionCore, SessionHandle, SessionKind, SessionState};

/// Control frame type: acknowledgement. `seq` carries the acknowledged type.
pub const T_ACK: u8 = 0;
/// Control frame type: end of session. Data is the session id as decimal text.
pub const T_END: u8 = 1;
/// Control frame type base for new-session requests; the session kind tag is
/// added to it.
pub const T_NEW: u8 = 4;

/// Attempt counts and waits for the control handshakes.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// New-session attempts before giving up. Default: 10.
    pub new_attempts: u32,
    /// Wait for a control frame to go out on the air. Default: 10s.
    pub sent_wait: Duration,
    /// Wait for the peer's answer on a normal round. Default: 5s.
    pub answer_wait: Duration,
    /// Wait for the peer's answer once it said it is still synchronizing.
    /// Default: 15s.
    pub sync_wait: Duration,
    /// End-of-session attempts before giving up. Default: 3.
    pub end_attempts: u32,
    /// Wait for the peer to acknowledge an end request. Default: 15s.
    pub end_wait: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            new_attempts: 10,
            sent_wait: Duration::from_secs(10),
            answer_wait: Duration::from_secs(5),
            sync_wait: Duration::from_secs(15),
            end_attempts: 3,
            end_wait: Duration::from_secs(15),
        }
    }
}

/// Session 0: creates and tears down every other session in-band.
///
/// The initiator side (`new_session`, `end_session`) blocks the caller
/// while it retries; the responder side runs on the transporter thread via
/// `handle`.
pub struct ControlSession {
    link: Arc<Link>,
    registry: Arc<Registry>,
    config: ControlConfig,
    arq: ArqConfig,
    syncing: Mutex<HashSet<u8>>,
}

impl ControlSession {
    pub fn new(link: Arc<Link>, registry: Arc<Registry>, config: ControlConfig, arq: ArqConfig) -> Self {
        Self {
            link,
            registry,
            config,
            arq,
            syncing: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Ask the peer to open `core`, which must be registered and in `SYNC`.
    /// Returns once the peer has acknowledged and the session is `OPEN`.
    pub fn new_session(&self, core: &SessionCore) -> Result<()> {
        let mut data = vec![core.id()];
        data.extend_from_slice(core.name().as_bytes());
        let request = Frame::new(0, T_NEW + core.kind().tag(), data).with_dst(core.peer());

        let result = self.retry_new(core, &request);
        self.syncing_set().remove(&core.id());
        result
    }

    fn retry_new(&self, core: &SessionCore, request: &Frame) -> Result<()> {
        for attempt in 1..=self.config.new_attempts {
            let entry = self.link.outgoing_control(request.clone())?;
            if !entry.sent().wait(self.config.sent_wait) {
                warn!(session = core.id(), attempt, "new-session request not sent in time");
                continue;
            }
            let wait = if attempt > 1 && self.syncing_set().contains(&core.id()) {
                self.config.sync_wait
            } else {
                self.config.answer_wait
            };
            match core.wait_for_state(|state| state != SessionState::Sync, wait) {
                SessionState::Open => {
                    info!(
                        session = core.id(),
                        remote = ?core.remote_id(),
                        peer = %core.peer(),
                        attempt,
                        "session established"
                    );
                    return Ok(());
                }
                SessionState::Sync => {
                    debug!(session = core.id(), attempt, "no answer to new-session request")
                }
                other => {
                    return Err(SessionError::HandshakeFailed(format!(
                        "session {} went {other} during handshake",
                        core.id()
                    )))
                }
            }
        }
        Err(SessionError::HandshakeFailed(format!(
            "{} did not answer after {} attempts",
            core.peer(),
            self.config.new_attempts
        )))
    }

    /// Tell the peer `core` is ending and wait for its acknowledgement.
    pub fn end_session(&self, core: &SessionCore) -> Result<()> {
        if core.state() == SessionState::Closed {
            return Ok(());
        }
        core.set_state(SessionState::CloseWait);
        let id = core.remote_id().unwrap_or(core.id());
        let request = Frame::new(0, T_END, id.to_string()).with_dst(core.peer());

        for attempt in 1..=self.config.end_attempts {
            let entry = self.link.outgoing_control(request.clone())?;
            if !entry.sent().wait(self.config.sent_wait) {
                warn!(session = core.id(), attempt, "end request not sent in time");
                continue;
            }
            let state = core.wait_for_state(|state| state == SessionState::Closed, self.config.end_wait);
            if state == SessionState::Closed {
                info!(session = core.id(), attempt, "session ended");
                return Ok(());
            }
        }
        Err(SessionError::HandshakeFailed(format!(
            "{} did not acknowledge end of session {}",
            core.peer(),
            core.id()
        )))
    }

    /// Process a control frame routed to session 0.
    pub fn handle(&self, frame: Frame) {
        if frame.dst != self.link.local_call() {
            debug!(src = %frame.src, dst = %frame.dst, "ignoring control frame for another station");
            return;
        }
        match frame.kind {
            T_ACK => self.on_ack(&frame),
            T_END => self.on_end(&frame),
            kind if kind >= T_NEW => match SessionKind::from_tag(kind - T_NEW) {
                Some(session_kind) => self.on_new(&frame, session_kind),
                None => warn!(src = %frame.src, kind, "new-session request for unknown kind"),
            },
            kind => warn!(src = %frame.src, kind, "unknown control frame type"),
        }
    }

    /// A new session stays in `SYNC` until its acknowledgement is on the
    /// air. A request repeated before then gets the one-byte "still
    /// synchronizing" answer.
    fn on_new(&self, frame: &Frame, kind: SessionKind) {
        let Some((&requested, name)) = frame.data.split_first() else {
            warn!(src = %frame.src, "empty new-session request");
            return;
        };
        let acked = frame.kind;

        if let Some(existing) = self.registry.find_by_peer(&frame.src, requested) {
            debug!(session = existing.id(), src = %frame.src, requested, "repeated new-session request");
            let data = if existing.state() == SessionState::Sync {
                vec![requested]
            } else {
                vec![requested, existing.id()]
            };
            self.reply(&frame.src, acked, data);
            return;
        }

        let name = String::from_utf8_lossy(name).into_owned();
        let peer = frame.src.clone();
        let link = Arc::clone(&self.link);
        let result = self.registry.register_with(true, |id| {
            let core = SessionCore::new(id, name, peer, kind, link);
            core.set_remote_id(requested);
            core.set_state(SessionState::Sync);
            SessionHandle::open(core, &self.arq)
        });
        let handle = match result {
            Ok(handle) => handle,
            Err(err) => {
                warn!(src = %frame.src, error = %err, "refusing new session");
                return;
            }
        };
        info!(
            session = handle.id(),
            remote = requested,
            peer = %frame.src,
            kind = %kind,
            "accepted new session"
        );

        let ack = self.link.prepare_control(ack_frame(&frame.src, acked, vec![requested, handle.id()]));
        let opened = handle.clone();
        ack.on_sent(move || {
            let core = opened.core();
            if core.state() == SessionState::Sync {
                core.set_state(SessionState::Open);
            }
        });
        if let Err(err) = self.link.transmit(&ack) {
            warn!(dst = %frame.src, error = %err, "control acknowledgement not queued");
        }
    }

    fn on_ack(&self, frame: &Frame) {
        let acked = frame.seq as u8;
        if acked == T_END {
            return self.on_end_ack(frame);
        }
        if acked < T_NEW {
            warn!(src = %frame.src, acked, "acknowledgement of unknown control type");
            return;
        }
        match frame.data[..] {
            [local] => match self.registry.get(local) {
                Some(handle) if handle.state() == SessionState::Sync => {
                    debug!(session = local, "peer still synchronizing");
                    self.syncing_set().insert(local);
                }
                _ => debug!(session = local, "late synchronizing answer"),
            },
            [local, assigned, ..] => {
                let Some(handle) = self.registry.get(local) else {
                    debug!(session = local, "acknowledgement for unknown session");
                    return;
                };
                let core = handle.core();
                if core.peer() != frame.src {
                    debug!(session = local, src = %frame.src, "acknowledgement from the wrong station");
                    return;
                }
                if core.state() == SessionState::Sync {
                    core.set_remote_id(assigned);
                    core.set_state(SessionState::Open);
                }
            }
            [] => warn!(src = %frame.src, "empty new-session acknowledgement"),
        }
    }

    fn on_end(&self, frame: &Frame) {
        let Some(id) = parse_id(&frame.data) else {
            warn!(src = %frame.src, "malformed end request");
            return;
        };
        match self.registry.get(id) {
            Some(handle) if handle.core().peer() == frame.src => {
                info!(session = id, peer = %frame.src, "peer ended session");
                handle.close();
                self.registry.deregister(id, "closed by peer");
            }
            _ => debug!(session = id, src = %frame.src, "end request for unknown session"),
        }
        self.reply(&frame.src, T_END, frame.data.to_vec());
    }

    fn on_end_ack(&self, frame: &Frame) {
        let Some(id) = parse_id(&frame.data) else {
            warn!(src = %frame.src, "malformed end acknowledgement");
            return;
        };
        let handle = self
            .registry
            .find_by_peer(&frame.src, id)
            .or_else(|| self.registry.get(id).filter(|h| h.core().peer() == frame.src));
        match handle {
            Some(handle) if handle.state() == SessionState::CloseWait => {
                handle.core().set_state(SessionState::Closed);
            }
            _ => debug!(session = id, src = %frame.src, "stale end acknowledgement"),
        }
    }

    fn reply(&self, dst: &str, acked: u8, data: Vec<u8>) {
        if let Err(err) = self.link.outgoing_control(ack_frame(dst, acked, data)) {
            warn!(dst, error = %err, "control acknowledgement not queued");
        }
    }

    fn syncing_set(&self) -> std::sync::MutexGuard<'_, HashSet<u8>> {
        self.syncing.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn ack_frame(dst: &str, acked: u8, data: Vec<u8>) -> Frame {
    Frame::new(0, T_ACK, data)
        .with_seq(u16::from(acked))
        .with_dst(dst)
}

fn parse_id(data: &[u8]) -> Option<u8> {
    std::str::from_utf8(data).ok()?.trim().parse().ok()
}
