use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ratlink_channel::ByteChannel;
use ratlink_frame::{callsign, is_broadcast, Frame, Inbound};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::arq::ArqConfig;
use crate::control::{ControlConfig, ControlSession};
use crate::error::{Result, SessionError};
use crate::link::Link;
use crate::queue::OutboundFrame;
use crate::session::{SessionCore, SessionHandle, SessionKind, SessionState};
use crate::transporter::{TransportConfig, Transporter, WARMUP_SESSION, WARMUP_TYPE};

/// Highest id the registry hands out; [`WARMUP_SESSION`] stays reserved.
pub const MAX_SESSION_ID: u8 = WARMUP_SESSION - 1;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lifecycle notification passed to session callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A session was registered, by us (`incoming: false`) or at a peer's
    /// request.
    Created {
        id: u8,
        name: String,
        peer: String,
        incoming: bool,
    },
    /// A registered session went away.
    Ended {
        id: u8,
        name: String,
        peer: String,
        reason: String,
    },
    /// A locally started session never got past its handshake.
    Failed {
        id: u8,
        name: String,
        peer: String,
        reason: String,
    },
}

impl SessionEvent {
    pub fn id(&self) -> u8 {
        match self {
            SessionEvent::Created { id, .. }
            | SessionEvent::Ended { id, .. }
            | SessionEvent::Failed { id, .. } => *id,
        }
    }
}

pub type SessionCallback = Arc<dyn Fn(&SessionEvent) + Send + Sync>;
pub type GpsHandler = Arc<dyn Fn(&str) + Send + Sync>;

struct Slots {
    sessions: HashMap<u8, SessionHandle>,
    last_id: u8,
}

/// Table of live sessions keyed by local id.
///
/// Id 0 belongs to the control session and is never handed out. Callbacks
/// run after the table lock is released.
pub struct Registry {
    slots: Mutex<Slots>,
    callbacks: Mutex<Vec<SessionCallback>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                sessions: HashMap::new(),
                last_id: 0,
            }),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Allocate the next free id, build the session for it and register it.
    ///
    /// Ids run from 1 to [`MAX_SESSION_ID`]. The search starts just after
    /// the last id handed out and wraps, so a freshly closed id is not reused
    /// straight away.
    pub fn register_with(
        &self,
        incoming: bool,
        build: impl FnOnce(u8) -> Result<SessionHandle>,
    ) -> Result<SessionHandle> {
        let handle = {
            let mut slots = lock(&self.slots);
            let last = u16::from(slots.last_id);
            let span = u16::from(MAX_SESSION_ID);
            let id = (1..=span)
                .map(|step| ((last + step - 1) % span + 1) as u8)
                .find(|id| !slots.sessions.contains_key(id))
                .ok_or(SessionError::NoFreeSessionId)?;
            let handle = build(id)?;
            slots.sessions.insert(id, handle.clone());
            slots.last_id = id;
            handle
        };
        let core = handle.core();
        debug!(session = core.id(), name = %core.name(), peer = %core.peer(), incoming, "registered session");
        self.notify(&SessionEvent::Created {
            id: core.id(),
            name: core.name().to_string(),
            peer: core.peer().to_string(),
            incoming,
        });
        Ok(handle)
    }

    pub fn get(&self, id: u8) -> Option<SessionHandle> {
        lock(&self.slots).sessions.get(&id).cloned()
    }

    /// First session matching `pred`, lowest id first.
    pub fn find(&self, mut pred: impl FnMut(&SessionCore) -> bool) -> Option<SessionHandle> {
        let slots = lock(&self.slots);
        let mut ids: Vec<&u8> = slots.sessions.keys().collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|id| slots.sessions.get(id))
            .find(|handle| pred(handle.core()))
            .cloned()
    }

    /// The session bound to the peer's id `remote_id` for `peer`.
    pub fn find_by_peer(&self, peer: &str, remote_id: u8) -> Option<SessionHandle> {
        self.find(|core| core.peer() == peer && core.remote_id() == Some(remote_id))
    }

    pub fn find_by_name(&self, name: &str) -> Option<SessionHandle> {
        self.find(|core| core.name() == name)
    }

    /// Every registered session, ordered by id.
    pub fn sessions(&self) -> Vec<SessionHandle> {
        let mut sessions: Vec<SessionHandle> = lock(&self.slots).sessions.values().cloned().collect();
        sessions.sort_by_key(SessionHandle::id);
        sessions
    }

    /// Remove session `id`, firing [`SessionEvent::Ended`] if it was
    /// registered. Removing an unknown id is a no-op.
    pub fn deregister(&self, id: u8, reason: &str) -> Option<SessionHandle> {
        let handle = lock(&self.slots).sessions.remove(&id)?;
        info!(session = id, reason, "session deregistered");
        self.notify(&SessionEvent::Ended {
            id,
            name: handle.core().name().to_string(),
            peer: handle.core().peer().to_string(),
            reason: reason.to_string(),
        });
        Some(handle)
    }

    /// Like [`deregister`](Self::deregister) but reports a failed start.
    pub fn fail(&self, id: u8, reason: &str) -> Option<SessionHandle> {
        let handle = lock(&self.slots).sessions.remove(&id)?;
        warn!(session = id, reason, "session failed");
        self.notify(&SessionEvent::Failed {
            id,
            name: handle.core().name().to_string(),
            peer: handle.core().peer().to_string(),
            reason: reason.to_string(),
        });
        Some(handle)
    }

    pub fn add_callback(&self, callback: impl Fn(&SessionEvent) + Send + Sync + 'static) {
        lock(&self.callbacks).push(Arc::new(callback));
    }

    pub fn len(&self) -> usize {
        lock(&self.slots).sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify(&self, event: &SessionEvent) {
        let callbacks = lock(&self.callbacks).clone();
        for callback in callbacks {
            callback(event);
        }
    }
}

/// Everything a [`SessionManager`] needs to know, in one place.
#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    pub transport: TransportConfig,
    pub control: ControlConfig,
    pub arq: ArqConfig,
}

struct Inner {
    link: Arc<Link>,
    registry: Arc<Registry>,
    control: ControlSession,
    arq: ArqConfig,
    gps: Mutex<Option<GpsHandler>>,
}

impl Inner {
    fn dispatch(&self, item: Inbound) {
        match item {
            Inbound::Frame(frame) => self.incoming(frame),
            Inbound::Gps(line) => match lock(&self.gps).clone() {
                Some(handler) => handler(&line),
                None => debug!(%line, "position report ignored"),
            },
        }
    }

    fn incoming(&self, frame: Frame) {
        let local = self.link.local_call();
        if frame.dst != local && !is_broadcast(&frame.dst) {
            debug!(src = %frame.src, dst = %frame.dst, "frame for another station");
            return;
        }
        if frame.src == local {
            debug!(session = frame.session, "ignoring our own frame");
            return;
        }
        if frame.session == WARMUP_SESSION && frame.kind == WARMUP_TYPE {
            return;
        }
        if frame.session == 0 {
            self.control.handle(frame);
            return;
        }
        let Some(handle) = self.registry.get(frame.session) else {
            debug!(session = frame.session, src = %frame.src, "frame for unknown session");
            return;
        };
        let core = handle.core();
        if !core.is_broadcast() && frame.src != core.peer() {
            debug!(
                session = frame.session,
                src = %frame.src,
                peer = %core.peer(),
                "frame from the wrong station"
            );
            return;
        }
        debug!(session = frame.session, seq = frame.seq, kind = frame.kind, src = %frame.src, "routing frame");
        match core.handler() {
            Some(handler) => handler(frame),
            None => handle.session().deliver(frame),
        }
    }
}

/// Multiplexes sessions over one byte channel.
///
/// Owns the transporter thread and the session registry. Dropping the
/// manager closes every session and stops the transporter.
pub struct SessionManager {
    inner: Arc<Inner>,
    transporter: Transporter,
}

impl SessionManager {
    /// Start serving `channel` as station `local_call`.
    pub fn start<C>(local_call: &str, channel: C, config: ManagerConfig) -> Result<Self>
    where
        C: ByteChannel + 'static,
    {
        callsign::pack(local_call)?;
        let registry = Arc::new(Registry::new());
        let link = Link::new(local_call, Arc::downgrade(&registry));
        let control = ControlSession::new(
            Arc::clone(&link),
            Arc::clone(&registry),
            config.control,
            config.arq.clone(),
        );
        let inner = Arc::new(Inner {
            link: Arc::clone(&link),
            registry,
            control,
            arq: config.arq,
            gps: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let transporter = Transporter::spawn(channel, link, config.transport, move |item| {
            if let Some(inner) = weak.upgrade() {
                inner.dispatch(item);
            }
        })?;
        info!(call = local_call, "session manager started");
        Ok(Self { inner, transporter })
    }

    pub fn local_call(&self) -> &str {
        self.inner.link.local_call()
    }

    /// Whether the transporter is still serving the channel.
    pub fn is_online(&self) -> bool {
        self.transporter.is_running()
    }

    /// Open a session named `name` with `dest`.
    ///
    /// Sessions to `CQCQCQ` open immediately; anything else runs the
    /// new-session handshake on the calling thread and fails with
    /// [`SessionError::HandshakeFailed`] if the peer never answers.
    pub fn start_session(&self, name: &str, dest: &str, kind: SessionKind) -> Result<SessionHandle> {
        let inner = &self.inner;
        let handle = inner.registry.register_with(false, |id| {
            let core = SessionCore::new(id, name, dest, kind, Arc::clone(&inner.link));
            let state = if core.is_broadcast() {
                SessionState::Open
            } else {
                SessionState::Sync
            };
            core.set_state(state);
            SessionHandle::open(core, &inner.arq)
        })?;
        if handle.core().is_broadcast() {
            return Ok(handle);
        }
        if let Err(err) = inner.control.new_session(handle.core()) {
            inner.link.flush(handle.id());
            inner.registry.fail(handle.id(), &err.to_string());
            handle.close();
            return Err(err);
        }
        Ok(handle)
    }

    /// End `handle`: drop its queued frames, tell the peer, deregister and
    /// close. A peer that never acknowledges the end is logged, not an error.
    pub fn stop_session(&self, handle: &SessionHandle) -> Result<()> {
        let inner = &self.inner;
        let core = handle.core();
        inner.link.flush(core.id());
        if !core.is_broadcast() && core.state() != SessionState::Closed && inner.link.is_online() {
            if let Err(err) = inner.control.end_session(core) {
                warn!(session = core.id(), error = %err, "closing without peer acknowledgement");
            }
        }
        inner.registry.deregister(core.id(), "closed locally");
        handle.close();
        Ok(())
    }

    pub fn get_session(&self, id: u8) -> Option<SessionHandle> {
        self.inner.registry.get(id)
    }

    /// The session `peer` knows by `remote_id`.
    pub fn get_session_by_peer(&self, peer: &str, remote_id: u8) -> Option<SessionHandle> {
        self.inner.registry.find_by_peer(peer, remote_id)
    }

    pub fn get_session_by_name(&self, name: &str) -> Option<SessionHandle> {
        self.inner.registry.find_by_name(name)
    }

    pub fn sessions(&self) -> Vec<SessionHandle> {
        self.inner.registry.sessions()
    }

    /// Call `callback` on every session creation, end and failed start.
    pub fn register_session_cb(&self, callback: impl Fn(&SessionEvent) + Send + Sync + 'static) {
        self.inner.registry.add_callback(callback);
    }

    /// Receive position sentences found between frames on the channel.
    pub fn set_gps_handler(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        *lock(&self.inner.gps) = Some(Arc::new(handler));
    }

    /// Route a frame as if it had arrived from the channel.
    pub fn incoming(&self, frame: Frame) {
        self.inner.incoming(frame);
    }

    /// Stamp `frame` for `core` and queue it for transmission.
    pub fn outgoing(&self, core: &SessionCore, frame: Frame) -> Result<Arc<OutboundFrame>> {
        self.inner.link.outgoing(core, frame)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.inner.link
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        let registry = &self.inner.registry;
        for handle in registry.sessions() {
            registry.deregister(handle.id(), "manager shut down");
            handle.close();
        }
        self.transporter.stop();
        info!(call = self.inner.link.local_call(), "session manager stopped");
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("link", &self.inner.link)
            .field("sessions", &self.inner.registry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;

    use super::*;

    fn stateless(registry: &Registry, link: &Arc<Link>, incoming: bool) -> SessionHandle {
        registry
            .register_with(incoming, |id| {
                let core = SessionCore::new(id, "chat", "KD7ABC", SessionKind::Stateless, Arc::clone(link));
                SessionHandle::open(core, &ArqConfig::default())
            })
            .unwrap()
    }

    #[test]
    fn ids_start_at_one_and_skip_recently_used() {
        let registry = Registry::new();
        let link = Link::new("N0CALL", Weak::new());
        let a = stateless(&registry, &link, false);
        let b = stateless(&registry, &link, false);
        assert_eq!((a.id(), b.id()), (1, 2));

        registry.deregister(1, "test");
        let c = stateless(&registry, &link, false);
        assert_eq!(c.id(), 3);
    }

    #[test]
    fn allocation_wraps_and_skips_reserved_ids() {
        let registry = Registry::new();
        let link = Link::new("N0CALL", Weak::new());
        for _ in 0..MAX_SESSION_ID {
            stateless(&registry, &link, false);
        }
        assert_eq!(registry.len(), usize::from(MAX_SESSION_ID));
        assert!(registry.get(0).is_none());
        assert!(registry.get(WARMUP_SESSION).is_none());

        let result = registry.register_with(false, |id| {
            let core = SessionCore::new(id, "x", "KD7ABC", SessionKind::Stateless, Arc::clone(&link));
            SessionHandle::open(core, &ArqConfig::default())
        });
        assert!(matches!(result, Err(SessionError::NoFreeSessionId)));

        registry.deregister(7, "test");
        assert_eq!(stateless(&registry, &link, false).id(), 7);

        // After the top id the search wraps to 1, never through 255.
        registry.deregister(MAX_SESSION_ID, "test");
        registry.deregister(1, "test");
        assert_eq!(stateless(&registry, &link, false).id(), MAX_SESSION_ID);
        assert_eq!(stateless(&registry, &link, false).id(), 1);
    }

    #[test]
    fn callbacks_see_create_and_end_once() {
        let registry = Registry::new();
        let link = Link::new("N0CALL", Weak::new());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        registry.add_callback(move |event| sink.lock().unwrap().push(event.clone()));

        let handle = stateless(&registry, &link, true);
        registry.deregister(handle.id(), "done");
        registry.deregister(handle.id(), "done again");

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], SessionEvent::Created { incoming: true, .. }));
        assert!(matches!(&events[1], SessionEvent::Ended { reason, .. } if reason == "done"));
    }

    #[test]
    fn lookup_by_peer_and_name() {
        let registry = Registry::new();
        let link = Link::new("N0CALL", Weak::new());
        let handle = stateless(&registry, &link, false);
        handle.core().set_remote_id(12);

        assert_eq!(registry.find_by_peer("KD7ABC", 12).unwrap().id(), handle.id());
        assert!(registry.find_by_peer("KD7ABC", 13).is_none());
        assert!(registry.find_by_peer("W1AW", 12).is_none());
        assert_eq!(registry.find_by_name("chat").unwrap().id(), handle.id());
    }

    #[test]
    fn events_serialize_with_tag() {
        let event = SessionEvent::Ended {
            id: 4,
            name: "xfer".into(),
            peer: "KD7ABC".into(),
            reason: "retries exhausted".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "ended");
        assert_eq!(json["reason"], "retries exhausted");
        assert_eq!(event.id(), 4);
    }
}
