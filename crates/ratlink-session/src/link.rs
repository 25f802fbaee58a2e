use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use ratlink_frame::Frame;
use tracing::debug;

use crate::error::{Result, SessionError};
use crate::manager::Registry;
use crate::queue::{BlockingQueue, OutboundFrame};
use crate::session::SessionCore;

/// When the shared channel last carried inbound traffic.
///
/// One per channel, not per session: a half-duplex link that is busy with
/// anyone's traffic should hold back everyone's retransmissions.
#[derive(Debug)]
pub struct LinkActivity {
    epoch: Instant,
    // Microseconds since `epoch`, plus one. Zero means never.
    last_inbound: AtomicU64,
}

impl Default for LinkActivity {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkActivity {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_inbound: AtomicU64::new(0),
        }
    }

    /// Record inbound traffic now.
    pub fn touch(&self) {
        let micros = self.epoch.elapsed().as_micros() as u64 + 1;
        self.last_inbound.store(micros, Ordering::Relaxed);
    }

    /// Time since the last inbound traffic, or `None` if there was none.
    pub fn idle_for(&self) -> Option<Duration> {
        match self.last_inbound.load(Ordering::Relaxed) {
            0 => None,
            micros => {
                let at = Duration::from_micros(micros - 1);
                Some(self.epoch.elapsed().saturating_sub(at))
            }
        }
    }

    /// Whether the channel carried inbound traffic within `window`.
    pub fn busy_within(&self, window: Duration) -> bool {
        self.idle_for().is_some_and(|idle| idle < window)
    }
}

/// State shared between the transporter, the sessions and the manager.
///
/// Holds the station call sign, the transporter's outbound queue, the
/// channel activity clock and the online flag. Sessions reach the registry
/// through a weak reference so a session never keeps the manager alive.
pub struct Link {
    local_call: String,
    outbound: BlockingQueue<Arc<OutboundFrame>>,
    activity: LinkActivity,
    online: AtomicBool,
    registry: Weak<Registry>,
}

impl Link {
    pub fn new(local_call: impl Into<String>, registry: Weak<Registry>) -> Arc<Self> {
        Arc::new(Self {
            local_call: local_call.into(),
            outbound: BlockingQueue::new(),
            activity: LinkActivity::new(),
            online: AtomicBool::new(true),
            registry,
        })
    }

    /// This station's call sign.
    pub fn local_call(&self) -> &str {
        &self.local_call
    }

    pub fn activity(&self) -> &LinkActivity {
        &self.activity
    }

    pub fn outbound(&self) -> &BlockingQueue<Arc<OutboundFrame>> {
        &self.outbound
    }

    /// Whether the transporter is still serving the channel.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Stamp a session frame for the wire without queueing it.
    ///
    /// Source is this station; destination defaults to the session's peer;
    /// the session field carries the peer's id for the conversation when one
    /// is known, else the local id.
    pub fn prepare(&self, core: &SessionCore, mut frame: Frame) -> Arc<OutboundFrame> {
        frame.src = self.local_call.clone();
        if frame.dst.is_empty() {
            frame.dst = core.peer().to_string();
        }
        frame.session = core.remote_id().unwrap_or(core.id());
        OutboundFrame::new(frame, core.id())
    }

    /// Stamp a session frame and hand it to the transporter.
    pub fn outgoing(&self, core: &SessionCore, frame: Frame) -> Result<Arc<OutboundFrame>> {
        let entry = self.prepare(core, frame);
        self.transmit(&entry)?;
        Ok(entry)
    }

    /// Stamp a control-session frame (session 0) without queueing it.
    pub fn prepare_control(&self, mut frame: Frame) -> Arc<OutboundFrame> {
        frame.src = self.local_call.clone();
        frame.session = 0;
        OutboundFrame::new(frame, 0)
    }

    /// Queue a control-session frame (session 0).
    pub fn outgoing_control(&self, frame: Frame) -> Result<Arc<OutboundFrame>> {
        let entry = self.prepare_control(frame);
        self.transmit(&entry)?;
        Ok(entry)
    }

    /// Queue an already prepared entry, clearing its "sent" signal first.
    pub fn transmit(&self, entry: &Arc<OutboundFrame>) -> Result<()> {
        if !self.is_online() {
            return Err(SessionError::TransportDown);
        }
        entry.sent().clear();
        self.outbound.enqueue(Arc::clone(entry));
        Ok(())
    }

    /// Drop every queued outbound frame produced by local session `id`.
    pub fn flush(&self, id: u8) -> usize {
        let dropped = self.outbound.drain_where(|entry| entry.owner() == id).len();
        if dropped > 0 {
            debug!(session = id, dropped, "flushed queued outbound frames");
        }
        dropped
    }

    /// Remove a session that closed itself from the registry, firing the
    /// end callback with `reason`.
    pub(crate) fn report_closed(&self, id: u8, reason: &str) {
        if let Some(registry) = self.registry.upgrade() {
            registry.deregister(id, reason);
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("local_call", &self.local_call)
            .field("queued", &self.outbound.len())
            .field("online", &self.is_online())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionKind;

    #[test]
    fn activity_starts_idle() {
        let activity = LinkActivity::new();
        assert_eq!(activity.idle_for(), None);
        assert!(!activity.busy_within(Duration::from_secs(3)));
        activity.touch();
        assert!(activity.busy_within(Duration::from_secs(3)));
    }

    #[test]
    fn outgoing_stamps_source_destination_and_remote_id() {
        let link = Link::new("N0CALL", Weak::new());
        let core = SessionCore::new(3, "xfer", "KD7ABC", SessionKind::Stateful, Arc::clone(&link));

        let entry = link.outgoing(&core, Frame::new(0, 4, &b"a"[..])).unwrap();
        assert_eq!(entry.frame().src, "N0CALL");
        assert_eq!(entry.frame().dst, "KD7ABC");
        assert_eq!(entry.frame().session, 3);

        core.set_remote_id(9);
        let entry = link.outgoing(&core, Frame::new(0, 4, &b"b"[..])).unwrap();
        assert_eq!(entry.frame().session, 9);
        assert_eq!(entry.owner(), 3);
        assert_eq!(link.outbound().len(), 2);
    }

    #[test]
    fn flush_only_drops_the_owner() {
        let link = Link::new("N0CALL", Weak::new());
        let a = SessionCore::new(1, "a", "KD7ABC", SessionKind::Stateful, Arc::clone(&link));
        let b = SessionCore::new(2, "b", "KD7ABC", SessionKind::Stateful, Arc::clone(&link));
        link.outgoing(&a, Frame::new(0, 4, &b"1"[..])).unwrap();
        link.outgoing(&b, Frame::new(0, 4, &b"2"[..])).unwrap();
        link.outgoing(&a, Frame::new(0, 4, &b"3"[..])).unwrap();

        assert_eq!(link.flush(1), 2);
        assert_eq!(link.outbound().len(), 1);
    }

    #[test]
    fn offline_link_refuses_frames() {
        let link = Link::new("N0CALL", Weak::new());
        link.set_online(false);
        let result = link.outgoing_control(Frame::new(0, 0, &b""[..]));
        assert!(matches!(result, Err(SessionError::TransportDown)));
    }
}
