use std::time::{Duration, Instant};

use bytes::Bytes;
use ratlink_frame::Frame;

use crate::error::{Result, SessionError};
use crate::queue::OutboundFrame;
use crate::session::{wait_until, Session, SessionCore, SessionState, WaitOutcome};

/// Frame type of a stateless datagram.
pub const T_DATA: u8 = 0;

const READ_POLL: Duration = Duration::from_millis(50);

/// A datagram received on a stateless session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub src: String,
    pub dst: String,
    pub data: Bytes,
}

/// Fire-and-forget session: no acknowledgement, no retry, arrival order.
pub struct StatelessSession {
    core: SessionCore,
}

impl StatelessSession {
    pub fn new(core: SessionCore) -> Self {
        Self { core }
    }

    /// Send `buf` to `dst`, or to the session's peer if `None`.
    ///
    /// Returns the queued entry; its "sent" signal fires once the frame is
    /// on the air.
    pub fn write(&self, dst: Option<&str>, buf: &[u8]) -> Result<std::sync::Arc<OutboundFrame>> {
        self.core.ensure_open()?;
        let mut frame = Frame::new(0, T_DATA, Bytes::copy_from_slice(buf));
        if let Some(dst) = dst {
            frame = frame.with_dst(dst);
        }
        let entry = self.core.link().outgoing(&self.core, frame)?;
        let len = buf.len() as u64;
        self.core.update_stats(|stats| stats.sent += len);
        Ok(entry)
    }

    /// Next datagram in arrival order.
    pub fn read(&self, timeout: Option<Duration>) -> Result<Datagram> {
        let outcome = wait_until(
            timeout.map(|t| Instant::now() + t),
            READ_POLL,
            |slice| self.core.inbound().dequeue(Some(slice)),
            || self.core.state() == SessionState::Closed && self.core.inbound().is_empty(),
        );
        match outcome {
            WaitOutcome::Ready(frame) => {
                let len = frame.data.len() as u64;
                self.core.update_stats(|stats| stats.recv += len);
                Ok(Datagram {
                    src: frame.src,
                    dst: frame.dst,
                    data: frame.data,
                })
            }
            WaitOutcome::TimedOut => Err(SessionError::Timeout(timeout.unwrap_or_default())),
            WaitOutcome::Closed => Err(SessionError::SessionClosed { id: self.core.id() }),
        }
    }
}

impl Session for StatelessSession {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn close(&self) {
        self.core.set_state(SessionState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Weak};

    use super::*;
    use crate::link::Link;
    use crate::session::SessionKind;

    fn open_session() -> (Arc<Link>, StatelessSession) {
        let link = Link::new("N0CALL", Weak::new());
        let core = SessionCore::new(1, "chat", "CQCQCQ", SessionKind::Stateless, Arc::clone(&link));
        core.set_state(SessionState::Open);
        (link, StatelessSession::new(core))
    }

    #[test]
    fn write_defaults_to_session_peer() {
        let (link, session) = open_session();
        session.write(None, b"hello").unwrap();
        session.write(Some("KD7ABC"), b"direct").unwrap();

        let first = link.outbound().try_dequeue().unwrap();
        assert_eq!(first.frame().dst, "CQCQCQ");
        assert_eq!(first.frame().kind, T_DATA);
        let second = link.outbound().try_dequeue().unwrap();
        assert_eq!(second.frame().dst, "KD7ABC");
        assert_eq!(session.core().stats().sent, 11);
    }

    #[test]
    fn read_returns_addresses_and_payload() {
        let (_link, session) = open_session();
        let frame = Frame::new(1, T_DATA, &b"hi"[..])
            .with_src("KD7ABC")
            .with_dst("CQCQCQ");
        session.deliver(frame);
        let got = session.read(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(
            got,
            Datagram {
                src: "KD7ABC".to_string(),
                dst: "CQCQCQ".to_string(),
                data: Bytes::from_static(b"hi"),
            }
        );
    }

    #[test]
    fn read_times_out_then_reports_close() {
        let (_link, session) = open_session();
        assert!(matches!(
            session.read(Some(Duration::from_millis(10))),
            Err(SessionError::Timeout(_))
        ));
        session.close();
        assert!(matches!(
            session.read(None),
            Err(SessionError::SessionClosed { id: 1 })
        ));
        assert!(matches!(
            session.write(None, b"late"),
            Err(SessionError::SessionClosed { id: 1 })
        ));
    }
}
