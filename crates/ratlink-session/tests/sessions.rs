mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use common::{fast_config, pattern, record_events, station_pair, wait_for, Faults};
use ratlink_session::{
    Result, SessionError, SessionEvent, SessionHandle, SessionKind, SessionManager, SessionState,
};

const LONG: Duration = Duration::from_secs(20);

/// The responder-side session for `handle`, once its acknowledgement went
/// out and it opened.
fn peer_session(peer: &SessionManager, handle: &SessionHandle) -> SessionHandle {
    wait_for(LONG, || {
        peer.get_session_by_peer("N0CALL", handle.id())
            .filter(|remote| remote.state() == SessionState::Open)
    })
    .expect("peer opened the session")
}

/// Read blocks until `len` bytes have arrived.
fn collect(len: usize, mut read: impl FnMut(Option<Duration>) -> Result<Bytes>) -> Vec<u8> {
    let mut got = Vec::with_capacity(len);
    while got.len() < len {
        let block = read(Some(LONG)).expect("block arrives");
        got.extend_from_slice(&block);
    }
    got
}

#[test]
fn broadcast_chat_reaches_the_other_station() {
    let (a, b, _) = station_pair(fast_config(), Faults::default());
    let chat_a = a.start_session("chat", "CQCQCQ", SessionKind::Stateless).unwrap();
    let chat_b = b.start_session("chat", "CQCQCQ", SessionKind::Stateless).unwrap();
    assert_eq!(chat_a.id(), 1);
    assert_eq!(chat_b.id(), 1);
    assert_eq!(chat_a.state(), SessionState::Open);

    chat_a.stateless().unwrap().write(None, b"hello").unwrap();
    let datagram = chat_b
        .stateless()
        .unwrap()
        .read(Some(Duration::from_secs(5)))
        .unwrap();
    assert_eq!(datagram.src, "N0CALL");
    assert_eq!(datagram.dst, "CQCQCQ");
    assert_eq!(&datagram.data[..], b"hello");
    assert_eq!(chat_a.core().stats().sent, 5);
    assert_eq!(chat_b.core().stats().recv, 5);
}

#[test]
fn stateless_read_times_out() {
    let (a, _b, _) = station_pair(fast_config(), Faults::default());
    let chat = a.start_session("chat", "CQCQCQ", SessionKind::Stateless).unwrap();
    let result = chat.stateless().unwrap().read(Some(Duration::from_millis(30)));
    assert!(matches!(result, Err(SessionError::Timeout(_))));
}

#[test]
fn handshake_survives_a_lossy_channel() {
    let (a, b, _) = station_pair(fast_config(), Faults::lossy(3));
    let kinds = [SessionKind::Stateless, SessionKind::Stateful, SessionKind::Stateless];

    for (n, kind) in kinds.into_iter().enumerate() {
        let local = a
            .start_session(&format!("session-{n}"), "KD7ABC", kind)
            .expect("handshake completes despite loss");
        let remote = peer_session(&b, &local);

        assert_eq!(local.state(), SessionState::Open);
        assert_eq!(remote.state(), SessionState::Open);
        assert_eq!(local.core().remote_id(), Some(remote.id()));
        assert_eq!(remote.core().remote_id(), Some(local.id()));
        assert_eq!(remote.core().kind(), kind);
        assert_eq!(remote.core().name(), format!("session-{n}"));
    }
    assert_eq!(b.sessions().len(), kinds.len());
}

#[test]
fn handshake_fails_without_a_peer() {
    let mut config = fast_config();
    config.control.new_attempts = 2;
    config.control.answer_wait = Duration::from_millis(50);
    let (a, _b, _) = station_pair(config, Faults::default());
    let events = record_events(&a);

    let result = a.start_session("xfer", "W1AW", SessionKind::Stateful);
    assert!(matches!(result, Err(SessionError::HandshakeFailed(_))));
    assert!(a.sessions().is_empty());

    let events = events.lock().unwrap();
    assert!(matches!(events.last(), Some(SessionEvent::Failed { peer, .. }) if peer == "W1AW"));
}

#[test]
fn stateful_delivers_in_order_despite_reordering() {
    let (a, b, _) = station_pair(fast_config(), Faults::reordering());
    let local = a.start_session("xfer", "KD7ABC", SessionKind::Stateful).unwrap();
    let remote = peer_session(&b, &local);

    let data = pattern(40 * 16);
    local.stateful().unwrap().write(&data, Some(LONG)).unwrap();

    let receiver = remote.stateful().unwrap();
    let got = collect(data.len(), |timeout| receiver.read(timeout));
    assert_eq!(got, data);
    assert_eq!(local.core().stats().sent, data.len() as u64);
    assert_eq!(remote.core().stats().recv, data.len() as u64);
}

#[test]
fn stateful_survives_a_lossy_channel() {
    let (a, b, _) = station_pair(fast_config(), Faults::lossy(3));
    let local = a.start_session("xfer", "KD7ABC", SessionKind::Stateful).unwrap();
    let remote = peer_session(&b, &local);

    let data = pattern(20 * 16 + 3);
    local.stateful().unwrap().write(&data, Some(LONG)).unwrap();

    let receiver = remote.stateful().unwrap();
    assert_eq!(collect(data.len(), |timeout| receiver.read(timeout)), data);
    assert!(local.core().stats().retries > 0);
}

#[test]
fn stateful_sequence_wraps() {
    let mut config = fast_config();
    config.arq.block_size = 1;
    let (a, b, _) = station_pair(config, Faults::default());
    let local = a.start_session("xfer", "KD7ABC", SessionKind::Stateful).unwrap();
    let remote = peer_session(&b, &local);

    let data = pattern(270);
    local.stateful().unwrap().write(&data, None).unwrap();
    let receiver = remote.stateful().unwrap();
    assert_eq!(collect(data.len(), |timeout| receiver.read(timeout)), data);
}

#[test]
fn pipelined_delivers_in_order_despite_reordering() {
    let (a, b, _) = station_pair(fast_config(), Faults::reordering());
    let local = a.start_session("bulk", "KD7ABC", SessionKind::Pipelined).unwrap();
    let remote = peer_session(&b, &local);

    let data = pattern(50 * 16 + 5);
    local.pipelined().unwrap().write(&data, Some(LONG)).unwrap();

    let receiver = remote.pipelined().unwrap();
    assert_eq!(collect(data.len(), |timeout| receiver.read(timeout)), data);
    assert_eq!(local.core().stats().sent, data.len() as u64);
}

#[test]
fn pipelined_survives_a_lossy_channel() {
    let (a, b, _) = station_pair(fast_config(), Faults::lossy(3));
    let local = a.start_session("bulk", "KD7ABC", SessionKind::Pipelined).unwrap();
    let remote = peer_session(&b, &local);

    let data = pattern(40 * 16 + 5);
    local.pipelined().unwrap().write(&data, Some(LONG)).unwrap();

    let receiver = remote.pipelined().unwrap();
    assert_eq!(collect(data.len(), |timeout| receiver.read(timeout)), data);
    assert!(local.core().stats().retries > 0);
}

#[test]
fn pipelined_window_stays_within_out_limit() {
    let mut config = fast_config();
    config.arq.out_limit = 4;
    let (a, b, _) = station_pair(config, Faults::reordering());
    let local = a.start_session("bulk", "KD7ABC", SessionKind::Pipelined).unwrap();
    let remote = peer_session(&b, &local);

    let data = pattern(10 * 16);
    local.pipelined().unwrap().write(&data, Some(LONG)).unwrap();

    let receiver = remote.pipelined().unwrap();
    assert_eq!(collect(data.len(), |timeout| receiver.read(timeout)), data);
    let stats = local.core().stats();
    assert!(stats.max_outstanding <= 4, "window grew to {}", stats.max_outstanding);
    assert!(stats.max_outstanding >= 1);
}

#[test]
fn pipelined_survives_sequence_cycles() {
    let mut config = fast_config();
    config.arq.block_size = 4;
    let faults = Faults {
        duplicate_every: Some(7),
        ..Faults::default()
    };
    let (a, b, _) = station_pair(config, faults);
    let local = a.start_session("bulk", "KD7ABC", SessionKind::Pipelined).unwrap();
    let remote = peer_session(&b, &local);

    let data = pattern(300 * 4);
    local.pipelined().unwrap().write(&data, Some(LONG)).unwrap();

    let receiver = remote.pipelined().unwrap();
    assert_eq!(collect(data.len(), |timeout| receiver.read(timeout)), data);
}

/// Open a `kind` session, silence the link, and check the write gives up
/// with exactly one "retries exhausted" report.
fn assert_retries_exhaust(kind: SessionKind) {
    let mut config = fast_config();
    config.arq.max_retries = 3;
    config.arq.ack_timeout = Duration::from_millis(100);
    let (a, b, blackhole) = station_pair(config, Faults::default());
    let events = record_events(&a);

    let local = a.start_session("xfer", "KD7ABC", kind).unwrap();
    peer_session(&b, &local);
    blackhole.store(true, Ordering::SeqCst);

    let data = b"into the void";
    let result = match kind {
        SessionKind::Stateful => local.stateful().unwrap().write(data, Some(LONG)),
        SessionKind::Pipelined => local.pipelined().unwrap().write(data, Some(LONG)),
        SessionKind::Stateless => unreachable!("stateless sessions never retry"),
    };
    assert!(matches!(result, Err(SessionError::SessionClosed { .. })), "{kind}: {result:?}");
    let state = local
        .core()
        .wait_for_state(|state| state == SessionState::Closed, Duration::from_secs(5));
    assert_eq!(state, SessionState::Closed);
    assert_eq!(local.core().stats().retries, 3);
    let ended_once = |events: &[SessionEvent]| {
        events
            .iter()
            .filter(|event| matches!(event, SessionEvent::Ended { .. }) && event.id() == local.id())
            .cloned()
            .collect::<Vec<_>>()
    };
    let reported = wait_for(Duration::from_secs(5), || {
        (!ended_once(&events.lock().unwrap()).is_empty()).then_some(())
    });
    assert!(reported.is_some());
    assert!(a.get_session(local.id()).is_none());

    a.stop_session(&local).unwrap();
    let ended = ended_once(&events.lock().unwrap());
    assert_eq!(ended.len(), 1);
    assert!(matches!(&ended[0], SessionEvent::Ended { reason, .. } if reason == "retries exhausted"));
}

#[test]
fn stateful_retry_exhaustion_closes_once() {
    assert_retries_exhaust(SessionKind::Stateful);
}

#[test]
fn pipelined_retry_exhaustion_closes_once() {
    assert_retries_exhaust(SessionKind::Pipelined);
}

#[test]
fn idle_session_closes_itself() {
    let mut config = fast_config();
    config.arq.idle_timeout = Some(Duration::from_millis(200));
    let (a, b, _) = station_pair(config, Faults::default());
    let events = record_events(&a);

    let local = a.start_session("xfer", "KD7ABC", SessionKind::Pipelined).unwrap();
    peer_session(&b, &local);

    let state = local
        .core()
        .wait_for_state(|state| state == SessionState::Closed, Duration::from_secs(5));
    assert_eq!(state, SessionState::Closed);
    let reason = wait_for(Duration::from_secs(5), || {
        events.lock().unwrap().iter().find_map(|event| match event {
            SessionEvent::Ended { id, reason, .. } if *id == local.id() => Some(reason.clone()),
            _ => None,
        })
    });
    assert_eq!(reason.as_deref(), Some("idle timeout"));
}

#[test]
fn stop_session_ends_both_sides() {
    let (a, b, _) = station_pair(fast_config(), Faults::default());
    let events_b = record_events(&b);
    let local = a.start_session("xfer", "KD7ABC", SessionKind::Stateful).unwrap();
    let remote = peer_session(&b, &local);

    a.stop_session(&local).unwrap();
    assert_eq!(local.state(), SessionState::Closed);
    assert!(a.get_session(local.id()).is_none());

    let closed = wait_for(LONG, || b.get_session(remote.id()).is_none().then_some(()));
    assert!(closed.is_some());
    assert_eq!(remote.state(), SessionState::Closed);
    assert!(events_b
        .lock()
        .unwrap()
        .iter()
        .any(|event| matches!(event, SessionEvent::Ended { reason, .. } if reason == "closed by peer")));
}

#[test]
fn lookups_find_sessions() {
    let (a, _b, _) = station_pair(fast_config(), Faults::default());
    let chat = a.start_session("chat", "CQCQCQ", SessionKind::Stateless).unwrap();
    assert_eq!(a.get_session(chat.id()).unwrap().id(), chat.id());
    assert_eq!(a.get_session_by_name("chat").unwrap().id(), chat.id());
    assert!(a.get_session_by_name("nope").is_none());
    assert!(matches!(chat.stateful(), Err(SessionError::WrongKind { .. })));
}

#[test]
fn frames_for_other_stations_are_dropped() {
    let (a, _b, _) = station_pair(fast_config(), Faults::default());
    let chat = a.start_session("chat", "CQCQCQ", SessionKind::Stateless).unwrap();
    let stray = ratlink_frame::Frame::new(chat.id(), 0, &b"not for you"[..])
        .with_src("KD7ABC")
        .with_dst("W1AW");
    a.incoming(stray);
    let result = chat.stateless().unwrap().read(Some(Duration::from_millis(30)));
    assert!(matches!(result, Err(SessionError::Timeout(_))));

    let handled = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = std::sync::Arc::clone(&handled);
    chat.core().set_handler(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let broadcast = ratlink_frame::Frame::new(chat.id(), 0, &b"cq"[..])
        .with_src("KD7ABC")
        .with_dst("CQCQCQ");
    a.incoming(broadcast);
    assert_eq!(handled.load(Ordering::SeqCst), 1);
}
