//! Two stations chatting over an in-memory link.
//!
//! Run with:
//!   cargo run --example chat-pair --features session

use std::time::Duration;

use ratlink::channel::MemoryChannel;
use ratlink::session::{ManagerConfig, SessionKind, SessionManager};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (left, right) = MemoryChannel::pair();
    let alpha = SessionManager::start("N0CALL", left, ManagerConfig::default())?;
    let bravo = SessionManager::start("KD7ABC", right, ManagerConfig::default())?;

    alpha.register_session_cb(|event| eprintln!("N0CALL: {event:?}"));
    bravo.register_session_cb(|event| eprintln!("KD7ABC: {event:?}"));

    // Broadcast chat: both sides open the same session id without a handshake.
    let cq_alpha = alpha.start_session("chat", "CQCQCQ", SessionKind::Stateless)?;
    let cq_bravo = bravo.start_session("chat", "CQCQCQ", SessionKind::Stateless)?;
    cq_alpha.stateless()?.write(None, b"CQ CQ de N0CALL")?;
    let heard = cq_bravo.stateless()?.read(Some(Duration::from_secs(5)))?;
    eprintln!("{} heard {}: {}", bravo.local_call(), heard.src, String::from_utf8_lossy(&heard.data));

    // Directed chat: the handshake opens a matching session at the peer.
    let direct = alpha.start_session("qso", "KD7ABC", SessionKind::Stateless)?;
    direct.stateless()?.write(None, b"good morning")?;
    let remote = bravo
        .get_session_by_peer("N0CALL", direct.id())
        .ok_or("peer session missing")?;
    let msg = remote.stateless()?.read(Some(Duration::from_secs(5)))?;
    eprintln!("{} got {:?}", bravo.local_call(), String::from_utf8_lossy(&msg.data));

    alpha.stop_session(&direct)?;
    Ok(())
}
