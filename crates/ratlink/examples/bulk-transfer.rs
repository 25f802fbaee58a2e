//! Push a buffer through a pipelined session and report the counters.
//!
//! Run with:
//!   cargo run --example bulk-transfer --features session

use std::thread;
use std::time::{Duration, Instant};

use ratlink::channel::MemoryChannel;
use ratlink::session::{ArqConfig, ManagerConfig, SessionKind, SessionManager};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ManagerConfig {
        arq: ArqConfig::default().with_block_size(256).with_out_limit(8),
        ..ManagerConfig::default()
    };
    let (left, right) = MemoryChannel::pair();
    let sender = SessionManager::start("N0CALL", left, config.clone())?;
    let receiver = SessionManager::start("KD7ABC", right, config)?;

    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    let session = sender.start_session("file", "KD7ABC", SessionKind::Pipelined)?;
    let remote = receiver
        .get_session_by_peer("N0CALL", session.id())
        .ok_or("peer session missing")?;

    let expected = payload.len();
    let reader = thread::spawn(move || -> Result<Vec<u8>, ratlink::session::SessionError> {
        let pipe = remote.pipelined()?;
        let mut got = Vec::with_capacity(expected);
        while got.len() < expected {
            got.extend_from_slice(&pipe.read(Some(Duration::from_secs(30)))?);
        }
        Ok(got)
    });

    let started = Instant::now();
    session.pipelined()?.write(&payload, Some(Duration::from_secs(60)))?;
    let got = reader.join().map_err(|_| "reader panicked")??;
    assert_eq!(got, payload);

    let stats = session.core().stats();
    eprintln!(
        "{} bytes in {:?}: retries={} max_outstanding={}",
        stats.sent,
        started.elapsed(),
        stats.retries,
        stats.max_outstanding
    );
    sender.stop_session(&session)?;
    Ok(())
}
