use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use ratlink_channel::TcpChannel;
use ratlink_frame::{Frame, BROADCAST};
use ratlink_session::{ManagerConfig, SessionCore, SessionEvent, SessionKind, SessionManager};
use tracing::info;

use crate::cmd::{start_station, ListenArgs};
use crate::exit::{channel_error, io_error, session_error, CliError, CliResult, SUCCESS};
use crate::output::{print_event, print_message, print_sessions, OutputFormat};

const POLL: Duration = Duration::from_millis(250);

pub fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let listener = TcpListener::bind(&args.bind).map_err(|err| io_error("bind failed", err))?;
    info!(bind = %args.bind, call = %args.station.call, "waiting for tunnel");

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let mut printed = 0usize;
    while running.load(Ordering::SeqCst) {
        let channel = TcpChannel::accept(&listener).map_err(|err| channel_error("accept failed", err))?;
        let manager = start_station(&args.station, channel, ManagerConfig::default())?;
        let (tx, rx) = mpsc::channel();
        attach_incoming(&manager, tx.clone(), format);

        let chat = manager
            .start_session(&args.station.session, BROADCAST, SessionKind::Stateless)
            .map_err(|err| session_error("session open failed", err))?;
        forward_frames(chat.core(), tx);

        while running.load(Ordering::SeqCst) && manager.is_online() {
            let frame = match rx.recv_timeout(POLL) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            print_message(&frame, format);
            printed = printed.saturating_add(1);

            if args.count.is_some_and(|count| printed >= count) {
                finish(&manager, &args, format);
                return Ok(SUCCESS);
            }
        }
        finish(&manager, &args, format);
        info!("tunnel closed");
    }

    Ok(SUCCESS)
}

/// Print lifecycle events and collect chat from stateless sessions peers
/// open to us.
fn attach_incoming(manager: &SessionManager, tx: Sender<Frame>, format: OutputFormat) {
    let registry = Arc::downgrade(manager.registry());
    manager.register_session_cb(move |event| {
        print_event(event, format);
        let SessionEvent::Created { id, incoming: true, .. } = event else {
            return;
        };
        let Some(handle) = registry.upgrade().and_then(|registry| registry.get(*id)) else {
            return;
        };
        if handle.stateless().is_ok() {
            forward_frames(handle.core(), tx.clone());
        }
    });
    manager.set_gps_handler(|line| info!(%line, "position report"));
}

fn forward_frames(core: &SessionCore, tx: Sender<Frame>) {
    core.set_handler(move |frame| {
        let _ = tx.send(frame);
    });
}

fn finish(manager: &SessionManager, args: &ListenArgs, format: OutputFormat) {
    if args.stats {
        let sessions: Vec<_> = manager.sessions().iter().map(|h| h.core().info()).collect();
        print_sessions(&sessions, format);
    }
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| {
        CliError::new(
            crate::exit::INTERNAL,
            format!("signal handler setup failed: {err}"),
        )
    })
}
