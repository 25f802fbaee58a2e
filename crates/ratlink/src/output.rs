use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use ratlink_frame::Frame;
use ratlink_session::{SessionEvent, SessionInfo};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct MessageOutput<'a> {
    session: u8,
    src: &'a str,
    dst: &'a str,
    payload_size: usize,
    payload: String,
    timestamp: String,
}

/// Print a chat frame received on a stateless session.
pub fn print_message(frame: &Frame, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = MessageOutput {
                session: frame.session,
                src: &frame.src,
                dst: &frame.dst,
                payload_size: frame.data.len(),
                payload: payload_preview(&frame.data),
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["SESSION", "FROM", "TO", "SIZE", "MESSAGE"])
                .add_row(vec![
                    frame.session.to_string(),
                    frame.src.clone(),
                    frame.dst.clone(),
                    frame.data.len().to_string(),
                    payload_preview(&frame.data),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "{} -> {} [{}] {}",
                frame.src,
                frame.dst,
                frame.session,
                payload_preview(&frame.data)
            );
        }
        OutputFormat::Raw => print_raw(&frame.data),
    }
}

/// Print a session lifecycle event.
pub fn print_event(event: &SessionEvent, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string())
        ),
        OutputFormat::Raw => {}
        OutputFormat::Table | OutputFormat::Pretty => match event {
            SessionEvent::Created { id, name, peer, incoming } => {
                let origin = if *incoming { "incoming" } else { "outgoing" };
                println!("session {id} ({name}) with {peer} opened, {origin}");
            }
            SessionEvent::Ended { id, name, peer, reason } => {
                println!("session {id} ({name}) with {peer} ended: {reason}");
            }
            SessionEvent::Failed { id, name, peer, reason } => {
                println!("session {id} ({name}) with {peer} failed: {reason}");
            }
        },
    }
}

/// Print a snapshot of session state and counters.
pub fn print_sessions(sessions: &[SessionInfo], format: OutputFormat) {
    match format {
        OutputFormat::Json | OutputFormat::Raw => println!(
            "{}",
            serde_json::to_string(sessions).unwrap_or_else(|_| "[]".to_string())
        ),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["ID", "NAME", "PEER", "KIND", "STATE", "SENT", "RECV", "RETRIES"]);
            for info in sessions {
                table.add_row(vec![
                    info.id.to_string(),
                    info.name.clone(),
                    info.peer.clone(),
                    info.kind.to_string(),
                    info.state.to_string(),
                    info.stats.sent.to_string(),
                    info.stats.recv.to_string(),
                    info.stats.retries.to_string(),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for info in sessions {
                println!(
                    "{} {} {} {} {} sent={} recv={} retries={}",
                    info.id,
                    info.name,
                    info.peer,
                    info.kind,
                    info.state,
                    info.stats.sent,
                    info.stats.recv,
                    info.stats.retries
                );
            }
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_marks_binary_payloads() {
        assert_eq!(payload_preview(b"73 de N0CALL"), "73 de N0CALL");
        assert_eq!(payload_preview(&[0xff, 0xfe]), "<binary 2 bytes>");
    }
}
