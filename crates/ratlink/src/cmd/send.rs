use std::fs;
use std::time::Duration;

use ratlink_channel::{ByteChannel, TcpChannel, TcpLogin};
use ratlink_frame::is_broadcast;
use ratlink_session::{ManagerConfig, SessionKind};
use serde::Serialize;
use tracing::warn;

use crate::cmd::{start_station, SendArgs};
use crate::exit::{channel_error, session_error, CliError, CliResult, SUCCESS, TIMEOUT, USAGE};
use crate::output::OutputFormat;

const END_WAIT: Duration = Duration::from_secs(2);

#[derive(Serialize)]
struct SentOutput<'a> {
    session: u8,
    src: &'a str,
    dst: &'a str,
    payload_size: usize,
}

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let payload = resolve_payload(&args)?;

    let mut channel = TcpChannel::new(args.addr.as_str());
    if let Some(password) = &args.password {
        channel = channel.with_login(TcpLogin {
            call: args.station.call.clone(),
            password: password.clone(),
        });
    }
    channel
        .connect()
        .map_err(|err| channel_error("connect failed", err))?;

    let manager = start_station(&args.station, channel, one_shot_config())?;
    let handle = manager
        .start_session(&args.station.session, &args.to, SessionKind::Stateless)
        .map_err(|err| session_error("session open failed", err))?;
    let chat = handle
        .stateless()
        .map_err(|err| session_error("session open failed", err))?;

    let entry = chat
        .write(None, &payload)
        .map_err(|err| session_error("send failed", err))?;
    if !entry.sent().wait(timeout) {
        return Err(CliError::new(
            TIMEOUT,
            format!("send failed: message not on the air after {timeout:?}"),
        ));
    }

    print_sent(
        &SentOutput {
            session: entry.frame().session,
            src: &entry.frame().src,
            dst: &entry.frame().dst,
            payload_size: payload.len(),
        },
        format,
    );

    if !is_broadcast(&args.to) {
        if let Err(err) = manager.stop_session(&handle) {
            warn!(error = %err, "session close failed");
        }
    }
    Ok(SUCCESS)
}

/// Defaults, except the close handshake gets one short attempt.
fn one_shot_config() -> ManagerConfig {
    let mut config = ManagerConfig::default();
    config.control.end_attempts = 1;
    config.control.end_wait = END_WAIT;
    config
}

fn print_sent(out: &SentOutput<'_>, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string(out).unwrap_or_else(|_| "{}".to_string())
        ),
        OutputFormat::Raw => {}
        OutputFormat::Table | OutputFormat::Pretty => println!(
            "sent {} bytes {} -> {} on session {}",
            out.payload_size, out.src, out.dst, out.session
        ),
    }
}

fn resolve_payload(args: &SendArgs) -> CliResult<Vec<u8>> {
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path).map_err(|err| {
            crate::exit::io_error(&format!("failed reading {}", path.display()), err)
        });
    }
    Err(CliError::new(USAGE, "one of --data or --file is required"))
}

fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::StationArgs;

    fn args(data: Option<&str>) -> SendArgs {
        SendArgs {
            addr: "127.0.0.1:9000".to_string(),
            station: StationArgs {
                call: "N0CALL".to_string(),
                session: "chat".to_string(),
                text_mode: false,
                kiss: None,
            },
            to: "CQCQCQ".to_string(),
            data: data.map(str::to_string),
            file: None,
            password: None,
            timeout: "10s".to_string(),
        }
    }

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
    }

    #[test]
    fn payload_comes_from_data() {
        assert_eq!(resolve_payload(&args(Some("73"))).unwrap(), b"73".to_vec());
    }

    #[test]
    fn missing_payload_is_a_usage_error() {
        let err = resolve_payload(&args(None)).unwrap_err();
        assert_eq!(err.code, USAGE);
    }
}
