use clap::{Args, Subcommand};
use std::path::PathBuf;

use ratlink_channel::{ByteChannel, KissChannel, TcpChannel};
use ratlink_session::{ManagerConfig, SessionManager};

use crate::exit::{session_error, CliResult};
use crate::output::OutputFormat;

pub mod listen;
pub mod send;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send one chat message through a TCP tunnel.
    Send(SendArgs),
    /// Accept a TCP tunnel and print chat messages as they arrive.
    Listen(ListenArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Send(args) => send::run(args, format),
        Command::Listen(args) => listen::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

/// Options shared by every command that puts a station on the air.
#[derive(Args, Debug, Clone)]
pub struct StationArgs {
    /// This station's call sign.
    #[arg(long, env = "RATLINK_CALL")]
    pub call: String,
    /// Session name for chat traffic.
    #[arg(long, default_value = "chat")]
    pub session: String,
    /// Treat the tunnel as text-only and armor every frame.
    #[arg(long)]
    pub text_mode: bool,
    /// Wrap the tunnel in KISS framing on this TNC port.
    #[arg(long, value_name = "PORT")]
    pub kiss: Option<u8>,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Tunnel address (host:port).
    pub addr: String,
    #[command(flatten)]
    pub station: StationArgs,
    /// Destination call sign. Default: broadcast.
    #[arg(long, default_value = "CQCQCQ")]
    pub to: String,
    /// Message text.
    #[arg(long, conflicts_with = "file")]
    pub data: Option<String>,
    /// Read the message from a file.
    #[arg(long, conflicts_with = "data")]
    pub file: Option<PathBuf>,
    /// Tunnel login password (sent with USER/PASS after connecting).
    #[arg(long, env = "RATLINK_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
    /// How long to wait for the message to go out (e.g. 10s, 500ms).
    #[arg(long, default_value = "10s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Address to accept the tunnel on (host:port).
    pub bind: String,
    #[command(flatten)]
    pub station: StationArgs,
    /// Exit after receiving N messages.
    #[arg(long)]
    pub count: Option<usize>,
    /// Print session counters before exiting.
    #[arg(long)]
    pub stats: bool,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Start a session manager on `channel`, KISS-wrapped if asked.
pub fn start_station(
    station: &StationArgs,
    channel: TcpChannel,
    config: ManagerConfig,
) -> CliResult<SessionManager> {
    let channel = channel.with_text_mode(station.text_mode);
    match station.kiss {
        Some(port) => start_manager(&station.call, KissChannel::with_port(channel, port), config),
        None => start_manager(&station.call, channel, config),
    }
}

fn start_manager<C: ByteChannel + 'static>(
    call: &str,
    channel: C,
    config: ManagerConfig,
) -> CliResult<SessionManager> {
    SessionManager::start(call, channel, config).map_err(|err| session_error("station start failed", err))
}
