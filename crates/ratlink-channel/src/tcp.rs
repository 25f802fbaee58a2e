use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{ChannelError, Result};
use crate::traits::ByteChannel;

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(250);
const LOGIN_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_LOGIN_LINE: usize = 256;

/// Credentials for the text login some tunnel servers expect.
#[derive(Clone)]
pub struct TcpLogin {
    pub call: String,
    pub password: String,
}

impl std::fmt::Debug for TcpLogin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpLogin")
            .field("call", &self.call)
            .field(
                "password",
                &format_args!("<redacted:{} bytes>", self.password.len()),
            )
            .finish()
    }
}

/// A TCP tunnel standing in for a radio link.
///
/// Outbound channels remember their address and can reconnect; accepted
/// channels cannot.
pub struct TcpChannel {
    addr: Option<String>,
    stream: Option<TcpStream>,
    login: Option<TcpLogin>,
    read_timeout: Duration,
    eight_bit_clean: bool,
    name: String,
}

impl TcpChannel {
    /// Describe an outbound tunnel to `addr` (`host:port`). Call
    /// [`connect`](ByteChannel::connect) to open it.
    pub fn new(addr: impl Into<String>) -> Self {
        let addr = addr.into();
        Self {
            name: format!("tcp:{addr}"),
            addr: Some(addr),
            stream: None,
            login: None,
            read_timeout: DEFAULT_READ_TIMEOUT,
            eight_bit_clean: true,
        }
    }

    /// Open an outbound tunnel to `addr` right away.
    pub fn connect_to(addr: impl Into<String>) -> Result<Self> {
        let mut channel = Self::new(addr);
        channel.connect()?;
        Ok(channel)
    }

    /// Accept one tunnel connection from `listener`.
    pub fn accept(listener: &TcpListener) -> Result<Self> {
        let (stream, peer) = listener.accept()?;
        debug!(%peer, "accepted tunnel connection");
        let mut channel = Self {
            addr: None,
            stream: None,
            login: None,
            read_timeout: DEFAULT_READ_TIMEOUT,
            eight_bit_clean: true,
            name: format!("tcp:{peer}"),
        };
        channel.attach(stream)?;
        Ok(channel)
    }

    /// Log in with `USER`/`PASS` after connecting.
    pub fn with_login(mut self, login: TcpLogin) -> Self {
        self.login = Some(login);
        self
    }

    /// Override how long `read` waits for data.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Mark the tunnel as text-only so frames get armored.
    pub fn with_text_mode(mut self, text_only: bool) -> Self {
        self.eight_bit_clean = !text_only;
        self
    }

    fn attach(&mut self, stream: TcpStream) -> Result<()> {
        stream.set_read_timeout(Some(self.read_timeout))?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        Ok(())
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream.as_mut().ok_or(ChannelError::NotConnected)
    }

    fn login(&mut self) -> Result<()> {
        let Some(login) = self.login.clone() else {
            return Ok(());
        };
        let stream = self.stream()?;
        stream.set_read_timeout(Some(LOGIN_TIMEOUT))?;

        let greeting = read_line(stream)?;
        debug!(%greeting, "tunnel greeting");

        stream.write_all(format!("USER {}\r\n", login.call).as_bytes())?;
        let reply = read_line(stream)?;
        if !matches!(reply.chars().next(), Some('1'..='3')) {
            return Err(ChannelError::LoginRejected(reply));
        }

        stream.write_all(format!("PASS {}\r\n", login.password).as_bytes())?;
        let reply = read_line(stream)?;
        if !reply.starts_with('2') {
            return Err(ChannelError::LoginRejected(reply));
        }

        let timeout = self.read_timeout;
        self.stream()?.set_read_timeout(Some(timeout))?;
        info!(call = %login.call, "tunnel login accepted");
        Ok(())
    }
}

fn read_line(stream: &mut TcpStream) -> Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte) {
            Ok(0) => return Err(ChannelError::Io(ErrorKind::UnexpectedEof.into())),
            Ok(_) if byte[0] == b'\n' => break,
            Ok(_) => {
                line.push(byte[0]);
                if line.len() > MAX_LOGIN_LINE {
                    return Err(ChannelError::LoginRejected("login line too long".to_string()));
                }
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(String::from_utf8_lossy(&line).trim_end().to_string())
}

impl ByteChannel for TcpChannel {
    fn connect(&mut self) -> Result<()> {
        let Some(addr) = self.addr.clone() else {
            return Err(ChannelError::CannotReconnect(self.name.clone()));
        };
        let stream = TcpStream::connect(&addr).map_err(|source| ChannelError::Connect {
            addr: addr.clone(),
            source,
        })?;
        self.attach(stream)?;
        if let Err(err) = self.login() {
            self.stream = None;
            return Err(err);
        }
        info!(%addr, "tunnel connected");
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            debug!(name = %self.name, "tunnel closed");
        }
        Ok(())
    }

    fn read(&mut self, max: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; max];
        let stream = self.stream()?;
        match stream.read(&mut buf) {
            Ok(0) => {
                self.stream = None;
                Err(ChannelError::Io(ErrorKind::UnexpectedEof.into()))
            }
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                Ok(Vec::new())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let stream = self.stream()?;
        loop {
            match stream.write(data) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn can_reconnect(&self) -> bool {
        self.addr.is_some()
    }

    fn is_eight_bit_clean(&self) -> bool {
        self.eight_bit_clean
    }

    fn name(&self) -> &str {
        &self.name
    }
}
