//! Loopback TCP channel carrying [`WireMessage`] frames between the foreground process and
//! the sync process.
//!
//! Either side may listen. When the sync process launches the user program it binds a
//! [`WireServer`] and passes the port through the environment; when it attaches to a
//! running program it connects to that program's port with a [`WireClient`].

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use crate::core::wire::{DONE_TAG, READY_TAG, WireMessage};

/// How long to wait for the exit-code byte that may follow a done tag.
pub const DONE_CODE_WAIT: Duration = Duration::from_millis(200);

const ACCEPT_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum WireError {
    #[error("no message before the timeout")]
    Timeout,
    #[error("peer closed the wire channel")]
    Closed,
    #[error("unexpected wire tag {0}")]
    Protocol(u8),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Anything the coordinator can wait on for a done message.
pub trait WireSource: Send {
    fn recv(&mut self, timeout: Duration) -> Result<WireMessage, WireError>;
}

struct WireConn {
    stream: TcpStream,
}

impl WireConn {
    fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    fn send(&mut self, msg: WireMessage) -> Result<(), WireError> {
        self.stream.write_all(&msg.encode())?;
        self.stream.flush()?;
        Ok(())
    }

    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, WireError> {
        self.stream
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        let mut byte = [0u8; 1];
        loop {
            return match self.stream.read(&mut byte) {
                Ok(0) => Err(WireError::Closed),
                Ok(_) => Ok(Some(byte[0])),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err)
                    if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    Ok(None)
                }
                Err(err) => Err(WireError::Io(err)),
            };
        }
    }

    fn recv(&mut self, timeout: Duration) -> Result<WireMessage, WireError> {
        let tag = self.read_byte(timeout)?.ok_or(WireError::Timeout)?;
        match tag {
            READY_TAG => Ok(WireMessage::Ready),
            DONE_TAG => {
                let exit_code = match self.read_byte(DONE_CODE_WAIT) {
                    Ok(code) => code,
                    Err(WireError::Closed) => None,
                    Err(err) => return Err(err),
                };
                Ok(WireMessage::Done { exit_code })
            }
            other => Err(WireError::Protocol(other)),
        }
    }
}

/// Listening side; accepts one peer lazily.
pub struct WireServer {
    listener: TcpListener,
    conn: Option<WireConn>,
}

impl WireServer {
    /// Bind an ephemeral loopback port.
    pub fn bind() -> io::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))?;
        listener.set_nonblocking(true)?;
        debug!(port = listener.local_addr()?.port(), "wire server listening");
        Ok(Self {
            listener,
            conn: None,
        })
    }

    pub fn port(&self) -> io::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    fn accept(&mut self, deadline: Instant) -> Result<&mut WireConn, WireError> {
        if self.conn.is_none() {
            loop {
                match self.listener.accept() {
                    Ok((stream, peer)) => {
                        debug!(%peer, "wire peer connected");
                        self.conn = Some(WireConn::new(stream)?);
                        break;
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {
                        let now = Instant::now();
                        if now >= deadline {
                            return Err(WireError::Timeout);
                        }
                        thread::sleep((deadline - now).min(ACCEPT_POLL));
                    }
                    Err(err) => return Err(WireError::Io(err)),
                }
            }
        }
        self.conn.as_mut().ok_or(WireError::Closed)
    }

    /// Wait for one valid message, READY or DONE. `None` on timeout, a closed peer, or a
    /// protocol violation; a message that did arrive is always handed back.
    pub fn listen(&mut self, timeout: Duration) -> Option<WireMessage> {
        match self.recv(timeout) {
            Ok(msg) => Some(msg),
            Err(WireError::Timeout) => None,
            Err(err) => {
                debug!(err = %err, "no valid wire message");
                None
            }
        }
    }

    pub fn send(&mut self, msg: WireMessage, timeout: Duration) -> Result<(), WireError> {
        let deadline = Instant::now() + timeout;
        self.accept(deadline)?.send(msg)
    }
}

impl WireSource for WireServer {
    fn recv(&mut self, timeout: Duration) -> Result<WireMessage, WireError> {
        let deadline = Instant::now() + timeout;
        let conn = self.accept(deadline)?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let result = conn.recv(remaining);
        if matches!(result, Err(WireError::Closed)) {
            self.conn = None;
        }
        result
    }
}

/// Connecting side.
pub struct WireClient {
    conn: WireConn,
}

impl WireClient {
    pub fn connect(port: u16) -> io::Result<Self> {
        let stream = TcpStream::connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))?;
        debug!(port, "wire client connected");
        Ok(Self {
            conn: WireConn::new(stream)?,
        })
    }

    pub fn ready(&mut self) -> Result<(), WireError> {
        self.conn.send(WireMessage::Ready)
    }

    pub fn done(&mut self, exit_code: Option<u8>) -> Result<(), WireError> {
        self.conn.send(WireMessage::Done { exit_code })
    }
}

impl WireSource for WireClient {
    fn recv(&mut self, timeout: Duration) -> Result<WireMessage, WireError> {
        self.conn.recv(timeout)
    }
}
