//! Server events and host callbacks.
//!
//! Every lifecycle event the core produces is a [`ServerEvent`]. Events
//! always go to `tracing`; a host that installs a log hook additionally
//! receives each event rendered as a `[TCP] ...` line.

use crate::envelope::DecodeError;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Receives rendered log lines.
pub type LogHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Receives the peer address of each closed connection.
pub type DisconnectHook = Arc<dyn Fn(SocketAddr) + Send + Sync>;

/// Something that happened in the server.
#[derive(Debug)]
pub enum ServerEvent<'a> {
    Listening {
        address: SocketAddr,
    },
    BindFailed {
        address: &'a str,
        error: &'a io::Error,
    },
    AcceptFailed {
        error: &'a io::Error,
    },
    ConnectionOpened {
        peer: SocketAddr,
        id: u64,
    },
    MessageReceived {
        peer: SocketAddr,
        id: u64,
        line: &'a [u8],
    },
    DecodeFailed {
        peer: SocketAddr,
        id: u64,
        error: &'a DecodeError,
    },
    LineTooLong {
        peer: SocketAddr,
        id: u64,
        limit: usize,
    },
    ConnectionFailed {
        peer: SocketAddr,
        id: u64,
        error: &'a io::Error,
    },
    HandlerPanicked {
        peer: SocketAddr,
        id: u64,
    },
    ConnectionClosed {
        peer: SocketAddr,
        id: u64,
    },
}

impl ServerEvent<'_> {
    fn trace(&self) {
        match self {
            ServerEvent::Listening { address } => info!(%address, "Server listening"),
            ServerEvent::BindFailed { address, error } => {
                error!(address, error = %error, "Failed to bind listener")
            }
            ServerEvent::AcceptFailed { error } => {
                error!(error = %error, "Failed to accept connection")
            }
            ServerEvent::ConnectionOpened { peer, id } => {
                debug!(peer = %peer, id, "New connection")
            }
            ServerEvent::MessageReceived { peer, id, line } => {
                trace!(peer = %peer, id, line = %String::from_utf8_lossy(line), "Message received")
            }
            ServerEvent::DecodeFailed { peer, id, error } => {
                warn!(peer = %peer, id, error = %error, "Parse error")
            }
            ServerEvent::LineTooLong { peer, id, limit } => {
                warn!(peer = %peer, id, limit, "Line too long")
            }
            ServerEvent::ConnectionFailed { peer, id, error } => {
                debug!(peer = %peer, id, error = %error, "Connection error")
            }
            ServerEvent::HandlerPanicked { peer, id } => {
                error!(peer = %peer, id, "Connection task panicked")
            }
            ServerEvent::ConnectionClosed { peer, id } => {
                debug!(peer = %peer, id, "Connection closed")
            }
        }
    }
}

impl fmt::Display for ServerEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[TCP] ")?;
        match self {
            ServerEvent::Listening { address } => write!(f, "Tcp Listening on {address}"),
            ServerEvent::BindFailed { address, error } => {
                write!(f, "Error listening on {address}: {error}")
            }
            ServerEvent::AcceptFailed { error } => {
                write!(f, "Error accepting connection: {error}")
            }
            ServerEvent::ConnectionOpened { peer, .. } => write!(f, "{peer} Connection open"),
            ServerEvent::MessageReceived { peer, line, .. } => {
                write!(f, "{peer} Message Received: {}", String::from_utf8_lossy(line))
            }
            ServerEvent::DecodeFailed { peer, error, .. } => write!(f, "{peer} {error}"),
            ServerEvent::LineTooLong { peer, limit, .. } => {
                write!(f, "{peer} Line exceeds {limit} bytes")
            }
            ServerEvent::ConnectionFailed { peer, error, .. } => write!(f, "{peer} {error}"),
            ServerEvent::HandlerPanicked { peer, .. } => {
                write!(f, "{peer} Connection handler panicked")
            }
            ServerEvent::ConnectionClosed { peer, .. } => write!(f, "{peer} Connection closed"),
        }
    }
}

/// Optional host callbacks.
#[derive(Clone, Default)]
pub struct Hooks {
    log: Option<LogHook>,
    disconnect: Option<DisconnectHook>,
}

impl Hooks {
    pub fn set_log(&mut self, hook: LogHook) {
        self.log = Some(hook);
    }

    pub fn set_disconnect(&mut self, hook: DisconnectHook) {
        self.disconnect = Some(hook);
    }

    pub fn emit(&self, event: ServerEvent<'_>) {
        event.trace();
        if let Some(log) = &self.log {
            log(&event.to_string());
        }
    }

    pub fn disconnected(&self, peer: SocketAddr) {
        if let Some(disconnect) = &self.disconnect {
            disconnect(peer);
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("log", &self.log.is_some())
            .field("disconnect", &self.disconnect.is_some())
            .finish()
    }
}
