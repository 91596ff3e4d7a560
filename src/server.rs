//! TCP server for line-delimited JSON requests.
//!
//! Binds the listener, accepts connections, registers each one with the
//! client registry and hands it to its own connection task.

use crate::clients::{ClientRegistry, ConnectionSink};
use crate::config::{ListenConfig, ServerConfig, TransportKind};
use crate::connection;
use crate::envelope::{self, Envelope, MethodList};
use crate::hooks::{Hooks, ServerEvent};
use crate::methods::{MethodRegistry, RegisterError};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{lookup_host, TcpListener};

/// Server startup and accept errors
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to resolve {address}: {source}")]
    Resolve {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("No {transport} address found for {address}")]
    NoAddress {
        address: String,
        transport: TransportKind,
    },
    #[error("Error listening on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("Error accepting connection: {0}")]
    Accept(#[source] io::Error),
}

/// State shared by the accept loop and every connection task.
///
/// Built once at bind time; only the client registry changes afterwards.
pub(crate) struct Shared {
    pub(crate) config: ListenConfig,
    pub(crate) methods: MethodRegistry,
    pub(crate) clients: Arc<ClientRegistry>,
    pub(crate) hooks: Hooks,
    /// Encoded response for `help`.
    pub(crate) help_line: String,
}

impl Shared {
    pub(crate) fn new(
        config: ListenConfig,
        methods: MethodRegistry,
        clients: Arc<ClientRegistry>,
        hooks: Hooks,
    ) -> Self {
        let help_line = envelope::encode_success(&MethodList {
            methods: &methods.names(),
        });
        Self {
            config,
            methods,
            clients,
            hooks,
            help_line,
        }
    }
}

/// An unstarted server.
///
/// Methods and hooks can only be registered here; [`Server::bind`] and
/// [`Server::start`] consume the server, so the method table is complete
/// before the first connection is accepted.
pub struct Server {
    config: ServerConfig,
    methods: MethodRegistry,
    clients: Arc<ClientRegistry>,
    hooks: Hooks,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: ServerConfig) -> Self {
        Server {
            config,
            methods: MethodRegistry::new(),
            clients: Arc::new(ClientRegistry::new()),
            hooks: Hooks::default(),
        }
    }

    /// Register a method handler. `help` is reserved.
    pub fn register_method<F, Fut>(
        &mut self,
        name: impl Into<String>,
        handler: F,
    ) -> Result<(), RegisterError>
    where
        F: Fn(Envelope, ConnectionSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = io::Result<()>> + Send + 'static,
    {
        self.methods.register(name, handler)
    }

    /// Receive every server event as a rendered log line.
    pub fn on_log<F>(&mut self, hook: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.hooks.set_log(Arc::new(hook));
    }

    /// Be told the peer address of each connection as it closes.
    pub fn on_disconnect<F>(&mut self, hook: F)
    where
        F: Fn(SocketAddr) + Send + Sync + 'static,
    {
        self.hooks.set_disconnect(Arc::new(hook));
    }

    /// Handle for counting and broadcasting to clients once running.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            clients: Arc::clone(&self.clients),
        }
    }

    /// Resolve the configuration and bind the listener.
    pub async fn bind(self) -> Result<BoundServer, ServerError> {
        let listen = self.config.resolve();
        let address = listen.address();

        let candidates = lookup_host((listen.host.clone(), listen.port))
            .await
            .map_err(|source| ServerError::Resolve {
                address: address.clone(),
                source,
            })?;
        let addr = pick_address(candidates, listen.transport).ok_or_else(|| {
            ServerError::NoAddress {
                address: address.clone(),
                transport: listen.transport,
            }
        })?;

        let listener = create_listener(addr, listen.backlog)
            .and_then(TcpListener::from_std)
            .and_then(|listener| {
                let local_addr = listener.local_addr()?;
                Ok((listener, local_addr))
            });
        let (listener, local_addr) = match listener {
            Ok(bound) => bound,
            Err(source) => {
                self.hooks.emit(ServerEvent::BindFailed {
                    address: &address,
                    error: &source,
                });
                return Err(ServerError::Bind { address, source });
            }
        };

        self.hooks
            .emit(ServerEvent::Listening { address: local_addr });

        Ok(BoundServer {
            listener,
            local_addr,
            shared: Arc::new(Shared::new(listen, self.methods, self.clients, self.hooks)),
        })
    }

    /// Bind and accept connections until the listener fails.
    pub async fn start(self) -> Result<(), ServerError> {
        self.bind().await?.serve().await
    }
}

/// A server with a bound listener that has not started accepting.
pub struct BoundServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
}

impl BoundServer {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            clients: Arc::clone(&self.shared.clients),
        }
    }

    /// Accept connections until an accept error occurs.
    ///
    /// Connections already accepted keep running after this returns.
    pub async fn serve(self) -> Result<(), ServerError> {
        let BoundServer {
            listener, shared, ..
        } = self;

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    shared.hooks.emit(ServerEvent::AcceptFailed { error: &error });
                    return Err(ServerError::Accept(error));
                }
            };

            let (reader, writer) = stream.into_split();
            let sink = ConnectionSink::new(peer, writer);
            let id = shared.clients.add(sink.clone()).await;
            shared.hooks.emit(ServerEvent::ConnectionOpened { peer, id });

            tokio::spawn(connection::handle_connection(
                id,
                reader,
                sink,
                Arc::clone(&shared),
            ));
        }
    }
}

/// Cloneable access to a server's live clients.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    clients: Arc<ClientRegistry>,
}

impl ServerHandle {
    /// Number of currently open connections.
    pub fn num_clients(&self) -> usize {
        self.clients.count()
    }

    /// Send `message` plus newline to every open connection.
    ///
    /// Returns the number of connections the message reached.
    pub async fn broadcast(&self, message: &str) -> usize {
        self.clients.broadcast(message).await
    }
}

/// First resolved address usable by `transport`.
///
/// Plain `tcp` prefers an IPv4 address when the host resolves to both
/// families, so `localhost` is reachable at 127.0.0.1.
fn pick_address(
    candidates: impl IntoIterator<Item = SocketAddr>,
    transport: TransportKind,
) -> Option<SocketAddr> {
    let mut fallback = None;
    for addr in candidates {
        if !transport.accepts(&addr) {
            continue;
        }
        if addr.is_ipv4() || transport != TransportKind::Tcp {
            return Some(addr);
        }
        fallback.get_or_insert(addr);
    }
    fallback
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

    Ok(socket.into())
}
