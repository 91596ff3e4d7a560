//! linewire: an embeddable line-delimited JSON request/response server.
//!
//! A host registers named methods, starts the listener, and the server
//! takes care of the rest:
//! - Newline framing and `{"method": ..., "payload": ...}` envelopes
//! - Method dispatch, with a built-in `help` listing
//! - Control words `help`, `quit`, `bye` and `exit`
//! - Live connection tracking and broadcast to every client
//!
//! ```no_run
//! use linewire::{ConnectionSink, Envelope, Server, ServerConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = Server::new(ServerConfig::default());
//! server.register_method("ping", |_request: Envelope, sink: ConnectionSink| async move {
//!     sink.send_success("pong").await
//! })?;
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod clients;
pub mod config;
mod connection;
pub mod envelope;
pub mod framing;
pub mod hooks;
pub mod methods;
mod server;

pub use clients::{ClientRegistry, ConnectionSink};
pub use config::{ListenConfig, ServerConfig, TransportKind};
pub use connection::METHOD_NOT_FOUND;
pub use envelope::{DecodeError, Envelope};
pub use hooks::ServerEvent;
pub use methods::{RegisterError, HELP_METHOD};
pub use server::{BoundServer, Server, ServerError, ServerHandle};
