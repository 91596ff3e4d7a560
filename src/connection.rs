//! Per-connection read and dispatch loop.
//!
//! Each accepted socket is served by exactly one [`Connection`], which
//! moves between these states:
//!
//! ```text
//! Reading --line--> Dispatching --done--> Reading
//!    |                    |
//!    +--EOF / quit--------+--sink error--> Closing
//! ```
//!
//! `Closing` is handled by [`handle_connection`] after the loop task
//! finishes, whatever the reason, so cleanup runs exactly once.

use crate::clients::ConnectionSink;
use crate::envelope;
use crate::framing::{Frame, LineReader};
use crate::hooks::ServerEvent;
use crate::methods::HELP_METHOD;
use crate::server::Shared;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncRead;

/// Error text for requests naming an unregistered method.
pub const METHOD_NOT_FOUND: &str = "Method not found";

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for the next line.
    Reading,
    /// Decoding and running one request.
    Dispatching,
    /// Loop finished; the connection is being torn down.
    Closing,
}

/// Why the read loop ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed its side of the stream.
    EndOfStream,
    /// Peer sent `quit`, `bye` or `exit`.
    ClientQuit,
}

const QUIT_WORDS: [&[u8]; 3] = [b"quit", b"bye", b"exit"];

/// Words recognised before JSON parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlWord {
    Help,
    Quit,
}

impl ControlWord {
    /// Case-sensitive prefix match.
    fn parse(line: &[u8]) -> Option<Self> {
        if line.starts_with(b"help") {
            Some(ControlWord::Help)
        } else if QUIT_WORDS.iter().any(|word| line.starts_with(word)) {
            Some(ControlWord::Quit)
        } else {
            None
        }
    }
}

/// A single client connection.
pub struct Connection<R> {
    id: u64,
    peer: SocketAddr,
    lines: LineReader<R>,
    sink: ConnectionSink,
    state: ConnState,
    shared: Arc<Shared>,
}

impl<R: AsyncRead + Unpin> Connection<R> {
    pub(crate) fn new(id: u64, reader: R, sink: ConnectionSink, shared: Arc<Shared>) -> Self {
        Self {
            id,
            peer: sink.peer_addr(),
            lines: LineReader::new(reader, shared.config.max_line_length),
            sink,
            state: ConnState::Reading,
            shared,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Serve requests until the peer leaves.
    ///
    /// Lines are handled strictly in arrival order; a handler finishes
    /// before the next line is read. The connection is left in
    /// [`ConnState::Closing`] whichever way the loop ends.
    pub async fn run(&mut self) -> io::Result<CloseReason> {
        let mut line = Bytes::new();
        let mut reason = CloseReason::EndOfStream;

        loop {
            let next = match self.state {
                ConnState::Reading => self.read_request(&mut line, &mut reason).await,
                ConnState::Dispatching => self.dispatch(&line).await.map(|()| ConnState::Reading),
                ConnState::Closing => return Ok(reason),
            };

            match next {
                Ok(state) => self.state = state,
                Err(e) => {
                    self.state = ConnState::Closing;
                    return Err(e);
                }
            }
        }
    }

    /// Wait for the next request line and pick the state it leads to.
    async fn read_request(
        &mut self,
        line: &mut Bytes,
        reason: &mut CloseReason,
    ) -> io::Result<ConnState> {
        let frame = match self.lines.next_frame().await? {
            None => {
                *reason = CloseReason::EndOfStream;
                return Ok(ConnState::Closing);
            }
            Some(Frame::Overflow) => {
                let limit = self.shared.config.max_line_length;
                self.shared.hooks.emit(ServerEvent::LineTooLong {
                    peer: self.peer,
                    id: self.id,
                    limit,
                });
                self.sink
                    .send_error(&format!("line exceeds {limit} bytes"))
                    .await?;
                return Ok(ConnState::Reading);
            }
            Some(Frame::Line(frame)) => frame,
        };

        if frame.is_empty() {
            return Ok(ConnState::Reading);
        }

        match ControlWord::parse(&frame) {
            Some(ControlWord::Help) => {
                self.send_help().await?;
                Ok(ConnState::Reading)
            }
            Some(ControlWord::Quit) => {
                *reason = CloseReason::ClientQuit;
                Ok(ConnState::Closing)
            }
            None => {
                *line = frame;
                Ok(ConnState::Dispatching)
            }
        }
    }

    async fn dispatch(&mut self, line: &[u8]) -> io::Result<()> {
        self.shared.hooks.emit(ServerEvent::MessageReceived {
            peer: self.peer,
            id: self.id,
            line,
        });

        let request = match envelope::decode(line) {
            Ok(request) => request,
            Err(e) => {
                self.shared.hooks.emit(ServerEvent::DecodeFailed {
                    peer: self.peer,
                    id: self.id,
                    error: &e,
                });
                return self.sink.send_error(&e.to_string()).await;
            }
        };

        if request.method.is_empty() {
            return Ok(());
        }
        if request.method == HELP_METHOD {
            return self.send_help().await;
        }

        match self.shared.methods.lookup(&request.method).cloned() {
            Some(handler) => handler(request, self.sink.clone()).await,
            None => self.sink.send_error(METHOD_NOT_FOUND).await,
        }
    }

    async fn send_help(&mut self) -> io::Result<()> {
        self.sink.write_all(self.shared.help_line.as_bytes()).await
    }
}

/// Serve one accepted connection, then tear it down.
///
/// The read loop runs in its own task so a panicking method handler
/// still reaches the cleanup below.
pub(crate) async fn handle_connection<R>(
    id: u64,
    reader: R,
    sink: ConnectionSink,
    shared: Arc<Shared>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let peer = sink.peer_addr();
    let mut connection = Connection::new(id, reader, sink.clone(), Arc::clone(&shared));

    match tokio::spawn(async move { connection.run().await }).await {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => shared.hooks.emit(ServerEvent::ConnectionFailed {
            peer,
            id,
            error: &error,
        }),
        Err(_) => shared.hooks.emit(ServerEvent::HandlerPanicked { peer, id }),
    }

    shared.clients.remove(id).await;
    // The peer may already be gone.
    let _ = sink.shutdown().await;
    shared.hooks.emit(ServerEvent::ConnectionClosed { peer, id });
    shared.hooks.disconnected(peer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ClientRegistry;
    use crate::config::ServerConfig;
    use crate::hooks::Hooks;
    use crate::methods::MethodRegistry;
    use std::sync::Mutex;
    use tokio::io::{duplex, AsyncReadExt};
    use tokio_test::io::Builder;

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 50000))
    }

    fn shared_with(methods: MethodRegistry, hooks: Hooks, max_line_length: usize) -> Arc<Shared> {
        let config = ServerConfig {
            max_line_length: Some(max_line_length),
            ..ServerConfig::default()
        };
        Arc::new(Shared::new(
            config.resolve(),
            methods,
            Arc::new(ClientRegistry::new()),
            hooks,
        ))
    }

    async fn boom(_request: envelope::Envelope, _sink: ConnectionSink) -> io::Result<()> {
        panic!("handler failure")
    }

    fn echo_methods() -> MethodRegistry {
        let mut methods = MethodRegistry::new();
        methods
            .register("echo", |request: envelope::Envelope, sink: ConnectionSink| async move {
                match request.raw_payload() {
                    Some(payload) => sink.send_success(payload).await,
                    None => sink.send_missing_params().await,
                }
            })
            .unwrap();
        methods
            .register("ping", |_request, sink: ConnectionSink| async move {
                sink.send_success("pong").await
            })
            .unwrap();
        methods
    }

    /// Feed `input` through a connection and collect everything written back.
    async fn converse(input: &[u8], shared: Arc<Shared>) -> (CloseReason, String) {
        let reader = Builder::new().read(input).build();
        let (client, server) = duplex(64 * 1024);
        let sink = ConnectionSink::new(peer(), server);

        let mut connection = Connection::new(1, reader, sink.clone(), shared);
        let reason = connection.run().await.unwrap();
        assert_eq!(connection.state(), ConnState::Closing);
        sink.shutdown().await.unwrap();
        drop(connection);
        drop(sink);

        let mut out = String::new();
        let mut client = client;
        client.read_to_string(&mut out).await.unwrap();
        (reason, out)
    }

    #[test]
    fn test_control_words() {
        assert_eq!(ControlWord::parse(b"help"), Some(ControlWord::Help));
        assert_eq!(ControlWord::parse(b"helpme"), Some(ControlWord::Help));
        assert_eq!(ControlWord::parse(b"quit"), Some(ControlWord::Quit));
        assert_eq!(ControlWord::parse(b"bye"), Some(ControlWord::Quit));
        assert_eq!(ControlWord::parse(b"exit now"), Some(ControlWord::Quit));
        assert_eq!(ControlWord::parse(b"QUIT"), None);
        assert_eq!(ControlWord::parse(b"{\"method\":\"quit\"}"), None);
    }

    #[tokio::test]
    async fn test_help_word_lists_methods() {
        let shared = shared_with(echo_methods(), Hooks::default(), 1024);
        let (reason, out) = converse(b"help\n", shared).await;

        assert_eq!(reason, CloseReason::EndOfStream);
        assert_eq!(
            out,
            "{\"status\":\"ok\",\"data\":{\"methods\":[\"help\",\"echo\",\"ping\"]}}\n"
        );
    }

    #[tokio::test]
    async fn test_help_method_matches_help_word() {
        let shared = shared_with(echo_methods(), Hooks::default(), 1024);
        let (_, out) = converse(b"{\"method\":\"help\"}\nhelp\n", shared).await;

        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], lines[1]);
    }

    #[tokio::test]
    async fn test_unknown_method_keeps_connection() {
        let shared = shared_with(echo_methods(), Hooks::default(), 1024);
        let (reason, out) =
            converse(b"{\"method\":\"missing\"}\n{\"method\":\"ping\"}\n", shared).await;

        assert_eq!(reason, CloseReason::EndOfStream);
        assert_eq!(
            out,
            "{\"status\":\"error\",\"error\":\"Method not found\"}\n\
             {\"status\":\"ok\",\"data\":\"pong\"}\n"
        );
    }

    #[tokio::test]
    async fn test_malformed_line_keeps_connection() {
        let shared = shared_with(echo_methods(), Hooks::default(), 1024);
        let (_, out) = converse(b"not-json\n{\"method\":\"ping\"}\n", shared).await;

        let lines: Vec<serde_json::Value> = out
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["status"], "error");
        assert!(lines[0]["error"].is_string());
        assert_eq!(lines[1]["data"], "pong");
    }

    #[tokio::test]
    async fn test_silent_lines() {
        let shared = shared_with(echo_methods(), Hooks::default(), 1024);
        let (_, out) = converse(b"\n   \r\n{\"payload\":1}\n{\"method\":\"\"}\n", shared).await;

        assert_eq!(out, "");
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let shared = shared_with(echo_methods(), Hooks::default(), 1024);
        let (_, out) = converse(b"{\"method\":\"echo\",\"payload\":{\"a\":1}}\n", shared).await;

        let value: serde_json::Value = serde_json::from_str(out.trim_end()).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["data"], serde_json::json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_quit_stops_processing() {
        let shared = shared_with(echo_methods(), Hooks::default(), 1024);
        let (reason, out) =
            converse(b"{\"method\":\"ping\"}\nquit\n{\"method\":\"ping\"}\n", shared).await;

        assert_eq!(reason, CloseReason::ClientQuit);
        assert_eq!(out, "{\"status\":\"ok\",\"data\":\"pong\"}\n");
    }

    #[tokio::test]
    async fn test_long_line_reported() {
        let shared = shared_with(echo_methods(), Hooks::default(), 24);
        let (_, out) = converse(
            b"{\"method\":\"echo\",\"payload\":\"far too long\"}\n{\"method\":\"ping\"}\n",
            shared,
        )
        .await;

        assert_eq!(
            out,
            "{\"status\":\"error\",\"error\":\"line exceeds 24 bytes\"}\n\
             {\"status\":\"ok\",\"data\":\"pong\"}\n"
        );
    }

    #[tokio::test]
    async fn test_cleanup_runs_once_after_panic() {
        let mut methods = MethodRegistry::new();
        methods.register("boom", boom).unwrap();

        let closed = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&closed);
        let mut hooks = Hooks::default();
        hooks.set_disconnect(Arc::new(move |addr: SocketAddr| {
            seen.lock().unwrap().push(addr)
        }));

        let shared = shared_with(methods, hooks, 1024);
        let (mut client, server) = duplex(1024);
        let sink = ConnectionSink::new(peer(), server);
        let id = shared.clients.add(sink.clone()).await;
        assert_eq!(shared.clients.count(), 1);

        let reader = Builder::new().read(b"{\"method\":\"boom\"}\n").build();
        handle_connection(id, reader, sink, Arc::clone(&shared)).await;

        assert_eq!(shared.clients.count(), 0);
        assert_eq!(*closed.lock().unwrap(), vec![peer()]);

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }

    /// Reader that is `Send` but not `Sync`.
    struct Unshared<R> {
        inner: R,
        _not_sync: std::marker::PhantomData<std::cell::Cell<()>>,
    }

    impl<R: AsyncRead + Unpin> AsyncRead for Unshared<R> {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::pin::Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    #[tokio::test]
    async fn test_reader_need_not_be_sync() {
        let shared = shared_with(echo_methods(), Hooks::default(), 1024);
        let (mut client, server) = duplex(1024);
        let sink = ConnectionSink::new(peer(), server);
        let id = shared.clients.add(sink.clone()).await;

        let reader = Unshared {
            inner: Builder::new().read(b"{\"method\":\"ping\"}\n").build(),
            _not_sync: std::marker::PhantomData,
        };
        handle_connection(id, reader, sink, Arc::clone(&shared)).await;

        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "{\"status\":\"ok\",\"data\":\"pong\"}\n");
        assert_eq!(shared.clients.count(), 0);
    }

    #[tokio::test]
    async fn test_unterminated_last_line_is_served() {
        let shared = shared_with(echo_methods(), Hooks::default(), 1024);
        let (reason, out) = converse(b"{\"method\":\"ping\"}", shared).await;

        assert_eq!(reason, CloseReason::EndOfStream);
        assert_eq!(out, "{\"status\":\"ok\",\"data\":\"pong\"}\n");
    }

    #[tokio::test]
    async fn test_null_method_is_silent() {
        let shared = shared_with(echo_methods(), Hooks::default(), 1024);
        let (_, out) = converse(b"{\"method\":null}\n{\"method\":\"ping\"}\n", shared).await;

        assert_eq!(out, "{\"status\":\"ok\",\"data\":\"pong\"}\n");
    }

    #[tokio::test]
    async fn test_read_error_leaves_closing_state() {
        let shared = shared_with(echo_methods(), Hooks::default(), 1024);
        let reader = Builder::new()
            .read(b"{\"method\":\"ping\"}\n")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let (_client, server) = duplex(1024);
        let sink = ConnectionSink::new(peer(), server);

        let mut connection = Connection::new(1, reader, sink, shared);
        assert_eq!(connection.state(), ConnState::Reading);

        let err = connection.run().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(connection.state(), ConnState::Closing);
    }
}
