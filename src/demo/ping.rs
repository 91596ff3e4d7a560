//! `ping` method for health checks and latency measurement.
//!
//! ```text
//! Request:  {"method":"ping"}
//! Response: {"status":"ok","data":"pong"}
//!
//! Request:  {"method":"ping","payload":"hello"}
//! Response: {"status":"ok","data":"pong hello"}
//! ```

use linewire::{ConnectionSink, Envelope};
use std::io;

pub async fn handle(request: Envelope, sink: ConnectionSink) -> io::Result<()> {
    match request.payload_as::<Option<String>>() {
        Ok(Some(message)) => sink.send_success(&format!("pong {message}")).await,
        Ok(None) => sink.send_success("pong").await,
        Err(e) => sink.send_error(&e.to_string()).await,
    }
}
