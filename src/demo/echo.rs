//! `echo` method: returns the request payload untouched.
//!
//! Useful for checking that payloads survive the envelope intact,
//! whatever their shape or size.

use linewire::{ConnectionSink, Envelope};
use std::io;

pub async fn handle(request: Envelope, sink: ConnectionSink) -> io::Result<()> {
    match request.raw_payload() {
        Some(payload) => sink.send_success(payload).await,
        None => sink.send_success(&()).await,
    }
}
