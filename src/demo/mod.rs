//! Methods served by the demo binary.
//!
//! - `ping`: health check, see [`ping`]
//! - `echo`: payload passthrough, see [`echo`]
//! - `time`: current UTC time in RFC 3339
//! - `clients`: number of connected clients
//! - `announce`: broadcast a string payload to every client
//!
//! A heartbeat task can additionally broadcast a status line to all
//! clients at a fixed interval.

pub mod echo;
pub mod ping;

use chrono::{DateTime, Utc};
use linewire::{ConnectionSink, Envelope, RegisterError, Server, ServerHandle};
use serde_json::json;
use std::io;
use std::time::Duration;
use tracing::debug;

/// Register every demo method on `server`.
pub fn register(server: &mut Server) -> Result<(), RegisterError> {
    server.register_method("ping", ping::handle)?;
    server.register_method("echo", echo::handle)?;
    server.register_method("time", time)?;

    let handle = server.handle();
    server.register_method("clients", move |_request, sink: ConnectionSink| {
        let clients = handle.num_clients();
        async move { sink.send_success(&json!({ "clients": clients })).await }
    })?;

    let handle = server.handle();
    server.register_method("announce", move |request, sink| {
        announce(handle.clone(), request, sink)
    })?;

    Ok(())
}

async fn time(_request: Envelope, sink: ConnectionSink) -> io::Result<()> {
    sink.send_success(&Utc::now().to_rfc3339()).await
}

async fn announce(handle: ServerHandle, request: Envelope, sink: ConnectionSink) -> io::Result<()> {
    let message = match request.payload_as::<String>() {
        Ok(message) => message,
        Err(_) => return sink.send_missing_params().await,
    };

    let delivered = handle.broadcast(&message).await;
    sink.send_success(&json!({ "delivered": delivered })).await
}

/// Background task broadcasting a heartbeat line every `interval_secs`.
pub async fn heartbeat_task(handle: ServerHandle, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    // The first tick completes immediately
    interval.tick().await;

    loop {
        interval.tick().await;
        let message = heartbeat_message(handle.num_clients(), Utc::now());
        let delivered = handle.broadcast(&message).await;
        if delivered > 0 {
            debug!(delivered, "Sent heartbeat");
        }
    }
}

fn heartbeat_message(clients: usize, now: DateTime<Utc>) -> String {
    json!({
        "event": "heartbeat",
        "clients": clients,
        "time": now.to_rfc3339(),
    })
    .to_string()
}

/// Run `handler` on one request line and parse the single response line.
#[cfg(test)]
pub(crate) async fn invoke<F, Fut>(handler: F, line: &str) -> serde_json::Value
where
    F: Fn(Envelope, ConnectionSink) -> Fut,
    Fut: std::future::Future<Output = io::Result<()>>,
{
    use tokio::io::AsyncReadExt;

    let (mut client, server) = tokio::io::duplex(4096);
    let sink = ConnectionSink::new(([127, 0, 0, 1], 9).into(), server);
    let request = linewire::envelope::decode(line.as_bytes()).unwrap();

    handler(request, sink.clone()).await.unwrap();
    sink.shutdown().await.unwrap();

    let mut out = String::new();
    client.read_to_string(&mut out).await.unwrap();
    assert_eq!(out.matches('\n').count(), 1, "expected one response line: {out:?}");
    serde_json::from_str(out.trim_end()).unwrap()
}
