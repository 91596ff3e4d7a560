//! Envelope codec: request decoding and response encoding.
//!
//! Requests are single JSON objects carrying a `method` selector and an
//! optional payload (`payload`, or `data` for older clients). The
//! payload is kept as raw JSON text; handlers decode it themselves.
//!
//! ```text
//! Request:  {"method":"echo","payload":{"a":1}}
//! Response: {"status":"ok","data":{"a":1}}
//! Response: {"status":"error","error":"Method not found"}
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;

/// Decoded request line.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    /// Method selector. Empty when the client sent none or `null`.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub method: String,
    #[serde(default)]
    payload: Option<Box<RawValue>>,
    #[serde(default)]
    data: Option<Box<RawValue>>,
}

impl Envelope {
    /// Raw payload text, if the request carried one.
    pub fn raw_payload(&self) -> Option<&RawValue> {
        self.payload.as_deref().or(self.data.as_deref())
    }

    /// Decode the payload into a concrete type.
    ///
    /// A missing payload is decoded as JSON `null`, so `Option<T>`
    /// targets yield `None`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        let text = self.raw_payload().map_or("null", RawValue::get);
        serde_json::from_str(text).map_err(DecodeError::Payload)
    }
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Envelope decoding errors
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("{0}")]
    Malformed(#[source] serde_json::Error),
    #[error("invalid payload: {0}")]
    Payload(#[source] serde_json::Error),
}

/// Response line, tagged by `status`.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Response<'a, T: Serialize + ?Sized> {
    Ok { data: &'a T },
    Error { error: &'a str },
}

/// Data carried by the built-in `help` response.
#[derive(Debug, Serialize)]
pub struct MethodList<'a> {
    pub methods: &'a [String],
}

/// Parse one request line.
pub fn decode(line: &[u8]) -> Result<Envelope, DecodeError> {
    serde_json::from_slice(line).map_err(DecodeError::Malformed)
}

/// Encode a success response, newline included.
///
/// Data that fails to serialize produces an error response instead.
pub fn encode_success<T: Serialize + ?Sized>(data: &T) -> String {
    match serde_json::to_string(&Response::Ok { data }) {
        Ok(mut line) => {
            line.push('\n');
            line
        }
        Err(e) => encode_error(&e.to_string()),
    }
}

/// Encode an error response, newline included.
pub fn encode_error(message: &str) -> String {
    let response: Response<'_, ()> = Response::Error { error: message };
    let mut line = serde_json::to_string(&response)
        .unwrap_or_else(|_| r#"{"status":"error","error":"unencodable error"}"#.to_string());
    line.push('\n');
    line
}
