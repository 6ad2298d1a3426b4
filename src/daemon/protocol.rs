//! Wire protocol types for the line-delimited JSON envelope
//!
//! Every request and reply is a single JSON object terminated by `\n`:
//!
//! ```text
//! {"cli":"client-1","cmd":"hello","dta":{"planet":"world"}}
//! ```
//!
//! The greeting sent on accept is plain text and is produced by
//! [`version_line`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Server name announced in the greeting line
pub const SERVER_NAME: &str = "CPIAServer";

/// Version of the wire protocol, independent of the crate version
pub const API_VERSION: &str = "1.0.0";

/// Command name used for replies to requests that failed validation
pub const INVALID_COMMAND: &str = "invalid";

/// Errors produced while decoding an envelope line
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("failed to parse message data: {0}")]
    Json(#[source] serde_json::Error),

    #[error("incorrect message data, expected a JSON object: {0}")]
    NotAnObject(Value),

    #[error("invalid message field: {0}")]
    Field(#[source] serde_json::Error),
}

/// A client/server message
///
/// Keys missing from the envelope decode to `None` (or `Value::Null` for the
/// data block) instead of being rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "cli", default)]
    pub client: Option<String>,
    #[serde(rename = "cmd", default)]
    pub command: Option<String>,
    #[serde(rename = "dta", default)]
    pub data: Value,
}

impl Message {
    pub fn new(client: impl Into<String>, command: impl Into<String>, data: Value) -> Self {
        Self {
            client: Some(client.into()),
            command: Some(command.into()),
            data,
        }
    }

    /// Decode one envelope line. Surrounding whitespace, including the line
    /// terminator, is ignored.
    pub fn decode(line: &[u8]) -> Result<Self, DecodeError> {
        let parsed: Value = serde_json::from_slice(line.trim_ascii()).map_err(DecodeError::Json)?;
        if !parsed.is_object() {
            return Err(DecodeError::NotAnObject(parsed));
        }
        serde_json::from_value(parsed).map_err(DecodeError::Field)
    }

    /// Encode into a newline-terminated envelope line
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Reply to this message under the `invalid` command with a diagnostic
    pub fn invalid(&self, diagnostic: impl Into<String>) -> Self {
        Self {
            client: self.client.clone(),
            command: Some(INVALID_COMMAND.to_string()),
            data: serde_json::json!({ "error": diagnostic.into() }),
        }
    }

    /// Insert a field into the data block, turning a null block into an object.
    /// Non-object data is left untouched.
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        if self.data.is_null() {
            self.data = Value::Object(serde_json::Map::new());
        }
        if let Some(map) = self.data.as_object_mut() {
            map.insert(key.to_string(), value.into());
        }
        self
    }

    pub fn command_name(&self) -> &str {
        self.command.as_deref().unwrap_or_default()
    }
}

/// Greeting written once per connection, immediately after accept
pub fn version_line() -> String {
    format!(
        "{} version: {}, api version: {}\n",
        SERVER_NAME,
        env!("CARGO_PKG_VERSION"),
        API_VERSION
    )
}
