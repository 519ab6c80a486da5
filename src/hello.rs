//! The `hello` handshake command and its reply shape.

use bson::{doc, Document};
use serde::Deserialize;

use crate::error::Result;
use crate::transport::Connection;
use tokio::io::{AsyncRead, AsyncWrite};

/// Build the `hello` command sent once per connection, immediately after the socket opens.
pub fn hello_command() -> Document {
    doc! {
        "hello": 1,
        "client": {
            "driver": { "name": "mongolite", "version": env!("CARGO_PKG_VERSION") },
        },
    }
}

/// The fields of a `hello` reply this driver actually consults. Unrecognized fields are
/// ignored rather than rejected, since the server reply carries many fields (`hosts`,
/// `setName`, election/topology data, …) that only matter to a full replica-set-aware
/// driver and have no bearing on a single-connection client.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloResult {
    #[serde(default)]
    pub is_writable_primary: Option<bool>,

    #[serde(default)]
    pub read_only: Option<bool>,

    #[serde(default)]
    pub sasl_supported_mechs: Vec<String>,

    #[serde(rename = "compression", default)]
    pub compression: Vec<String>,

    #[serde(default)]
    pub connection_id: Option<i64>,

    #[serde(default)]
    pub local_time: Option<bson::DateTime>,

    pub max_bson_object_size: i64,
    pub max_message_size_bytes: i32,
}

impl HelloResult {
    pub fn is_read_only(&self) -> bool {
        self.read_only.unwrap_or(false) || self.is_writable_primary == Some(false)
    }
}

/// Run the `hello` handshake over a freshly connected (not yet authenticated) connection.
pub async fn run_hello<S: AsyncRead + AsyncWrite + Unpin>(
    connection: &Connection<S>,
) -> Result<HelloResult> {
    let reply = connection.exchange(hello_command(), "admin").await?;
    Ok(bson::from_document(reply)?)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deserializes_a_minimal_reply() {
        let reply = doc! {
            "ok": 1.0,
            "isWritablePrimary": true,
            "maxBsonObjectSize": 16_777_216i64,
            "maxMessageSizeBytes": 48_000_000i32,
            "saslSupportedMechs": ["SCRAM-SHA-1", "SCRAM-SHA-256"],
            "compression": ["zstd", "zlib"],
        };
        let parsed: HelloResult = bson::from_document(reply).unwrap();
        assert_eq!(parsed.is_writable_primary, Some(true));
        assert_eq!(parsed.sasl_supported_mechs, vec!["SCRAM-SHA-1", "SCRAM-SHA-256"]);
        assert!(!parsed.is_read_only());
    }

    #[test]
    fn missing_optional_fields_default_to_empty() {
        let reply = doc! {
            "ok": 1.0,
            "maxBsonObjectSize": 16_777_216i64,
            "maxMessageSizeBytes": 48_000_000i32,
        };
        let parsed: HelloResult = bson::from_document(reply).unwrap();
        assert!(parsed.sasl_supported_mechs.is_empty());
        assert!(parsed.compression.is_empty());
    }
}
