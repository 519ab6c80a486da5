//! The authentication engine: credential modeling plus the SCRAM conversation driver.

pub mod sasl;
pub mod scram;

use crate::error::{Error, Result};
use crate::transport::Connection;
use scram::{ClientFinal, ClientFirst, ScramMechanism, ServerFirst};
use tokio::io::{AsyncRead, AsyncWrite};

/// A user's identity: username, password, and the database the user is defined in
/// (defaults to `admin`, matching the server convention).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthCredentials {
    pub username: String,
    pub password: String,
    pub db_name: String,
}

impl AuthCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>, db_name: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            db_name: db_name.into(),
        }
    }

    /// Build credentials from `MONGO_USER`/`MONGO_PASSWORD`/`MONGO_DB` (default `admin`).
    /// Returns `None` if either the username or password is unset.
    pub fn from_env() -> Option<Self> {
        let username = std::env::var("MONGO_USER").ok()?;
        let password = std::env::var("MONGO_PASSWORD").ok()?;
        let db_name = std::env::var("MONGO_DB").unwrap_or_else(|_| "admin".to_string());
        Some(Self::new(username, password, db_name))
    }
}

/// The outcome of a successful authentication: the server signature, retained so a later
/// `logout` can be gated on "we actually finished a handshake".
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub mechanism: ScramMechanism,
    pub server_signature_verified: bool,
}

/// Drive one full SCRAM conversation against `connection`, authenticating `credentials`.
#[tracing::instrument(level = "debug", skip_all, fields(username = %credentials.username, db = %credentials.db_name))]
pub async fn authenticate<S: AsyncRead + AsyncWrite + Unpin>(
    connection: &Connection<S>,
    credentials: &AuthCredentials,
    offered_mechanisms: &[String],
) -> Result<AuthOutcome> {
    let mechanism = ScramMechanism::negotiate(offered_mechanisms)?;
    tracing::debug!(?mechanism, "negotiated SCRAM mechanism");
    let client_first = ClientFirst::new(mechanism, &credentials.username);

    let start_reply = connection
        .exchange(
            sasl::build_sasl_start(mechanism, &client_first),
            &credentials.db_name,
        )
        .await?;
    let start = sasl::parse_sasl_reply(&start_reply)?;
    if start.done {
        return Err(Error::authentication(
            "server completed the conversation after only one round trip",
        ));
    }

    let server_first = ServerFirst::parse(&start.payload, &client_first.nonce)?;
    let client_final = ClientFinal::build(mechanism, credentials, &client_first, &server_first)?;

    let continue_reply = connection
        .exchange(
            sasl::build_sasl_continue(start.conversation_id, &client_final.message),
            &credentials.db_name,
        )
        .await?;
    let continue_result = sasl::parse_sasl_reply(&continue_reply)?;
    client_final.verify_server_signature(mechanism, &continue_result.payload)?;

    if !continue_result.done {
        // MongoDB's SCRAM handshake always requires one extra empty round trip even
        // though the client has already verified the server signature.
        let final_reply = connection
            .exchange(
                sasl::build_sasl_continue(continue_result.conversation_id, ""),
                &credentials.db_name,
            )
            .await?;
        let finished = sasl::parse_sasl_reply(&final_reply)?;
        if !finished.done {
            return Err(Error::authentication(
                "server did not complete the conversation after the final empty round trip",
            ));
        }
    }

    tracing::debug!("SCRAM handshake completed, server signature verified");
    Ok(AuthOutcome {
        mechanism,
        server_signature_verified: true,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn from_env_requires_both_user_and_password() {
        std::env::remove_var("MONGO_USER");
        std::env::remove_var("MONGO_PASSWORD");
        assert!(AuthCredentials::from_env().is_none());
    }
}
