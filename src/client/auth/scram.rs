//! SCRAM-SHA-1 / SCRAM-SHA-256 authentication (RFC 5802), driven over MongoDB's
//! `saslStart`/`saslContinue` commands.

use base64::Engine;
use hmac::{Hmac, Mac};
use md5::{Digest as Md5Digest, Md5};
use rand::Rng;
use sha1::Sha1;
use sha2::Sha256;

use crate::error::{Error, Result};

use super::AuthCredentials;

const MIN_ITERATION_COUNT: u32 = 4096;
const CLIENT_KEY: &[u8] = b"Client Key";
const SERVER_KEY: &[u8] = b"Server Key";

/// The hash family backing one SCRAM mechanism.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ScramMechanism {
    Sha1,
    Sha256,
}

impl ScramMechanism {
    pub fn name(self) -> &'static str {
        match self {
            ScramMechanism::Sha1 => "SCRAM-SHA-1",
            ScramMechanism::Sha256 => "SCRAM-SHA-256",
        }
    }

    /// Choose a mechanism from the server's `saslSupportedMechs` list, preferring
    /// SHA-256 whenever both are offered.
    pub fn negotiate(offered: &[String]) -> Result<Self> {
        if offered.iter().any(|m| m == "SCRAM-SHA-256") {
            Ok(ScramMechanism::Sha256)
        } else if offered.iter().any(|m| m == "SCRAM-SHA-1") {
            Ok(ScramMechanism::Sha1)
        } else {
            Err(Error::authentication(
                "server offered no SCRAM mechanism this client supports",
            ))
        }
    }

    /// The password bytes to feed into PBKDF2, per mechanism-specific pre-processing.
    fn prepare_password(self, credentials: &AuthCredentials) -> Result<Vec<u8>> {
        match self {
            ScramMechanism::Sha1 => Ok(md5_hash(&credentials.username, &credentials.password)
                .into_bytes()),
            ScramMechanism::Sha256 => {
                let normalized = stringprep::saslprep(&credentials.password)
                    .map_err(|_| Error::authentication("password failed SASLprep normalization"))?;
                Ok(normalized.into_owned().into_bytes())
            }
        }
    }
}

/// MongoDB's SCRAM-SHA-1-specific password pre-hash: `HEX(MD5(user + ":mongo:" + password))`.
pub fn md5_hash(username: &str, password: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(username.as_bytes());
    hasher.update(b":mongo:");
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac =
        Hmac::<Sha1>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hmac(mechanism: ScramMechanism, key: &[u8], data: &[u8]) -> Vec<u8> {
    match mechanism {
        ScramMechanism::Sha1 => hmac_sha1(key, data),
        ScramMechanism::Sha256 => hmac_sha256(key, data),
    }
}

fn h(mechanism: ScramMechanism, data: &[u8]) -> Vec<u8> {
    match mechanism {
        ScramMechanism::Sha1 => {
            use sha1::Digest;
            Sha1::digest(data).to_vec()
        }
        ScramMechanism::Sha256 => {
            use sha2::Digest;
            Sha256::digest(data).to_vec()
        }
    }
}

fn salted_password(
    mechanism: ScramMechanism,
    password: &[u8],
    salt: &[u8],
    iterations: u32,
) -> Result<Vec<u8>> {
    if iterations < MIN_ITERATION_COUNT {
        return Err(Error::authentication(format!(
            "server requested {iterations} PBKDF2 iterations, below the minimum of {MIN_ITERATION_COUNT}"
        )));
    }
    let out_len = match mechanism {
        ScramMechanism::Sha1 => 20,
        ScramMechanism::Sha256 => 32,
    };
    let mut out = vec![0u8; out_len];
    match mechanism {
        ScramMechanism::Sha1 => {
            pbkdf2::pbkdf2_hmac::<Sha1>(password, salt, iterations, &mut out);
        }
        ScramMechanism::Sha256 => {
            pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out);
        }
    }
    Ok(out)
}

fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect()
}

/// Parse a SCRAM `key=value,key=value,...` payload into a lookup helper.
fn parse_kvp(payload: &str) -> std::collections::HashMap<char, String> {
    payload
        .split(',')
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?.chars().next()?;
            let value = parts.next()?.to_string();
            Some((key, value))
        })
        .collect()
}

fn random_nonce() -> String {
    let bytes: [u8; 24] = rand::rng().random();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// The client's first message: `n,,n=<user>,r=<nonce>`.
pub struct ClientFirst {
    pub mechanism: ScramMechanism,
    pub username: String,
    pub nonce: String,
}

impl ClientFirst {
    pub fn new(mechanism: ScramMechanism, username: &str) -> Self {
        Self {
            mechanism,
            username: username.to_string(),
            nonce: random_nonce(),
        }
    }

    pub fn bare_message(&self) -> String {
        format!("n={},r={}", self.username, self.nonce)
    }

    pub fn wire_payload(&self) -> String {
        format!("n,,{}", self.bare_message())
    }
}

/// The server's first reply: combined nonce, salt, iteration count, and the raw payload
/// string as received. RFC 5802's AuthMessage must concatenate the server-first message
/// verbatim, so the raw form is kept alongside the parsed fields rather than reformatted
/// from them later.
pub struct ServerFirst {
    pub combined_nonce: String,
    pub salt: Vec<u8>,
    pub iterations: u32,
    pub raw: String,
}

impl ServerFirst {
    pub fn parse(payload: &str, client_nonce: &str) -> Result<Self> {
        let kvp = parse_kvp(payload);
        let combined_nonce = kvp
            .get(&'r')
            .ok_or_else(|| Error::authentication("server-first message missing nonce"))?
            .clone();
        if !combined_nonce.starts_with(client_nonce) {
            return Err(Error::authentication(
                "server-first combined nonce did not extend the client nonce",
            ));
        }
        let salt_b64 = kvp
            .get(&'s')
            .ok_or_else(|| Error::authentication("server-first message missing salt"))?;
        let salt = base64::engine::general_purpose::STANDARD
            .decode(salt_b64)
            .map_err(|_| Error::authentication("server-first salt was not valid base64"))?;
        let iterations: u32 = kvp
            .get(&'i')
            .ok_or_else(|| Error::authentication("server-first message missing iteration count"))?
            .parse()
            .map_err(|_| Error::authentication("server-first iteration count was not a number"))?;
        Ok(Self {
            combined_nonce,
            salt,
            iterations,
            raw: payload.to_string(),
        })
    }
}

/// The client's final message, plus the keys needed to verify the server's signature.
pub struct ClientFinal {
    pub message: String,
    pub server_key: Vec<u8>,
    pub auth_message: String,
}

impl ClientFinal {
    pub fn build(
        mechanism: ScramMechanism,
        credentials: &AuthCredentials,
        client_first: &ClientFirst,
        server_first: &ServerFirst,
    ) -> Result<Self> {
        let password = mechanism.prepare_password(credentials)?;
        let salted = salted_password(
            mechanism,
            &password,
            &server_first.salt,
            server_first.iterations,
        )?;
        let client_key = hmac(mechanism, &salted, CLIENT_KEY);
        let stored_key = h(mechanism, &client_key);
        let server_key = hmac(mechanism, &salted, SERVER_KEY);

        let channel_binding = "c=biws"; // base64("n,,")
        let without_proof = format!("{channel_binding},r={}", server_first.combined_nonce);
        let auth_message = format!(
            "{},{},{}",
            client_first.bare_message(),
            server_first.raw,
            without_proof
        );

        let client_signature = hmac(mechanism, &stored_key, auth_message.as_bytes());
        let client_proof = xor(&client_key, &client_signature);
        let proof_b64 = base64::engine::general_purpose::STANDARD.encode(client_proof);

        Ok(Self {
            message: format!("{without_proof},p={proof_b64}"),
            server_key,
            auth_message,
        })
    }

    /// Verify the server's reported signature against the expected value computed from
    /// this client's own derived keys.
    pub fn verify_server_signature(&self, mechanism: ScramMechanism, payload: &str) -> Result<()> {
        let kvp = parse_kvp(payload);
        let reported_b64 = kvp
            .get(&'v')
            .ok_or_else(|| Error::authentication("server-final message missing signature"))?;
        let reported = base64::engine::general_purpose::STANDARD
            .decode(reported_b64)
            .map_err(|_| Error::authentication("server-final signature was not valid base64"))?;
        let expected = hmac(mechanism, &self.server_key, self.auth_message.as_bytes());
        if reported != expected {
            return Err(Error::authentication(
                "server signature verification failed",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn md5_hash_matches_mongo_reference_vector() {
        assert_eq!(
            md5_hash("main_m1", "incunaby!"),
            "f79a93932f4e10c3654be025a576398c"
        );
    }

    #[test]
    fn negotiate_prefers_sha256_when_both_offered() {
        let offered = vec!["SCRAM-SHA-1".to_string(), "SCRAM-SHA-256".to_string()];
        assert_eq!(ScramMechanism::negotiate(&offered).unwrap(), ScramMechanism::Sha256);
    }

    #[test]
    fn negotiate_falls_back_to_sha1_alone() {
        let offered = vec!["SCRAM-SHA-1".to_string()];
        assert_eq!(ScramMechanism::negotiate(&offered).unwrap(), ScramMechanism::Sha1);
    }

    #[test]
    fn negotiate_rejects_empty_list() {
        assert!(ScramMechanism::negotiate(&[]).is_err());
    }

    #[test]
    fn rejects_iteration_counts_below_the_minimum() {
        let result = salted_password(ScramMechanism::Sha256, b"pw", b"salt", 100);
        assert!(result.is_err());
    }

    #[test]
    fn full_handshake_round_trips_and_verifies() {
        // Emulates the server side of one SCRAM-SHA-256 conversation so the client's math
        // can be checked end to end without a live server.
        let credentials = AuthCredentials::new("dima", "incunaby!", "admin");
        let client_first = ClientFirst::new(ScramMechanism::Sha256, &credentials.username);

        let salt = b"NaCl".to_vec();
        let iterations = 4096u32;
        let server_combined_nonce = format!("{}SERVERPART", client_first.nonce);
        let server_first_payload = format!(
            "r={},s={},i={}",
            server_combined_nonce,
            base64::engine::general_purpose::STANDARD.encode(&salt),
            iterations
        );
        let server_first =
            ServerFirst::parse(&server_first_payload, &client_first.nonce).unwrap();

        let client_final = ClientFinal::build(
            ScramMechanism::Sha256,
            &credentials,
            &client_first,
            &server_first,
        )
        .unwrap();

        // Reconstruct what the server would compute for its own ServerSignature.
        let password = ScramMechanism::Sha256.prepare_password(&credentials).unwrap();
        let salted = salted_password(ScramMechanism::Sha256, &password, &salt, iterations).unwrap();
        let server_key = hmac(ScramMechanism::Sha256, &salted, SERVER_KEY);
        let server_signature = hmac(
            ScramMechanism::Sha256,
            &server_key,
            client_final.auth_message.as_bytes(),
        );
        let server_final_payload = format!(
            "v={}",
            base64::engine::general_purpose::STANDARD.encode(&server_signature)
        );

        assert!(client_final
            .verify_server_signature(ScramMechanism::Sha256, &server_final_payload)
            .is_ok());
    }

    #[test]
    fn tampered_server_signature_is_rejected() {
        let credentials = AuthCredentials::new("dima", "incunaby!", "admin");
        let client_first = ClientFirst::new(ScramMechanism::Sha1, &credentials.username);
        let salt = b"salt1234".to_vec();
        let server_first_payload = format!(
            "r={}XYZ,s={},i=4096",
            client_first.nonce,
            base64::engine::general_purpose::STANDARD.encode(&salt)
        );
        let server_first = ServerFirst::parse(&server_first_payload, &client_first.nonce).unwrap();
        let client_final =
            ClientFinal::build(ScramMechanism::Sha1, &credentials, &client_first, &server_first)
                .unwrap();

        let bogus = format!("v={}", base64::engine::general_purpose::STANDARD.encode(b"not-it"));
        assert!(client_final
            .verify_server_signature(ScramMechanism::Sha1, &bogus)
            .is_err());
    }
}
