//! SCRAM-SHA-256 client-side exchange.
//!
//! Only the mechanism computation lives here; message transport is the
//! connector's job. Channel binding is not supported, so the gs2 header is
//! always `n,,` (`biws` in base64).
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac_array;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// The SASL mechanism name this client implements.
pub(crate) const MECHANISM: &str = "SCRAM-SHA-256";

/// A violation of the SCRAM exchange by either side.
#[derive(Debug, thiserror::Error)]
pub enum SaslError {
    /// A server message did not carry a required attribute.
    #[error("malformed SCRAM server message: missing {0}")]
    Missing(&'static str),

    /// A server message was not valid UTF-8.
    #[error("SCRAM server message is not utf8")]
    NotUtf8,

    /// The combined nonce does not extend the client nonce.
    #[error("SCRAM server nonce does not extend the client nonce")]
    NonceMismatch,

    /// The iteration count is zero or unparsable.
    #[error("invalid SCRAM iteration count")]
    BadIterations,

    /// An attribute value was not valid base64.
    #[error("invalid base64 in SCRAM exchange: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The server signature did not verify; the server does not know the
    /// password.
    #[error("SCRAM server signature mismatch")]
    SignatureMismatch,
}

/// One SCRAM-SHA-256 exchange.
///
/// ```text
/// client                                server
///   | -- n,,n=,r=<client-nonce> ---------> |
///   | <-- r=<combined>,s=<salt>,i=<iter> - |
///   | -- c=biws,r=<combined>,p=<proof> --> |
///   | <-- v=<server-signature> ----------- |
/// ```
pub(crate) struct ScramClient {
    password: String,
    nonce: String,
    server_first: Option<ServerFirst>,
}

struct ServerFirst {
    auth_message: String,
    salted_password: [u8; 32],
}

impl ScramClient {
    /// Start an exchange with a fresh 24-character client nonce.
    pub fn new(password: &str) -> Self {
        // 18 random bytes encode to exactly 24 base64 chars, no padding
        let mut raw = [0u8; 18];
        rand::rngs::OsRng.fill_bytes(&mut raw);
        Self::with_nonce(password, BASE64.encode(raw))
    }

    fn with_nonce(password: &str, nonce: String) -> Self {
        Self {
            password: password.to_string(),
            nonce,
            server_first: None,
        }
    }

    fn first_bare(&self) -> String {
        // the authorization identity is taken from the startup message,
        // so the n= attribute stays empty
        format!("n=,r={}", self.nonce)
    }

    /// The `client-first-message`, sent in `SASLInitialResponse`.
    pub fn client_first_message(&self) -> String {
        format!("n,,{}", self.first_bare())
    }

    /// Consume the `server-first-message` and produce the
    /// `client-final-message` for `SASLResponse`.
    pub fn handle_server_first(&mut self, data: &[u8]) -> Result<String, SaslError> {
        let message = std::str::from_utf8(data).map_err(|_| SaslError::NotUtf8)?;

        let combined_nonce = attribute(message, 'r').ok_or(SaslError::Missing("r="))?;
        let salt = attribute(message, 's').ok_or(SaslError::Missing("s="))?;
        let iterations = attribute(message, 'i').ok_or(SaslError::Missing("i="))?;

        if !combined_nonce.starts_with(&self.nonce) || combined_nonce.len() <= self.nonce.len() {
            return Err(SaslError::NonceMismatch);
        }
        let salt = BASE64.decode(salt)?;
        let iterations: u32 = iterations.parse().map_err(|_| SaslError::BadIterations)?;
        if iterations == 0 {
            return Err(SaslError::BadIterations);
        }

        let salted_password =
            pbkdf2_hmac_array::<Sha256, 32>(self.password.as_bytes(), &salt, iterations);

        let client_key = hmac(&salted_password, b"Client Key");
        let stored_key = Sha256::digest(client_key);

        let without_proof = format!("c=biws,r={combined_nonce}");
        let auth_message = format!("{},{},{}", self.first_bare(), message, without_proof);

        let client_signature = hmac(&stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(key, sig)| key ^ sig)
            .collect();

        self.server_first = Some(ServerFirst { auth_message, salted_password });

        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)))
    }

    /// Verify the `server-final-message` signature.
    pub fn verify_server_final(&self, data: &[u8]) -> Result<(), SaslError> {
        let message = std::str::from_utf8(data).map_err(|_| SaslError::NotUtf8)?;
        let signature = attribute(message, 'v').ok_or(SaslError::Missing("v="))?;
        let signature = BASE64.decode(signature)?;

        let state = self.server_first.as_ref().ok_or(SaslError::Missing("server-first"))?;
        let server_key = hmac(&state.salted_password, b"Server Key");
        let expected = hmac(&server_key, state.auth_message.as_bytes());

        if !constant_time_eq(&signature, &expected) {
            return Err(SaslError::SignatureMismatch);
        }
        Ok(())
    }
}

fn attribute<'a>(message: &'a str, key: char) -> Option<&'a str> {
    message
        .split(',')
        .find_map(|part| part.strip_prefix(key)?.strip_prefix('='))
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const NONCE: &str = "rOprNGfwEbeRWgbNEkqO";
    const SERVER_NONCE: &str = "rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0";

    fn server_first() -> String {
        format!("r={SERVER_NONCE},s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096")
    }

    #[test]
    fn client_first_message_shape() {
        let scram = ScramClient::with_nonce("pencil", NONCE.to_string());
        assert_eq!(scram.client_first_message(), format!("n,,n=,r={NONCE}"));
    }

    #[test]
    fn fresh_nonce_is_24_chars() {
        let scram = ScramClient::new("pw");
        assert_eq!(scram.nonce.len(), 24);
        let other = ScramClient::new("pw");
        assert_ne!(scram.nonce, other.nonce);
    }

    #[test]
    fn exchange_against_reference_computation() {
        let mut scram = ScramClient::with_nonce("pencil", NONCE.to_string());
        let final_message = scram.handle_server_first(server_first().as_bytes()).unwrap();

        // reference computation assembled independently of the client
        let salt = BASE64.decode("W22ZaJ0SNY7soEsUEjb6gQ==").unwrap();
        let salted = pbkdf2_hmac_array::<Sha256, 32>(b"pencil", &salt, 4096);
        let client_key = hmac(&salted, b"Client Key");
        let stored_key = Sha256::digest(client_key);
        let auth_message = format!(
            "n=,r={NONCE},{},c=biws,r={SERVER_NONCE}",
            server_first()
        );
        let signature = hmac(&stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key.iter().zip(&signature).map(|(k, s)| k ^ s).collect();

        assert_eq!(
            final_message,
            format!("c=biws,r={SERVER_NONCE},p={}", BASE64.encode(&proof))
        );

        let server_key = hmac(&salted, b"Server Key");
        let server_signature = hmac(&server_key, auth_message.as_bytes());
        let server_final = format!("v={}", BASE64.encode(server_signature));
        scram.verify_server_final(server_final.as_bytes()).unwrap();

        // a flipped signature must not verify
        let bad = format!("v={}", BASE64.encode([0u8; 32]));
        assert!(matches!(
            scram.verify_server_final(bad.as_bytes()),
            Err(SaslError::SignatureMismatch)
        ));
    }

    #[test]
    fn rejects_nonce_that_does_not_extend_ours() {
        let mut scram = ScramClient::with_nonce("pencil", NONCE.to_string());
        let err = scram
            .handle_server_first(b"r=completely-different,s=AAAA,i=4096")
            .unwrap_err();
        assert!(matches!(err, SaslError::NonceMismatch));
    }

    #[test]
    fn rejects_missing_attributes() {
        let mut scram = ScramClient::with_nonce("pencil", NONCE.to_string());
        assert!(matches!(
            scram.handle_server_first(b"s=AAAA,i=4096").unwrap_err(),
            SaslError::Missing("r=")
        ));
        assert!(matches!(
            scram.handle_server_first(format!("r={SERVER_NONCE},s=AAAA,i=0").as_bytes()).unwrap_err(),
            SaslError::BadIterations
        ));
    }
}
