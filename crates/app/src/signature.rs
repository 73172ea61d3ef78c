use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rsa::{pkcs8::DecodePublicKey, Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use kick_bridge_util::{AppConfig, Environment};

/// Platform public key published by Kick for webhook signatures.
pub const KICK_PUBLIC_KEY_PEM: &str = "-----BEGIN PUBLIC KEY-----
MIIBIjANBgkqhkiG9w0BAQEFAAOCAQ8AMIIBCgKCAQEAq/+l1WnlRrGSolDMA+A8
6rAhMbQGmQ2SapVcGM3zq8ANXjnhDWocMqfWcTd95btDydITa10kDvHzw9WQOqp2
MZI7ZyrfzJuz5nhTPCiJwTwnEtWft7nV14BYRDHvlfqPUaZ+1KR4OCaO/wWIk/rQ
L/TjY0M70gse8rlBkbo2a91q4WnZpunkMKXHQC9BpsIYHwyW1BaRQWr1QJjfAR6z
HbuRzSMRz442rUvpULs1+PM4W4lNf9h2j945VWiz3HFy+29Tj17SgGrJXB9AkF6i
EYXrZhoLcBOVgK7z4JpjurPH2YKkMBXyy6aLDFKR8TIEeqUTBWv6/gZ9UdlBFAw3
CQIDAQAB
-----END PUBLIC KEY-----";

const SIMULATED_PREFIX: &str = "sha256=";

/// Returns whether a signature header announces a simulated (HMAC) delivery.
pub fn is_simulated_signature(signature: &str) -> bool {
    signature.starts_with(SIMULATED_PREFIX)
}

/// Which trust domain accepted the delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignaturePath {
    Platform,
    Simulated,
}

/// Verifies webhook signatures.
///
/// The platform path checks an RSASSA-PKCS1-v1_5 / SHA-256 signature over
/// `"{message_id}.{timestamp}.{body}"` against the Kick public key. The
/// simulated path (`sha256=` prefixed, hex HMAC keyed by the subscription
/// secret) exists for local tooling and is refused in production outright.
pub struct WebhookVerifier {
    public_key: RsaPublicKey,
    environment: Environment,
}

impl WebhookVerifier {
    pub fn from_config(config: &AppConfig) -> Result<Self, VerifierInitError> {
        let pem = config
            .webhook_public_key_pem
            .as_deref()
            .unwrap_or(KICK_PUBLIC_KEY_PEM);
        Self::new(pem, config.environment)
    }

    pub fn new(public_key_pem: &str, environment: Environment) -> Result<Self, VerifierInitError> {
        let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
            .map_err(VerifierInitError::PublicKey)?;
        Ok(Self {
            public_key,
            environment,
        })
    }

    pub fn verify(
        &self,
        message_id: &str,
        timestamp: &str,
        body: &[u8],
        signature: &str,
        subscription_secret: Option<&str>,
    ) -> Result<SignaturePath, SignatureError> {
        let message = signed_message(message_id, timestamp, body);

        if let Some(hex_signature) = signature.strip_prefix(SIMULATED_PREFIX) {
            if !self.environment.allows_simulated_webhooks() {
                return Err(SignatureError::SimulationRefused);
            }
            let secret = subscription_secret.ok_or(SignatureError::MissingSecret)?;
            verify_simulated(secret, &message, hex_signature)?;
            return Ok(SignaturePath::Simulated);
        }

        let provided = BASE64
            .decode(signature)
            .map_err(|_| SignatureError::Encoding)?;
        let digest = Sha256::digest(&message);
        self.public_key
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &provided)
            .map_err(|_| SignatureError::Mismatch)?;
        Ok(SignaturePath::Platform)
    }
}

fn signed_message(message_id: &str, timestamp: &str, body: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(message_id.len() + timestamp.len() + body.len() + 2);
    message.extend_from_slice(message_id.as_bytes());
    message.push(b'.');
    message.extend_from_slice(timestamp.as_bytes());
    message.push(b'.');
    message.extend_from_slice(body);
    message
}

fn verify_simulated(secret: &str, message: &[u8], hex_signature: &str) -> Result<(), SignatureError> {
    let provided = hex::decode(hex_signature).map_err(|_| SignatureError::Encoding)?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| SignatureError::Mismatch)?;
    mac.update(message);
    let expected = mac.finalize().into_bytes();
    let expected_bytes: &[u8] = expected.as_ref();

    if expected_bytes.ct_eq(provided.as_slice()).into() {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

#[derive(Debug, Error)]
pub enum VerifierInitError {
    #[error("failed to parse webhook public key: {0}")]
    PublicKey(rsa::pkcs8::spki::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("simulated signatures are not accepted in production")]
    SimulationRefused,
    #[error("subscription has no shared secret for simulated deliveries")]
    MissingSecret,
    #[error("signature encoding is invalid")]
    Encoding,
    #[error("signature mismatch")]
    Mismatch,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use rsa::pkcs8::{EncodePublicKey, LineEnding};
    use rsa::RsaPrivateKey;

    pub(crate) fn simulated_signature(
        secret: &str,
        message_id: &str,
        timestamp: &str,
        body: &str,
    ) -> String {
        let message = signed_message(message_id, timestamp, body.as_bytes());
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac");
        mac.update(&message);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn embedded_platform_key_parses() {
        WebhookVerifier::new(KICK_PUBLIC_KEY_PEM, Environment::Production).expect("key parses");
    }

    #[test]
    fn simulated_signature_verifies_outside_production() {
        let verifier =
            WebhookVerifier::new(KICK_PUBLIC_KEY_PEM, Environment::Test).expect("verifier");
        let signature = simulated_signature("shh", "msg-1", "2026-01-01T00:00:00Z", "{}");

        let path = verifier
            .verify(
                "msg-1",
                "2026-01-01T00:00:00Z",
                b"{}",
                &signature,
                Some("shh"),
            )
            .expect("valid simulated signature");
        assert_eq!(path, SignaturePath::Simulated);
    }

    #[test]
    fn simulated_signature_rejects_tampered_body() {
        let verifier =
            WebhookVerifier::new(KICK_PUBLIC_KEY_PEM, Environment::Test).expect("verifier");
        let signature = simulated_signature("shh", "msg-1", "2026-01-01T00:00:00Z", "{}");

        let err = verifier
            .verify(
                "msg-1",
                "2026-01-01T00:00:00Z",
                b"{\"tampered\":true}",
                &signature,
                Some("shh"),
            )
            .unwrap_err();
        assert_eq!(err, SignatureError::Mismatch);
    }

    #[test]
    fn production_refuses_simulated_path_even_with_valid_hmac() {
        let verifier =
            WebhookVerifier::new(KICK_PUBLIC_KEY_PEM, Environment::Production).expect("verifier");
        let signature = simulated_signature("shh", "msg-1", "2026-01-01T00:00:00Z", "{}");

        let err = verifier
            .verify(
                "msg-1",
                "2026-01-01T00:00:00Z",
                b"{}",
                &signature,
                Some("shh"),
            )
            .unwrap_err();
        assert_eq!(err, SignatureError::SimulationRefused);
    }

    #[test]
    fn simulated_signature_without_secret_is_rejected() {
        let verifier =
            WebhookVerifier::new(KICK_PUBLIC_KEY_PEM, Environment::Test).expect("verifier");
        let signature = simulated_signature("shh", "msg-1", "2026-01-01T00:00:00Z", "{}");

        let err = verifier
            .verify("msg-1", "2026-01-01T00:00:00Z", b"{}", &signature, None)
            .unwrap_err();
        assert_eq!(err, SignatureError::MissingSecret);
    }

    #[test]
    fn platform_signature_round_trips_with_generated_key() {
        let private = RsaPrivateKey::new(&mut OsRng, 2048).expect("generate key");
        let pem = private
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .expect("pem");
        let verifier = WebhookVerifier::new(&pem, Environment::Production).expect("verifier");

        let body = br#"{"broadcaster":{"user_id":7,"username":"streamer"}}"#;
        let message = signed_message("msg-9", "2026-01-01T00:00:00Z", body);
        let digest = Sha256::digest(&message);
        let raw_signature = private
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .expect("sign");
        let signature = BASE64.encode(raw_signature);

        let path = verifier
            .verify("msg-9", "2026-01-01T00:00:00Z", body, &signature, None)
            .expect("valid platform signature");
        assert_eq!(path, SignaturePath::Platform);

        let err = verifier
            .verify("msg-9", "2026-01-01T00:00:01Z", body, &signature, None)
            .unwrap_err();
        assert_eq!(err, SignatureError::Mismatch);
    }
}
