//! JWT minting and verification: inbound queue-delivery bearer tokens,
//! outbound short-lived callback bearer tokens, and the admin API's
//! requeue tokens.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iss: String,
    aud: String,
    exp: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    sub: Option<String>,
}

/// Verifies inbound bearer tokens against the configured queue issuer and
/// audience (`QUEUE_ISSUER`/`QUEUE_AUDIENCE`).
#[derive(Clone)]
pub struct QueueTokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl QueueTokenVerifier {
    pub fn new(shared_secret: &str, issuer: &str, audience: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[audience]);
        Self {
            key: DecodingKey::from_secret(shared_secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<(), jsonwebtoken::errors::Error> {
        decode::<Claims>(token, &self.key, &self.validation).map(|_| ())
    }
}

/// Mints bearer tokens for requeued deliveries the admin retry endpoint
/// re-POSTs to the queue delivery endpoint, using the same issuer/audience
/// convention `QueueTokenVerifier` checks on the way in.
#[derive(Clone)]
pub struct QueueTokenSigner {
    key: EncodingKey,
    issuer: String,
    audience: String,
}

impl QueueTokenSigner {
    pub fn new(shared_secret: &str, issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            key: EncodingKey::from_secret(shared_secret.as_bytes()),
            issuer: issuer.into(),
            audience: audience.into(),
        }
    }

    pub fn sign(&self) -> Result<String, jsonwebtoken::errors::Error> {
        let exp = (chrono::Utc::now() + chrono::Duration::minutes(5)).timestamp() as usize;
        let claims = Claims {
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            exp,
            sub: None,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.key)
    }
}

/// Mints short-lived bearer tokens for outbound callback POSTs, audience set
/// to the receiver's origin, TTL capped at 10 minutes.
#[derive(Clone)]
pub struct CallbackTokenSigner {
    key: EncodingKey,
    issuer: String,
}

const MAX_CALLBACK_TOKEN_TTL_SECS: i64 = 600;

impl CallbackTokenSigner {
    pub fn new(signing_key: &str, issuer: impl Into<String>) -> Self {
        Self {
            key: EncodingKey::from_secret(signing_key.as_bytes()),
            issuer: issuer.into(),
        }
    }

    pub fn sign(&self, receiver_origin: &str) -> Result<String, jsonwebtoken::errors::Error> {
        let exp = (chrono::Utc::now() + chrono::Duration::seconds(MAX_CALLBACK_TOKEN_TTL_SECS))
            .timestamp() as usize;
        let claims = Claims {
            iss: self.issuer.clone(),
            aud: receiver_origin.to_owned(),
            exp,
            sub: None,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_valid_token() {
        let signer = CallbackTokenSigner::new("secret", "enrichment-worker");
        let token = signer.sign("https://receiver.example").unwrap();

        let verifier = QueueTokenVerifier::new("secret", "enrichment-worker", "https://receiver.example");
        assert!(verifier.verify(&token).is_ok());
    }

    #[test]
    fn queue_token_signer_round_trips_against_verifier() {
        let signer = QueueTokenSigner::new("secret", "enrichment-admin", "enrichment-worker");
        let token = signer.sign().unwrap();

        let verifier = QueueTokenVerifier::new("secret", "enrichment-admin", "enrichment-worker");
        assert!(verifier.verify(&token).is_ok());
    }

    #[test]
    fn rejects_wrong_audience() {
        let signer = CallbackTokenSigner::new("secret", "enrichment-worker");
        let token = signer.sign("https://receiver.example").unwrap();

        let verifier = QueueTokenVerifier::new("secret", "enrichment-worker", "https://someone-else.example");
        assert!(verifier.verify(&token).is_err());
    }
}
