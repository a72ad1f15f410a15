// ABOUTME: PKCE (RFC 7636) verifier generation, challenge derivation, and single-use validation
// ABOUTME: Challenges are stored per authorization code and consumed atomically before comparison
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Proof Key for Code Exchange (RFC 7636)
//!
//! [`PkceVerifier`] covers both halves of the exchange: the client-side
//! primitives (`generate_verifier`, `derive_challenge`) and the server-side
//! binding (`store_challenge` at authorization time, `validate` at token
//! exchange). Validation consumes the stored challenge *before* comparing,
//! so a failed exchange burns the record and the code cannot be retried
//! with a corrected verifier.

use crate::constants::{limits, ttl};
use crate::errors::{AppError, AppResult};
use crate::store::ReplayStore;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;

/// PKCE challenge transformation method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeChallengeMethod {
    /// SHA-256 transformation (the only method OAuth 2.1 permits)
    S256,
    /// Verifier passed through unchanged. Supported for legacy interop;
    /// rejected by the authorization-request policy layer.
    Plain,
}

impl fmt::Display for CodeChallengeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::S256 => write!(f, "S256"),
            Self::Plain => write!(f, "plain"),
        }
    }
}

impl FromStr for CodeChallengeMethod {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "S256" => Ok(Self::S256),
            "plain" => Ok(Self::Plain),
            other => Err(AppError::invalid_input(format!(
                "unknown code_challenge_method: {other}"
            ))),
        }
    }
}

/// Stored challenge, bound to an authorization code and client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PkceChallengeRecord {
    /// The code challenge presented at the authorization endpoint
    pub challenge: String,
    /// Transformation method the client declared
    pub method: CodeChallengeMethod,
    /// Client the challenge is bound to
    pub client_id: String,
    /// When the challenge was stored
    pub created_at: DateTime<Utc>,
    /// Expiry mirror of the store TTL, for diagnostics
    pub expires_at: DateTime<Utc>,
}

/// PKCE manager over a replay store
pub struct PkceVerifier {
    store: Arc<dyn ReplayStore>,
    challenge_ttl: Duration,
}

impl PkceVerifier {
    /// Create a verifier with the default 10-minute challenge TTL
    #[must_use]
    pub fn new(store: Arc<dyn ReplayStore>) -> Self {
        Self {
            store,
            challenge_ttl: Duration::from_secs(ttl::PKCE_CHALLENGE_TTL_SECS),
        }
    }

    /// Create a verifier with an explicit challenge TTL
    #[must_use]
    pub fn with_ttl(store: Arc<dyn ReplayStore>, challenge_ttl: Duration) -> Self {
        Self {
            store,
            challenge_ttl,
        }
    }

    /// Create a verifier with the challenge lifetime from the security
    /// configuration (`AUTHGUARD_PKCE_TTL_SECS` override included)
    #[must_use]
    pub fn from_config(
        store: Arc<dyn ReplayStore>,
        config: &crate::config::SecurityConfig,
    ) -> Self {
        Self::with_ttl(store, config.pkce_challenge_ttl)
    }

    /// Generate a fresh code verifier: 64 random bytes, base64url (86 chars)
    ///
    /// # Errors
    ///
    /// Returns an internal error if the system RNG fails or the encoded
    /// verifier falls outside the RFC 7636 [43, 128] bound (programming
    /// defect, not reachable with the current byte count).
    pub fn generate_verifier() -> AppResult<String> {
        let rng = SystemRandom::new();
        let mut bytes = vec![0u8; limits::PKCE_VERIFIER_BYTES];
        rng.fill(&mut bytes).map_err(|e| {
            tracing::error!("CRITICAL: SystemRandom failed generating PKCE verifier: {e}");
            AppError::internal("system RNG failure - cannot generate secure random bytes")
        })?;

        let verifier = URL_SAFE_NO_PAD.encode(&bytes);
        if verifier.len() < limits::PKCE_VERIFIER_MIN_LEN
            || verifier.len() > limits::PKCE_VERIFIER_MAX_LEN
        {
            return Err(AppError::internal(format!(
                "generated verifier length {} outside RFC 7636 bounds",
                verifier.len()
            )));
        }
        Ok(verifier)
    }

    /// Derive the challenge for a verifier. Deterministic.
    ///
    /// `S256` is base64url(SHA-256(verifier)); `plain` echoes the verifier
    /// and logs the downgrade.
    #[must_use]
    pub fn derive_challenge(verifier: &str, method: CodeChallengeMethod) -> String {
        match method {
            CodeChallengeMethod::S256 => {
                let mut hasher = Sha256::new();
                hasher.update(verifier.as_bytes());
                URL_SAFE_NO_PAD.encode(hasher.finalize())
            }
            CodeChallengeMethod::Plain => {
                tracing::warn!("plain code_challenge_method in use - downgrade from S256");
                verifier.to_owned()
            }
        }
    }

    /// Bind a challenge to an authorization code
    pub async fn store_challenge(
        &self,
        code: &str,
        challenge: &str,
        method: CodeChallengeMethod,
        client_id: &str,
    ) -> AppResult<()> {
        let now = Utc::now();
        let record = PkceChallengeRecord {
            challenge: challenge.to_owned(),
            method,
            client_id: client_id.to_owned(),
            created_at: now,
            expires_at: now
                + chrono::Duration::from_std(self.challenge_ttl)
                    .unwrap_or_else(|_| chrono::Duration::seconds(600)),
        };
        let serialized = serde_json::to_vec(&record)?;
        self.store
            .put(&challenge_key(code), serialized, self.challenge_ttl)
            .await;
        tracing::debug!(client_id = %client_id, method = %method, "stored PKCE challenge");
        Ok(())
    }

    /// Validate a code verifier against the challenge stored for `code`
    ///
    /// Returns `false` on missing or expired record, client mismatch,
    /// malformed verifier, or challenge mismatch. Never panics on
    /// attacker-controlled input.
    ///
    /// The record is consumed before verification, so success and failure
    /// both burn it. A second line of defense behind authorization-code
    /// single-use: a stolen code cannot be ground through verifier guesses.
    pub async fn validate(&self, code: &str, verifier: &str, client_id: &str) -> bool {
        let Some(raw) = self.store.take(&challenge_key(code)).await else {
            tracing::warn!(client_id = %client_id, "PKCE validation failed: no challenge for code");
            return false;
        };
        let Ok(record) = serde_json::from_slice::<PkceChallengeRecord>(&raw) else {
            tracing::warn!("PKCE validation failed: stored challenge record is corrupt");
            return false;
        };

        if record.client_id != client_id {
            tracing::warn!(
                expected = %record.client_id,
                presented = %client_id,
                "PKCE validation failed: client mismatch"
            );
            return false;
        }

        // RFC 7636 Section 4.1: length 43-128, unreserved characters only
        if !verifier_format_valid(verifier) {
            tracing::warn!(client_id = %client_id, "PKCE validation failed: malformed verifier");
            return false;
        }

        let computed = Self::derive_challenge(verifier, record.method);

        // Length check first; the constant-time compare needs equal lengths
        // and a length mismatch is already public information
        if computed.len() != record.challenge.len() {
            tracing::warn!(client_id = %client_id, "PKCE validation failed: challenge mismatch");
            return false;
        }
        if computed
            .as_bytes()
            .ct_eq(record.challenge.as_bytes())
            .into()
        {
            tracing::debug!(client_id = %client_id, "PKCE verification successful");
            true
        } else {
            tracing::warn!(
                client_id = %client_id,
                "PKCE validation failed: code_verifier does not match code_challenge"
            );
            false
        }
    }
}

fn challenge_key(code: &str) -> String {
    format!("pkce:{code}")
}

fn verifier_format_valid(verifier: &str) -> bool {
    if verifier.len() < limits::PKCE_VERIFIER_MIN_LEN
        || verifier.len() > limits::PKCE_VERIFIER_MAX_LEN
    {
        return false;
    }
    verifier
        .chars()
        .all(|c| matches!(c, 'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '.' | '_' | '~'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_challenge_known_vector() {
        // RFC 7636 Appendix B test vector
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        let challenge = PkceVerifier::derive_challenge(verifier, CodeChallengeMethod::S256);
        assert_eq!(challenge, "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
    }

    #[test]
    fn test_derive_challenge_deterministic() {
        let a = PkceVerifier::derive_challenge("x".repeat(43).as_str(), CodeChallengeMethod::S256);
        let b = PkceVerifier::derive_challenge("x".repeat(43).as_str(), CodeChallengeMethod::S256);
        assert_eq!(a, b);
    }

    #[test]
    fn test_plain_passthrough() {
        let verifier = "A".repeat(43);
        let challenge = PkceVerifier::derive_challenge(&verifier, CodeChallengeMethod::Plain);
        assert_eq!(challenge, verifier);
    }

    #[test]
    fn test_verifier_format_bounds() {
        assert!(!verifier_format_valid(&"a".repeat(42)));
        assert!(verifier_format_valid(&"a".repeat(43)));
        assert!(verifier_format_valid(&"a".repeat(128)));
        assert!(!verifier_format_valid(&"a".repeat(129)));
        assert!(!verifier_format_valid(&format!("{}!", "a".repeat(43))));
    }

    #[test]
    fn test_method_parse() {
        assert_eq!(
            "S256".parse::<CodeChallengeMethod>().unwrap(),
            CodeChallengeMethod::S256
        );
        assert_eq!(
            "plain".parse::<CodeChallengeMethod>().unwrap(),
            CodeChallengeMethod::Plain
        );
        assert!("s256".parse::<CodeChallengeMethod>().is_err());
    }
}
