// ABOUTME: Environment configuration management for deployment-specific security settings
// ABOUTME: Parses the state-token signing secret and TTL overrides from environment variables
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Environment-based security configuration
//!
//! The only configuration the crate *requires* is the state-token signing
//! secret (`AUTHGUARD_STATE_SECRET`). Everything else has defaults from
//! [`crate::constants`] and can be overridden per deployment.

use crate::constants::{limits, ttl};
use crate::errors::{AppError, AppResult};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ring::rand::{SecureRandom, SystemRandom};
use std::env;
use std::time::Duration;
use tracing::warn;

/// Security configuration for the authorization core
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// HMAC key material for state-token signing (min 32 bytes)
    pub state_secret: Vec<u8>,
    /// CSRF state record lifetime
    pub state_ttl: Duration,
    /// PKCE challenge record lifetime
    pub pkce_challenge_ttl: Duration,
    /// DPoP jti replay window
    pub dpop_jti_ttl: Duration,
    /// Server-issued DPoP nonce lifetime
    pub dpop_nonce_ttl: Duration,
    /// Accepted DPoP proof clock skew, either direction
    pub dpop_proof_max_skew: Duration,
}

impl SecurityConfig {
    /// Load configuration from environment variables
    ///
    /// Reads `AUTHGUARD_STATE_SECRET` (required, hex or raw, min 32 bytes of
    /// key material) and the optional `AUTHGUARD_*_TTL_SECS` overrides.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the secret is missing or too short.
    pub fn from_env() -> AppResult<Self> {
        let secret_raw = env::var("AUTHGUARD_STATE_SECRET").map_err(|_| {
            AppError::config_missing(
                "AUTHGUARD_STATE_SECRET must be set (min 32 bytes, hex or raw)",
            )
        })?;
        let state_secret = Self::decode_secret(&secret_raw);

        let config = Self {
            state_secret,
            state_ttl: parse_ttl_secs("AUTHGUARD_STATE_TTL_SECS", ttl::STATE_TTL_SECS),
            pkce_challenge_ttl: parse_ttl_secs(
                "AUTHGUARD_PKCE_TTL_SECS",
                ttl::PKCE_CHALLENGE_TTL_SECS,
            ),
            dpop_jti_ttl: parse_ttl_secs("AUTHGUARD_DPOP_JTI_TTL_SECS", ttl::DPOP_JTI_TTL_SECS),
            dpop_nonce_ttl: parse_ttl_secs(
                "AUTHGUARD_DPOP_NONCE_TTL_SECS",
                ttl::DPOP_NONCE_TTL_SECS,
            ),
            dpop_proof_max_skew: parse_ttl_secs(
                "AUTHGUARD_DPOP_SKEW_SECS",
                limits::DPOP_PROOF_MAX_SKEW_SECS.unsigned_abs(),
            ),
        };
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from an explicit secret, defaults elsewhere
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the secret is shorter than 32 bytes.
    pub fn with_secret(state_secret: impl Into<Vec<u8>>) -> AppResult<Self> {
        let config = Self {
            state_secret: state_secret.into(),
            state_ttl: Duration::from_secs(ttl::STATE_TTL_SECS),
            pkce_challenge_ttl: Duration::from_secs(ttl::PKCE_CHALLENGE_TTL_SECS),
            dpop_jti_ttl: Duration::from_secs(ttl::DPOP_JTI_TTL_SECS),
            dpop_nonce_ttl: Duration::from_secs(ttl::DPOP_NONCE_TTL_SECS),
            dpop_proof_max_skew: Duration::from_secs(
                limits::DPOP_PROOF_MAX_SKEW_SECS.unsigned_abs(),
            ),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the secret is below the 256-bit
    /// minimum or a TTL is zero.
    pub fn validate(&self) -> AppResult<()> {
        if self.state_secret.len() < limits::STATE_SECRET_MIN_BYTES {
            return Err(AppError::config(format!(
                "state secret must be at least {} bytes, got {}",
                limits::STATE_SECRET_MIN_BYTES,
                self.state_secret.len()
            )));
        }
        if self.state_ttl.is_zero() || self.pkce_challenge_ttl.is_zero() {
            return Err(AppError::config("TTL values must be non-zero"));
        }
        Ok(())
    }

    /// Generate a fresh 32-byte state secret, base64url-encoded for storage
    ///
    /// # Errors
    ///
    /// Returns an internal error if the system RNG fails.
    pub fn generate_state_secret() -> AppResult<String> {
        let rng = SystemRandom::new();
        let mut bytes = vec![0u8; limits::STATE_SECRET_MIN_BYTES];
        rng.fill(&mut bytes)
            .map_err(|_| AppError::internal("system RNG failure generating state secret"))?;
        Ok(URL_SAFE_NO_PAD.encode(&bytes))
    }

    /// Decode hex-encoded secrets; anything else is treated as raw key bytes
    fn decode_secret(raw: &str) -> Vec<u8> {
        if raw.len() >= limits::STATE_SECRET_MIN_BYTES * 2 {
            if let Ok(decoded) = hex::decode(raw) {
                return decoded;
            }
        }
        raw.as_bytes().to_vec()
    }
}

fn parse_ttl_secs(key: &str, default: u64) -> Duration {
    let secs = env::var(key).map_or(default, |value| {
        value.parse().unwrap_or_else(|_| {
            warn!("invalid {key}={value}, using default {default}");
            default
        })
    });
    Duration::from_secs(secs)
}
