// ABOUTME: CSRF protection via HMAC-signed, single-use OAuth state tokens
// ABOUTME: Also enforces redirect-URI allow-listing and authorization-request policy
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! CSRF state tokens and authorization-request validation
//!
//! [`StateGuard`] issues state tokens of the form
//! `base64url(payload_json) + "." + base64url(hmac_sha256_tag)` and stores a
//! server-side [`StateRecord`] under the embedded state id. Validation is
//! exactly-once: the record is consumed on success. The signed payload
//! redundantly carries the client id, redirect URI, and nonce so tampering
//! is detectable even before the record lookup; a tampered token leaves the
//! record untouched so a legitimate retry with the original token still
//! succeeds.

use crate::config::SecurityConfig;
use crate::constants::limits;
use crate::errors::{AppError, AppResult};
use crate::store::ReplayStore;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Server-side record for an issued state token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRecord {
    /// Random state identifier (also in the signed payload as `sid`)
    pub state_id: String,
    /// Client the authorization request belongs to
    pub client_id: String,
    /// Redirect URI the request committed to
    pub redirect_uri: String,
    /// Per-request nonce, echoed in the signed payload
    pub nonce: String,
    /// Requested scope, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// PKCE challenge captured at authorization time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_challenge: Option<String>,
    /// PKCE method declared with the challenge
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_challenge_method: Option<String>,
    /// Issue time
    pub created_at: DateTime<Utc>,
    /// Expiry time
    pub expires_at: DateTime<Utc>,
    /// Requesting IP, for audit correlation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// Requesting user agent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Device fingerprint, when the host computes one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

/// Signed wire payload inside a state token
#[derive(Debug, Serialize, Deserialize)]
struct StateTokenPayload {
    sid: String,
    cid: String,
    ruri: String,
    nonce: String,
    iat: i64,
    exp: i64,
}

/// Input for issuing a state token
#[derive(Debug, Clone, Default)]
pub struct StateParams {
    /// Client making the authorization request
    pub client_id: String,
    /// Redirect URI the request commits to
    pub redirect_uri: String,
    /// Per-request nonce (caller-chosen; a UUID works)
    pub nonce: String,
    /// Requested scope
    pub scope: Option<String>,
    /// PKCE challenge to bind to the session
    pub code_challenge: Option<String>,
    /// PKCE method
    pub code_challenge_method: Option<String>,
    /// Requesting IP
    pub ip_address: Option<String>,
    /// Requesting user agent
    pub user_agent: Option<String>,
    /// Device fingerprint
    pub fingerprint: Option<String>,
}

/// OAuth 2.1 authorization request parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizeRequest {
    /// Must be exactly `code`
    pub response_type: String,
    /// Requesting client
    pub client_id: String,
    /// Redirect target, must be on the client's allow-list
    pub redirect_uri: String,
    /// Requested scope
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// CSRF state parameter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// PKCE challenge (mandatory under OAuth 2.1)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_challenge: Option<String>,
    /// PKCE method; only `S256` passes policy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_challenge_method: Option<String>,
}

/// Outcome of authorization-request policy validation
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationCheck {
    /// Whether the request passes policy
    pub valid: bool,
    /// Reason for rejection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuthorizationCheck {
    fn ok() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    fn reject(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(reason.into()),
        }
    }
}

/// Source of per-client redirect URI allow-lists
///
/// The real registry lives with the host's client storage; this trait is the
/// seam. [`StaticClientRegistry`] ships for tests and config-driven setups.
pub trait ClientRegistry: Send + Sync {
    /// Registered redirect URIs for a client, `None` for unknown clients
    fn redirect_uris(&self, client_id: &str) -> Option<Vec<String>>;
}

/// Fixed in-memory client registry
#[derive(Debug, Default)]
pub struct StaticClientRegistry {
    clients: HashMap<String, Vec<String>>,
}

impl StaticClientRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client with its redirect URI allow-list
    pub fn register(&mut self, client_id: impl Into<String>, redirect_uris: Vec<String>) {
        self.clients.insert(client_id.into(), redirect_uris);
    }
}

impl ClientRegistry for StaticClientRegistry {
    fn redirect_uris(&self, client_id: &str) -> Option<Vec<String>> {
        self.clients.get(client_id).cloned()
    }
}

/// CSRF state manager
pub struct StateGuard {
    store: Arc<dyn ReplayStore>,
    registry: Arc<dyn ClientRegistry>,
    key: hmac::Key,
    ttl: Duration,
}

impl StateGuard {
    /// Create a guard from the security configuration
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the signing secret is below the
    /// 256-bit minimum.
    pub fn new(
        store: Arc<dyn ReplayStore>,
        registry: Arc<dyn ClientRegistry>,
        config: &SecurityConfig,
    ) -> AppResult<Self> {
        if config.state_secret.len() < limits::STATE_SECRET_MIN_BYTES {
            return Err(AppError::config(format!(
                "state secret must be at least {} bytes",
                limits::STATE_SECRET_MIN_BYTES
            )));
        }
        Ok(Self {
            store,
            registry,
            key: hmac::Key::new(hmac::HMAC_SHA256, &config.state_secret),
            ttl: config.state_ttl,
        })
    }

    /// Issue a signed, single-use state token and store its record
    ///
    /// # Errors
    ///
    /// Returns an internal error if the system RNG or record serialization
    /// fails.
    pub async fn issue(&self, params: StateParams) -> AppResult<String> {
        let state_id = generate_state_id()?;
        let now = Utc::now();
        let ttl_chrono = chrono::Duration::from_std(self.ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let expires_at = now + ttl_chrono;

        let record = StateRecord {
            state_id: state_id.clone(),
            client_id: params.client_id.clone(),
            redirect_uri: params.redirect_uri.clone(),
            nonce: params.nonce.clone(),
            scope: params.scope,
            code_challenge: params.code_challenge,
            code_challenge_method: params.code_challenge_method,
            created_at: now,
            expires_at,
            ip_address: params.ip_address,
            user_agent: params.user_agent,
            fingerprint: params.fingerprint,
        };
        let serialized = serde_json::to_vec(&record)?;
        self.store
            .put(&state_key(&state_id), serialized, self.ttl)
            .await;

        let payload = StateTokenPayload {
            sid: state_id,
            cid: params.client_id,
            ruri: params.redirect_uri,
            nonce: params.nonce,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let payload_json = serde_json::to_vec(&payload)?;
        let payload_b64 = URL_SAFE_NO_PAD.encode(&payload_json);
        let tag = hmac::sign(&self.key, payload_b64.as_bytes());
        let tag_b64 = URL_SAFE_NO_PAD.encode(tag.as_ref());

        debug!(client_id = %payload.cid, "issued state token");
        Ok(format!("{payload_b64}.{tag_b64}"))
    }

    /// Validate and consume a state token
    ///
    /// Returns the stored record exactly once; any subsequent presentation
    /// of the same token returns `None`. Signature or expiry failures, and
    /// payload fields that disagree with the stored record, return `None`
    /// without consuming the record.
    pub async fn validate(&self, token: &str) -> Option<StateRecord> {
        let (payload_b64, tag_b64) = token.split_once('.')?;

        let Ok(tag) = URL_SAFE_NO_PAD.decode(tag_b64) else {
            warn!("state validation failed: tag is not valid base64url");
            return None;
        };
        if hmac::verify(&self.key, payload_b64.as_bytes(), &tag).is_err() {
            warn!("state validation failed: signature mismatch - possible tampering");
            return None;
        }

        let payload_json = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
        let Ok(payload) = serde_json::from_slice::<StateTokenPayload>(&payload_json) else {
            warn!("state validation failed: payload is not valid JSON");
            return None;
        };

        if Utc::now().timestamp() > payload.exp {
            warn!(client_id = %payload.cid, "state validation failed: token expired");
            return None;
        }

        // Peek before consuming: binding mismatches must not burn the record
        let key = state_key(&payload.sid);
        let raw = self.store.get(&key).await?;
        let Ok(record) = serde_json::from_slice::<StateRecord>(&raw) else {
            warn!("state validation failed: stored record is corrupt");
            return None;
        };

        if record.client_id != payload.cid
            || record.redirect_uri != payload.ruri
            || record.nonce != payload.nonce
        {
            warn!(
                client_id = %payload.cid,
                "state validation failed: payload does not match stored record - possible tampering"
            );
            return None;
        }

        // Consume: at most one presentation of this token ever succeeds.
        // A racing duplicate loses here even though both passed the peek.
        let raw = self.store.take(&key).await?;
        let record = serde_json::from_slice::<StateRecord>(&raw).ok()?;

        debug!(client_id = %record.client_id, "state token validated and consumed");
        Some(record)
    }

    /// Exact-match redirect URI validation against the client's allow-list
    ///
    /// No prefix, substring, or pattern matching. An unknown client has no
    /// valid redirect URIs.
    #[must_use]
    pub fn validate_redirect_uri(&self, uri: &str, client_id: &str) -> bool {
        match self.registry.redirect_uris(client_id) {
            Some(allowed) => {
                let ok = allowed.iter().any(|registered| registered == uri);
                if !ok {
                    warn!(client_id = %client_id, uri = %uri, "redirect_uri not on allow-list");
                }
                ok
            }
            None => {
                warn!(client_id = %client_id, "redirect_uri check for unknown client");
                false
            }
        }
    }

    /// OAuth 2.1 policy validation for an authorization request
    ///
    /// Requires `response_type=code`, a known client with an allow-listed
    /// redirect URI, a state parameter, and an S256 PKCE challenge of valid
    /// length. `plain` is rejected here even though the PKCE primitive can
    /// compute it.
    #[must_use]
    pub fn validate_authorization_request(&self, request: &AuthorizeRequest) -> AuthorizationCheck {
        if request.response_type != "code" {
            return AuthorizationCheck::reject(
                "unsupported response_type: only 'code' is supported",
            );
        }
        if request.client_id.is_empty() {
            return AuthorizationCheck::reject("client_id is required");
        }
        if request.redirect_uri.is_empty() {
            return AuthorizationCheck::reject("redirect_uri is required");
        }
        if !self.validate_redirect_uri(&request.redirect_uri, &request.client_id) {
            return AuthorizationCheck::reject("redirect_uri is not registered for this client");
        }
        if request.state.as_deref().map_or(true, str::is_empty) {
            return AuthorizationCheck::reject("state parameter is required");
        }

        let Some(challenge) = request.code_challenge.as_deref() else {
            return AuthorizationCheck::reject("code_challenge is required (PKCE is mandatory)");
        };
        if challenge.len() < limits::PKCE_VERIFIER_MIN_LEN
            || challenge.len() > limits::PKCE_VERIFIER_MAX_LEN
        {
            return AuthorizationCheck::reject(
                "code_challenge must be between 43 and 128 characters",
            );
        }
        if let Some(method) = request.code_challenge_method.as_deref() {
            if method != "S256" {
                return AuthorizationCheck::reject(
                    "only S256 code_challenge_method is supported",
                );
            }
        }

        AuthorizationCheck::ok()
    }
}

fn state_key(state_id: &str) -> String {
    format!("state:{state_id}")
}

fn generate_state_id() -> AppResult<String> {
    let rng = SystemRandom::new();
    let mut bytes = vec![0u8; limits::STATE_ID_BYTES];
    rng.fill(&mut bytes).map_err(|e| {
        tracing::error!("CRITICAL: SystemRandom failed generating state id: {e}");
        AppError::internal("system RNG failure - cannot generate secure random bytes")
    })?;
    Ok(URL_SAFE_NO_PAD.encode(&bytes))
}
