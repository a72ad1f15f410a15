// ABOUTME: DPoP (RFC 9449) proof creation and validation with RFC 7638 key thumbprints
// ABOUTME: Binds access tokens to a client key pair via cnf.jkt confirmation claims
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Demonstrating Proof of Possession (RFC 9449)
//!
//! [`DpopBinder`] validates DPoP proof JWTs presented alongside HTTP requests
//! and, on success, yields the RFC 7638 thumbprint (`jkt`) of the proving
//! key. Token issuance embeds that thumbprint in a `cnf.jkt` confirmation
//! claim; every later use of the token must carry a fresh proof from the
//! same key. A stolen bearer token without the private key is useless.
//!
//! Validation failures are reported through [`DpopValidation`], never as
//! errors: every input here is attacker-controlled.

use crate::constants::{limits, ttl};
use crate::errors::{AppError, AppResult};
use crate::store::ReplayStore;
use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use ring::rand::{SecureRandom, SystemRandom};
use rsa::{pkcs8::EncodePrivateKey, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default RSA key size for proof signing keys. Proofs are interactive and
/// short-lived; 2048 bits keeps signing fast.
const RSA_KEY_SIZE: usize = 2048;

/// Asymmetric algorithms accepted in DPoP proofs. Symmetric algorithms are
/// rejected outright - an HMAC proof signed with the embedded key proves
/// nothing about possession.
const ALLOWED_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::ES256,
    Algorithm::ES384,
];

/// Claims carried in a DPoP proof JWT
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DpopProofClaims {
    /// Unique proof identifier for replay detection
    pub jti: String,
    /// HTTP method the proof covers
    pub htm: String,
    /// HTTP URI the proof covers (no fragment)
    pub htu: String,
    /// Issue time (unix seconds)
    pub iat: i64,
    /// base64url(SHA-256(access token)), present when the proof accompanies
    /// a token use
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ath: Option<String>,
    /// Server-issued nonce
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Result of DPoP proof validation
#[derive(Debug, Clone, Serialize)]
pub struct DpopValidation {
    /// Whether the proof is valid
    pub valid: bool,
    /// RFC 7638 thumbprint of the proving key, set on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jkt: Option<String>,
    /// Human-readable failure reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DpopValidation {
    fn ok(jkt: String) -> Self {
        Self {
            valid: true,
            jkt: Some(jkt),
            error: None,
        }
    }

    fn fail(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        warn!("DPoP proof rejected: {reason}");
        Self {
            valid: false,
            jkt: None,
            error: Some(reason),
        }
    }
}

/// Options for proof creation
#[derive(Debug, Clone, Default)]
pub struct ProofOptions {
    /// Access token the proof accompanies; hashes into `ath`
    pub access_token: Option<String>,
    /// Server-issued nonce to echo
    pub nonce: Option<String>,
}

/// Options for proof validation
#[derive(Debug, Clone, Default)]
pub struct ValidationOptions {
    /// Access token presented with the proof; when set, `ath` must match
    pub access_token: Option<String>,
    /// Nonce the server expects this proof to echo
    pub expected_nonce: Option<String>,
    /// Reject proofs that carry no nonce
    pub require_nonce: bool,
}

/// RSA key pair for DPoP proof signing
#[derive(Clone)]
pub struct DpopKeyPair {
    /// Key identifier
    pub kid: String,
    /// Private key for proof signing; never serialized
    pub private_key: RsaPrivateKey,
    /// Public key, embedded in proof headers as a JWK
    pub public_key: RsaPublicKey,
}

impl DpopKeyPair {
    /// Generate a new 2048-bit key pair
    ///
    /// # Errors
    /// Returns error if key generation fails
    pub fn generate(kid: &str) -> Result<Self> {
        Self::generate_with_key_size(kid, RSA_KEY_SIZE)
    }

    /// Generate a key pair with a configurable key size
    ///
    /// # Errors
    /// Returns error if key generation fails
    pub fn generate_with_key_size(kid: &str, key_size_bits: usize) -> Result<Self> {
        use rand::rngs::OsRng;

        let mut rng = OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, key_size_bits)
            .map_err(|e| anyhow!("Failed to generate RSA private key: {e}"))?;
        let public_key = RsaPublicKey::from(&private_key);

        Ok(Self {
            kid: kid.to_string(),
            private_key,
            public_key,
        })
    }

    /// Public key as a JWK suitable for a DPoP proof header
    ///
    /// # Errors
    /// Returns error if key serialization fails
    pub fn to_jwk(&self) -> Result<jsonwebtoken::jwk::Jwk> {
        use rsa::traits::PublicKeyParts;

        let n_b64 = URL_SAFE_NO_PAD.encode(self.public_key.n().to_bytes_be());
        let e_b64 = URL_SAFE_NO_PAD.encode(self.public_key.e().to_bytes_be());

        let jwk = serde_json::from_value(json!({
            "kty": "RSA",
            "use": "sig",
            "kid": self.kid,
            "alg": "RS256",
            "n": n_b64,
            "e": e_b64,
        }))
        .map_err(|e| anyhow!("Failed to build JWK from RSA components: {e}"))?;
        Ok(jwk)
    }

    /// Get encoding key for proof signing
    ///
    /// # Panics
    /// Panics if PEM export or encoding key creation fails (should never
    /// happen with valid RSA keys)
    #[must_use]
    pub fn encoding_key(&self) -> EncodingKey {
        let pem = self
            .private_key
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .expect("Failed to export private key");
        EncodingKey::from_rsa_pem(pem.as_bytes()).expect("Failed to create encoding key")
    }
}

/// DPoP proof validator and token binder
pub struct DpopBinder {
    store: Arc<dyn ReplayStore>,
    proof_max_skew: Duration,
    jti_ttl: Duration,
    nonce_ttl: Duration,
}

impl DpopBinder {
    /// Create a binder with default skew and replay windows
    #[must_use]
    pub fn new(store: Arc<dyn ReplayStore>) -> Self {
        Self {
            store,
            proof_max_skew: Duration::from_secs(limits::DPOP_PROOF_MAX_SKEW_SECS.unsigned_abs()),
            jti_ttl: Duration::from_secs(ttl::DPOP_JTI_TTL_SECS),
            nonce_ttl: Duration::from_secs(ttl::DPOP_NONCE_TTL_SECS),
        }
    }

    /// Create a binder from the security configuration
    #[must_use]
    pub fn from_config(store: Arc<dyn ReplayStore>, config: &crate::config::SecurityConfig) -> Self {
        Self {
            store,
            proof_max_skew: config.dpop_proof_max_skew,
            jti_ttl: config.dpop_jti_ttl,
            nonce_ttl: config.dpop_nonce_ttl,
        }
    }

    /// Create a DPoP proof JWT for an HTTP request
    ///
    /// # Errors
    ///
    /// Returns an error when the URI does not parse or the JWT cannot be
    /// signed.
    pub fn create_proof(
        key_pair: &DpopKeyPair,
        method: &str,
        uri: &str,
        options: &ProofOptions,
    ) -> AppResult<String> {
        let htu = normalize_uri(uri)
            .ok_or_else(|| AppError::invalid_input(format!("invalid proof URI: {uri}")))?;

        let claims = DpopProofClaims {
            jti: Uuid::new_v4().to_string(),
            htm: method.to_uppercase(),
            htu,
            iat: chrono::Utc::now().timestamp(),
            ath: options
                .access_token
                .as_deref()
                .map(access_token_hash),
            nonce: options.nonce.clone(),
        };

        let mut header = Header::new(Algorithm::RS256);
        header.typ = Some("dpop+jwt".to_owned());
        header.jwk = Some(
            key_pair
                .to_jwk()
                .map_err(|e| AppError::internal(format!("JWK construction failed: {e}")))?,
        );

        encode(&header, &claims, &key_pair.encoding_key())
            .map_err(|e| AppError::internal(format!("proof signing failed: {e}")))
    }

    /// Validate a DPoP proof against the request it claims to cover
    ///
    /// Checks run in order and short-circuit: `typ` header, embedded JWK
    /// with an allow-listed asymmetric algorithm, signature, `htm`, `htu`
    /// (normalized), `iat` freshness, `jti` replay, `ath` binding, nonce.
    /// On success the proof's `jti` is recorded for the replay window and
    /// the key thumbprint is returned.
    pub async fn validate_proof(
        &self,
        proof: &str,
        method: &str,
        uri: &str,
        options: &ValidationOptions,
    ) -> DpopValidation {
        // 1. Header shape: typ must mark this as a DPoP proof
        let Ok(header) = decode_header(proof) else {
            return DpopValidation::fail("proof is not a valid JWT");
        };
        if header.typ.as_deref() != Some("dpop+jwt") {
            return DpopValidation::fail("proof typ header must be dpop+jwt");
        }

        // 2. Embedded key with an allow-listed asymmetric algorithm
        let Some(jwk) = header.jwk.as_ref() else {
            return DpopValidation::fail("proof header carries no jwk");
        };
        if !ALLOWED_ALGORITHMS.contains(&header.alg) {
            return DpopValidation::fail(format!(
                "proof algorithm {:?} is not an accepted asymmetric algorithm",
                header.alg
            ));
        }

        // 3. Signature, verified with the embedded key
        let Ok(decoding_key) = DecodingKey::from_jwk(jwk) else {
            return DpopValidation::fail("embedded jwk is not a usable public key");
        };
        let mut validation = Validation::new(header.alg);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["iat"]);
        let claims = match decode::<DpopProofClaims>(proof, &decoding_key, &validation) {
            Ok(data) => data.claims,
            Err(e) => {
                return DpopValidation::fail(format!("proof signature verification failed: {e}"));
            }
        };

        // 4. HTTP method binding
        if !claims.htm.eq_ignore_ascii_case(method) {
            return DpopValidation::fail(format!(
                "proof htm {} does not match request method {method}",
                claims.htm
            ));
        }

        // 5. HTTP URI binding, compared after normalization
        let Some(expected_htu) = normalize_uri(uri) else {
            return DpopValidation::fail("request URI does not parse");
        };
        let Some(proof_htu) = normalize_uri(&claims.htu) else {
            return DpopValidation::fail("proof htu does not parse");
        };
        if proof_htu != expected_htu {
            return DpopValidation::fail(format!(
                "proof htu {proof_htu} does not match request URI {expected_htu}"
            ));
        }

        // 6. Freshness
        let now = chrono::Utc::now().timestamp();
        let skew = i64::try_from(self.proof_max_skew.as_secs()).unwrap_or(i64::MAX);
        if (now - claims.iat).abs() > skew {
            return DpopValidation::fail("proof iat is outside the accepted clock skew");
        }

        // 7. Replay: jti must be unseen, and is recorded immediately
        let jti_key = format!("dpop:jti:{}", claims.jti);
        if self.store.exists(&jti_key).await {
            return DpopValidation::fail("proof replay detected (jti already used)");
        }
        self.store.put(&jti_key, vec![1], self.jti_ttl).await;

        // 8. Access token binding: ath present iff a token was presented
        match (&options.access_token, &claims.ath) {
            (Some(token), Some(ath)) => {
                let expected = access_token_hash(token);
                if expected.len() != ath.len()
                    || !bool::from(expected.as_bytes().ct_eq(ath.as_bytes()))
                {
                    return DpopValidation::fail("proof ath does not match the presented token");
                }
            }
            (Some(_), None) => {
                return DpopValidation::fail("proof must carry ath when a token is presented");
            }
            (None, Some(_)) => {
                return DpopValidation::fail("proof carries ath but no token was presented");
            }
            (None, None) => {}
        }

        // 9. Server nonce: required when demanded, single use ever. An
        // unsolicited nonce on a proof nothing asked for is ignored.
        let nonce_solicited = options.require_nonce || options.expected_nonce.is_some();
        match &claims.nonce {
            Some(nonce) if nonce_solicited => {
                if let Some(expected) = &options.expected_nonce {
                    if nonce != expected {
                        return DpopValidation::fail(
                            "proof nonce does not match the expected nonce",
                        );
                    }
                }
                let nonce_key = format!("dpop:nonce:{nonce}");
                if self.store.take(&nonce_key).await.is_none() {
                    return DpopValidation::fail("proof nonce is unknown, expired, or already used");
                }
            }
            Some(_) => {}
            None => {
                if nonce_solicited {
                    return DpopValidation::fail("proof must carry a server-issued nonce");
                }
            }
        }

        let jkt = match jwk_thumbprint(jwk) {
            Ok(jkt) => jkt,
            Err(e) => {
                return DpopValidation::fail(format!("thumbprint computation failed: {e}"));
            }
        };
        debug!(jkt = %jkt, "DPoP proof validated");
        DpopValidation::ok(jkt)
    }

    /// Issue a fresh single-use server nonce (10-minute lifetime)
    ///
    /// The route layer delivers it via the `DPoP-Nonce` response header.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the system RNG fails.
    pub async fn issue_nonce(&self) -> AppResult<String> {
        let rng = SystemRandom::new();
        let mut bytes = vec![0u8; limits::DPOP_NONCE_BYTES];
        rng.fill(&mut bytes).map_err(|e| {
            tracing::error!("CRITICAL: SystemRandom failed generating DPoP nonce: {e}");
            AppError::internal("system RNG failure - cannot generate secure random bytes")
        })?;
        let nonce = URL_SAFE_NO_PAD.encode(&bytes);
        self.store
            .put(&format!("dpop:nonce:{nonce}"), vec![1], self.nonce_ttl)
            .await;
        Ok(nonce)
    }

    /// Attach a `cnf.jkt` confirmation claim and DPoP token type to a token
    /// claims envelope
    #[must_use]
    pub fn create_bound_token(mut claims: serde_json::Value, jkt: &str) -> serde_json::Value {
        if let Some(map) = claims.as_object_mut() {
            map.insert("cnf".to_owned(), json!({ "jkt": jkt }));
            map.insert("token_type".to_owned(), json!("DPoP"));
        }
        claims
    }

    /// Check that a token envelope's confirmation claim matches the key a
    /// fresh proof was signed with
    #[must_use]
    pub fn validate_token_binding(claims: &serde_json::Value, presented_jkt: &str) -> bool {
        let Some(bound_jkt) = claims
            .get("cnf")
            .and_then(|cnf| cnf.get("jkt"))
            .and_then(serde_json::Value::as_str)
        else {
            warn!("token binding check failed: no cnf.jkt in token claims");
            return false;
        };
        let ok = bound_jkt.len() == presented_jkt.len()
            && bool::from(bound_jkt.as_bytes().ct_eq(presented_jkt.as_bytes()));
        if !ok {
            warn!("token binding check failed: cnf.jkt does not match presented key");
        }
        ok
    }
}

/// RFC 7638 JWK thumbprint: SHA-256 over the canonical member subset in
/// lexicographic order with no whitespace
///
/// # Errors
///
/// Returns an error for key types without a defined canonical subset.
pub fn jwk_thumbprint(jwk: &jsonwebtoken::jwk::Jwk) -> Result<String> {
    let value = serde_json::to_value(jwk)?;

    // serde_json maps iterate in key order, so inserting the canonical
    // members yields the lexicographic serialization RFC 7638 requires
    let mut canonical = serde_json::Map::new();
    let kty = value
        .get("kty")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| anyhow!("JWK has no kty member"))?;
    match kty {
        "RSA" => {
            for member in ["e", "kty", "n"] {
                let v = value
                    .get(member)
                    .ok_or_else(|| anyhow!("RSA JWK missing {member} member"))?;
                canonical.insert(member.to_owned(), v.clone());
            }
        }
        "EC" => {
            for member in ["crv", "kty", "x", "y"] {
                let v = value
                    .get(member)
                    .ok_or_else(|| anyhow!("EC JWK missing {member} member"))?;
                canonical.insert(member.to_owned(), v.clone());
            }
        }
        other => return Err(anyhow!("unsupported JWK key type for thumbprint: {other}")),
    }

    let canonical_json = serde_json::to_string(&canonical)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical_json.as_bytes());
    Ok(URL_SAFE_NO_PAD.encode(hasher.finalize()))
}

/// Hash an access token for the `ath` claim
fn access_token_hash(access_token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(access_token.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Normalize an `htu` URI: parse, strip the fragment, keep the query.
/// The url crate lower-cases scheme and host as a side effect of parsing.
fn normalize_uri(uri: &str) -> Option<String> {
    let mut parsed = url::Url::parse(uri).ok()?;
    parsed.set_fragment(None);
    Some(parsed.to_string())
}
