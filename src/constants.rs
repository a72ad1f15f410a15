// ABOUTME: System-wide constants for the authorization security core
// ABOUTME: Contains protocol TTLs, RFC bounds, and risk-scoring defaults
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Constants Module
//!
//! Hardcoded protocol constants and scoring defaults. Values that deployments
//! commonly tune are mirrored as environment overrides in
//! [`crate::config::environment::SecurityConfig`].

/// Time-to-live defaults for single-use records
pub mod ttl {
    /// CSRF state records and tokens (RFC 6749 §10.12 recommends short-lived state)
    pub const STATE_TTL_SECS: u64 = 10 * 60;

    /// PKCE challenge records, keyed by authorization code (matches code lifetime)
    pub const PKCE_CHALLENGE_TTL_SECS: u64 = 10 * 60;

    /// DPoP jti replay window
    pub const DPOP_JTI_TTL_SECS: u64 = 60 * 60;

    /// Server-issued DPoP nonces (single use, short-lived)
    pub const DPOP_NONCE_TTL_SECS: u64 = 10 * 60;

    /// Cached IP reputation lookups
    pub const IP_REPUTATION_TTL_SECS: u64 = 60 * 60;
}

/// Protocol limits and RFC-mandated bounds
pub mod limits {
    /// RFC 7636 §4.1: code verifier minimum length in characters
    pub const PKCE_VERIFIER_MIN_LEN: usize = 43;

    /// RFC 7636 §4.1: code verifier maximum length in characters
    pub const PKCE_VERIFIER_MAX_LEN: usize = 128;

    /// Random bytes drawn for a generated verifier (86 base64url chars)
    pub const PKCE_VERIFIER_BYTES: usize = 64;

    /// Minimum HMAC secret length for state-token signing (256 bits)
    pub const STATE_SECRET_MIN_BYTES: usize = 32;

    /// Random bytes per state identifier
    pub const STATE_ID_BYTES: usize = 32;

    /// Random bytes per DPoP nonce
    pub const DPOP_NONCE_BYTES: usize = 16;

    /// Accepted clock skew for DPoP proof `iat`, in either direction
    pub const DPOP_PROOF_MAX_SKEW_SECS: i64 = 5 * 60;

    /// Login-hour history retained per user profile
    pub const LOGIN_HOUR_HISTORY: usize = 100;
}

/// Risk-scoring defaults for the anomaly scorer
pub mod risk {
    /// Composite score at or above which the verdict is `Deny`
    pub const DENY_THRESHOLD: f64 = 0.8;

    /// Composite score at or above which the verdict is `Challenge`
    pub const CHALLENGE_THRESHOLD: f64 = 0.5;

    /// Standing profile risk considered elevated
    pub const ELEVATED_PROFILE_RISK: f64 = 0.6;

    /// Composite considered moderate when the profile risk is already elevated
    pub const MODERATE_SCORE: f64 = 0.3;

    /// Rolling window for per-IP request velocity
    pub const VELOCITY_WINDOW_SECS: i64 = 60;

    /// Requests inside the window that saturate the velocity factor
    pub const VELOCITY_MAX_REQUESTS: usize = 10;

    /// Implied travel speed beyond which a location change is implausible (km/h)
    pub const IMPOSSIBLE_TRAVEL_KMH: f64 = 900.0;

    /// Hours of deviation from the historical mean login hour before penalizing
    pub const TIME_DEVIATION_HOURS: f64 = 4.0;

    /// Prior logins required before the time-of-day factor applies
    pub const MIN_HISTORY_FOR_TIME_FACTOR: usize = 10;

    /// Consecutive failures that saturate the behavioral factor
    pub const MAX_FAILED_ATTEMPTS: u32 = 5;

    /// Multiplicative decay applied to standing risk on each successful login
    pub const RISK_DECAY: f64 = 0.9;

    /// Distinct source IPs tracked by the scorer's reputation and velocity
    /// caches before LRU eviction
    pub const MAX_TRACKED_IPS: usize = 10_000;
}

/// Crate identity used in logging defaults
pub mod service {
    /// Service name for structured logging
    pub const NAME: &str = "authguard";

    /// Crate version from Cargo.toml
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}
