// ABOUTME: Main library entry point for the authguard authorization security core
// ABOUTME: Provides CSRF state tokens, PKCE, DPoP proof validation, and risk scoring
//
// SPDX-License-Identifier: MIT OR Apache-2.0

#![deny(unsafe_code)]

//! # authguard
//!
//! Security primitives for an OAuth 2.1 authorization server: the pieces that
//! sit between the HTTP route layer and token issuance and decide whether a
//! request is what it claims to be.
//!
//! ## Components
//!
//! - **[`state`]**: HMAC-signed, single-use CSRF state tokens with
//!   redirect-URI allow-listing and OAuth 2.1 authorization-request policy
//! - **[`pkce`]**: RFC 7636 code verifier generation, challenge derivation,
//!   and consume-then-verify validation at the token endpoint
//! - **[`dpop`]**: RFC 9449-style proof validation and sender-constrained
//!   token binding via RFC 7638 key thumbprints
//! - **[`anomaly`]**: multi-factor authentication risk scoring with
//!   allow/challenge/deny verdicts
//! - **[`store`]**: the replay-store seam every single-use record lives
//!   behind, with an in-memory TTL cache implementation
//!
//! Validation of attacker-controlled input always comes back as a value
//! (`bool`, `Option`, or a result object); errors are reserved for
//! configuration and programming defects.
//!
//! ## Example
//!
//! ```rust,no_run
//! use authguard::errors::AppResult;
//! use authguard::pkce::{CodeChallengeMethod, PkceVerifier};
//! use authguard::store::{StoreConfig, TtlCache};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> AppResult<()> {
//!     let store = Arc::new(TtlCache::new(&StoreConfig::default()));
//!
//!     let pkce = PkceVerifier::new(store);
//!     let verifier = PkceVerifier::generate_verifier()?;
//!     let challenge = PkceVerifier::derive_challenge(&verifier, CodeChallengeMethod::S256);
//!     pkce.store_challenge("auth-code", &challenge, CodeChallengeMethod::S256, "client")
//!         .await?;
//!
//!     assert!(pkce.validate("auth-code", &verifier, "client").await);
//!     Ok(())
//! }
//! ```

/// Authentication anomaly detection and risk scoring
pub mod anomaly;
/// Security configuration from environment variables
pub mod config;
/// Protocol constants, TTLs, and scoring defaults
pub mod constants;
/// DPoP proof validation and token binding
pub mod dpop;
/// Unified error types and OAuth error mapping
pub mod errors;
/// Structured logging setup
pub mod logging;
/// PKCE verifier and challenge handling
pub mod pkce;
/// CSRF state tokens and authorization-request policy
pub mod state;
/// Replay store trait and in-memory implementation
pub mod store;
