// ABOUTME: Configuration management module for the authorization security core
// ABOUTME: Handles environment-driven security settings and runtime validation
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration module
//!
//! Centralized configuration for the crate:
//!
//! - **Environment**: security configuration from environment variables
//!   (state-token signing secret, TTL overrides)
//!
//! Protocol constants that deployments rarely touch live in
//! [`crate::constants`]; everything tunable comes through here.

/// Environment and security configuration
pub mod environment;

pub use environment::SecurityConfig;
