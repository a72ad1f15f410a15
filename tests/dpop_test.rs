// ABOUTME: Integration tests for DPoP proof validation and token binding
// ABOUTME: Covers replay detection, htm/htu binding, ath hashes, and server nonces
//
// SPDX-License-Identifier: MIT OR Apache-2.0

use anyhow::Result;
use authguard::dpop::{
    DpopBinder, DpopKeyPair, DpopProofClaims, ProofOptions, ValidationOptions,
};
use authguard::store::TtlCache;
use std::sync::Arc;

const TOKEN_URI: &str = "https://auth.example.com/token";

fn test_binder() -> DpopBinder {
    DpopBinder::new(Arc::new(TtlCache::for_testing()))
}

fn test_key() -> Result<DpopKeyPair> {
    DpopKeyPair::generate_with_key_size("test-key", 2048)
}

#[tokio::test]
async fn test_proof_round_trip_yields_jkt() -> Result<()> {
    let binder = test_binder();
    let key = test_key()?;

    let proof = DpopBinder::create_proof(&key, "POST", TOKEN_URI, &ProofOptions::default())?;
    let result = binder
        .validate_proof(&proof, "POST", TOKEN_URI, &ValidationOptions::default())
        .await;

    assert!(result.valid, "unexpected failure: {:?}", result.error);
    let jkt = result.jkt.expect("valid proof must yield a thumbprint");
    assert!(!jkt.is_empty());

    // The thumbprint is stable for the same key
    let jwk = key.to_jwk()?;
    assert_eq!(jkt, authguard::dpop::jwk_thumbprint(&jwk)?);
    Ok(())
}

#[tokio::test]
async fn test_identical_proof_replay_rejected() -> Result<()> {
    let binder = test_binder();
    let key = test_key()?;

    let proof = DpopBinder::create_proof(&key, "POST", TOKEN_URI, &ProofOptions::default())?;
    assert!(
        binder
            .validate_proof(&proof, "POST", TOKEN_URI, &ValidationOptions::default())
            .await
            .valid
    );

    let replay = binder
        .validate_proof(&proof, "POST", TOKEN_URI, &ValidationOptions::default())
        .await;
    assert!(!replay.valid);
    assert!(replay.error.unwrap().contains("replay"));
    Ok(())
}

#[tokio::test]
async fn test_method_and_host_binding() -> Result<()> {
    let binder = test_binder();
    let key = test_key()?;

    let proof = DpopBinder::create_proof(&key, "POST", TOKEN_URI, &ProofOptions::default())?;
    let wrong_method = binder
        .validate_proof(&proof, "GET", TOKEN_URI, &ValidationOptions::default())
        .await;
    assert!(!wrong_method.valid);

    let proof = DpopBinder::create_proof(&key, "POST", TOKEN_URI, &ProofOptions::default())?;
    let wrong_host = binder
        .validate_proof(
            &proof,
            "POST",
            "https://other.example.com/token",
            &ValidationOptions::default(),
        )
        .await;
    assert!(!wrong_host.valid);
    Ok(())
}

#[tokio::test]
async fn test_uri_normalization_tolerates_formatting() -> Result<()> {
    let binder = test_binder();
    let key = test_key()?;

    // Upper-cased host and a fragment on one side; query preserved on both
    let proof = DpopBinder::create_proof(
        &key,
        "get",
        "HTTPS://Auth.Example.COM/token?grant=code#section",
        &ProofOptions::default(),
    )?;
    let result = binder
        .validate_proof(
            &proof,
            "GET",
            "https://auth.example.com/token?grant=code",
            &ValidationOptions::default(),
        )
        .await;
    assert!(result.valid, "unexpected failure: {:?}", result.error);
    Ok(())
}

#[tokio::test]
async fn test_access_token_hash_binding() -> Result<()> {
    let binder = test_binder();
    let key = test_key()?;
    let token = "opaque-access-token";

    // Proof without ath fails when a token is presented
    let bare = DpopBinder::create_proof(&key, "GET", TOKEN_URI, &ProofOptions::default())?;
    let options = ValidationOptions {
        access_token: Some(token.to_owned()),
        ..ValidationOptions::default()
    };
    assert!(!binder.validate_proof(&bare, "GET", TOKEN_URI, &options).await.valid);

    // Proof bound to the right token passes
    let bound = DpopBinder::create_proof(
        &key,
        "GET",
        TOKEN_URI,
        &ProofOptions {
            access_token: Some(token.to_owned()),
            nonce: None,
        },
    )?;
    assert!(binder.validate_proof(&bound, "GET", TOKEN_URI, &options).await.valid);

    // Proof bound to a different token fails
    let mismatched = DpopBinder::create_proof(
        &key,
        "GET",
        TOKEN_URI,
        &ProofOptions {
            access_token: Some("some-other-token".to_owned()),
            nonce: None,
        },
    )?;
    assert!(
        !binder
            .validate_proof(&mismatched, "GET", TOKEN_URI, &options)
            .await
            .valid
    );
    Ok(())
}

#[tokio::test]
async fn test_server_nonce_is_single_use() -> Result<()> {
    let binder = test_binder();
    let key = test_key()?;
    let nonce = binder.issue_nonce().await?;

    let options = ValidationOptions {
        expected_nonce: Some(nonce.clone()),
        require_nonce: true,
        ..ValidationOptions::default()
    };

    let proof = DpopBinder::create_proof(
        &key,
        "POST",
        TOKEN_URI,
        &ProofOptions {
            access_token: None,
            nonce: Some(nonce.clone()),
        },
    )?;
    assert!(binder.validate_proof(&proof, "POST", TOKEN_URI, &options).await.valid);

    // A second proof echoing the consumed nonce fails
    let second = DpopBinder::create_proof(
        &key,
        "POST",
        TOKEN_URI,
        &ProofOptions {
            access_token: None,
            nonce: Some(nonce),
        },
    )?;
    let result = binder.validate_proof(&second, "POST", TOKEN_URI, &options).await;
    assert!(!result.valid);
    assert!(result.error.unwrap().contains("nonce"));
    Ok(())
}

#[tokio::test]
async fn test_unsolicited_nonce_is_ignored() -> Result<()> {
    let binder = test_binder();
    let key = test_key()?;

    // The proof volunteers a nonce nothing asked for; validation with no
    // nonce expectations must not check it against the nonce cache
    let proof = DpopBinder::create_proof(
        &key,
        "POST",
        TOKEN_URI,
        &ProofOptions {
            access_token: None,
            nonce: Some("client-invented-nonce".into()),
        },
    )?;
    let result = binder
        .validate_proof(&proof, "POST", TOKEN_URI, &ValidationOptions::default())
        .await;
    assert!(result.valid, "unexpected failure: {:?}", result.error);
    Ok(())
}

#[tokio::test]
async fn test_nonce_required_but_missing() -> Result<()> {
    let binder = test_binder();
    let key = test_key()?;

    let proof = DpopBinder::create_proof(&key, "POST", TOKEN_URI, &ProofOptions::default())?;
    let result = binder
        .validate_proof(
            &proof,
            "POST",
            TOKEN_URI,
            &ValidationOptions {
                require_nonce: true,
                ..ValidationOptions::default()
            },
        )
        .await;
    assert!(!result.valid);
    assert!(result.error.unwrap().contains("nonce"));
    Ok(())
}

#[tokio::test]
async fn test_stale_proof_rejected() -> Result<()> {
    let binder = test_binder();
    let key = test_key()?;

    // Hand-roll a proof with an iat well outside the skew window
    let claims = DpopProofClaims {
        jti: uuid::Uuid::new_v4().to_string(),
        htm: "POST".into(),
        htu: TOKEN_URI.into(),
        iat: chrono::Utc::now().timestamp() - 3600,
        ath: None,
        nonce: None,
    };
    let mut header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256);
    header.typ = Some("dpop+jwt".into());
    header.jwk = Some(key.to_jwk()?);
    let stale = jsonwebtoken::encode(&header, &claims, &key.encoding_key())?;

    let result = binder
        .validate_proof(&stale, "POST", TOKEN_URI, &ValidationOptions::default())
        .await;
    assert!(!result.valid);
    assert!(result.error.unwrap().contains("skew"));
    Ok(())
}

#[tokio::test]
async fn test_wrong_typ_header_rejected() -> Result<()> {
    let binder = test_binder();
    let key = test_key()?;

    let claims = DpopProofClaims {
        jti: uuid::Uuid::new_v4().to_string(),
        htm: "POST".into(),
        htu: TOKEN_URI.into(),
        iat: chrono::Utc::now().timestamp(),
        ath: None,
        nonce: None,
    };
    let mut header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256);
    header.typ = Some("JWT".into());
    header.jwk = Some(key.to_jwk()?);
    let proof = jsonwebtoken::encode(&header, &claims, &key.encoding_key())?;

    let result = binder
        .validate_proof(&proof, "POST", TOKEN_URI, &ValidationOptions::default())
        .await;
    assert!(!result.valid);
    Ok(())
}

#[tokio::test]
async fn test_proof_signed_by_different_key_rejected() -> Result<()> {
    let binder = test_binder();
    let key = test_key()?;
    let other = DpopKeyPair::generate_with_key_size("other-key", 2048)?;

    // Header advertises one key, signature comes from another
    let claims = DpopProofClaims {
        jti: uuid::Uuid::new_v4().to_string(),
        htm: "POST".into(),
        htu: TOKEN_URI.into(),
        iat: chrono::Utc::now().timestamp(),
        ath: None,
        nonce: None,
    };
    let mut header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256);
    header.typ = Some("dpop+jwt".into());
    header.jwk = Some(key.to_jwk()?);
    let forged = jsonwebtoken::encode(&header, &claims, &other.encoding_key())?;

    let result = binder
        .validate_proof(&forged, "POST", TOKEN_URI, &ValidationOptions::default())
        .await;
    assert!(!result.valid);
    Ok(())
}

#[tokio::test]
async fn test_token_binding_round_trip() -> Result<()> {
    let binder = test_binder();
    let key = test_key()?;

    let proof = DpopBinder::create_proof(&key, "POST", TOKEN_URI, &ProofOptions::default())?;
    let result = binder
        .validate_proof(&proof, "POST", TOKEN_URI, &ValidationOptions::default())
        .await;
    let jkt = result.jkt.expect("proof must validate");

    let claims = serde_json::json!({ "sub": "user-1", "scope": "openid" });
    let bound = DpopBinder::create_bound_token(claims, &jkt);
    assert_eq!(bound["token_type"], "DPoP");
    assert!(DpopBinder::validate_token_binding(&bound, &jkt));

    // A proof from a different key does not unlock the token
    let other = DpopKeyPair::generate_with_key_size("intruder", 2048)?;
    let other_jkt = authguard::dpop::jwk_thumbprint(&other.to_jwk()?)?;
    assert!(!DpopBinder::validate_token_binding(&bound, &other_jkt));
    Ok(())
}
