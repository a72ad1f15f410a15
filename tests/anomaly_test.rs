// ABOUTME: Integration tests for the authentication anomaly scorer
// ABOUTME: Covers verdict thresholds, failure streaks, travel checks, and profile learning
//
// SPDX-License-Identifier: MIT OR Apache-2.0

use anyhow::Result;
use authguard::anomaly::{
    AnomalyScorer, AuthEvent, AuthMethod, FactorWeights, GeoMetadata, RiskAction, ScorerConfig,
    StaticIpReputation,
};
use chrono::{TimeZone, Utc};
use std::sync::Arc;

fn clean_reputation() -> Arc<StaticIpReputation> {
    Arc::new(StaticIpReputation::new())
}

fn login_event(user_id: &str, ip: &str, success: bool) -> AuthEvent {
    AuthEvent {
        user_id: Some(user_id.to_owned()),
        client_id: "client-a".into(),
        ip: ip.to_owned(),
        user_agent: Some("test-agent".into()),
        fingerprint: Some("device-1".into()),
        timestamp: Utc::now(),
        method: AuthMethod::Login,
        success,
        geo: None,
    }
}

fn geo(country: &str, city: &str, lat: f64, lon: f64) -> GeoMetadata {
    GeoMetadata {
        country: Some(country.to_owned()),
        city: Some(city.to_owned()),
        latitude: Some(lat),
        longitude: Some(lon),
    }
}

#[tokio::test]
async fn test_clean_new_user_is_allowed() -> Result<()> {
    let scorer = AnomalyScorer::new(clean_reputation());
    let assessment = scorer.score(&login_event("user-1", "203.0.113.1", true)).await;

    assert_eq!(assessment.action, RiskAction::Allow);
    assert!(assessment.composite < 0.5);
    Ok(())
}

#[tokio::test]
async fn test_failure_streak_escalates() -> Result<()> {
    let scorer = AnomalyScorer::new(clean_reputation());

    let mut last = None;
    for _ in 0..5 {
        last = Some(scorer.score(&login_event("user-2", "203.0.113.2", false)).await);
    }
    let assessment = last.unwrap();

    assert_ne!(
        assessment.action,
        RiskAction::Allow,
        "five consecutive failures must at least challenge (composite {})",
        assessment.composite
    );
    assert!(assessment
        .reasons
        .iter()
        .any(|r| r.contains("failed attempts")));
    Ok(())
}

#[tokio::test]
async fn test_success_clears_failure_streak() -> Result<()> {
    let scorer = AnomalyScorer::new(clean_reputation());

    for _ in 0..3 {
        scorer.score(&login_event("user-3", "203.0.113.3", false)).await;
    }
    scorer.score(&login_event("user-3", "203.0.113.3", true)).await;

    let profile = scorer.profile("user-3").await.expect("profile exists");
    assert_eq!(profile.failed_attempts, 0);
    Ok(())
}

#[tokio::test]
async fn test_impossible_travel_detected() -> Result<()> {
    let scorer = AnomalyScorer::new(clean_reputation());

    let mut first = login_event("user-4", "203.0.113.4", true);
    first.geo = Some(geo("FR", "Paris", 48.8566, 2.3522));
    scorer.score(&first).await;

    // Same user from Sydney one event later; the implied speed is absurd
    let mut second = login_event("user-4", "198.51.100.9", true);
    second.geo = Some(geo("AU", "Sydney", -33.8688, 151.2093));
    let assessment = scorer.score(&second).await;

    assert!(assessment.factors.geo_novelty >= 0.9);
    assert!(assessment
        .reasons
        .iter()
        .any(|r| r.contains("travel speed")));
    Ok(())
}

#[tokio::test]
async fn test_known_location_scores_no_novelty() -> Result<()> {
    let scorer = AnomalyScorer::new(clean_reputation());

    let mut first = login_event("user-5", "203.0.113.5", true);
    first.geo = Some(geo("CA", "Toronto", 43.6532, -79.3832));
    scorer.score(&first).await;

    let mut second = login_event("user-5", "203.0.113.5", true);
    second.geo = Some(geo("CA", "Toronto", 43.6532, -79.3832));
    let assessment = scorer.score(&second).await;

    assert!(assessment.factors.geo_novelty < f64::EPSILON);
    assert!(assessment.factors.device_novelty < f64::EPSILON);
    Ok(())
}

#[tokio::test]
async fn test_bad_ip_reputation_can_deny() -> Result<()> {
    let mut reputation = StaticIpReputation::new();
    reputation.insert("203.0.113.66", 1.0);

    // Weight the reputation signal heavily so it alone crosses the deny bar
    let config = ScorerConfig {
        weights: FactorWeights {
            ip_reputation: 10.0,
            ..FactorWeights::default()
        },
        ..ScorerConfig::default()
    };
    let scorer = AnomalyScorer::with_config(Arc::new(reputation), config);

    let event = AuthEvent {
        user_id: None,
        client_id: "client-a".into(),
        ip: "203.0.113.66".into(),
        user_agent: None,
        fingerprint: None,
        timestamp: Utc::now(),
        method: AuthMethod::Login,
        success: false,
        geo: None,
    };
    let assessment = scorer.score(&event).await;
    assert_eq!(assessment.action, RiskAction::Deny);
    Ok(())
}

#[tokio::test]
async fn test_velocity_saturates_under_burst() -> Result<()> {
    let scorer = AnomalyScorer::new(clean_reputation());

    let mut last = None;
    for _ in 0..12 {
        let event = AuthEvent {
            user_id: None,
            client_id: "client-a".into(),
            ip: "198.51.100.50".into(),
            user_agent: None,
            fingerprint: None,
            timestamp: Utc::now(),
            method: AuthMethod::Login,
            success: true,
            geo: None,
        };
        last = Some(scorer.score(&event).await);
    }

    let assessment = last.unwrap();
    assert!((assessment.factors.velocity - 1.0).abs() < f64::EPSILON);
    Ok(())
}

#[tokio::test]
async fn test_anonymous_events_skip_user_factors() -> Result<()> {
    let scorer = AnomalyScorer::new(clean_reputation());

    let event = AuthEvent {
        user_id: None,
        client_id: "client-a".into(),
        ip: "203.0.113.7".into(),
        user_agent: None,
        fingerprint: Some("never-seen-device".into()),
        timestamp: Utc::now(),
        method: AuthMethod::Login,
        success: true,
        geo: Some(geo("JP", "Tokyo", 35.6762, 139.6503)),
    };
    let assessment = scorer.score(&event).await;

    // Without a user there is no profile to be novel against
    assert!(assessment.factors.geo_novelty < f64::EPSILON);
    assert!(assessment.factors.device_novelty < f64::EPSILON);
    assert!(assessment.factors.behavioral < f64::EPSILON);
    assert_eq!(assessment.action, RiskAction::Allow);
    Ok(())
}

#[tokio::test]
async fn test_successful_logins_decay_standing_risk() -> Result<()> {
    let scorer = AnomalyScorer::new(clean_reputation());

    for _ in 0..3 {
        scorer.score(&login_event("user-6", "203.0.113.8", false)).await;
    }
    let risk_after_failures = scorer.profile("user-6").await.unwrap().risk_score;
    assert!(risk_after_failures > 0.5);

    for _ in 0..5 {
        scorer.score(&login_event("user-6", "203.0.113.8", true)).await;
    }
    let risk_after_successes = scorer.profile("user-6").await.unwrap().risk_score;
    assert!(risk_after_successes < risk_after_failures);
    Ok(())
}

#[tokio::test]
async fn test_reset_profile_forgets_history() -> Result<()> {
    let scorer = AnomalyScorer::new(clean_reputation());

    scorer.score(&login_event("user-7", "203.0.113.9", true)).await;
    assert!(scorer.profile("user-7").await.is_some());

    scorer.reset_profile("user-7").await;
    assert!(scorer.profile("user-7").await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_time_of_day_factor_needs_history_then_flags_odd_hours() -> Result<()> {
    let scorer = AnomalyScorer::new(clean_reputation());

    // Twelve successful logins at 09:00 on separate days build the habit
    for day in 1..=12 {
        let mut event = login_event("user-9", "203.0.113.20", true);
        event.timestamp = Utc.with_ymd_and_hms(2026, 1, day, 9, 0, 0).unwrap();
        scorer.score(&event).await;
    }

    // Another 09:00 login sits on the habitual hour
    let mut usual = login_event("user-9", "203.0.113.20", true);
    usual.timestamp = Utc.with_ymd_and_hms(2026, 1, 13, 9, 0, 0).unwrap();
    let assessment = scorer.score(&usual).await;
    assert!(assessment.factors.time_novelty < f64::EPSILON);

    // A 21:00 login is antipodal to the learned mean
    let mut odd = login_event("user-9", "203.0.113.20", true);
    odd.timestamp = Utc.with_ymd_and_hms(2026, 1, 13, 21, 0, 0).unwrap();
    let assessment = scorer.score(&odd).await;
    assert!(assessment.factors.time_novelty > 0.9);
    assert!(assessment.reasons.iter().any(|r| r.contains("login hour")));
    Ok(())
}

#[tokio::test]
async fn test_time_factor_silent_without_enough_history() -> Result<()> {
    let scorer = AnomalyScorer::new(clean_reputation());

    // Three logins at 09:00 are not enough history for the time factor
    for day in 1..=3 {
        let mut event = login_event("user-10", "203.0.113.21", true);
        event.timestamp = Utc.with_ymd_and_hms(2026, 2, day, 9, 0, 0).unwrap();
        scorer.score(&event).await;
    }

    let mut odd = login_event("user-10", "203.0.113.21", true);
    odd.timestamp = Utc.with_ymd_and_hms(2026, 2, 4, 21, 0, 0).unwrap();
    let assessment = scorer.score(&odd).await;
    assert!(assessment.factors.time_novelty < f64::EPSILON);
    Ok(())
}

fn anonymous_event(ip: &str) -> AuthEvent {
    AuthEvent {
        user_id: None,
        client_id: "client-a".into(),
        ip: ip.to_owned(),
        user_agent: None,
        fingerprint: None,
        timestamp: Utc::now(),
        method: AuthMethod::Login,
        success: true,
        geo: None,
    }
}

#[tokio::test]
async fn test_ip_tracking_is_lru_bounded() -> Result<()> {
    let config = ScorerConfig {
        max_tracked_ips: 2,
        ..ScorerConfig::default()
    };
    let scorer = AnomalyScorer::with_config(clean_reputation(), config);

    for _ in 0..5 {
        scorer.score(&anonymous_event("203.0.113.30")).await;
    }

    // Two fresh IPs evict the burst IP's velocity history under the bound
    scorer.score(&anonymous_event("203.0.113.31")).await;
    scorer.score(&anonymous_event("203.0.113.32")).await;

    let assessment = scorer.score(&anonymous_event("203.0.113.30")).await;
    assert!(
        assessment.factors.velocity < 0.2,
        "burst history must have been evicted, got velocity {}",
        assessment.factors.velocity
    );
    Ok(())
}

#[tokio::test]
async fn test_profile_learns_from_success() -> Result<()> {
    let scorer = AnomalyScorer::new(clean_reputation());

    let mut event = login_event("user-8", "203.0.113.10", true);
    event.geo = Some(geo("DE", "Berlin", 52.52, 13.405));
    scorer.score(&event).await;

    let profile = scorer.profile("user-8").await.unwrap();
    assert!(profile.known_ips.contains("203.0.113.10"));
    assert!(profile.known_devices.contains("device-1"));
    assert!(profile.known_locations.contains("DE/Berlin"));
    assert_eq!(profile.login_hours.len(), 1);
    assert!(profile.last_location.is_some());
    Ok(())
}
