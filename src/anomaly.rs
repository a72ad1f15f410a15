// ABOUTME: Authentication anomaly detection with multi-factor risk scoring
// ABOUTME: Produces allow/challenge/deny verdicts and maintains per-user behavior profiles
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Authentication risk scoring
//!
//! [`AnomalyScorer`] evaluates each authentication event against six
//! independent signals (IP reputation, geographic novelty with
//! impossible-travel detection, device novelty, time-of-day novelty,
//! per-IP request velocity, consecutive failures) and combines them into a
//! weight-normalized composite with an [`RiskAction`] verdict. Scoring
//! never fails: missing signals contribute zero and drop out of the
//! normalization.
//!
//! Profiles are exclusively owned by the scorer. Hosts feed events in
//! through [`AnomalyScorer::score`] and clear a user's history with
//! [`AnomalyScorer::reset_profile`] after a credential reset.

use crate::constants::{risk, ttl};
use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Authentication method an event represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// Interactive login
    Login,
    /// Refresh-token exchange
    Refresh,
    /// Session termination
    Logout,
    /// Account registration
    Register,
}

/// Geographic metadata attached to an event, all fields best-effort
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeoMetadata {
    /// ISO country code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    /// City name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    /// Latitude in degrees
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    /// Longitude in degrees
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
}

/// One authentication event, as observed by the host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthEvent {
    /// Authenticated user, absent for pre-authentication events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Client the event belongs to
    pub client_id: String,
    /// Source IP address
    pub ip: String,
    /// User agent string
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Device fingerprint, when the host computes one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Event time
    pub timestamp: DateTime<Utc>,
    /// What kind of authentication this was
    pub method: AuthMethod,
    /// Whether the attempt succeeded
    pub success: bool,
    /// Geo lookup result for the source IP
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo: Option<GeoMetadata>,
}

/// Last observed location with coordinates, for travel-speed checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastLocation {
    /// Latitude in degrees
    pub latitude: f64,
    /// Longitude in degrees
    pub longitude: f64,
    /// When the user was seen there
    pub seen_at: DateTime<Utc>,
}

/// Learned behavior profile for one user
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserAuthProfile {
    /// User the profile belongs to
    pub user_id: String,
    /// IPs seen on successful authentications
    pub known_ips: HashSet<String>,
    /// Device fingerprints seen on successful authentications
    pub known_devices: HashSet<String>,
    /// Location keys (country/city) seen on successful authentications
    pub known_locations: HashSet<String>,
    /// Hours-of-day of recent successful logins, bounded
    pub login_hours: VecDeque<u32>,
    /// Last location with coordinates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_location: Option<LastLocation>,
    /// Consecutive failed attempts since the last success
    pub failed_attempts: u32,
    /// Standing risk score, decayed on success and raised on failure
    pub risk_score: f64,
}

/// Individual factor scores, each in [0, 1]
#[derive(Debug, Clone, Default, Serialize)]
pub struct RiskFactors {
    /// External reputation of the source IP
    pub ip_reputation: f64,
    /// Unfamiliar or implausible location
    pub geo_novelty: f64,
    /// Unfamiliar or missing device fingerprint
    pub device_novelty: f64,
    /// Login hour far from the user's habitual hours
    pub time_novelty: f64,
    /// Request rate from the source IP
    pub velocity: f64,
    /// Consecutive authentication failures
    pub behavioral: f64,
}

/// Verdict for an authentication event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskAction {
    /// Proceed normally
    Allow,
    /// Require step-up verification
    Challenge,
    /// Refuse the attempt
    Deny,
}

/// Full scoring result for one event
#[derive(Debug, Clone, Serialize)]
pub struct RiskAssessment {
    /// Weight-normalized composite over the applicable factors
    pub composite: f64,
    /// Individual factor scores
    pub factors: RiskFactors,
    /// Verdict
    pub action: RiskAction,
    /// Human-readable explanations for elevated factors
    pub reasons: Vec<String>,
}

/// Relative weight of each factor in the composite
#[derive(Debug, Clone)]
pub struct FactorWeights {
    /// IP reputation weight
    pub ip_reputation: f64,
    /// Geographic novelty weight
    pub geo_novelty: f64,
    /// Device novelty weight
    pub device_novelty: f64,
    /// Time-of-day novelty weight
    pub time_novelty: f64,
    /// Velocity weight
    pub velocity: f64,
    /// Behavioral weight; failures are the strongest single signal
    pub behavioral: f64,
}

impl Default for FactorWeights {
    fn default() -> Self {
        Self {
            ip_reputation: 1.0,
            geo_novelty: 1.0,
            device_novelty: 1.0,
            time_novelty: 1.0,
            velocity: 1.0,
            behavioral: 2.0,
        }
    }
}

/// Scorer configuration with tuned defaults
#[derive(Debug, Clone)]
pub struct ScorerConfig {
    /// Factor weights
    pub weights: FactorWeights,
    /// Composite at or above which the verdict is Deny
    pub deny_threshold: f64,
    /// Composite at or above which the verdict is Challenge
    pub challenge_threshold: f64,
    /// Standing profile risk considered elevated
    pub elevated_profile_risk: f64,
    /// Composite considered moderate when profile risk is elevated
    pub moderate_score: f64,
    /// Rolling window for per-IP velocity
    pub velocity_window: Duration,
    /// Requests inside the window that saturate the velocity factor
    pub velocity_max_requests: usize,
    /// Implied travel speed beyond which a move is implausible (km/h)
    pub impossible_travel_kmh: f64,
    /// Deviation from the mean login hour before the time factor engages
    pub time_deviation_hours: f64,
    /// Login-hour history required before the time factor applies
    pub min_history_for_time_factor: usize,
    /// Failures that saturate the behavioral factor
    pub max_failed_attempts: u32,
    /// Multiplicative decay applied to standing risk on success
    pub risk_decay: f64,
    /// Distinct source IPs tracked before LRU eviction; source IPs are
    /// attacker-controlled, so these caches must stay bounded
    pub max_tracked_ips: usize,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            weights: FactorWeights::default(),
            deny_threshold: risk::DENY_THRESHOLD,
            challenge_threshold: risk::CHALLENGE_THRESHOLD,
            elevated_profile_risk: risk::ELEVATED_PROFILE_RISK,
            moderate_score: risk::MODERATE_SCORE,
            velocity_window: Duration::from_secs(risk::VELOCITY_WINDOW_SECS.unsigned_abs()),
            velocity_max_requests: risk::VELOCITY_MAX_REQUESTS,
            impossible_travel_kmh: risk::IMPOSSIBLE_TRAVEL_KMH,
            time_deviation_hours: risk::TIME_DEVIATION_HOURS,
            min_history_for_time_factor: risk::MIN_HISTORY_FOR_TIME_FACTOR,
            max_failed_attempts: risk::MAX_FAILED_ATTEMPTS,
            risk_decay: risk::RISK_DECAY,
            max_tracked_ips: risk::MAX_TRACKED_IPS,
        }
    }
}

/// Source of external IP reputation, in [0, 1] where 1 is known-bad
///
/// The single I/O-bound suspend point in scoring. Results are cached per IP
/// for an hour inside the scorer.
#[async_trait]
pub trait IpReputationProvider: Send + Sync {
    /// Reputation score for an IP; 0.0 means no adverse information
    async fn reputation(&self, ip: &str) -> f64;
}

/// Fixed reputation table with a neutral default
#[derive(Debug, Default)]
pub struct StaticIpReputation {
    scores: HashMap<String, f64>,
}

impl StaticIpReputation {
    /// Empty table; every IP scores 0.0
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an IP with a reputation score
    pub fn insert(&mut self, ip: impl Into<String>, score: f64) {
        self.scores.insert(ip.into(), score.clamp(0.0, 1.0));
    }
}

#[async_trait]
impl IpReputationProvider for StaticIpReputation {
    async fn reputation(&self, ip: &str) -> f64 {
        self.scores.get(ip).copied().unwrap_or(0.0)
    }
}

/// Multi-factor authentication risk scorer
///
/// The reputation and velocity caches are keyed by source IP, which the
/// attacker chooses, so both are LRU-bounded rather than open hash maps.
pub struct AnomalyScorer {
    config: ScorerConfig,
    reputation: Arc<dyn IpReputationProvider>,
    profiles: RwLock<HashMap<String, UserAuthProfile>>,
    reputation_cache: RwLock<LruCache<String, (f64, Instant)>>,
    recent_requests: RwLock<LruCache<String, VecDeque<DateTime<Utc>>>>,
}

impl AnomalyScorer {
    /// Fallback IP-cache capacity when config specifies zero
    const DEFAULT_IP_CAPACITY: NonZeroUsize = match NonZeroUsize::new(10_000) {
        Some(n) => n,
        None => unreachable!(),
    };

    /// Create a scorer with default configuration
    #[must_use]
    pub fn new(reputation: Arc<dyn IpReputationProvider>) -> Self {
        Self::with_config(reputation, ScorerConfig::default())
    }

    /// Create a scorer with explicit configuration
    #[must_use]
    pub fn with_config(reputation: Arc<dyn IpReputationProvider>, config: ScorerConfig) -> Self {
        let ip_capacity =
            NonZeroUsize::new(config.max_tracked_ips).unwrap_or(Self::DEFAULT_IP_CAPACITY);
        Self {
            config,
            reputation,
            profiles: RwLock::new(HashMap::new()),
            reputation_cache: RwLock::new(LruCache::new(ip_capacity)),
            recent_requests: RwLock::new(LruCache::new(ip_capacity)),
        }
    }

    /// Score an authentication event and update the user's profile
    ///
    /// User-scoped factors (geo, device, time, behavioral) only apply when
    /// the event carries a `user_id`; their weights drop out of the
    /// normalization otherwise. Scoring itself never fails.
    pub async fn score(&self, event: &AuthEvent) -> RiskAssessment {
        let mut factors = RiskFactors::default();
        let mut reasons = Vec::new();

        factors.ip_reputation = self.ip_reputation_factor(&event.ip).await;
        if factors.ip_reputation > 0.5 {
            reasons.push(format!("source IP {} has adverse reputation", event.ip));
        }

        factors.velocity = self.velocity_factor(event).await;
        if factors.velocity >= 1.0 {
            reasons.push(format!(
                "request velocity from {} saturated the rolling window",
                event.ip
            ));
        }

        let weights = &self.config.weights;
        let mut weighted_sum =
            factors.ip_reputation * weights.ip_reputation + factors.velocity * weights.velocity;
        let mut weight_total = weights.ip_reputation + weights.velocity;

        let mut profile_risk = 0.0;
        if let Some(user_id) = &event.user_id {
            let profiles = self.profiles.read().await;
            let profile = profiles.get(user_id);

            factors.geo_novelty = self.geo_factor(event, profile, &mut reasons);
            factors.device_novelty = Self::device_factor(event, profile, &mut reasons);
            factors.time_novelty = self.time_factor(event, profile, &mut reasons);
            factors.behavioral = self.behavioral_factor(event, profile, &mut reasons);
            profile_risk = profile.map_or(0.0, |p| p.risk_score);
            drop(profiles);

            weighted_sum += factors.geo_novelty * weights.geo_novelty
                + factors.device_novelty * weights.device_novelty
                + factors.behavioral * weights.behavioral;
            weight_total += weights.geo_novelty + weights.device_novelty + weights.behavioral;

            // The time factor only applies once the user has enough history
            if self.time_factor_applies(user_id, event).await {
                weighted_sum += factors.time_novelty * weights.time_novelty;
                weight_total += weights.time_novelty;
            }
        }

        let composite = if weight_total > 0.0 {
            (weighted_sum / weight_total).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let action = if composite >= self.config.deny_threshold {
            reasons.push(format!(
                "composite risk {composite:.2} above deny threshold"
            ));
            RiskAction::Deny
        } else if composite >= self.config.challenge_threshold
            || (profile_risk >= self.config.elevated_profile_risk
                && composite >= self.config.moderate_score)
        {
            RiskAction::Challenge
        } else {
            RiskAction::Allow
        };

        if action != RiskAction::Allow {
            warn!(
                user_id = ?event.user_id,
                client_id = %event.client_id,
                composite = composite,
                action = ?action,
                "elevated authentication risk"
            );
        } else {
            debug!(client_id = %event.client_id, composite = composite, "authentication scored");
        }

        self.update_profile(event, composite).await;

        RiskAssessment {
            composite,
            factors,
            action,
            reasons,
        }
    }

    /// Forget a user's learned profile (credential-reset hook)
    pub async fn reset_profile(&self, user_id: &str) {
        self.profiles.write().await.remove(user_id);
        debug!(user_id = %user_id, "auth profile reset");
    }

    /// Snapshot of a user's profile, for diagnostics and persistence
    pub async fn profile(&self, user_id: &str) -> Option<UserAuthProfile> {
        self.profiles.read().await.get(user_id).cloned()
    }

    async fn ip_reputation_factor(&self, ip: &str) -> f64 {
        let cache_ttl = Duration::from_secs(ttl::IP_REPUTATION_TTL_SECS);
        {
            let mut cache = self.reputation_cache.write().await;
            if let Some((score, fetched_at)) = cache.get(ip) {
                if fetched_at.elapsed() < cache_ttl {
                    return *score;
                }
                // Stale entry, refresh below
                cache.pop(ip);
            }
        }
        let score = self.reputation.reputation(ip).await.clamp(0.0, 1.0);
        self.reputation_cache
            .write()
            .await
            .push(ip.to_owned(), (score, Instant::now()));
        score
    }

    async fn velocity_factor(&self, event: &AuthEvent) -> f64 {
        let window = chrono::Duration::from_std(self.config.velocity_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let cutoff = event.timestamp - window;

        let mut requests = self.recent_requests.write().await;

        // Pop-then-push refreshes LRU order; the LRU bound evicts the
        // least-recently-seen IP under a spoofed-IP flood
        let mut timestamps = requests.pop(&event.ip).unwrap_or_default();
        while timestamps.front().is_some_and(|t| *t < cutoff) {
            timestamps.pop_front();
        }
        timestamps.push_back(event.timestamp);

        #[allow(clippy::cast_precision_loss)]
        let factor = timestamps.len() as f64 / self.config.velocity_max_requests as f64;
        requests.push(event.ip.clone(), timestamps);
        factor.min(1.0)
    }

    #[allow(clippy::cast_precision_loss)]
    fn geo_factor(
        &self,
        event: &AuthEvent,
        profile: Option<&UserAuthProfile>,
        reasons: &mut Vec<String>,
    ) -> f64 {
        let Some(geo) = &event.geo else {
            return 0.0;
        };

        // Impossible travel dominates plain novelty when coordinates exist
        // on both sides
        if let (Some(profile), Some(lat), Some(lon)) =
            (profile, geo.latitude, geo.longitude)
        {
            if let Some(last) = &profile.last_location {
                let km = haversine_km(last.latitude, last.longitude, lat, lon);
                let hours =
                    (event.timestamp - last.seen_at).num_seconds().max(1) as f64 / 3600.0;
                let speed = km / hours;
                if speed > self.config.impossible_travel_kmh {
                    reasons.push(format!(
                        "implied travel speed {speed:.0} km/h exceeds plausible maximum"
                    ));
                    return 0.95;
                }
            }
        }

        let Some(key) = location_key(geo) else {
            return 0.0;
        };
        match profile {
            Some(profile) if profile.known_locations.contains(&key) => 0.0,
            _ => {
                reasons.push(format!("login from unfamiliar location {key}"));
                0.6
            }
        }
    }

    fn device_factor(
        event: &AuthEvent,
        profile: Option<&UserAuthProfile>,
        reasons: &mut Vec<String>,
    ) -> f64 {
        match &event.fingerprint {
            Some(fp) => match profile {
                Some(profile) if profile.known_devices.contains(fp) => 0.0,
                _ => {
                    reasons.push("login from unfamiliar device".to_owned());
                    0.7
                }
            },
            // No fingerprint at all is a weaker signal than a strange one
            None => 0.2,
        }
    }

    fn time_factor(
        &self,
        event: &AuthEvent,
        profile: Option<&UserAuthProfile>,
        reasons: &mut Vec<String>,
    ) -> f64 {
        let Some(profile) = profile else { return 0.0 };
        if profile.login_hours.len() < self.config.min_history_for_time_factor {
            return 0.0;
        }

        let mean = circular_mean_hour(&profile.login_hours);
        let deviation = circular_hour_distance(f64::from(event.timestamp.hour()), mean);
        if deviation <= self.config.time_deviation_hours {
            return 0.0;
        }
        reasons.push(format!(
            "login hour deviates {deviation:.1}h from habitual hours"
        ));
        // Scale beyond the tolerance; the 12h antipode scores 1.0
        ((deviation - self.config.time_deviation_hours)
            / (12.0 - self.config.time_deviation_hours))
            .clamp(0.0, 1.0)
    }

    fn behavioral_factor(
        &self,
        event: &AuthEvent,
        profile: Option<&UserAuthProfile>,
        reasons: &mut Vec<String>,
    ) -> f64 {
        let prior = profile.map_or(0, |p| p.failed_attempts);
        // The current event's own outcome counts: a failing streak is
        // scored at its full depth, not one behind
        let failures = prior + u32::from(!event.success);
        if failures == 0 {
            return 0.0;
        }
        if failures >= self.config.max_failed_attempts {
            reasons.push(format!("{failures} consecutive failed attempts"));
        }
        f64::from(failures.min(self.config.max_failed_attempts))
            / f64::from(self.config.max_failed_attempts)
    }

    async fn time_factor_applies(&self, user_id: &str, _event: &AuthEvent) -> bool {
        self.profiles
            .read()
            .await
            .get(user_id)
            .is_some_and(|p| p.login_hours.len() >= self.config.min_history_for_time_factor)
    }

    async fn update_profile(&self, event: &AuthEvent, composite: f64) {
        let Some(user_id) = &event.user_id else {
            return;
        };
        let mut profiles = self.profiles.write().await;
        let profile = profiles
            .entry(user_id.clone())
            .or_insert_with(|| UserAuthProfile {
                user_id: user_id.clone(),
                ..UserAuthProfile::default()
            });

        if event.success {
            profile.known_ips.insert(event.ip.clone());
            if let Some(fp) = &event.fingerprint {
                profile.known_devices.insert(fp.clone());
            }
            if let Some(geo) = &event.geo {
                if let Some(key) = location_key(geo) {
                    profile.known_locations.insert(key);
                }
                if let (Some(lat), Some(lon)) = (geo.latitude, geo.longitude) {
                    profile.last_location = Some(LastLocation {
                        latitude: lat,
                        longitude: lon,
                        seen_at: event.timestamp,
                    });
                }
            }
            if event.method == AuthMethod::Login {
                profile.login_hours.push_back(event.timestamp.hour());
                while profile.login_hours.len() > crate::constants::limits::LOGIN_HOUR_HISTORY {
                    profile.login_hours.pop_front();
                }
            }
            profile.failed_attempts = 0;
            profile.risk_score *= self.config.risk_decay;
        } else {
            profile.failed_attempts = profile.failed_attempts.saturating_add(1);
            // Raise standing risk: a fixed step per failure, floored at the
            // composite this event scored
            profile.risk_score = composite.max((profile.risk_score + 0.25).min(1.0));
        }
    }
}

fn location_key(geo: &GeoMetadata) -> Option<String> {
    match (&geo.country, &geo.city) {
        (Some(country), Some(city)) => Some(format!("{country}/{city}")),
        (Some(country), None) => Some(country.clone()),
        _ => None,
    }
}

/// Great-circle distance between two coordinates in kilometers
fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;

    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Circular mean of hours-of-day, handling the midnight wraparound
fn circular_mean_hour(hours: &VecDeque<u32>) -> f64 {
    let (sin_sum, cos_sum) = hours.iter().fold((0.0_f64, 0.0_f64), |(s, c), &h| {
        let angle = f64::from(h) / 24.0 * std::f64::consts::TAU;
        (s + angle.sin(), c + angle.cos())
    });
    let mean_angle = sin_sum.atan2(cos_sum);
    let mut hour = mean_angle / std::f64::consts::TAU * 24.0;
    if hour < 0.0 {
        hour += 24.0;
    }
    hour
}

/// Shortest distance between two hours on the 24-hour circle
fn circular_hour_distance(a: f64, b: f64) -> f64 {
    let diff = (a - b).abs() % 24.0;
    diff.min(24.0 - diff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_known_distance() {
        // Paris to London is roughly 344 km
        let km = haversine_km(48.8566, 2.3522, 51.5074, -0.1278);
        assert!((km - 344.0).abs() < 10.0, "got {km}");
    }

    #[test]
    fn test_circular_mean_wraps_midnight() {
        let hours: VecDeque<u32> = [23, 0, 1].into_iter().collect();
        let mean = circular_mean_hour(&hours);
        assert!(mean > 23.0 || mean < 1.0, "got {mean}");
    }

    #[test]
    fn test_circular_distance() {
        assert!((circular_hour_distance(23.0, 1.0) - 2.0).abs() < f64::EPSILON);
        assert!((circular_hour_distance(6.0, 18.0) - 12.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_location_key_degrades() {
        let geo = GeoMetadata {
            country: Some("CA".into()),
            city: None,
            latitude: None,
            longitude: None,
        };
        assert_eq!(location_key(&geo).as_deref(), Some("CA"));
        assert!(location_key(&GeoMetadata::default()).is_none());
    }
}
