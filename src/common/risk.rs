/// Adaptive risk scoring for authentication attempts.
///
/// Signals are weighted and summed into a 0-100 score; the recommendation
/// thresholds split ALLOW / CHALLENGE / DENY. An active blocklist entry
/// denies outright before any scoring. The verdict is advisory: the
/// pipeline decides what to do with it and audits every DENY.
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::RiskConfig;
use crate::db::Database;
use crate::error::Result;
use crate::geo::{GeoResolver, haversine_km};
use crate::metrics::Metrics;
use crate::models::{GeoLocation, IpMetadata, User};

const WEIGHT_IMPOSSIBLE_TRAVEL: u32 = 40;
const WEIGHT_COUNTRY_CHANGE: u32 = 20;
const WEIGHT_ASN_CHANGE: u32 = 10;
const WEIGHT_NEW_DEVICE: u32 = 15;
const WEIGHT_SUSPICIOUS_IP: u32 = 20;
const WEIGHT_RECENT_FAILURES: u32 = 15;

const RECENT_FAILURES_THRESHOLD: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recommendation {
    Allow,
    Challenge,
    Deny,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "ALLOW",
            Self::Challenge => "CHALLENGE",
            Self::Deny => "DENY",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskVerdict {
    pub score: u32,
    pub signals: Vec<String>,
    pub recommendation: Recommendation,
}

/// Everything the scoring function needs, gathered up front so the scoring
/// itself is pure and unit-testable.
#[derive(Debug)]
pub struct RiskContext {
    pub ip_blocked: bool,
    pub current_location: GeoLocation,
    pub current_asn: Option<i64>,
    pub last_observation: Option<(GeoLocation, DateTime<Utc>)>,
    pub previous_asn: Option<i64>,
    pub recent_countries: Vec<String>,
    pub suspicious_count: i32,
    pub known_device: Option<bool>,
    pub recent_failed_logins: i64,
    pub now: DateTime<Utc>,
}

impl Default for RiskContext {
    fn default() -> Self {
        Self {
            ip_blocked: false,
            current_location: GeoLocation::unknown(),
            current_asn: None,
            last_observation: None,
            previous_asn: None,
            recent_countries: Vec::new(),
            suspicious_count: 0,
            known_device: None,
            recent_failed_logins: 0,
            now: Utc::now(),
        }
    }
}

pub struct RiskEngine {
    config: RiskConfig,
}

impl RiskEngine {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Gather signals for an attempt and score them. `user` is absent for
    /// pre-credential evaluation (registration throttling).
    pub async fn assess(
        &self,
        db: &Database,
        geo: &dyn GeoResolver,
        metrics: &Metrics,
        user: Option<&User>,
        ip: &str,
        device_fingerprint: Option<&str>,
    ) -> Result<(RiskVerdict, GeoLocation, Option<i64>)> {
        let now = Utc::now();

        let ip_blocked = match db.get_ip_block(ip).await? {
            Some(entry) => entry.blocks_at(now),
            None => false,
        };

        let current_location = geo.locate(ip);
        let current_asn = geo.asn(ip);

        let metadata: Option<IpMetadata> = db.get_ip_metadata(ip).await?;
        let last_observation = metadata.as_ref().and_then(|m| {
            m.history()
                .last()
                .map(|obs| (obs.location.clone(), obs.observed_at))
        });

        let mut context = RiskContext {
            ip_blocked,
            current_location: current_location.clone(),
            current_asn,
            last_observation,
            previous_asn: metadata.as_ref().and_then(|m| m.asn),
            suspicious_count: metadata.as_ref().map(|m| m.suspicious_count).unwrap_or(0),
            recent_countries: Vec::new(),
            known_device: None,
            recent_failed_logins: 0,
            now,
        };

        if let Some(user) = user {
            context.recent_countries = db
                .recent_login_countries(user.id, self.config.country_change_window as i64)
                .await?;
            context.recent_failed_logins = db
                .recent_failed_logins(&user.email, std::time::Duration::from_secs(600))
                .await?;
            if let Some(fingerprint) = device_fingerprint {
                context.known_device =
                    Some(db.known_device_fingerprint(user.id, fingerprint).await?);
            }
        }

        let verdict = self.evaluate(&context);

        metrics
            .risk_verdicts_total
            .with_label_values(&[match verdict.recommendation {
                Recommendation::Allow => "allow",
                Recommendation::Challenge => "challenge",
                Recommendation::Deny => "deny",
            }])
            .inc();

        Ok((verdict, current_location, current_asn))
    }

    /// Pure scoring over a gathered context.
    pub fn evaluate(&self, ctx: &RiskContext) -> RiskVerdict {
        if ctx.ip_blocked {
            return RiskVerdict {
                score: 100,
                signals: vec!["ip_blocklisted".to_string()],
                recommendation: Recommendation::Deny,
            };
        }

        let mut score = 0u32;
        let mut signals = Vec::new();

        if let Some(speed) = self.travel_speed_kmh(ctx) {
            if speed > self.config.impossible_travel_kmh {
                score += WEIGHT_IMPOSSIBLE_TRAVEL;
                signals.push(format!("impossible_travel:{:.0}kmh", speed));
            }
        }

        if let Some(country) = &ctx.current_location.country_code {
            if !ctx.recent_countries.is_empty() && !ctx.recent_countries.contains(country) {
                score += WEIGHT_COUNTRY_CHANGE;
                signals.push(format!("country_change:{}", country));
            }
        }

        if let (Some(current), Some(previous)) = (ctx.current_asn, ctx.previous_asn) {
            if current != previous {
                score += WEIGHT_ASN_CHANGE;
                signals.push(format!("asn_change:{}->{}", previous, current));
            }
        }

        if ctx.known_device == Some(false) {
            score += WEIGHT_NEW_DEVICE;
            signals.push("new_device_fingerprint".to_string());
        }

        if ctx.suspicious_count >= self.config.suspicious_ip_threshold {
            score += WEIGHT_SUSPICIOUS_IP;
            signals.push(format!("suspicious_ip:{}", ctx.suspicious_count));
        }

        if ctx.recent_failed_logins >= RECENT_FAILURES_THRESHOLD {
            score += WEIGHT_RECENT_FAILURES;
            signals.push(format!("recent_failures:{}", ctx.recent_failed_logins));
        }

        let score = score.min(100);

        let recommendation = if score >= self.config.deny_score {
            Recommendation::Deny
        } else if score >= self.config.challenge_score {
            Recommendation::Challenge
        } else {
            Recommendation::Allow
        };

        RiskVerdict {
            score,
            signals,
            recommendation,
        }
    }

    /// km/h between the previous observation and the current location;
    /// `None` when either side has no coordinates or the distance is
    /// unknown. Sub-second elapsed times clamp to one second.
    fn travel_speed_kmh(&self, ctx: &RiskContext) -> Option<f64> {
        let (previous_location, previous_at) = ctx.last_observation.as_ref()?;
        let (lat1, lon1) = previous_location.coordinates()?;
        let (lat2, lon2) = ctx.current_location.coordinates()?;

        let distance = haversine_km(lat1, lon1, lat2, lon2);
        if distance < 0.0 {
            return None;
        }

        let elapsed_secs = (ctx.now - *previous_at).num_seconds().max(1) as f64;
        Some(distance / (elapsed_secs / 3600.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn engine() -> RiskEngine {
        RiskEngine::new(RiskConfig {
            impossible_travel_kmh: 900.0,
            suspicious_ip_threshold: 5,
            country_change_window: 5,
            deny_score: 70,
            challenge_score: 40,
        })
    }

    fn location(country: &str, lat: f64, lon: f64) -> GeoLocation {
        GeoLocation {
            country_code: Some(country.to_string()),
            latitude: Some(lat),
            longitude: Some(lon),
            ..GeoLocation::default()
        }
    }

    #[test]
    fn test_blocklisted_ip_denies_outright() {
        let verdict = engine().evaluate(&RiskContext {
            ip_blocked: true,
            now: Utc::now(),
            ..RiskContext::default()
        });

        assert_eq!(verdict.recommendation, Recommendation::Deny);
        assert_eq!(verdict.score, 100);
        assert_eq!(verdict.signals, vec!["ip_blocklisted"]);
    }

    #[test]
    fn test_clean_context_allows() {
        let verdict = engine().evaluate(&RiskContext {
            current_location: location("US", 40.7, -74.0),
            recent_countries: vec!["US".to_string()],
            known_device: Some(true),
            now: Utc::now(),
            ..RiskContext::default()
        });

        assert_eq!(verdict.recommendation, Recommendation::Allow);
        assert_eq!(verdict.score, 0);
        assert!(verdict.signals.is_empty());
    }

    #[test]
    fn test_impossible_travel_plus_country_change_denies() {
        // US login, then Japan 30 seconds later: ~10,000 km at ~1.2M km/h.
        let now = Utc::now();
        let verdict = engine().evaluate(&RiskContext {
            current_location: location("JP", 35.68, 139.65),
            last_observation: Some((location("US", 40.7, -74.0), now - Duration::seconds(30))),
            recent_countries: vec!["US".to_string()],
            suspicious_count: 5,
            now,
            ..RiskContext::default()
        });

        // impossible travel (40) + country change (20) + suspicious ip (20)
        assert!(verdict.score >= 70, "score was {}", verdict.score);
        assert_eq!(verdict.recommendation, Recommendation::Deny);
        assert!(verdict.signals.iter().any(|s| s.starts_with("impossible_travel")));
    }

    #[test]
    fn test_moderate_signals_challenge() {
        let verdict = engine().evaluate(&RiskContext {
            current_location: location("DE", 52.52, 13.40),
            recent_countries: vec!["US".to_string()],
            known_device: Some(false),
            recent_failed_logins: 3,
            now: Utc::now(),
            ..RiskContext::default()
        });

        // country change (20) + new device (15) + recent failures (15) = 50
        assert_eq!(verdict.score, 50);
        assert_eq!(verdict.recommendation, Recommendation::Challenge);
    }

    #[test]
    fn test_plausible_travel_does_not_score() {
        // Same city a day later.
        let now = Utc::now();
        let verdict = engine().evaluate(&RiskContext {
            current_location: location("US", 40.71, -74.01),
            last_observation: Some((location("US", 40.70, -74.00), now - Duration::days(1))),
            recent_countries: vec!["US".to_string()],
            now,
            ..RiskContext::default()
        });

        assert_eq!(verdict.score, 0);
        assert_eq!(verdict.recommendation, Recommendation::Allow);
    }

    #[test]
    fn test_asn_change_scores() {
        let verdict = engine().evaluate(&RiskContext {
            current_asn: Some(64501),
            previous_asn: Some(64500),
            now: Utc::now(),
            ..RiskContext::default()
        });

        assert_eq!(verdict.score, 10);
        assert!(verdict.signals.iter().any(|s| s.starts_with("asn_change")));
    }

    #[test]
    fn test_unknown_locations_are_neutral() {
        // No coordinates on either side: travel cannot be scored.
        let now = Utc::now();
        let verdict = engine().evaluate(&RiskContext {
            current_location: GeoLocation::unknown(),
            last_observation: Some((GeoLocation::unknown(), now - Duration::seconds(10))),
            now,
            ..RiskContext::default()
        });

        assert_eq!(verdict.score, 0);
    }
}
