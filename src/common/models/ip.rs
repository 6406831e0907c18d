use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Bound on the per-IP geolocation history ring.
pub const GEO_HISTORY_LIMIT: usize = 10;

/// Resolved geolocation for an IP address. Every field is optional; a lookup
/// against a missing or stale database yields `GeoLocation::unknown()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub country_code: Option<String>,
    pub country_name: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub time_zone: Option<String>,
    pub subdivision_name: Option<String>,
    pub subdivision_code: Option<String>,
}

impl GeoLocation {
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn is_unknown(&self) -> bool {
        self.country_code.is_none() && self.latitude.is_none()
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }
}

/// One entry of the per-IP observation ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoObservation {
    pub location: GeoLocation,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct IpMetadata {
    pub ip_address: String,
    pub suspicious_count: i32,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_geolocation: Option<serde_json::Value>,
    /// JSON array of `GeoObservation`, oldest first, at most
    /// `GEO_HISTORY_LIMIT` entries.
    pub geo_history: serde_json::Value,
    pub asn: Option<i64>,
}

impl IpMetadata {
    pub fn last_location(&self) -> Option<GeoLocation> {
        self.last_geolocation
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn history(&self) -> Vec<GeoObservation> {
        serde_json::from_value(self.geo_history.clone()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct IpBlockEntry {
    pub ip_address: String,
    pub reason: String,
    pub blocked_at: DateTime<Utc>,
    /// None means permanent.
    pub blocked_until: Option<DateTime<Utc>>,
    pub active: bool,
}

impl IpBlockEntry {
    pub fn blocks_at(&self, now: DateTime<Utc>) -> bool {
        self.active && self.blocked_until.map_or(true, |until| until > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_entry_windows() {
        let mut entry = IpBlockEntry {
            ip_address: "203.0.113.9".to_string(),
            reason: "abuse".to_string(),
            blocked_at: Utc::now(),
            blocked_until: None,
            active: true,
        };
        let now = Utc::now();

        // Permanent block
        assert!(entry.blocks_at(now));

        // Expired block
        entry.blocked_until = Some(now - chrono::Duration::minutes(1));
        assert!(!entry.blocks_at(now));

        // Future expiry
        entry.blocked_until = Some(now + chrono::Duration::minutes(1));
        assert!(entry.blocks_at(now));

        // Deactivated
        entry.active = false;
        assert!(!entry.blocks_at(now));
    }
}
