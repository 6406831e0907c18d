/// Geo/IP resolution over MaxMind database files.
///
/// Readers are opened once at boot and are safe for concurrent lookups.
/// City, country and ASN databases are independent: any of them may be
/// missing or fail to answer, and the result degrades to `unknown` fields
/// rather than an error. Callers never see a lookup failure.
use std::net::IpAddr;

use maxminddb::{Reader, geoip2};

use crate::config::GeoConfig;
use crate::models::GeoLocation;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Resolves an IP address to location and network metadata.
pub trait GeoResolver: Send + Sync {
    fn locate(&self, ip: &str) -> GeoLocation;
    fn asn(&self, ip: &str) -> Option<i64>;
}

/// Resolver over on-disk MaxMind databases. Each reader is optional; a
/// deployment without the files runs with every lookup returning unknown.
pub struct MaxMindResolver {
    city: Option<Reader<Vec<u8>>>,
    country: Option<Reader<Vec<u8>>>,
    asn: Option<Reader<Vec<u8>>>,
}

impl MaxMindResolver {
    pub fn open(config: &GeoConfig) -> Self {
        let open_reader = |path: &Option<String>, kind: &str| -> Option<Reader<Vec<u8>>> {
            let path = path.as_ref()?;
            match Reader::open_readfile(path) {
                Ok(reader) => {
                    tracing::info!(path = %path, kind = %kind, "Geo database opened");
                    Some(reader)
                }
                Err(e) => {
                    tracing::warn!(path = %path, kind = %kind, error = %e, "Geo database unavailable; lookups will return unknown");
                    None
                }
            }
        };

        Self {
            city: open_reader(&config.city_db_path, "city"),
            country: open_reader(&config.country_db_path, "country"),
            asn: open_reader(&config.asn_db_path, "asn"),
        }
    }
}

impl GeoResolver for MaxMindResolver {
    fn locate(&self, ip: &str) -> GeoLocation {
        let addr: IpAddr = match ip.parse() {
            Ok(addr) => addr,
            Err(_) => {
                tracing::debug!(ip = %ip, "Unparseable IP address in geo lookup");
                return GeoLocation::unknown();
            }
        };

        let mut location = GeoLocation::unknown();

        if let Some(reader) = &self.city {
            if let Ok(city) = reader.lookup::<geoip2::City>(addr) {
                if let Some(c) = city.country {
                    location.country_code = c.iso_code.map(str::to_string);
                    location.country_name = c
                        .names
                        .as_ref()
                        .and_then(|n| n.get("en"))
                        .map(|s| s.to_string());
                }
                if let Some(c) = city.city {
                    location.city = c
                        .names
                        .as_ref()
                        .and_then(|n| n.get("en"))
                        .map(|s| s.to_string());
                }
                if let Some(p) = city.postal {
                    location.postal_code = p.code.map(str::to_string);
                }
                if let Some(l) = city.location {
                    location.latitude = l.latitude;
                    location.longitude = l.longitude;
                    location.time_zone = l.time_zone.map(str::to_string);
                }
                if let Some(subs) = city.subdivisions {
                    if let Some(sub) = subs.first() {
                        location.subdivision_code = sub.iso_code.map(str::to_string);
                        location.subdivision_name = sub
                            .names
                            .as_ref()
                            .and_then(|n| n.get("en"))
                            .map(|s| s.to_string());
                    }
                }
            }
        }

        // Country database fills the gap when the city database is absent
        // or had no record for this address.
        if location.country_code.is_none() {
            if let Some(reader) = &self.country {
                if let Ok(country) = reader.lookup::<geoip2::Country>(addr) {
                    if let Some(c) = country.country {
                        location.country_code = c.iso_code.map(str::to_string);
                        location.country_name = c
                            .names
                            .as_ref()
                            .and_then(|n| n.get("en"))
                            .map(|s| s.to_string());
                    }
                }
            }
        }

        location
    }

    fn asn(&self, ip: &str) -> Option<i64> {
        let addr: IpAddr = ip.parse().ok()?;
        let reader = self.asn.as_ref()?;
        reader
            .lookup::<geoip2::Asn>(addr)
            .ok()
            .and_then(|record| record.autonomous_system_number)
            .map(|n| n as i64)
    }
}

/// Resolver used when no databases are configured (and in tests that do
/// not care about location).
pub struct NullResolver;

impl GeoResolver for NullResolver {
    fn locate(&self, _ip: &str) -> GeoLocation {
        GeoLocation::unknown()
    }

    fn asn(&self, _ip: &str) -> Option<i64> {
        None
    }
}

/// Great-circle distance in kilometres. Coordinates outside the valid
/// range return -1 and are logged; the risk engine treats that as
/// "distance unknown".
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let in_range = |lat: f64, lon: f64| (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon);
    if !in_range(lat1, lon1) || !in_range(lat2, lon2) {
        tracing::warn!(
            lat1 = lat1,
            lon1 = lon1,
            lat2 = lat2,
            lon2 = lon2,
            "Rejecting out-of-range coordinates in distance calculation"
        );
        return -1.0;
    }

    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_KM * c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_known_distances() {
        // London -> Paris, roughly 344 km
        let d = haversine_km(51.5074, -0.1278, 48.8566, 2.3522);
        assert!((330.0..360.0).contains(&d), "got {}", d);

        // San Francisco -> Tokyo, roughly 8,280 km
        let d = haversine_km(37.7749, -122.4194, 35.6762, 139.6503);
        assert!((8100.0..8500.0).contains(&d), "got {}", d);
    }

    #[test]
    fn test_haversine_zero_distance() {
        let d = haversine_km(40.0, -70.0, 40.0, -70.0);
        assert!(d.abs() < 1e-9);
    }

    #[test]
    fn test_haversine_rejects_out_of_range() {
        assert_eq!(haversine_km(91.0, 0.0, 0.0, 0.0), -1.0);
        assert_eq!(haversine_km(0.0, 181.0, 0.0, 0.0), -1.0);
        assert_eq!(haversine_km(0.0, 0.0, -90.5, 0.0), -1.0);
        assert_eq!(haversine_km(0.0, 0.0, 0.0, -180.5), -1.0);
    }

    #[test]
    fn test_null_resolver() {
        let resolver = NullResolver;
        assert!(resolver.locate("198.51.100.7").is_unknown());
        assert_eq!(resolver.asn("198.51.100.7"), None);
    }

    #[test]
    fn test_missing_databases_degrade_to_unknown() {
        let resolver = MaxMindResolver::open(&GeoConfig {
            city_db_path: Some("/nonexistent/city.mmdb".to_string()),
            country_db_path: None,
            asn_db_path: None,
        });

        assert!(resolver.locate("198.51.100.7").is_unknown());
        assert_eq!(resolver.asn("198.51.100.7"), None);
    }

    #[test]
    fn test_bad_ip_is_unknown() {
        let resolver = MaxMindResolver::open(&GeoConfig::default());
        assert!(resolver.locate("not-an-ip").is_unknown());
    }
}
