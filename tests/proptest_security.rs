//! Property-based tests for security-critical paths
//!
//! These tests fuzz critical security components to find edge cases and
//! vulnerabilities.

use proptest::prelude::*;
use warden::password::{PASSWORD_MAX_LEN, PASSWORD_MIN_LEN, complexity_violation};
use warden::{blind_index, haversine_km, normalise_email};

// ============================================================================
// Password Complexity Fuzzing
// ============================================================================

proptest! {
    #[test]
    fn test_complexity_accepts_conforming_passwords(
        upper in "[A-Z]{2,10}",
        lower in "[a-z]{2,10}",
        digits in "[0-9]{2,10}",
        special in "[!@#$%^&*]{2,10}",
    ) {
        // Interleave the classes so no run exceeds the repeat bound
        let password = format!("{}{}{}{}", upper, lower, digits, special);
        if password.chars().count() >= PASSWORD_MIN_LEN
            && password.chars().count() <= PASSWORD_MAX_LEN
        {
            let no_repeats = !has_long_run(&password);
            if no_repeats {
                prop_assert!(complexity_violation(&password).is_none());
            }
        }
    }

    #[test]
    fn test_complexity_rejects_short_passwords(
        password in "[A-Za-z0-9!]{1,11}",
    ) {
        prop_assert!(complexity_violation(&password).is_some());
    }

    #[test]
    fn test_complexity_rejects_over_long_passwords(
        filler in "[A-Za-z0-9!]{129,200}",
    ) {
        prop_assert!(complexity_violation(&filler).is_some());
    }

    #[test]
    fn test_complexity_rejects_single_class(
        lower_only in "[a-z]{12,40}",
        digits_only in "[0-9]{12,40}",
    ) {
        prop_assert!(complexity_violation(&lower_only).is_some());
        prop_assert!(complexity_violation(&digits_only).is_some());
    }

    #[test]
    fn test_complexity_never_panics_on_unicode(
        password in "\\PC{0,64}",
    ) {
        let _ = complexity_violation(&password);
    }
}

fn has_long_run(password: &str) -> bool {
    let mut run_char = '\0';
    let mut run_len = 0usize;
    for c in password.chars() {
        if c == run_char {
            run_len += 1;
            if run_len > 3 {
                return true;
            }
        } else {
            run_char = c;
            run_len = 1;
        }
    }
    false
}

// ============================================================================
// Blind Index Fuzzing
// ============================================================================

proptest! {
    #[test]
    fn test_blind_index_shape(input in "\\PC{0,100}") {
        let idx = blind_index(&input);
        prop_assert_eq!(idx.len(), 64);
        prop_assert!(idx.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_blind_index_deterministic(input in "\\PC{1,100}") {
        prop_assert_eq!(blind_index(&input), blind_index(&input));
    }

    #[test]
    fn test_normalised_emails_collide_on_case(
        local in "[a-zA-Z0-9.]{1,20}",
        domain in "[a-zA-Z0-9]{1,15}",
    ) {
        let mixed = format!("  {}@{}.com ", local, domain);
        let lower = mixed.trim().to_lowercase();
        prop_assert_eq!(
            blind_index(&normalise_email(&mixed)),
            blind_index(&normalise_email(&lower))
        );
    }
}

// ============================================================================
// Distance Calculation Fuzzing
// ============================================================================

proptest! {
    #[test]
    fn test_haversine_in_valid_range(
        lat1 in -90.0f64..=90.0,
        lon1 in -180.0f64..=180.0,
        lat2 in -90.0f64..=90.0,
        lon2 in -180.0f64..=180.0,
    ) {
        let d = haversine_km(lat1, lon1, lat2, lon2);
        // Half the Earth's circumference bounds every great-circle distance
        prop_assert!((0.0..=20_038.0).contains(&d), "distance {}", d);
    }

    #[test]
    fn test_haversine_symmetric(
        lat1 in -90.0f64..=90.0,
        lon1 in -180.0f64..=180.0,
        lat2 in -90.0f64..=90.0,
        lon2 in -180.0f64..=180.0,
    ) {
        let there = haversine_km(lat1, lon1, lat2, lon2);
        let back = haversine_km(lat2, lon2, lat1, lon1);
        prop_assert!((there - back).abs() < 1e-6);
    }

    #[test]
    fn test_haversine_rejects_out_of_range(
        lat in 90.1f64..=1000.0,
        lon in -180.0f64..=180.0,
    ) {
        prop_assert_eq!(haversine_km(lat, lon, 0.0, 0.0), -1.0);
        prop_assert_eq!(haversine_km(0.0, 0.0, -lat, lon), -1.0);
    }
}

// ============================================================================
// Rate-Limit Invariant (model check)
// ============================================================================

// A pure model of the sliding-window admission rule: over any sequence of
// monotone timestamps, admissions inside a trailing window never exceed
// the limit. The Redis script implements exactly this trim-count-append.
proptest! {
    #[test]
    fn test_sliding_window_model_never_over_admits(
        offsets in proptest::collection::vec(0u64..120_000_000, 1..200),
        limit in 1u64..20,
        window_us in 1_000_000u64..60_000_000,
    ) {
        let mut times: Vec<u64> = Vec::new();
        let mut now = 0u64;
        let mut admitted: Vec<u64> = Vec::new();

        for delta in offsets {
            now += delta % 1_000_000;
            times.push(now);

            // The atomic acquire: trim, count, append if under limit
            admitted.retain(|t| *t + window_us > now);
            if (admitted.len() as u64) < limit {
                admitted.push(now);
            }
        }

        // Invariant: no window of length `window_us` contains more than
        // `limit` admissions.
        for &t in &admitted {
            let in_window = admitted
                .iter()
                .filter(|&&u| u >= t.saturating_sub(window_us - 1) && u <= t)
                .count() as u64;
            prop_assert!(in_window <= limit);
        }
    }
}
