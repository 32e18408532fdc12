//! Request Canonicalizer
//!
//! Turns a logical request into the stable key used for both caching and
//! single-flight. Logically identical requests always produce the same key,
//! whatever the order of their sites, filters or numeric precision.

use std::fmt;

use serde::Serialize;

use crate::models::{LoadRequest, RangeCode};

// == Request Key ==
/// Canonical request key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RequestKey(String);

impl RequestKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// == Buckets ==
/// Requested point spacing, collapsed to a handful of tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionBucket {
    Auto,
    Raw,
    Hourly,
    Daily,
    Weekly,
}

impl ResolutionBucket {
    pub fn from_hint(seconds: Option<u32>) -> Self {
        match seconds {
            None | Some(0) => ResolutionBucket::Auto,
            Some(s) if s <= 300 => ResolutionBucket::Raw,
            Some(s) if s <= 3_600 => ResolutionBucket::Hourly,
            Some(s) if s <= 86_400 => ResolutionBucket::Daily,
            Some(_) => ResolutionBucket::Weekly,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionBucket::Auto => "auto",
            ResolutionBucket::Raw => "raw",
            ResolutionBucket::Hourly => "1h",
            ResolutionBucket::Daily => "1d",
            ResolutionBucket::Weekly => "1w",
        }
    }
}

/// Depth limit tiers for profile sensors.
fn depth_bucket(limit: Option<u32>) -> Option<&'static str> {
    limit.map(|d| match d {
        0..=5 => "5",
        6..=10 => "10",
        11..=25 => "25",
        _ => "all",
    })
}

// == Canonicalize ==
/// Builds the canonical key for `request` against `endpoint`.
///
/// Layout: `endpoint|sites=..|range=..|res=..|fid=..`, followed by the depth
/// tier and filter signature when present.
pub fn canonicalize(endpoint: &str, request: &LoadRequest) -> RequestKey {
    let sites = request.normalized_entities().join(",");
    let mut key = format!("{}|sites={}|{}", endpoint, sites, range_signature(request));
    push_tail(&mut key, request);
    RequestKey(key)
}

/// Key for the request minus its site set: identifies the range half of a
/// per-entity cache slot.
pub fn range_key(endpoint: &str, request: &LoadRequest) -> String {
    let mut key = format!("{}|{}", endpoint, range_signature(request));
    push_tail(&mut key, request);
    key
}

fn range_signature(request: &LoadRequest) -> String {
    let range = match (request.range, &request.custom_range) {
        (RangeCode::Custom, Some(r)) => format!(
            "custom:{}~{}",
            r.start.timestamp_millis(),
            r.end.timestamp_millis()
        ),
        (code, _) => code.as_str().to_string(),
    };
    format!(
        "range={}|res={}|fid={}",
        range,
        ResolutionBucket::from_hint(request.resolution_hint).as_str(),
        request.fidelity.as_str()
    )
}

fn push_tail(key: &mut String, request: &LoadRequest) {
    if let Some(depth) = depth_bucket(request.depth_limit) {
        key.push_str("|depth=");
        key.push_str(depth);
    }
    if !request.filters.is_empty() {
        let mut signature: Vec<String> = request
            .filters
            .iter()
            .map(|(k, v)| format!("{}={}", k.trim().to_ascii_lowercase(), v.trim()))
            .collect();
        signature.sort();
        key.push_str("|flt=");
        key.push_str(&signature.join(","));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FidelityMode, TimeRange};
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    #[test]
    fn test_key_layout() {
        let req = LoadRequest::new(["s2", "S1", "s1"], RangeCode::Last30Days);
        assert_eq!(
            canonicalize("readings", &req).as_str(),
            "readings|sites=S1,S2|range=30d|res=auto|fid=std"
        );
    }

    #[test]
    fn test_site_order_is_irrelevant() {
        let a = LoadRequest::new(["s2", "s1"], RangeCode::Last7Days);
        let b = LoadRequest::new(["S1", "S2"], RangeCode::Last7Days);
        assert_eq!(canonicalize("readings", &a), canonicalize("readings", &b));
    }

    #[test]
    fn test_custom_range_only_in_custom_keys() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();

        let mut stray = LoadRequest::new(["S1"], RangeCode::Last7Days);
        stray.custom_range = Some(TimeRange::new(start, end));
        assert!(!canonicalize("r", &stray).as_str().contains("custom"));

        let custom = LoadRequest::new(["S1"], RangeCode::Last7Days)
            .with_custom_range(TimeRange::new(start, end));
        assert!(canonicalize("r", &custom)
            .as_str()
            .contains(&format!("range=custom:{}~", start.timestamp_millis())));
    }

    #[test]
    fn test_resolution_buckets_collapse() {
        let a = LoadRequest::new(["S1"], RangeCode::Last7Days).with_resolution(1_800);
        let b = LoadRequest::new(["S1"], RangeCode::Last7Days).with_resolution(3_600);
        let c = LoadRequest::new(["S1"], RangeCode::Last7Days).with_resolution(7_200);

        assert_eq!(canonicalize("r", &a), canonicalize("r", &b));
        assert_ne!(canonicalize("r", &b), canonicalize("r", &c));
    }

    #[test]
    fn test_depth_and_filters() {
        let mut req = LoadRequest::new(["S1"], RangeCode::Last7Days)
            .with_filter("Param", " temp ")
            .with_filter("agency", "usgs");
        req.depth_limit = Some(8);

        assert_eq!(
            canonicalize("profiles", &req).as_str(),
            "profiles|sites=S1|range=7d|res=auto|fid=std|depth=10|flt=agency=usgs,param=temp"
        );
    }

    #[test]
    fn test_range_key_omits_sites() {
        let req = LoadRequest::new(["S1", "S2"], RangeCode::Last90Days)
            .with_fidelity(FidelityMode::Full);
        assert_eq!(range_key("readings", &req), "readings|range=90d|res=auto|fid=full");
    }

    fn site_strategy() -> impl Strategy<Value = String> {
        "[a-zA-Z][a-zA-Z0-9]{0,5}"
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // Any permutation or re-casing of the same site set yields the same key.
        #[test]
        fn prop_permutation_invariance(
            sites in prop::collection::vec(site_strategy(), 1..8),
            seed in any::<u64>(),
        ) {
            let mut shuffled: Vec<String> = sites
                .iter()
                .map(|s| if seed % 2 == 0 { s.to_ascii_lowercase() } else { s.to_ascii_uppercase() })
                .collect();
            let len = shuffled.len();
            shuffled.rotate_left((seed as usize) % len);
            shuffled.reverse();
            shuffled.push(sites[0].clone());

            let a = LoadRequest::new(sites.clone(), RangeCode::Last30Days);
            let b = LoadRequest::new(shuffled, RangeCode::Last30Days);
            prop_assert_eq!(canonicalize("readings", &a), canonicalize("readings", &b));
        }

        // Canonicalizing is idempotent under re-normalization of the sites.
        #[test]
        fn prop_idempotent(sites in prop::collection::vec(site_strategy(), 1..8)) {
            let req = LoadRequest::new(sites, RangeCode::Last7Days);
            let normalized = req.with_entities(req.normalized_entities());
            prop_assert_eq!(canonicalize("r", &req), canonicalize("r", &normalized));
        }
    }
}
