//! Request models
//!
//! The logical load request issued by dashboard collaborators, plus the range
//! and fidelity vocabularies it is expressed in.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DataError, Result};

/// Service used when a request does not name one.
pub const DEFAULT_SERVICE: &str = "readings";

// == Range Code ==
/// Fixed vocabulary of time ranges. Relative phrases collapse onto these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RangeCode {
    Last24Hours,
    Last7Days,
    #[default]
    Last30Days,
    Last90Days,
    LastYear,
    All,
    Custom,
}

impl RangeCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RangeCode::Last24Hours => "24h",
            RangeCode::Last7Days => "7d",
            RangeCode::Last30Days => "30d",
            RangeCode::Last90Days => "90d",
            RangeCode::LastYear => "1y",
            RangeCode::All => "all",
            RangeCode::Custom => "custom",
        }
    }

    /// Maps a relative range phrase onto the vocabulary.
    ///
    /// Accepts the codes themselves, named periods ("week", "quarter"), and
    /// rolling phrases such as "last 30 days" or "14d", which are bucketed up
    /// to the next range that covers them.
    pub fn from_phrase(phrase: &str) -> Option<Self> {
        let normalized = phrase.trim().to_ascii_lowercase().replace(['_', '-'], " ");
        let normalized = normalized.trim_start_matches("last ").trim();

        let named = match normalized {
            "24h" | "day" | "today" | "24 hours" | "1 day" => Some(RangeCode::Last24Hours),
            "7d" | "week" | "1w" | "7 days" => Some(RangeCode::Last7Days),
            "30d" | "month" | "1m" | "30 days" => Some(RangeCode::Last30Days),
            "90d" | "quarter" | "3m" | "90 days" => Some(RangeCode::Last90Days),
            "1y" | "year" | "12m" | "365d" | "365 days" => Some(RangeCode::LastYear),
            "all" | "all time" | "everything" => Some(RangeCode::All),
            "custom" => Some(RangeCode::Custom),
            _ => None,
        };
        named.or_else(|| Self::parse_rolling(normalized))
    }

    /// "N days", "Nd", "N hours", "Nh" -> smallest covering range.
    fn parse_rolling(phrase: &str) -> Option<Self> {
        let split = phrase
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(phrase.len());
        let (number, unit) = phrase.split_at(split);
        let n: u64 = number.parse().ok()?;
        let days = match unit.trim() {
            "d" | "day" | "days" => n,
            "h" | "hour" | "hours" => n.div_ceil(24),
            "w" | "week" | "weeks" => n * 7,
            _ => return None,
        };

        Some(match days {
            0..=1 => RangeCode::Last24Hours,
            2..=7 => RangeCode::Last7Days,
            8..=30 => RangeCode::Last30Days,
            31..=90 => RangeCode::Last90Days,
            91..=365 => RangeCode::LastYear,
            _ => RangeCode::All,
        })
    }

    /// Length of a rolling range, None for `All` and `Custom`.
    pub fn span(&self) -> Option<Duration> {
        match self {
            RangeCode::Last24Hours => Some(Duration::hours(24)),
            RangeCode::Last7Days => Some(Duration::days(7)),
            RangeCode::Last30Days => Some(Duration::days(30)),
            RangeCode::Last90Days => Some(Duration::days(90)),
            RangeCode::LastYear => Some(Duration::days(365)),
            RangeCode::All | RangeCode::Custom => None,
        }
    }

    /// The next wider rolling range, used by range-widening prefetch.
    pub fn wider(&self) -> Option<Self> {
        match self {
            RangeCode::Last24Hours => Some(RangeCode::Last7Days),
            RangeCode::Last7Days => Some(RangeCode::Last30Days),
            RangeCode::Last30Days => Some(RangeCode::Last90Days),
            RangeCode::Last90Days => Some(RangeCode::LastYear),
            _ => None,
        }
    }
}

impl fmt::Display for RangeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for RangeCode {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        RangeCode::from_phrase(&value).ok_or_else(|| format!("unknown range '{}'", value))
    }
}

impl From<RangeCode> for String {
    fn from(code: RangeCode) -> Self {
        code.as_str().to_string()
    }
}

// == Time Range ==
/// Explicit `[start, end)` window, only meaningful with `RangeCode::Custom`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }
}

// == Fidelity Mode ==
/// How much of the raw signal the caller wants back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FidelityMode {
    /// Downsampled overview
    Summary,
    #[default]
    Standard,
    /// Every stored reading
    Full,
}

impl FidelityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FidelityMode::Summary => "sum",
            FidelityMode::Standard => "std",
            FidelityMode::Full => "full",
        }
    }
}

// == Load Request ==
/// A logical data request from the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadRequest {
    #[serde(default = "default_service")]
    pub service: String,
    /// Monitoring sites (the cache partition unit)
    pub entities: Vec<String>,
    #[serde(default)]
    pub range: RangeCode,
    #[serde(default)]
    pub custom_range: Option<TimeRange>,
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
    /// Requested seconds between points
    #[serde(default)]
    pub resolution_hint: Option<u32>,
    /// Maximum depth/level count for profile sensors
    #[serde(default)]
    pub depth_limit: Option<u32>,
    #[serde(default)]
    pub fidelity: FidelityMode,
}

fn default_service() -> String {
    DEFAULT_SERVICE.to_string()
}

impl LoadRequest {
    /// A request for `entities` over `range` with default options.
    pub fn new<I, S>(entities: I, range: RangeCode) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            service: default_service(),
            entities: entities.into_iter().map(Into::into).collect(),
            range,
            custom_range: None,
            filters: BTreeMap::new(),
            resolution_hint: None,
            depth_limit: None,
            fidelity: FidelityMode::default(),
        }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn with_custom_range(mut self, range: TimeRange) -> Self {
        self.range = RangeCode::Custom;
        self.custom_range = Some(range);
        self
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(key.into(), value.into());
        self
    }

    pub fn with_resolution(mut self, seconds: u32) -> Self {
        self.resolution_hint = Some(seconds);
        self
    }

    pub fn with_fidelity(mut self, fidelity: FidelityMode) -> Self {
        self.fidelity = fidelity;
        self
    }

    /// Same request narrowed (or widened) to another entity set.
    pub fn with_entities<I, S>(&self, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entities: entities.into_iter().map(Into::into).collect(),
            ..self.clone()
        }
    }

    /// Entities upper-cased, de-duplicated and sorted.
    pub fn normalized_entities(&self) -> Vec<String> {
        let mut sites: Vec<String> = self
            .entities
            .iter()
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        sites.sort();
        sites.dedup();
        sites
    }

    // == Validate ==
    pub fn validate(&self) -> Result<()> {
        if self.service.trim().is_empty() {
            return Err(DataError::InvalidRequest("Service cannot be empty".into()));
        }
        if self.normalized_entities().is_empty() {
            return Err(DataError::InvalidRequest(
                "At least one site is required".into(),
            ));
        }
        if self.range == RangeCode::Custom {
            match &self.custom_range {
                Some(r) if r.start < r.end => {}
                Some(_) => {
                    return Err(DataError::InvalidRequest(
                        "Custom range start must precede end".into(),
                    ))
                }
                None => {
                    return Err(DataError::InvalidRequest(
                        "Custom range requires start and end".into(),
                    ))
                }
            }
        }
        Ok(())
    }

    /// Concrete window for this request at `now`. `All` is unbounded.
    pub fn resolve_window(&self, now: DateTime<Utc>) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        match (self.range, &self.custom_range) {
            (RangeCode::Custom, Some(r)) => (Some(r.start), Some(r.end)),
            (code, _) => match code.span() {
                Some(span) => (Some(now - span), Some(now)),
                None => (None, Some(now)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_range_phrases() {
        assert_eq!(RangeCode::from_phrase("30d"), Some(RangeCode::Last30Days));
        assert_eq!(RangeCode::from_phrase("Last 30 days"), Some(RangeCode::Last30Days));
        assert_eq!(RangeCode::from_phrase("last_7_days"), Some(RangeCode::Last7Days));
        assert_eq!(RangeCode::from_phrase("quarter"), Some(RangeCode::Last90Days));
        assert_eq!(RangeCode::from_phrase("14d"), Some(RangeCode::Last30Days));
        assert_eq!(RangeCode::from_phrase("last 48 hours"), Some(RangeCode::Last7Days));
        assert_eq!(RangeCode::from_phrase("2 weeks"), Some(RangeCode::Last30Days));
        assert_eq!(RangeCode::from_phrase("1000d"), Some(RangeCode::All));
        assert_eq!(RangeCode::from_phrase("fortnight"), None);
    }

    #[test]
    fn test_range_serde_uses_codes() {
        let json = serde_json::to_string(&RangeCode::LastYear).unwrap();
        assert_eq!(json, "\"1y\"");

        let code: RangeCode = serde_json::from_str("\"last 90 days\"").unwrap();
        assert_eq!(code, RangeCode::Last90Days);
        assert!(serde_json::from_str::<RangeCode>("\"soon\"").is_err());
    }

    #[test]
    fn test_load_request_deserialize_defaults() {
        let json = r#"{"entities": ["s2", "S1"]}"#;
        let req: LoadRequest = serde_json::from_str(json).unwrap();

        assert_eq!(req.service, DEFAULT_SERVICE);
        assert_eq!(req.range, RangeCode::Last30Days);
        assert_eq!(req.fidelity, FidelityMode::Standard);
        assert_eq!(req.normalized_entities(), vec!["S1", "S2"]);
    }

    #[test]
    fn test_validate_rejects_empty_sites() {
        let req = LoadRequest::new(["  ", ""], RangeCode::Last7Days);
        assert!(matches!(req.validate(), Err(DataError::InvalidRequest(_))));
    }

    #[test]
    fn test_validate_custom_range() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();

        let ok = LoadRequest::new(["S1"], RangeCode::Last7Days)
            .with_custom_range(TimeRange::new(start, end));
        assert!(ok.validate().is_ok());

        let inverted = LoadRequest::new(["S1"], RangeCode::Last7Days)
            .with_custom_range(TimeRange::new(end, start));
        assert!(inverted.validate().is_err());

        let missing = LoadRequest::new(["S1"], RangeCode::Custom);
        assert!(missing.validate().is_err());
    }

    #[test]
    fn test_resolve_window() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();

        let (start, end) = LoadRequest::new(["S1"], RangeCode::Last7Days).resolve_window(now);
        assert_eq!(start, Some(now - Duration::days(7)));
        assert_eq!(end, Some(now));

        let (start, _) = LoadRequest::new(["S1"], RangeCode::All).resolve_window(now);
        assert!(start.is_none());
    }
}
