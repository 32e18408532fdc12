//! Prefetch Patterns
//!
//! A pattern is a trigger predicate over the newest action and the behavior
//! history, a derivation producing the follow-up request, a probability and
//! a delay. Predicates compose with `when`.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use crate::canonical::RequestKey;
use crate::models::{LoadRequest, RangeCode};

/// One observed foreground action.
#[derive(Debug, Clone)]
pub struct BehaviorEvent {
    pub request: LoadRequest,
    pub key: RequestKey,
    pub observed_at: u64,
}

type Predicate = Box<dyn Fn(&LoadRequest, &[BehaviorEvent]) -> bool + Send + Sync>;
type Derivation = Box<dyn Fn(&LoadRequest, &[BehaviorEvent]) -> Option<LoadRequest> + Send + Sync>;

// == Prefetch Pattern ==
pub struct PrefetchPattern {
    pub name: String,
    triggers: Vec<Predicate>,
    derive: Derivation,
    pub probability: f64,
    pub delay: Duration,
}

impl PrefetchPattern {
    /// A pattern that always triggers, with probability 1 and no delay.
    pub fn new<F>(name: impl Into<String>, derive: F) -> Self
    where
        F: Fn(&LoadRequest, &[BehaviorEvent]) -> Option<LoadRequest> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            triggers: Vec::new(),
            derive: Box::new(derive),
            probability: 1.0,
            delay: Duration::ZERO,
        }
    }

    /// Adds a trigger predicate; all predicates must hold.
    pub fn when<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&LoadRequest, &[BehaviorEvent]) -> bool + Send + Sync + 'static,
    {
        self.triggers.push(Box::new(predicate));
        self
    }

    pub fn with_probability(mut self, probability: f64) -> Self {
        self.probability = probability.clamp(0.0, 1.0);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// `history` holds earlier events only, most recent first.
    pub fn matches(&self, current: &LoadRequest, history: &[BehaviorEvent]) -> bool {
        self.triggers.iter().all(|trigger| trigger(current, history))
    }

    pub fn derive(&self, current: &LoadRequest, history: &[BehaviorEvent]) -> Option<LoadRequest> {
        (self.derive)(current, history)
    }
}

impl fmt::Debug for PrefetchPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrefetchPattern")
            .field("name", &self.name)
            .field("triggers", &self.triggers.len())
            .field("probability", &self.probability)
            .field("delay", &self.delay)
            .finish()
    }
}

// == Predicates ==
pub fn service_is(service: &str) -> impl Fn(&LoadRequest, &[BehaviorEvent]) -> bool + Send + Sync {
    let service = service.to_string();
    move |request, _| request.service == service
}

pub fn range_in(codes: &[RangeCode]) -> impl Fn(&LoadRequest, &[BehaviorEvent]) -> bool + Send + Sync {
    let codes = codes.to_vec();
    move |request, _| codes.contains(&request.range)
}

/// Some earlier event shares at least `min_overlap` entities with the
/// current one without covering the same set.
pub fn overlaps_history(min_overlap: usize) -> impl Fn(&LoadRequest, &[BehaviorEvent]) -> bool + Send + Sync {
    move |request, history| overlapping_event(request, history, min_overlap).is_some()
}

fn overlapping_event<'a>(
    request: &LoadRequest,
    history: &'a [BehaviorEvent],
    min_overlap: usize,
) -> Option<&'a BehaviorEvent> {
    let current: BTreeSet<String> = request.normalized_entities().into_iter().collect();
    history.iter().find(|event| {
        if event.request.range != request.range {
            return false;
        }
        let previous: BTreeSet<String> = event.request.normalized_entities().into_iter().collect();
        previous != current && previous.intersection(&current).count() >= min_overlap.max(1)
    })
}

// == Default Patterns ==
/// After a rolling range is viewed, fetch the next wider one:
/// 24h -> 7d -> 30d -> 90d.
pub fn range_widening() -> PrefetchPattern {
    PrefetchPattern::new("range-widening", |request, _| {
        let wider = request.range.wider()?;
        let mut next = request.clone();
        next.range = wider;
        Some(next)
    })
    .when(range_in(&[
        RangeCode::Last24Hours,
        RangeCode::Last7Days,
        RangeCode::Last30Days,
    ]))
    .with_probability(0.6)
    .with_delay(Duration::from_millis(500))
}

/// When the current site set overlaps one viewed recently, fetch the union.
pub fn recent_sites_union() -> PrefetchPattern {
    PrefetchPattern::new("recent-sites-union", |request, history| {
        let previous = overlapping_event(request, history, 1)?;
        let mut sites = request.normalized_entities();
        sites.extend(previous.request.normalized_entities());
        Some(request.with_entities(sites))
    })
    .when(overlaps_history(1))
    .with_probability(0.4)
    .with_delay(Duration::from_millis(1_000))
}

pub fn default_patterns() -> Vec<PrefetchPattern> {
    vec![range_widening(), recent_sites_union()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::canonicalize;

    fn event(sites: &[&str], range: RangeCode) -> BehaviorEvent {
        let request = LoadRequest::new(sites.iter().copied(), range);
        BehaviorEvent {
            key: canonicalize("readings", &request),
            request,
            observed_at: 0,
        }
    }

    #[test]
    fn test_range_widening_derives_next_range() {
        let pattern = range_widening();
        let request = LoadRequest::new(["S1"], RangeCode::Last24Hours);

        assert!(pattern.matches(&request, &[]));
        assert_eq!(pattern.derive(&request, &[]).unwrap().range, RangeCode::Last7Days);

        let wide = LoadRequest::new(["S1"], RangeCode::Last90Days);
        assert!(!pattern.matches(&wide, &[]));
    }

    #[test]
    fn test_recent_sites_union() {
        let pattern = recent_sites_union();
        let history = vec![event(&["S1", "S2"], RangeCode::Last30Days)];
        let request = LoadRequest::new(["S2", "S3"], RangeCode::Last30Days);

        assert!(pattern.matches(&request, &history));
        let derived = pattern.derive(&request, &history).unwrap();
        assert_eq!(derived.normalized_entities(), vec!["S1", "S2", "S3"]);
    }

    #[test]
    fn test_overlap_ignores_identical_and_other_ranges() {
        let request = LoadRequest::new(["S1", "S2"], RangeCode::Last30Days);
        let same = vec![event(&["S2", "S1"], RangeCode::Last30Days)];
        let other_range = vec![event(&["S1"], RangeCode::Last7Days)];
        let disjoint = vec![event(&["S9"], RangeCode::Last30Days)];

        let predicate = overlaps_history(1);
        assert!(!predicate(&request, &same[..]));
        assert!(!predicate(&request, &other_range[..]));
        assert!(!predicate(&request, &disjoint[..]));
    }

    #[test]
    fn test_predicates_compose() {
        let pattern = PrefetchPattern::new("custom", |r, _| Some(r.clone()))
            .when(service_is("profiles"))
            .when(range_in(&[RangeCode::Last7Days]));

        let readings = LoadRequest::new(["S1"], RangeCode::Last7Days);
        let profiles = readings.clone().with_service("profiles");
        assert!(!pattern.matches(&readings, &[]));
        assert!(pattern.matches(&profiles, &[]));
        assert_eq!(pattern.with_probability(3.0).probability, 1.0);
    }
}
