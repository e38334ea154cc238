//! Deterministic candidate filtering and compatibility scoring.
//!
//! Everything here is pure: no I/O, no hidden state, and no failure mode for
//! incomplete candidate records. A missing major, year or location simply
//! contributes nothing to the score.
//!
//! Scoring works in two stages. [`ScoringEngine::filter_candidates`] applies
//! the radius as a hard cutoff, pre-sorts survivors by distance and caps the
//! set. [`ScoringEngine::score`] then sums categorical bonuses and scales them
//! by a distance multiplier that fades from full credit to a non-zero floor
//! at the radius.

use std::cmp::Ordering;
use std::collections::HashSet;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

pub mod geo;

pub use geo::{haversine_meters, GeoPoint};

/// Documented default cap on the candidate set after filtering.
pub const DEFAULT_MAX_CANDIDATES: usize = 100;

/// A profile being evaluated for compatibility. Read-only input.
///
/// Optional fields are parsed leniently: a value of the wrong type reads as
/// missing instead of rejecting the whole record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(alias = "id")]
    pub uid: String,
    #[serde(default, deserialize_with = "lenient")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub major: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub year: Option<i64>,
    #[serde(default, deserialize_with = "lenient_tags")]
    pub interests: Vec<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub bio: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub location_lat: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub location_lng: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub campus_id: Option<String>,
}

impl Candidate {
    /// A bare record with only an identifier.
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            ..Self::default()
        }
    }

    pub fn location(&self) -> Option<GeoPoint> {
        GeoPoint::checked(self.location_lat?, self.location_lng?)
    }

    fn has_bio(&self) -> bool {
        self.bio.as_deref().is_some_and(|b| !b.trim().is_empty())
    }
}

fn lenient<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

fn lenient_tags<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    })
}

/// Per-request matching preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    /// Hard cutoff radius. `None` disables distance filtering.
    #[serde(default, deserialize_with = "lenient")]
    pub radius_meters: Option<f64>,
    /// Cap on the candidate set after filtering.
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    /// Scored candidates below this are dropped by the matching pipeline.
    #[serde(default)]
    pub min_score: f64,
}

fn default_max_candidates() -> usize {
    DEFAULT_MAX_CANDIDATES
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            radius_meters: None,
            max_candidates: DEFAULT_MAX_CANDIDATES,
            min_score: 0.0,
        }
    }
}

impl Preferences {
    #[must_use]
    pub fn with_radius(mut self, meters: f64) -> Self {
        self.radius_meters = Some(meters);
        self
    }

    #[must_use]
    pub fn with_max_candidates(mut self, cap: usize) -> Self {
        self.max_candidates = cap;
        self
    }

    #[must_use]
    pub fn with_min_score(mut self, min: f64) -> Self {
        self.min_score = min;
        self
    }

    /// Reject invariant violations such as a negative radius.
    pub fn validate(&self) -> Result<()> {
        if let Some(radius) = self.radius_meters {
            if !radius.is_finite() || radius < 0.0 {
                return Err(Error::Validation(format!(
                    "radiusMeters must be a non-negative number, got {radius}"
                )));
            }
        }
        Ok(())
    }
}

/// Tunable weights for the compatibility score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    /// Bonus for the same declared major.
    pub major_bonus: f64,
    /// Bonus per shared interest tag, uncapped before the final clamp.
    pub interest_bonus: f64,
    /// Bonus for the same year of study.
    pub year_bonus: f64,
    /// Amount the year bonus drops per year of difference.
    pub year_step: f64,
    /// Bonus when both profiles carry a bio.
    pub bio_bonus: f64,
    /// Share of the radius inside which bonuses get full credit.
    pub full_credit_fraction: f64,
    /// Multiplier reached at the radius boundary. Must be positive.
    pub distance_floor: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            major_bonus: 25.0,
            interest_bonus: 10.0,
            year_bonus: 15.0,
            year_step: 5.0,
            bio_bonus: 5.0,
            full_credit_fraction: 0.5,
            distance_floor: 0.4,
        }
    }
}

impl ScoringWeights {
    pub fn validate(&self) -> Result<()> {
        let bonuses = [
            self.major_bonus,
            self.interest_bonus,
            self.year_bonus,
            self.year_step,
            self.bio_bonus,
        ];
        if bonuses.iter().any(|b| !b.is_finite() || *b < 0.0) {
            return Err(Error::Config("scoring bonuses must be non-negative".into()));
        }
        if !(0.0..1.0).contains(&self.full_credit_fraction) {
            return Err(Error::Config(
                "full_credit_fraction must be in [0, 1)".into(),
            ));
        }
        if !(self.distance_floor > 0.0 && self.distance_floor <= 1.0) {
            return Err(Error::Config("distance_floor must be in (0, 1]".into()));
        }
        Ok(())
    }
}

/// A compatibility score, always within `[0, 100]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Score(f64);

impl Score {
    pub const MIN: Score = Score(0.0);
    pub const MAX: Score = Score(100.0);

    /// Clamp `raw` into range; NaN becomes zero.
    pub fn clamped(raw: f64) -> Self {
        if raw.is_nan() {
            return Score::MIN;
        }
        Score(raw.clamp(0.0, 100.0))
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

/// How a score was assembled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    /// Sum of categorical bonuses before the distance multiplier.
    pub base: f64,
    pub multiplier: f64,
    /// `None` when either side has no usable location.
    pub distance_meters: Option<f64>,
    pub total: Score,
}

/// A candidate with its score, as produced by [`ScoringEngine::score_all`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    pub breakdown: ScoreBreakdown,
}

impl ScoredCandidate {
    pub fn score(&self) -> Score {
        self.breakdown.total
    }
}

/// Distance-aware compatibility scoring.
///
/// # Example
///
/// ```rust
/// use campus_agents::scoring::{Candidate, Preferences, ScoringEngine};
///
/// let engine = ScoringEngine::default();
/// let mut me = Candidate::new("me");
/// me.major = Some("CS".into());
/// let mut peer = Candidate::new("peer");
/// peer.major = Some("CS".into());
///
/// let score = engine.score(&me, &peer, &Preferences::default());
/// assert!(score.value() > 0.0 && score.value() <= 100.0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ScoringEngine {
    weights: ScoringWeights,
}

impl ScoringEngine {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    /// Drop the requester itself and anyone beyond the radius, pre-sort the
    /// rest by distance and keep at most `prefs.max_candidates`.
    ///
    /// Candidates without a usable location cannot be measured, so they are
    /// kept and sorted after every measured candidate. Equal distances are
    /// ordered by `uid` so the cut is deterministic.
    pub fn filter_candidates<'a>(
        &self,
        requester: &Candidate,
        candidates: &'a [Candidate],
        prefs: &Preferences,
    ) -> Result<Vec<&'a Candidate>> {
        prefs.validate()?;
        let origin = requester.location();

        let mut survivors: Vec<(Option<f64>, &'a Candidate)> = candidates
            .iter()
            .filter(|c| c.uid != requester.uid)
            .map(|c| (distance(origin, c), c))
            .filter(|(d, _)| match (d, prefs.radius_meters) {
                (Some(d), Some(radius)) => *d <= radius,
                _ => true,
            })
            .collect();

        survivors.sort_by(|(da, a), (db, b)| {
            let by_distance = match (da, db) {
                (Some(x), Some(y)) => x.total_cmp(y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            by_distance.then_with(|| a.uid.cmp(&b.uid))
        });
        survivors.truncate(prefs.max_candidates);

        Ok(survivors.into_iter().map(|(_, c)| c).collect())
    }

    /// Compatibility of `candidate` with `requester`, in `[0, 100]`.
    pub fn score(&self, requester: &Candidate, candidate: &Candidate, prefs: &Preferences) -> Score {
        self.score_breakdown(requester, candidate, prefs).total
    }

    pub fn score_breakdown(
        &self,
        requester: &Candidate,
        candidate: &Candidate,
        prefs: &Preferences,
    ) -> ScoreBreakdown {
        let w = &self.weights;
        let mut base = 0.0;

        if let (Some(a), Some(b)) = (&requester.major, &candidate.major) {
            if !a.trim().is_empty() && a.trim().eq_ignore_ascii_case(b.trim()) {
                base += w.major_bonus;
            }
        }

        base += w.interest_bonus * shared_tags(&requester.interests, &candidate.interests) as f64;

        if let (Some(a), Some(b)) = (requester.year, candidate.year) {
            let diff = a.abs_diff(b) as f64;
            base += (w.year_bonus - w.year_step * diff).max(0.0);
        }

        if requester.has_bio() && candidate.has_bio() {
            base += w.bio_bonus;
        }

        let distance_meters = distance(requester.location(), candidate);
        let multiplier = match (distance_meters, usable_radius(prefs)) {
            (Some(d), Some(radius)) => self.distance_multiplier(d, radius),
            _ => 1.0,
        };

        ScoreBreakdown {
            base,
            multiplier,
            distance_meters,
            total: Score::clamped(base * multiplier),
        }
    }

    /// 1.0 inside the full-credit zone, then a linear fade that reaches
    /// `distance_floor` exactly at `radius`. Never zero.
    pub fn distance_multiplier(&self, distance: f64, radius: f64) -> f64 {
        let floor = self.weights.distance_floor;
        let full = radius * self.weights.full_credit_fraction;
        if distance <= full {
            return 1.0;
        }
        let span = radius - full;
        if span <= 0.0 || distance >= radius {
            return floor;
        }
        1.0 - (1.0 - floor) * (distance - full) / span
    }

    /// Score every candidate against `requester`.
    pub fn score_all<'a, I>(
        &self,
        requester: &Candidate,
        candidates: I,
        prefs: &Preferences,
    ) -> Vec<ScoredCandidate>
    where
        I: IntoIterator<Item = &'a Candidate>,
    {
        candidates
            .into_iter()
            .map(|c| ScoredCandidate {
                breakdown: self.score_breakdown(requester, c, prefs),
                candidate: c.clone(),
            })
            .collect()
    }
}

/// Best score first, ties by `uid`; keep the first `top_n`.
pub fn rank(mut scored: Vec<ScoredCandidate>, top_n: usize) -> Vec<ScoredCandidate> {
    scored.sort_by(|a, b| {
        b.score()
            .value()
            .total_cmp(&a.score().value())
            .then_with(|| a.candidate.uid.cmp(&b.candidate.uid))
    });
    scored.truncate(top_n);
    scored
}

fn distance(origin: Option<GeoPoint>, candidate: &Candidate) -> Option<f64> {
    Some(haversine_meters(origin?, candidate.location()?))
}

fn usable_radius(prefs: &Preferences) -> Option<f64> {
    prefs.radius_meters.filter(|r| r.is_finite() && *r > 0.0)
}

fn shared_tags(a: &[String], b: &[String]) -> usize {
    let mine: HashSet<&str> = a.iter().map(String::as_str).collect();
    let theirs: HashSet<&str> = b.iter().map(String::as_str).collect();
    mine.intersection(&theirs).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    const RADIUS: f64 = 200_000.0;

    fn profile(uid: &str, major: Option<&str>, interests: &[&str]) -> Candidate {
        Candidate {
            uid: uid.to_string(),
            major: major.map(str::to_string),
            interests: interests.iter().map(|s| s.to_string()).collect(),
            location_lat: Some(0.0),
            location_lng: Some(0.0),
            ..Candidate::default()
        }
    }

    /// A point roughly `meters` north of the origin.
    fn north_of_origin(mut c: Candidate, meters: f64) -> Candidate {
        c.location_lat = Some((meters / geo::EARTH_RADIUS_METERS).to_degrees());
        c.location_lng = Some(0.0);
        c
    }

    #[test]
    fn test_shared_major_and_interest_beats_nothing_in_common() {
        let engine = ScoringEngine::default();
        let prefs = Preferences::default().with_radius(RADIUS);
        let requester = profile("r", Some("CS"), &["AI", "Robotics"]);
        let a = north_of_origin(profile("a", Some("CS"), &["AI"]), 1000.0);
        let b = north_of_origin(profile("b", Some("Math"), &[]), 1000.0);

        let sa = engine.score(&requester, &a, &prefs);
        let sb = engine.score(&requester, &b, &prefs);
        assert!(sa > sb, "{sa:?} should beat {sb:?}");
    }

    #[test]
    fn test_year_bonus_decreases_then_vanishes() {
        let engine = ScoringEngine::default();
        let prefs = Preferences::default();
        let mut requester = Candidate::new("r");
        requester.year = Some(2);

        let at = |year: i64| {
            let mut c = Candidate::new("c");
            c.year = Some(year);
            engine.score(&requester, &c, &prefs).value()
        };
        assert_eq!(at(2), 15.0);
        assert_eq!(at(3), 10.0);
        assert_eq!(at(0), 5.0);
        assert_eq!(at(5), 0.0);
        assert_eq!(at(9), 0.0);
    }

    #[test]
    fn test_missing_fields_contribute_zero() {
        let engine = ScoringEngine::default();
        let requester = profile("r", Some("CS"), &["AI"]);
        let bare = Candidate::new("bare");
        let breakdown = engine.score_breakdown(&requester, &bare, &Preferences::default().with_radius(RADIUS));
        assert_eq!(breakdown.base, 0.0);
        assert_eq!(breakdown.multiplier, 1.0);
        assert_eq!(breakdown.distance_meters, None);
    }

    #[test]
    fn test_malformed_optional_fields_parse_as_missing() {
        let c: Candidate = serde_json::from_value(json!({
            "uid": "x",
            "year": "third",
            "interests": ["AI", 7, null],
            "locationLat": "north",
            "major": "CS"
        }))
        .unwrap();
        assert_eq!(c.year, None);
        assert_eq!(c.interests, vec!["AI".to_string()]);
        assert_eq!(c.location(), None);
        assert_eq!(c.major.as_deref(), Some("CS"));
    }

    #[test]
    fn test_score_is_clamped() {
        let engine = ScoringEngine::default();
        let tags: Vec<String> = (0..40).map(|i| format!("t{i}")).collect();
        let tag_refs: Vec<&str> = tags.iter().map(String::as_str).collect();
        let requester = profile("r", Some("CS"), &tag_refs);
        let twin = profile("t", Some("CS"), &tag_refs);

        let breakdown = engine.score_breakdown(&requester, &twin, &Preferences::default());
        assert!(breakdown.base > 100.0);
        assert_eq!(breakdown.total, Score::MAX);
    }

    #[test]
    fn test_radius_boundary_multiplier() {
        let engine = ScoringEngine::default();
        let at_zero = engine.distance_multiplier(0.0, RADIUS);
        let at_edge = engine.distance_multiplier(RADIUS, RADIUS);
        let near_edge = engine.distance_multiplier(RADIUS * 0.99, RADIUS);

        assert_eq!(at_zero, 1.0);
        assert!(at_edge > 0.0 && at_edge < at_zero);
        assert!(near_edge > at_edge);
    }

    #[test]
    fn test_filter_excludes_beyond_radius_and_self() {
        let engine = ScoringEngine::default();
        let requester = profile("r", None, &[]);
        let candidates = vec![
            requester.clone(),
            north_of_origin(profile("near", None, &[]), 1_000.0),
            north_of_origin(profile("far", None, &[]), 5_000.0),
            Candidate::new("unlocated"),
        ];
        let prefs = Preferences::default().with_radius(2_000.0);

        let kept: Vec<&str> = engine
            .filter_candidates(&requester, &candidates, &prefs)
            .unwrap()
            .into_iter()
            .map(|c| c.uid.as_str())
            .collect();
        assert_eq!(kept, vec!["near", "unlocated"]);
    }

    #[test]
    fn test_filter_caps_after_distance_presort() {
        let engine = ScoringEngine::default();
        let requester = profile("r", None, &[]);
        let candidates = vec![
            north_of_origin(profile("c", None, &[]), 300.0),
            north_of_origin(profile("b", None, &[]), 100.0),
            north_of_origin(profile("a", None, &[]), 300.0),
            north_of_origin(profile("d", None, &[]), 900.0),
        ];
        let prefs = Preferences::default().with_max_candidates(3);

        let kept: Vec<&str> = engine
            .filter_candidates(&requester, &candidates, &prefs)
            .unwrap()
            .into_iter()
            .map(|c| c.uid.as_str())
            .collect();
        assert_eq!(kept, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_negative_radius_is_rejected() {
        let engine = ScoringEngine::default();
        let prefs = Preferences::default().with_radius(-1.0);
        let err = engine
            .filter_candidates(&Candidate::new("r"), &[], &prefs)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_rank_orders_by_score_then_uid() {
        let engine = ScoringEngine::default();
        let requester = profile("r", Some("CS"), &["AI"]);
        let candidates = vec![
            profile("z", Some("CS"), &[]),
            profile("y", None, &["AI"]),
            profile("x", Some("CS"), &[]),
        ];
        let scored = engine.score_all(&requester, &candidates, &Preferences::default());
        let ranked: Vec<String> = rank(scored, 2)
            .into_iter()
            .map(|s| s.candidate.uid)
            .collect();
        assert_eq!(ranked, vec!["x".to_string(), "z".to_string()]);
    }

    #[test]
    fn test_weights_validation() {
        assert!(ScoringWeights::default().validate().is_ok());
        let bad = ScoringWeights {
            distance_floor: 0.0,
            ..ScoringWeights::default()
        };
        assert!(bad.validate().is_err());
    }

    fn arb_candidate(uid: &'static str) -> impl Strategy<Value = Candidate> {
        (
            proptest::option::of(prop::sample::select(vec!["CS", "Math", "Art"])),
            proptest::option::of(1i64..8),
            proptest::collection::vec(prop::sample::select(vec!["AI", "Music", "Chess", "Go", "Film"]), 0..5),
            proptest::option::of((-1.0f64..1.0, -1.0f64..1.0)),
        )
            .prop_map(move |(major, year, interests, loc)| Candidate {
                uid: uid.to_string(),
                major: major.map(str::to_string),
                year,
                interests: interests.into_iter().map(str::to_string).collect(),
                location_lat: loc.map(|l| l.0),
                location_lng: loc.map(|l| l.1),
                ..Candidate::default()
            })
    }

    proptest! {
        #[test]
        fn score_stays_in_range(
            r in arb_candidate("r"),
            c in arb_candidate("c"),
            radius in proptest::option::of(0.0f64..300_000.0),
        ) {
            let engine = ScoringEngine::default();
            let prefs = Preferences { radius_meters: radius, ..Preferences::default() };
            let s = engine.score(&r, &c, &prefs).value();
            prop_assert!((0.0..=100.0).contains(&s));
        }

        #[test]
        fn score_is_idempotent(r in arb_candidate("r"), c in arb_candidate("c")) {
            let engine = ScoringEngine::default();
            let prefs = Preferences::default().with_radius(RADIUS);
            prop_assert_eq!(
                engine.score_breakdown(&r, &c, &prefs),
                engine.score_breakdown(&r, &c, &prefs)
            );
        }

        #[test]
        fn score_monotone_in_shared_tags(
            base in arb_candidate("c"),
            shared in 0usize..6,
        ) {
            let engine = ScoringEngine::default();
            let prefs = Preferences::default().with_radius(RADIUS);
            let pool = ["p0", "p1", "p2", "p3", "p4", "p5", "p6"];
            let mut requester = base.clone();
            requester.uid = "r".into();
            requester.interests = pool.iter().map(|s| s.to_string()).collect();

            let mut fewer = base.clone();
            fewer.interests = pool[..shared].iter().map(|s| s.to_string()).collect();
            let mut more = base;
            more.interests = pool[..shared + 1].iter().map(|s| s.to_string()).collect();

            prop_assert!(
                engine.score(&requester, &more, &prefs) >= engine.score(&requester, &fewer, &prefs)
            );
        }
    }
}
