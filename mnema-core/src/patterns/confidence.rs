//! Confidence scoring
//!
//! Pure functions turning raw usage signals into the normalized confidence
//! value stored on a pattern. The weights, the usage curve, the recency
//! steps, and the label thresholds are contract values; downstream consumers
//! rank and prune on them.
//!
//! ```text
//! confidence = 0.40 * match_quality
//!            + 0.30 * usage_score        usage_score = min(1, log10(n+1)/2)
//!            + 0.20 * success_rate
//!            + 0.10 * recency_score
//! ```

use crate::types::{ConfidenceFactors, ConfidenceLabel};
use chrono::{DateTime, Utc};

const WEIGHT_MATCH: f64 = 0.40;
const WEIGHT_USAGE: f64 = 0.30;
const WEIGHT_SUCCESS: f64 = 0.20;
const WEIGHT_RECENCY: f64 = 0.10;

/// Compute a confidence score in [0, 1] as of now.
pub fn score(factors: &ConfidenceFactors) -> f64 {
    score_as_of(factors, Utc::now())
}

/// Compute a confidence score in [0, 1] as of a given instant.
pub fn score_as_of(factors: &ConfidenceFactors, now: DateTime<Utc>) -> f64 {
    let raw = WEIGHT_MATCH * factors.match_quality
        + WEIGHT_USAGE * usage_score(factors.usage_count)
        + WEIGHT_SUCCESS * factors.success_rate
        + WEIGHT_RECENCY * recency_score(factors.last_used, now);
    raw.clamp(0.0, 1.0)
}

/// Usage saturates logarithmically: ~100 uses score 1.0, one use ~0.15.
pub fn usage_score(usage_count: u64) -> f64 {
    (((usage_count + 1) as f64).log10() / 2.0).min(1.0)
}

/// Step function over days since last use. Unknown history sits in the
/// middle rather than being treated as fresh or dead.
pub fn recency_score(last_used: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    let Some(last_used) = last_used else {
        return 0.5;
    };

    let days = now.signed_duration_since(last_used).num_days();
    match days {
        i64::MIN..=7 => 1.0,
        8..=30 => 0.8,
        31..=90 => 0.6,
        91..=180 => 0.4,
        _ => 0.2,
    }
}

/// Score as an integer percentage, the form surfaced to consumers.
pub fn percent(score: f64) -> u8 {
    (score.clamp(0.0, 1.0) * 100.0).round() as u8
}

/// Discrete label for a score; thresholds per [`ConfidenceLabel`].
pub fn label(score: f64) -> ConfidenceLabel {
    ConfidenceLabel::from_percent(percent(score))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn days_ago(days: i64) -> Option<DateTime<Utc>> {
        Some(now() - chrono::Duration::days(days))
    }

    #[test]
    fn test_worked_example_scores_ninety_percent() {
        // match_quality=0.8, usage=99, success=0.9, last used 3 days ago:
        // 0.40*0.8 + 0.30*min(1, log10(100)/2) + 0.20*0.9 + 0.10*1.0 = 0.90
        let factors = ConfidenceFactors {
            match_quality: 0.8,
            usage_count: 99,
            success_rate: 0.9,
            last_used: days_ago(3),
        };

        let score = score_as_of(&factors, now());
        assert!((score - 0.90).abs() < 1e-9, "score was {}", score);
        assert_eq!(percent(score), 90);
        assert_eq!(label(score), ConfidenceLabel::VeryHigh);
    }

    #[test]
    fn test_usage_score_curve() {
        assert_eq!(usage_score(0), 0.0);
        assert!((usage_score(9) - 0.5).abs() < 1e-9);
        assert!((usage_score(99) - 1.0).abs() < 1e-9);
        // Saturates at 1.0 beyond 99 uses.
        assert_eq!(usage_score(10_000), 1.0);
    }

    #[test]
    fn test_recency_steps() {
        assert_eq!(recency_score(days_ago(0), now()), 1.0);
        assert_eq!(recency_score(days_ago(7), now()), 1.0);
        assert_eq!(recency_score(days_ago(8), now()), 0.8);
        assert_eq!(recency_score(days_ago(30), now()), 0.8);
        assert_eq!(recency_score(days_ago(31), now()), 0.6);
        assert_eq!(recency_score(days_ago(90), now()), 0.6);
        assert_eq!(recency_score(days_ago(91), now()), 0.4);
        assert_eq!(recency_score(days_ago(180), now()), 0.4);
        assert_eq!(recency_score(days_ago(181), now()), 0.2);
        assert_eq!(recency_score(days_ago(365), now()), 0.2);
        assert_eq!(recency_score(None, now()), 0.5);
    }

    #[test]
    fn test_score_is_clamped() {
        let factors = ConfidenceFactors {
            match_quality: 2.0,
            usage_count: 1_000_000,
            success_rate: 2.0,
            last_used: days_ago(0),
        };
        assert_eq!(score_as_of(&factors, now()), 1.0);

        let factors = ConfidenceFactors {
            match_quality: -1.0,
            usage_count: 0,
            success_rate: -1.0,
            last_used: days_ago(365),
        };
        assert_eq!(score_as_of(&factors, now()), 0.0);
    }

    #[test]
    fn test_label_boundaries() {
        assert_eq!(label(0.90), ConfidenceLabel::VeryHigh);
        assert_eq!(label(0.75), ConfidenceLabel::High);
        assert_eq!(label(0.50), ConfidenceLabel::Medium);
        assert_eq!(label(0.30), ConfidenceLabel::Low);
        assert_eq!(label(0.29), ConfidenceLabel::VeryLow);
    }
}
