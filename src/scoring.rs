//! Rule-based dropout scoring and the canonical risk tier table.
//!
//! The tier table is `> 0.7` ALTO, `> 0.4` MEDIO, otherwise BAJO. The
//! external model service and the old coloring path use `>= 0.5` / `>= 0.4`
//! instead; tiers coming from there are recomputed with this table.

use crate::error::Result;
use crate::models::{
    AcademicRecord, AggregateStats, GradeScale, PredictionResult, RawValue, RiskTier,
};
use crate::normalize;

/// Average grade below which a student is flagged (0-20 scale).
pub const LOW_AVERAGE_CUTOFF: f64 = 14.0;
pub const LOW_AVERAGE_WEIGHT: f64 = 0.3;

/// Failed-course count above which a student is flagged.
pub const FAILED_COUNT_CUTOFF: u32 = 2;
pub const FAILED_COUNT_WEIGHT: f64 = 0.3;

/// Share of failed courses above which a student is flagged.
pub const FAILED_RATIO_CUTOFF: f64 = 0.3;
pub const FAILED_RATIO_WEIGHT: f64 = 0.2;

pub const HIGH_RISK_ABOVE: f64 = 0.7;
pub const MEDIUM_RISK_ABOVE: f64 = 0.4;

const FAILED_STATE: &str = "REPROBADO";

impl AggregateStats {
    /// Aggregate a raw history the way the academic-history table is
    /// summarised: mean grade, count of failed courses, count of courses.
    /// Rows without a recorded state count as failed when below the pass mark.
    /// Rows with a blank grade cell are left out of the average only.
    pub fn from_history(records: &[AcademicRecord]) -> Result<Self> {
        let mut grade_sum = 0.0;
        let mut graded = 0u32;
        let mut failed = 0u32;

        for record in records {
            let normalized = normalize::normalize(record);
            if has_grade(record) {
                grade_sum += normalized.grade;
                graded += 1;
            }
            let is_failed = match record.state.as_deref().map(str::trim) {
                Some(state) if !state.is_empty() => state.eq_ignore_ascii_case(FAILED_STATE),
                _ => !normalized.passed(),
            };
            if is_failed {
                failed += 1;
            }
        }

        let total = records.len() as u32;
        let average = if graded == 0 { 0.0 } else { grade_sum / graded as f64 };
        AggregateStats::new(average, GradeScale::Twenty, failed, total)
    }
}

fn has_grade(record: &AcademicRecord) -> bool {
    match &record.grade {
        Some(RawValue::Number(_)) => true,
        Some(RawValue::Text(text)) => !text.trim().is_empty(),
        None => false,
    }
}

/// Additive weighted rule; each triggered condition adds its weight.
/// Ranges from 0.0 to 0.8 and is not clamped.
pub fn score(stats: &AggregateStats) -> f64 {
    let mut probability = 0.0;

    if stats.average_grade() < LOW_AVERAGE_CUTOFF {
        probability += LOW_AVERAGE_WEIGHT;
    }
    if stats.failed_count() > FAILED_COUNT_CUTOFF {
        probability += FAILED_COUNT_WEIGHT;
    }
    if stats
        .failed_ratio()
        .is_some_and(|ratio| ratio > FAILED_RATIO_CUTOFF)
    {
        probability += FAILED_RATIO_WEIGHT;
    }

    probability
}

pub fn classify(probability: f64) -> RiskTier {
    if probability > HIGH_RISK_ABOVE {
        RiskTier::Alto
    } else if probability > MEDIUM_RISK_ABOVE {
        RiskTier::Medio
    } else {
        RiskTier::Bajo
    }
}

/// Score and classify in one step.
pub fn predict(stats: &AggregateStats) -> PredictionResult {
    let probability = score(stats);
    PredictionResult {
        probability,
        risk_tier: classify(probability),
    }
}
