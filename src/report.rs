use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::batch::BatchOutcome;
use crate::models::{PredictionView, RiskTier, StudentPrediction, StudentWithHistory};

#[derive(Debug, Clone, PartialEq)]
pub struct TierSummary {
    pub tier: RiskTier,
    pub count: usize,
    pub avg_probability: f64,
}

/// Count and mean probability per tier, ALTO first.
pub fn summarize_by_tier<'a>(
    predictions: impl IntoIterator<Item = &'a StudentPrediction>,
) -> Vec<TierSummary> {
    let mut totals = [(0usize, 0.0f64); 3];

    for entry in predictions {
        let slot = tier_slot(entry.prediction.risk_tier);
        totals[slot].0 += 1;
        totals[slot].1 += entry.prediction.probability;
    }

    [RiskTier::Alto, RiskTier::Medio, RiskTier::Bajo]
        .into_iter()
        .zip(totals)
        .filter(|(_, (count, _))| *count > 0)
        .map(|(tier, (count, total))| TierSummary {
            tier,
            count,
            avg_probability: total / count as f64,
        })
        .collect()
}

fn tier_slot(tier: RiskTier) -> usize {
    match tier {
        RiskTier::Alto => 0,
        RiskTier::Medio => 1,
        RiskTier::Bajo => 2,
    }
}

pub fn build_report(
    students: &[StudentWithHistory],
    outcome: &BatchOutcome,
    generated_at: DateTime<Utc>,
) -> String {
    let batch_predictions: Vec<&StudentPrediction> = students
        .iter()
        .filter_map(|student| outcome.fresh_prediction(&student.id))
        .collect();
    let summaries = summarize_by_tier(batch_predictions.iter().copied());

    let mut output = String::new();

    let _ = writeln!(output, "# Dropout Risk Report");
    let _ = writeln!(
        output,
        "Generated {} for {} students ({} predicted, {} chunks)",
        generated_at.format("%Y-%m-%d %H:%M UTC"),
        students.len(),
        batch_predictions.len(),
        outcome.total_chunks
    );
    if outcome.cancelled {
        let _ = writeln!(output);
        let _ = writeln!(output, "_Run was cancelled before every chunk was sent._");
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Risk Tier Mix");
    if summaries.is_empty() {
        let _ = writeln!(output, "No predictions produced in this run.");
    } else {
        for summary in summaries.iter() {
            let _ = writeln!(
                output,
                "- {}: {} students (avg probability {:.2})",
                summary.tier, summary.count, summary.avg_probability
            );
        }
    }

    let mut ranked = batch_predictions.clone();
    ranked.sort_by(|a, b| {
        b.prediction
            .probability
            .partial_cmp(&a.prediction.probability)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.student_id.cmp(&b.student_id))
    });

    let _ = writeln!(output);
    let _ = writeln!(output, "## Highest Risk Students");
    let at_risk: Vec<_> = ranked
        .iter()
        .filter(|entry| entry.prediction.risk_tier != RiskTier::Bajo)
        .take(10)
        .collect();
    if at_risk.is_empty() {
        let _ = writeln!(output, "No students above the low-risk tier.");
    } else {
        for entry in at_risk {
            let _ = writeln!(
                output,
                "- {} ({}, level {}) {}",
                entry.full_name,
                entry.student_id,
                entry.level.as_deref().unwrap_or("n/a"),
                PredictionView::Predicted(entry.prediction)
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Not Predicted");
    let missing: Vec<&StudentWithHistory> = students
        .iter()
        .filter(|student| outcome.view(&student.id) == PredictionView::NotPredicted)
        .collect();
    if missing.is_empty() {
        let _ = writeln!(output, "Every student has a prediction.");
    } else {
        for student in missing {
            let reason = if student.history.is_empty() {
                "no academic history"
            } else {
                "classifier unavailable"
            };
            let _ = writeln!(
                output,
                "- {} ({}): {} ({reason})",
                student.full_name,
                student.id,
                PredictionView::NotPredicted
            );
        }
    }

    if !outcome.failed_chunks.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Failed Chunks");
        for failure in outcome.failed_chunks.iter() {
            let _ = writeln!(
                output,
                "- chunk {} ({} students): {}",
                failure.index + 1,
                failure.student_ids.len(),
                failure.reason
            );
        }
    }

    output
}
