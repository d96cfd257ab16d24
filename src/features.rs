use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::models::{AcademicRecord, FeatureVector, NormalizedRecord, LEVEL_COUNT};
use crate::normalize;

/// Build the classifier feature vector for one student.
///
/// Mean and population standard deviation cover every record; the per-level
/// passed/failed counters only cover records with a level in 1..=8.
pub fn extract(records: &[NormalizedRecord]) -> Result<FeatureVector> {
    if records.is_empty() {
        return Err(PipelineError::EmptyInput);
    }

    let count = records.len() as f64;
    let mean = records.iter().map(|record| record.grade).sum::<f64>() / count;
    let variance = records
        .iter()
        .map(|record| (record.grade - mean).powi(2))
        .sum::<f64>()
        / count;

    let stddev = variance.sqrt();
    // Finite grades can still overflow the sums; the classifier only takes numbers.
    if !mean.is_finite() || !stddev.is_finite() {
        return Err(PipelineError::MalformedRecord {
            field: "grade",
            value: format!("mean {mean}, stddev {stddev}"),
        });
    }

    let mut values = [0.0; FeatureVector::LEN];
    values[FeatureVector::MEAN] = mean;
    values[FeatureVector::STDDEV] = stddev;

    let mut unclassified = 0usize;
    for record in records {
        match record.level_index() {
            Some(index) => {
                let level = index + 1;
                let slot = if record.passed() {
                    FeatureVector::passed_index(level)
                } else {
                    FeatureVector::failed_index(level)
                };
                values[slot] += 1.0;
            }
            None => unclassified += 1,
        }
    }

    if unclassified > 0 {
        debug!(unclassified, "records without a level excluded from level counters");
    }

    Ok(FeatureVector::from_array(values))
}

/// Normalize a raw history and extract its features in one step.
pub fn extract_from_history(history: &[AcademicRecord]) -> Result<FeatureVector> {
    extract(&normalize::normalize_all(history))
}

/// Total passed and failed counts across all levels.
pub fn level_totals(features: &FeatureVector) -> (u32, u32) {
    (1..=LEVEL_COUNT).fold((0, 0), |(passed, failed), level| {
        (passed + features.passed(level), failed + features.failed(level))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rec(grade: f64, level: u8) -> NormalizedRecord {
        NormalizedRecord { grade, level }
    }

    #[test]
    fn matches_worked_example() {
        let features = extract(&[rec(15.0, 1), rec(10.0, 1), rec(16.0, 2)]).unwrap();

        assert!((features.mean() - 13.6667).abs() < 0.01);
        assert!((features.stddev() - 2.6247).abs() < 0.01);
        assert_eq!(features.passed(1), 1);
        assert_eq!(features.failed(1), 1);
        assert_eq!(features.passed(2), 1);
        assert_eq!(features.failed(2), 0);
        for level in 3..=LEVEL_COUNT {
            assert_eq!(features.passed(level), 0);
            assert_eq!(features.failed(level), 0);
        }
    }

    #[test]
    fn empty_history_is_rejected() {
        assert!(matches!(extract(&[]), Err(PipelineError::EmptyInput)));
        assert!(matches!(extract_from_history(&[]), Err(PipelineError::EmptyInput)));
    }

    #[test]
    fn pass_threshold_is_inclusive() {
        let features = extract(&[rec(14.1, 4), rec(14.09, 4)]).unwrap();
        assert_eq!(features.passed(4), 1);
        assert_eq!(features.failed(4), 1);
    }

    #[test]
    fn unclassified_records_only_affect_moments() {
        let with_unclassified = extract(&[rec(18.0, 3), rec(8.0, 0)]).unwrap();
        let classified_only = extract(&[rec(18.0, 3)]).unwrap();

        assert_eq!(with_unclassified.mean(), 13.0);
        assert_eq!(with_unclassified.stddev(), 5.0);
        assert_eq!(level_totals(&with_unclassified), level_totals(&classified_only));
        assert_eq!(
            &with_unclassified.as_slice()[2..],
            &classified_only.as_slice()[2..]
        );
    }

    #[test]
    fn extracts_from_raw_history() {
        let history = vec![
            AcademicRecord::new("15", "1"),
            AcademicRecord::new(10.0, 1i64),
            AcademicRecord::new("16.0", 2i64),
        ];
        let features = extract_from_history(&history).unwrap();
        assert_eq!(level_totals(&features), (2, 1));
        assert_eq!(features.named()["APRO_N2"], 1.0);
    }

    #[test]
    fn overflowing_grades_are_rejected() {
        let history = vec![AcademicRecord::new(1e308, 1i64), AcademicRecord::new(1e308, 1i64)];
        let err = extract_from_history(&history).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedRecord { field: "grade", .. }));
    }

    proptest! {
        #[test]
        fn vector_shape_and_mean_bounds(
            records in prop::collection::vec((0.0f64..20.0, 0u8..=10), 1..60)
        ) {
            let records: Vec<NormalizedRecord> = records
                .into_iter()
                .map(|(grade, level)| rec(grade, if level as usize > LEVEL_COUNT { 0 } else { level }))
                .collect();
            let features = extract(&records).unwrap();

            prop_assert_eq!(features.as_slice().len(), 18);
            let min = records.iter().map(|r| r.grade).fold(f64::INFINITY, f64::min);
            let max = records.iter().map(|r| r.grade).fold(f64::NEG_INFINITY, f64::max);
            prop_assert!(features.mean() >= min - 1e-9 && features.mean() <= max + 1e-9);
            prop_assert!(features.stddev() >= 0.0);

            let classified = records.iter().filter(|r| r.level_index().is_some()).count() as u32;
            let (passed, failed) = level_totals(&features);
            prop_assert_eq!(passed + failed, classified);
        }

        #[test]
        fn record_order_does_not_matter(
            records in prop::collection::vec((0.0f64..20.0, 1u8..=8), 1..30)
        ) {
            let forward: Vec<NormalizedRecord> = records.iter().map(|&(g, l)| rec(g, l)).collect();
            let mut reversed = forward.clone();
            reversed.reverse();

            let a = extract(&forward).unwrap();
            let b = extract(&reversed).unwrap();
            prop_assert!((a.mean() - b.mean()).abs() < 1e-9);
            prop_assert!((a.stddev() - b.stddev()).abs() < 1e-9);
            prop_assert_eq!(&a.as_slice()[2..], &b.as_slice()[2..]);
        }
    }
}
