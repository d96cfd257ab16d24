//! Record normalization.
//!
//! Unusable grades and levels degrade to zero rather than failing, so a
//! student's statistics can be skewed by bad rows. Every substitution is
//! logged; callers that would rather drop such rows use [`try_normalize`].

use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::models::{AcademicRecord, NormalizedRecord, RawValue, LEVEL_COUNT};

const MAX_GRADE: f64 = 20.0;

/// Coerce a raw record into canonical numeric form. Never fails.
pub fn normalize(record: &AcademicRecord) -> NormalizedRecord {
    let grade = parse_grade(record.grade.as_ref()).unwrap_or_else(|err| {
        warn!(error = %err, "substituting 0 for unusable grade");
        0.0
    });
    let level = parse_level(record.level.as_ref()).unwrap_or_else(|err| {
        warn!(error = %err, "treating record as unclassified");
        0
    });
    NormalizedRecord { grade, level }
}

/// Strict variant of [`normalize`]: a missing or unparsable grade, or a
/// level that is present but unparsable, is an error instead of a zero.
pub fn try_normalize(record: &AcademicRecord) -> Result<NormalizedRecord> {
    Ok(NormalizedRecord {
        grade: parse_grade(record.grade.as_ref())?,
        level: parse_level(record.level.as_ref())?,
    })
}

/// Normalize a whole history, keeping every row.
pub fn normalize_all(records: &[AcademicRecord]) -> Vec<NormalizedRecord> {
    records.iter().map(normalize).collect()
}

fn parse_grade(raw: Option<&RawValue>) -> Result<f64> {
    let value = match raw {
        None => None,
        Some(RawValue::Number(value)) => Some(*value),
        Some(RawValue::Text(text)) => parse_decimal(text),
    };

    match value {
        Some(grade) if grade.is_finite() => {
            if !(0.0..=MAX_GRADE).contains(&grade) {
                debug!(grade, "grade outside the 0-20 scale");
            }
            Ok(grade)
        }
        _ => Err(malformed("grade", raw)),
    }
}

/// Out-of-range levels collapse to 0; only unparsable input is an error.
fn parse_level(raw: Option<&RawValue>) -> Result<u8> {
    let level = match raw {
        None => return Ok(0),
        Some(RawValue::Number(value)) if value.is_finite() => value.trunc() as i64,
        Some(RawValue::Number(_)) => return Err(malformed("level", raw)),
        Some(RawValue::Text(text)) => {
            let text = text.trim();
            if text.is_empty() {
                return Ok(0);
            }
            match text.parse::<i64>() {
                Ok(level) => level,
                Err(_) => match parse_decimal(text) {
                    Some(value) if value.is_finite() => value.trunc() as i64,
                    _ => return Err(malformed("level", raw)),
                },
            }
        }
    };

    if (1..=LEVEL_COUNT as i64).contains(&level) {
        Ok(level as u8)
    } else {
        debug!(level, "level outside 1-8, record left unclassified");
        Ok(0)
    }
}

/// Accepts both `14.5` and the spreadsheet-style `14,5`. The whole cell must
/// parse; `15 pts` is rejected.
fn parse_decimal(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    text.parse::<f64>()
        .ok()
        .or_else(|| text.replace(',', ".").parse::<f64>().ok())
}

fn malformed(field: &'static str, raw: Option<&RawValue>) -> PipelineError {
    PipelineError::MalformedRecord {
        field,
        value: raw.map(ToString::to_string).unwrap_or_else(|| "<missing>".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(grade: Option<RawValue>, level: Option<RawValue>) -> AcademicRecord {
        AcademicRecord {
            grade,
            level,
            state: None,
        }
    }

    #[test]
    fn parses_numbers_and_text() {
        let normalized = normalize(&record(Some("15.25".into()), Some("3".into())));
        assert_eq!(normalized, NormalizedRecord { grade: 15.25, level: 3 });

        let normalized = normalize(&AcademicRecord::new(12.0, 8i64));
        assert_eq!(normalized, NormalizedRecord { grade: 12.0, level: 8 });
    }

    #[test]
    fn accepts_comma_decimal_grades() {
        let normalized = normalize(&record(Some("14,5".into()), Some(2i64.into())));
        assert_eq!(normalized.grade, 14.5);
    }

    #[test]
    fn unusable_grade_becomes_zero() {
        assert_eq!(normalize(&record(None, Some(1i64.into()))).grade, 0.0);
        assert_eq!(normalize(&record(Some("n/a".into()), Some(1i64.into()))).grade, 0.0);
        assert_eq!(normalize(&record(Some(f64::NAN.into()), Some(1i64.into()))).grade, 0.0);
        assert_eq!(normalize(&record(Some(f64::INFINITY.into()), Some(1i64.into()))).grade, 0.0);
    }

    #[test]
    fn levels_truncate_like_integers() {
        assert_eq!(normalize(&record(Some(10.0.into()), Some(3.7.into()))).level, 3);
        assert_eq!(normalize(&record(Some(10.0.into()), Some("4.0".into()))).level, 4);
    }

    #[test]
    fn out_of_range_or_garbage_levels_are_unclassified() {
        assert_eq!(normalize(&record(Some(10.0.into()), Some(9i64.into()))).level, 0);
        assert_eq!(normalize(&record(Some(10.0.into()), Some((-1i64).into()))).level, 0);
        assert_eq!(normalize(&record(Some(10.0.into()), Some("NIVEL".into()))).level, 0);
        assert_eq!(normalize(&record(Some(10.0.into()), None)).level, 0);
    }

    #[test]
    fn trailing_text_is_not_read_as_a_number() {
        let normalized = normalize(&record(Some("15 pts".into()), Some("3abc".into())));
        assert_eq!(normalized, NormalizedRecord { grade: 0.0, level: 0 });

        let err = try_normalize(&record(Some("15 pts".into()), Some(1i64.into()))).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedRecord { field: "grade", .. }));
    }

    #[test]
    fn strict_mode_reports_malformed_fields() {
        let err = try_normalize(&record(Some("abc".into()), Some(1i64.into()))).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedRecord { field: "grade", .. }));

        let err = try_normalize(&record(Some(12.0.into()), Some("x".into()))).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedRecord { field: "level", .. }));

        let err = try_normalize(&record(None, Some(1i64.into()))).unwrap_err();
        assert!(err.to_string().contains("<missing>"));

        let ok = try_normalize(&record(Some(12.0.into()), Some(11i64.into()))).unwrap();
        assert_eq!(ok, NormalizedRecord { grade: 12.0, level: 0 });
    }

    fn raw_value() -> impl Strategy<Value = Option<RawValue>> {
        prop_oneof![
            Just(None),
            any::<f64>().prop_map(|v| Some(RawValue::Number(v))),
            (-5i64..15).prop_map(|v| Some(RawValue::Number(v as f64))),
            "[ 0-9.,a-z-]{0,6}".prop_map(|s| Some(RawValue::Text(s))),
        ]
    }

    proptest! {
        #[test]
        fn normalization_is_idempotent(grade in raw_value(), level in raw_value()) {
            let once = normalize(&record(grade, level));
            let twice = normalize(&AcademicRecord::from(once));
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn normalized_values_are_finite_and_bounded(grade in raw_value(), level in raw_value()) {
            let normalized = normalize(&record(grade, level));
            prop_assert!(normalized.grade.is_finite());
            prop_assert!(normalized.level as usize <= LEVEL_COUNT);
        }
    }
}
