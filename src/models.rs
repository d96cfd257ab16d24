use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

pub type StudentId = String;

/// Predictions keyed by student, ordered for stable reports.
pub type PredictionMap = BTreeMap<StudentId, StudentPrediction>;

/// Number of academic levels tracked per student.
pub const LEVEL_COUNT: usize = 8;

/// Length of the classifier feature vector.
pub const FEATURE_COUNT: usize = 2 + 2 * LEVEL_COUNT;

/// Final grade at or above which a course counts as passed (0-20 scale).
pub const PASS_THRESHOLD: f64 = 14.1;

/// A raw cell as it arrives from storage, a spreadsheet, or a JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Number(f64),
    Text(String),
}

impl From<f64> for RawValue {
    fn from(value: f64) -> Self {
        RawValue::Number(value)
    }
}

impl From<i64> for RawValue {
    fn from(value: i64) -> Self {
        RawValue::Number(value as f64)
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::Text(value.to_string())
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Number(value) => write!(f, "{value}"),
            RawValue::Text(value) => f.write_str(value),
        }
    }
}

/// One student-course-term row, exactly as fetched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcademicRecord {
    #[serde(default)]
    pub grade: Option<RawValue>,
    #[serde(default)]
    pub level: Option<RawValue>,
    /// `APROBADO` / `REPROBADO` when the source carries it.
    #[serde(default)]
    pub state: Option<String>,
}

impl AcademicRecord {
    pub fn new(grade: impl Into<RawValue>, level: impl Into<RawValue>) -> Self {
        Self {
            grade: Some(grade.into()),
            level: Some(level.into()),
            state: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub grade: f64,
    /// 1..=8, or 0 when the level is unknown.
    pub level: u8,
}

impl NormalizedRecord {
    pub fn passed(&self) -> bool {
        self.grade >= PASS_THRESHOLD
    }

    /// Zero-based bucket index, `None` for unclassified records.
    pub fn level_index(&self) -> Option<usize> {
        match self.level as usize {
            level @ 1..=LEVEL_COUNT => Some(level - 1),
            _ => None,
        }
    }
}

impl From<NormalizedRecord> for AcademicRecord {
    fn from(record: NormalizedRecord) -> Self {
        AcademicRecord::new(record.grade, record.level as i64)
    }
}

/// The fixed-order vector the external classifier consumes positionally:
/// `[mean, stddev, passed_L1, failed_L1, ..., passed_L8, failed_L8]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector([f64; FEATURE_COUNT]);

impl FeatureVector {
    pub const LEN: usize = FEATURE_COUNT;
    pub const MEAN: usize = 0;
    pub const STDDEV: usize = 1;

    pub const NAMES: [&'static str; FEATURE_COUNT] = [
        "PROMEDIO", "STD", "APRO_N1", "PERD_N1", "APRO_N2", "PERD_N2", "APRO_N3", "PERD_N3",
        "APRO_N4", "PERD_N4", "APRO_N5", "PERD_N5", "APRO_N6", "PERD_N6", "APRO_N7", "PERD_N7",
        "APRO_N8", "PERD_N8",
    ];

    pub(crate) fn from_array(values: [f64; FEATURE_COUNT]) -> Self {
        Self(values)
    }

    /// Position of the passed counter for `level` (1-based).
    pub const fn passed_index(level: usize) -> usize {
        2 * level
    }

    /// Position of the failed counter for `level` (1-based).
    pub const fn failed_index(level: usize) -> usize {
        2 * level + 1
    }

    pub fn mean(&self) -> f64 {
        self.0[Self::MEAN]
    }

    pub fn stddev(&self) -> f64 {
        self.0[Self::STDDEV]
    }

    /// Passed count at `level`; zero for levels outside 1..=8.
    pub fn passed(&self, level: usize) -> u32 {
        if (1..=LEVEL_COUNT).contains(&level) {
            self.0[Self::passed_index(level)] as u32
        } else {
            0
        }
    }

    /// Failed count at `level`; zero for levels outside 1..=8.
    pub fn failed(&self, level: usize) -> u32 {
        if (1..=LEVEL_COUNT).contains(&level) {
            self.0[Self::failed_index(level)] as u32
        } else {
            0
        }
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn named(&self) -> BTreeMap<&'static str, f64> {
        Self::NAMES.iter().copied().zip(self.0).collect()
    }
}

/// Scale an average grade is expressed in before it enters `AggregateStats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradeScale {
    /// 0-20, the grading scale used throughout the pipeline.
    Twenty,
    /// 0-1 fraction of the maximum grade.
    Unit,
}

impl GradeScale {
    pub fn to_twenty(self, value: f64) -> f64 {
        match self {
            GradeScale::Twenty => value,
            GradeScale::Unit => value * 20.0,
        }
    }
}

/// Aggregate academic statistics consumed by the rule-based scorer.
/// `average_grade` is always on the 0-20 scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AggregateStats {
    average_grade: f64,
    failed_count: u32,
    total_count: u32,
}

impl AggregateStats {
    pub fn new(average_grade: f64, scale: GradeScale, failed_count: u32, total_count: u32) -> Result<Self> {
        if failed_count > total_count {
            return Err(PipelineError::InvalidStats {
                failed: failed_count,
                total: total_count,
            });
        }
        Ok(Self {
            average_grade: scale.to_twenty(average_grade),
            failed_count,
            total_count,
        })
    }

    pub fn average_grade(&self) -> f64 {
        self.average_grade
    }

    pub fn failed_count(&self) -> u32 {
        self.failed_count
    }

    pub fn total_count(&self) -> u32 {
        self.total_count
    }

    pub fn failed_ratio(&self) -> Option<f64> {
        if self.total_count == 0 {
            None
        } else {
            Some(self.failed_count as f64 / self.total_count as f64)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskTier {
    Alto,
    Medio,
    Bajo,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::Alto => "ALTO",
            RiskTier::Medio => "MEDIO",
            RiskTier::Bajo => "BAJO",
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskTier {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "ALTO" | "HIGH" => Ok(RiskTier::Alto),
            "MEDIO" | "MEDIUM" => Ok(RiskTier::Medio),
            "BAJO" | "LOW" => Ok(RiskTier::Bajo),
            _ => Err(PipelineError::MalformedRecord {
                field: "risk_tier",
                value: value.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub probability: f64,
    pub risk_tier: RiskTier,
}

/// A student queued for prediction, with display fields carried through.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StudentWithHistory {
    pub id: StudentId,
    pub full_name: String,
    /// Reference level shown next to the student, free text in the source data.
    pub level: Option<String>,
    #[serde(default)]
    pub history: Vec<AcademicRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentPrediction {
    pub student_id: StudentId,
    pub full_name: String,
    pub level: Option<String>,
    pub prediction: PredictionResult,
    pub predicted_at: DateTime<Utc>,
}

/// What the UI shows for a student: a prediction, or explicitly nothing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PredictionView {
    Predicted(PredictionResult),
    NotPredicted,
}

impl PredictionView {
    pub fn lookup(predictions: &PredictionMap, student_id: &str) -> Self {
        predictions
            .get(student_id)
            .map(|entry| PredictionView::Predicted(entry.prediction))
            .unwrap_or(PredictionView::NotPredicted)
    }
}

impl fmt::Display for PredictionView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PredictionView::Predicted(result) => {
                write!(f, "{} ({:.1}%)", result.risk_tier, result.probability * 100.0)
            }
            PredictionView::NotPredicted => f.write_str("not predicted"),
        }
    }
}
