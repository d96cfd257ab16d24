//! Storage collaborators the pipeline talks to.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{AcademicRecord, PredictionResult};

#[async_trait]
pub trait HistoryRepository: Send + Sync {
    /// All history rows for a student. An unknown student or one without
    /// courses yields an empty list; only I/O problems are errors.
    async fn get_history(&self, student_id: &str) -> Result<Vec<AcademicRecord>>;
}

#[async_trait]
pub trait PredictionSink: Send + Sync + 'static {
    async fn save_prediction(&self, student_id: &str, prediction: &PredictionResult) -> Result<()>;
}
