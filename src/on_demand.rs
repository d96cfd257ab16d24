use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::models::{AggregateStats, PredictionResult};
use crate::repository::{HistoryRepository, PredictionSink};
use crate::scoring;

/// Score one student from stored history with the weighted rule, bypassing
/// the batch path. The save is best-effort.
pub async fn predict_student(
    repository: &dyn HistoryRepository,
    sink: Option<&dyn PredictionSink>,
    student_id: &str,
) -> Result<PredictionResult> {
    let history = repository.get_history(student_id).await?;
    if history.is_empty() {
        return Err(PipelineError::EmptyInput);
    }

    let stats = AggregateStats::from_history(&history)?;
    let prediction = scoring::predict(&stats);
    info!(
        student = student_id,
        average = stats.average_grade(),
        failed = stats.failed_count(),
        total = stats.total_count(),
        probability = prediction.probability,
        tier = %prediction.risk_tier,
        "student scored"
    );

    if let Some(sink) = sink {
        if let Err(err) = sink.save_prediction(student_id, &prediction).await {
            warn!(student = student_id, error = %err, "failed to persist prediction");
        }
    }

    Ok(prediction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use crate::models::{AcademicRecord, RiskTier};

    struct MemoryRepository {
        histories: HashMap<String, Vec<AcademicRecord>>,
    }

    #[async_trait]
    impl HistoryRepository for MemoryRepository {
        async fn get_history(&self, student_id: &str) -> Result<Vec<AcademicRecord>> {
            Ok(self.histories.get(student_id).cloned().unwrap_or_default())
        }
    }

    struct UnreachableRepository;

    #[async_trait]
    impl HistoryRepository for UnreachableRepository {
        async fn get_history(&self, _: &str) -> Result<Vec<AcademicRecord>> {
            Err(PipelineError::repository("connection reset"))
        }
    }

    #[derive(Default)]
    struct MemorySink {
        saved: Mutex<HashMap<String, PredictionResult>>,
    }

    #[async_trait]
    impl PredictionSink for MemorySink {
        async fn save_prediction(&self, student_id: &str, prediction: &PredictionResult) -> Result<()> {
            self.saved
                .lock()
                .await
                .insert(student_id.to_string(), *prediction);
            Ok(())
        }
    }

    fn repository() -> MemoryRepository {
        let mut histories = HashMap::new();
        histories.insert(
            "S1".to_string(),
            vec![
                AcademicRecord::new(12.0, 1i64),
                AcademicRecord::new(10.0, 1i64),
                AcademicRecord::new(11.0, 2i64),
                AcademicRecord::new(15.0, 2i64),
            ],
        );
        MemoryRepository { histories }
    }

    #[tokio::test]
    async fn scores_and_saves_student() {
        let sink = MemorySink::default();
        let prediction = predict_student(&repository(), Some(&sink), "S1").await.unwrap();

        // average 12 (< 14), 3 failed (> 2), 3/4 failed (> 0.3)
        assert!((prediction.probability - 0.8).abs() < 1e-9);
        assert_eq!(prediction.risk_tier, RiskTier::Alto);
        assert_eq!(sink.saved.lock().await.get("S1"), Some(&prediction));
    }

    #[tokio::test]
    async fn student_without_history_is_insufficient_data() {
        let err = predict_student(&repository(), None, "S2").await.unwrap_err();
        assert!(matches!(err, PipelineError::EmptyInput));
    }

    #[tokio::test]
    async fn repository_failures_propagate() {
        let err = predict_student(&UnreachableRepository, None, "S1").await.unwrap_err();
        assert!(matches!(err, PipelineError::Repository { .. }));
    }
}
