//! Bulk prediction across many students.
//!
//! Students are split into fixed-size chunks, each chunk is one classifier
//! call, and a failing chunk only costs its own students their prediction.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::classifier::{Classifier, ScoringInput};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::features;
use crate::models::{
    AggregateStats, PredictionMap, PredictionResult, PredictionView, StudentId,
    StudentPrediction, StudentWithHistory,
};
use crate::repository::PredictionSink;

/// Chunk completion counters, shareable with an observer task.
#[derive(Debug, Default)]
pub struct BatchProgress {
    total_chunks: AtomicUsize,
    completed_chunks: AtomicUsize,
}

impl BatchProgress {
    pub fn new() -> Self {
        Self::default()
    }

    fn start(&self, total_chunks: usize) {
        self.total_chunks.store(total_chunks, Ordering::Relaxed);
        self.completed_chunks.store(0, Ordering::Relaxed);
    }

    fn record_chunk(&self) {
        self.completed_chunks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_chunks(&self) -> usize {
        self.total_chunks.load(Ordering::Relaxed)
    }

    /// Chunks attempted so far, successful or not.
    pub fn completed_chunks(&self) -> usize {
        self.completed_chunks.load(Ordering::Relaxed)
    }

    pub fn percent(&self) -> f64 {
        let total = self.total_chunks();
        if total == 0 {
            return 0.0;
        }
        (self.completed_chunks().min(total) as f64 / total as f64) * 100.0
    }
}

/// Cooperative cancellation flag for a running batch.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct BatchOptions {
    /// Results of earlier runs; merged first, fresh predictions overwrite them.
    pub previous: PredictionMap,
    pub progress: Option<Arc<BatchProgress>>,
    pub cancel: Option<CancellationToken>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkFailure {
    pub index: usize,
    pub student_ids: Vec<StudentId>,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Carried-over results merged with this run's; see `fresh`.
    pub predictions: PredictionMap,
    /// Students predicted by this run.
    pub fresh: BTreeSet<StudentId>,
    /// Students left without a prediction because they have no usable history.
    pub skipped: Vec<StudentId>,
    pub failed_chunks: Vec<ChunkFailure>,
    pub total_chunks: usize,
    /// Set when the run stopped launching chunks early.
    pub cancelled: bool,
}

impl BatchOutcome {
    /// Students of this batch that ended up without a fresh prediction.
    pub fn unpredicted(&self) -> impl Iterator<Item = &StudentId> {
        self.skipped
            .iter()
            .chain(self.failed_chunks.iter().flat_map(|failure| failure.student_ids.iter()))
    }

    /// This run's prediction for `student_id`. An entry only carried over
    /// from `BatchOptions::previous` is not returned.
    pub fn fresh_prediction(&self, student_id: &str) -> Option<&StudentPrediction> {
        if self.fresh.contains(student_id) {
            self.predictions.get(student_id)
        } else {
            None
        }
    }

    pub fn view(&self, student_id: &str) -> PredictionView {
        if self.fresh.contains(student_id) {
            PredictionView::lookup(&self.predictions, student_id)
        } else {
            PredictionView::NotPredicted
        }
    }
}

#[derive(Debug, Clone)]
struct PreparedStudent {
    id: StudentId,
    full_name: String,
    level: Option<String>,
    input: ScoringInput,
}

struct ChunkReport {
    index: usize,
    students: Vec<PreparedStudent>,
    result: Result<Vec<PredictionResult>>,
}

pub struct BatchOrchestrator {
    classifier: Arc<dyn Classifier>,
    config: PipelineConfig,
    sink: Option<Arc<dyn PredictionSink>>,
}

impl BatchOrchestrator {
    pub fn new(classifier: Arc<dyn Classifier>, config: PipelineConfig) -> Self {
        Self {
            classifier,
            config,
            sink: None,
        }
    }

    /// Save every fresh prediction through `sink`. Save failures are logged
    /// and never affect the batch outcome.
    pub fn with_sink(mut self, sink: Arc<dyn PredictionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[instrument(
        name = "batch_run",
        skip_all,
        fields(students = students.len(), classifier = self.classifier.name())
    )]
    pub async fn run_batch(
        &self,
        students: &[StudentWithHistory],
        options: BatchOptions,
    ) -> Result<BatchOutcome> {
        self.config.validate()?;

        let mut skipped = Vec::new();
        let mut prepared = Vec::with_capacity(students.len());
        for student in students {
            match prepare(student) {
                Ok(entry) => prepared.push(entry),
                Err(err) => {
                    debug!(student = %student.id, error = %err, "student not predicted");
                    skipped.push(student.id.clone());
                }
            }
        }

        if prepared.is_empty() {
            return Err(PipelineError::NoValidStudents);
        }

        let chunks: Vec<Vec<PreparedStudent>> = prepared
            .chunks(self.config.chunk_size)
            .map(<[PreparedStudent]>::to_vec)
            .collect();
        let total_chunks = chunks.len();
        if let Some(progress) = &options.progress {
            progress.start(total_chunks);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut handles: Vec<(usize, Vec<StudentId>, JoinHandle<ChunkReport>)> = Vec::new();
        let mut cancelled = false;

        for (index, chunk) in chunks.into_iter().enumerate() {
            if options.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                cancelled = true;
                break;
            }
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            // A chunk may have been cancelled while waiting for a slot.
            if options.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                cancelled = true;
                break;
            }

            let ids = chunk.iter().map(|student| student.id.clone()).collect();
            let classifier = Arc::clone(&self.classifier);
            let config = self.config.clone();
            let progress = options.progress.clone();
            let handle = tokio::spawn(async move {
                let result = run_chunk(classifier.as_ref(), &config, index, &chunk).await;
                drop(permit);
                if let Some(progress) = progress {
                    progress.record_chunk();
                }
                ChunkReport {
                    index,
                    students: chunk,
                    result,
                }
            });
            handles.push((index, ids, handle));
        }

        let launched = handles.len();
        let mut predictions = options.previous;
        let mut fresh = BTreeSet::new();
        let mut failed_chunks = Vec::new();
        let mut saves = Vec::new();

        for (index, ids, handle) in handles {
            let report = match handle.await {
                Ok(report) => report,
                Err(err) => {
                    warn!(chunk = index, error = %err, "chunk task aborted");
                    failed_chunks.push(ChunkFailure {
                        index,
                        student_ids: ids,
                        reason: err.to_string(),
                    });
                    continue;
                }
            };

            match report.result {
                Ok(results) => {
                    let predicted_at = Utc::now();
                    for (student, prediction) in report.students.into_iter().zip(results) {
                        if let Some(sink) = &self.sink {
                            saves.push(spawn_save(Arc::clone(sink), student.id.clone(), prediction));
                        }
                        fresh.insert(student.id.clone());
                        predictions.insert(
                            student.id.clone(),
                            StudentPrediction {
                                student_id: student.id,
                                full_name: student.full_name,
                                level: student.level,
                                prediction,
                                predicted_at,
                            },
                        );
                    }
                }
                Err(err) => {
                    warn!(chunk = report.index, error = %err, "chunk left without predictions");
                    failed_chunks.push(ChunkFailure {
                        index: report.index,
                        student_ids: ids,
                        reason: err.to_string(),
                    });
                }
            }
        }

        for save in saves {
            if let Err(err) = save.await {
                warn!(error = %err, "prediction save task aborted");
            }
        }

        if cancelled {
            warn!(launched, total_chunks, "batch cancelled before all chunks were sent");
        }
        info!(
            predicted = fresh.len(),
            carried_over = predictions.len() - fresh.len(),
            skipped = skipped.len(),
            failed_chunks = failed_chunks.len(),
            total_chunks,
            "batch prediction finished"
        );

        Ok(BatchOutcome {
            predictions,
            fresh,
            skipped,
            failed_chunks,
            total_chunks,
            cancelled,
        })
    }
}

fn prepare(student: &StudentWithHistory) -> Result<PreparedStudent> {
    let features = features::extract_from_history(&student.history)?;
    let stats = AggregateStats::from_history(&student.history)?;
    Ok(PreparedStudent {
        id: student.id.clone(),
        full_name: student.full_name.clone(),
        level: student.level.clone(),
        input: ScoringInput { features, stats },
    })
}

/// One chunk with per-attempt timeout and backoff between retries. Only
/// transport-level failures are retried; a malformed answer is final.
async fn run_chunk(
    classifier: &dyn Classifier,
    config: &PipelineConfig,
    index: usize,
    chunk: &[PreparedStudent],
) -> Result<Vec<PredictionResult>> {
    let inputs: Vec<ScoringInput> = chunk.iter().map(|student| student.input).collect();
    let mut attempt = 0u32;

    loop {
        if attempt > 0 {
            let delay = config.backoff(attempt);
            debug!(chunk = index, attempt, ?delay, "retrying chunk");
            tokio::time::sleep(delay).await;
        }

        let error = match tokio::time::timeout(config.timeout, classifier.classify(&inputs)).await {
            Ok(Ok(results)) if results.len() == inputs.len() => {
                debug!(chunk = index, size = inputs.len(), "chunk classified");
                return Ok(results);
            }
            Ok(Ok(results)) => {
                return Err(PipelineError::ClassifierResponse {
                    reason: format!("expected {} predictions, got {}", inputs.len(), results.len()),
                });
            }
            Ok(Err(err @ PipelineError::ClassifierUnavailable { .. })) => err,
            Ok(Err(err)) => return Err(err),
            Err(_) => PipelineError::ClassifierUnavailable {
                reason: format!("timed out after {:?}", config.timeout),
            },
        };

        if attempt >= config.max_retries {
            return Err(error);
        }
        debug!(chunk = index, attempt, error = %error, "chunk attempt failed");
        attempt += 1;
    }
}

fn spawn_save(
    sink: Arc<dyn PredictionSink>,
    student_id: StudentId,
    prediction: PredictionResult,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = sink.save_prediction(&student_id, &prediction).await {
            warn!(student = %student_id, error = %err, "failed to persist prediction");
        }
    })
}
