//! Dropout-risk prediction pipeline: record normalization, feature
//! extraction, rule-based scoring, risk tiers, and batch orchestration
//! against an external classifier.

pub mod batch;
pub mod classifier;
pub mod config;
pub mod db;
pub mod error;
pub mod features;
pub mod ingest;
pub mod models;
pub mod normalize;
pub mod on_demand;
pub mod report;
pub mod repository;
pub mod scoring;

pub use batch::{BatchOptions, BatchOrchestrator, BatchOutcome, BatchProgress, CancellationToken};
pub use classifier::{Classifier, HttpClassifier, RuleBasedClassifier, ScoringInput};
pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use models::{
    AcademicRecord, AggregateStats, FeatureVector, GradeScale, NormalizedRecord, PredictionMap,
    PredictionResult, PredictionView, RawValue, RiskTier, StudentPrediction, StudentWithHistory,
};
pub use repository::{HistoryRepository, PredictionSink};
