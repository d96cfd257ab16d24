//! Classifiers the batch orchestrator can drive.
//!
//! Outputs are positional: the n-th result belongs to the n-th input.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::error::{PipelineError, Result};
use crate::models::{AggregateStats, FeatureVector, PredictionResult, RiskTier};
use crate::scoring;

/// Everything a classifier may look at for one student.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringInput {
    pub features: FeatureVector,
    pub stats: AggregateStats,
}

#[async_trait]
pub trait Classifier: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn classify(&self, batch: &[ScoringInput]) -> Result<Vec<PredictionResult>>;
}

/// Fallback classifier applying the weighted rule to each student's stats.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleBasedClassifier;

#[async_trait]
impl Classifier for RuleBasedClassifier {
    fn name(&self) -> &'static str {
        "rule-based"
    }

    async fn classify(&self, batch: &[ScoringInput]) -> Result<Vec<PredictionResult>> {
        Ok(batch.iter().map(|input| scoring::predict(&input.stats)).collect())
    }
}

#[derive(Serialize)]
struct PredictRequest<'a> {
    data: Vec<&'a [f64]>,
}

#[derive(Debug, Deserialize)]
struct ServicePrediction {
    #[serde(rename = "probabilidad", alias = "probability")]
    probability: f64,
    #[serde(rename = "nivelRiesgo", alias = "riskTier", default)]
    risk_tier: Option<String>,
}

/// Client for the external model service (`POST {base_url}/predict`).
#[derive(Debug, Clone)]
pub struct HttpClassifier {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpClassifier {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::InvalidConfig {
                reason: format!("cannot build classifier client: {e}"),
            })?;
        Ok(Self {
            endpoint: format!("{}/predict", base_url.trim_end_matches('/')),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    fn name(&self) -> &'static str {
        "http"
    }

    #[instrument(name = "classifier_http_predict", skip(self, batch), fields(size = batch.len()))]
    async fn classify(&self, batch: &[ScoringInput]) -> Result<Vec<PredictionResult>> {
        let request = PredictRequest {
            data: batch.iter().map(|input| input.features.as_slice()).collect(),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(unavailable)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::ClassifierUnavailable {
                reason: format!("HTTP {status}: {body}"),
            });
        }

        let predictions: Vec<ServicePrediction> = response.json().await.map_err(|e| {
            PipelineError::ClassifierResponse {
                reason: format!("cannot decode predictions: {e}"),
            }
        })?;

        interpret(batch.len(), predictions)
    }
}

fn unavailable(err: reqwest::Error) -> PipelineError {
    PipelineError::ClassifierUnavailable {
        reason: err.to_string(),
    }
}

/// Validate a service response and re-derive each tier canonically.
fn interpret(expected: usize, predictions: Vec<ServicePrediction>) -> Result<Vec<PredictionResult>> {
    if predictions.len() != expected {
        return Err(PipelineError::ClassifierResponse {
            reason: format!("expected {expected} predictions, got {}", predictions.len()),
        });
    }

    predictions
        .into_iter()
        .enumerate()
        .map(|(position, prediction)| {
            let probability = prediction.probability;
            if !probability.is_finite() || !(0.0..=1.0).contains(&probability) {
                return Err(PipelineError::ClassifierResponse {
                    reason: format!("probability {probability} at position {position} outside [0, 1]"),
                });
            }

            let risk_tier = scoring::classify(probability);
            if let Some(reported) = prediction
                .risk_tier
                .as_deref()
                .and_then(|tier| tier.parse::<RiskTier>().ok())
            {
                if reported != risk_tier {
                    warn!(
                        position,
                        probability,
                        reported = %reported,
                        canonical = %risk_tier,
                        "classifier tier disagrees with canonical thresholds"
                    );
                }
            }

            Ok(PredictionResult {
                probability,
                risk_tier,
            })
        })
        .collect()
}
