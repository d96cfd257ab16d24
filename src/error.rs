/// Errors raised by the prediction pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("malformed record: {field} = {value:?}")]
    MalformedRecord { field: &'static str, value: String },

    #[error("cannot extract features from an empty history")]
    EmptyInput,

    #[error("classifier unavailable: {reason}")]
    ClassifierUnavailable { reason: String },

    #[error("invalid classifier response: {reason}")]
    ClassifierResponse { reason: String },

    #[error("no student in the batch has a usable academic history")]
    NoValidStudents,

    #[error("failed count {failed} exceeds total count {total}")]
    InvalidStats { failed: u32, total: u32 },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("repository error: {reason}")]
    Repository { reason: String },
}

impl PipelineError {
    pub fn repository(err: impl std::fmt::Display) -> Self {
        Self::Repository {
            reason: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
