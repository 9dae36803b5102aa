use thiserror::Error;

pub type Result<T> = std::result::Result<T, KernelError>;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("grammar violation: {0}")]
    GrammarViolation(String),

    #[error("image token mismatch: counted {counted}, evaluated {evaluated}")]
    ImageTokenMismatch { counted: usize, evaluated: usize },

    #[error("image evaluation failed at position {position}: {detail}")]
    ImageEval { position: usize, detail: String },

    #[error("context shift mismatch: expected {expected} tokens, found {actual}")]
    ContextShiftMismatch { expected: usize, actual: usize },

    #[error("no sampling candidates survived filtering")]
    EmptyCandidates,

    #[error("backend failure: {0}")]
    Backend(#[from] anyhow::Error),

    #[error("a generation is already in flight")]
    Busy,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl KernelError {
    /// Errors raised while consuming image embeddings leave the multimodal
    /// cache unusable.
    pub fn invalidates_images(&self) -> bool {
        matches!(
            self,
            KernelError::ImageTokenMismatch { .. } | KernelError::ImageEval { .. }
        )
    }
}
