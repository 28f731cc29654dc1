//! Error taxonomy for the extraction pipeline and job layer.
//!
//! Errors below the job boundary are absorbed and recorded in the run
//! summary; only [`PipelineError::JobExecution`] and [`PipelineError::JobRejected`]
//! surface to callers of the job manager. A routing miss is not an error at
//! all: [`SemanticRouter::route`](crate::router::SemanticRouter::route)
//! returns `Ok(None)`.

use thiserror::Error;

/// Failure of a single language-model call.
///
/// This is the only shape downstream code sees after talking to the model.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LlmError {
    #[error("language model is disabled")]
    Disabled,
    #[error("language model request failed: {0}")]
    Transport(String),
    #[error("language model returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("language model returned an unreadable response: {0}")]
    Malformed(String),
    #[error("language model returned an empty response")]
    Empty,
}

/// Boundary type returned by every [`LanguageModel`](crate::llm::LanguageModel) call.
pub type LlmReply = Result<String, LlmError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Structured decode failed. Recovered locally by the line decoder.
    #[error("could not decode structured extraction output: {0}")]
    ExtractionDecode(String),

    /// The document has no embedded context yet.
    #[error("document {document_id} has no embedded context")]
    MissingEmbeddings { document_id: String },

    /// One document's completion judgment was unusable.
    #[error("no completion signal from document {document_id}: {reason}")]
    EvaluatorSignal { document_id: String, reason: String },

    #[error(transparent)]
    Llm(#[from] LlmError),

    /// A store or document-source call failed while handling one document.
    #[error("storage error: {0}")]
    Storage(String),

    /// A job terminated abnormally (error or panic inside the run).
    #[error("job failed: {0}")]
    JobExecution(String),

    /// The worker pool and its queue are full.
    #[error("refresh rejected: {running} jobs already in flight (capacity {capacity})")]
    JobRejected { running: usize, capacity: usize },
}

impl PipelineError {
    pub(crate) fn storage(err: anyhow::Error) -> Self {
        PipelineError::Storage(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_human_readable() {
        let err = PipelineError::MissingEmbeddings {
            document_id: "doc-2".into(),
        };
        assert_eq!(err.to_string(), "document doc-2 has no embedded context");

        let err: PipelineError = LlmError::Status {
            status: 503,
            body: "overloaded".into(),
        }
        .into();
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn rejection_names_capacity() {
        let err = PipelineError::JobRejected {
            running: 20,
            capacity: 20,
        };
        assert_eq!(
            err.to_string(),
            "refresh rejected: 20 jobs already in flight (capacity 20)"
        );
    }
}
