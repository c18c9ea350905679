//! Concurrency orchestrator: bounded worker pool around the external extractor.
//!
//! The coordinating thread owns the FIFO job queue, the per-document
//! assembly state and the result sink; workers only render pages, call the
//! extractor and validate the response. Results are assembled by document
//! id, never by completion order, and a document's metadata reaches the
//! sink only once every one of its batches has succeeded.

pub mod extractor;
pub mod job;
pub mod pool;
pub mod retry;
pub mod validate;

use thiserror::Error;
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::models::DocumentMetadata;

pub use extractor::{
    mock_response, page_id, ExtractionRequest, HttpMetadataExtractor, MetadataExtractor,
    MockExtractor, PageImage,
};
pub use job::{DocumentSource, ExtractionJob, JobRecord, JobStatus};
pub use pool::{CancellationToken, Orchestrator};
pub use retry::{AttemptParams, RetryPolicy};
pub use validate::{validate_response, ExtractionOutcome, ValidatedMetadata};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Extractor timed out after {secs}s")]
    ExtractionTimeout { secs: u64 },

    #[error("Extractor returned malformed output: {0}")]
    ExtractionMalformedOutput(String),

    #[error("Extractor transport error: {0}")]
    Transport(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Worker channel closed")]
    ChannelClosed,

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Final result for one document, handed to the sink exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentOutcome {
    Succeeded {
        document_id: Uuid,
        metadata: DocumentMetadata,
    },
    Failed {
        document_id: Uuid,
        reason: String,
    },
}

impl DocumentOutcome {
    pub fn document_id(&self) -> Uuid {
        match self {
            Self::Succeeded { document_id, .. } | Self::Failed { document_id, .. } => *document_id,
        }
    }
}

/// Counters and job ledger of one orchestrator run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionSummary {
    /// First-attempt jobs planned.
    pub jobs_queued: usize,
    pub jobs_succeeded: usize,
    pub jobs_retried: usize,
    pub jobs_failed: usize,
    pub documents_succeeded: usize,
    pub documents_failed: usize,
    /// Terminal record of every job, retries included.
    pub jobs: Vec<JobRecord>,
}
