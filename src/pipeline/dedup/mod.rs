//! Deduplication runs: the per-loan run lock, the `start_deduplication`
//! trigger and the end-to-end pipeline behind it.
//!
//! A run walks fingerprinting → extraction → resolution. Only the calling
//! (or spawned run) thread touches the database; extraction workers hand
//! their results back through the orchestrator's sink.

pub mod report;
pub mod run;

#[cfg(test)]
mod tests;

pub use report::{DedupProgressEvent, DedupReport, DedupStage};
pub use run::{run_deduplication, start_deduplication, DedupContext, DedupRunHandle};

use thiserror::Error;
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::pipeline::import::ImportError;
use crate::pipeline::orchestrator::OrchestratorError;
use crate::pipeline::resolver::ResolverError;

#[derive(Error, Debug)]
pub enum DedupError {
    #[error("A deduplication run is already in progress for loan {loan_id}")]
    RunAlreadyInProgress { loan_id: Uuid },

    #[error("Loan not found: {0}")]
    LoanNotFound(Uuid),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Run thread panicked")]
    RunPanicked,

    #[error("Import error: {0}")]
    Import(#[from] ImportError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("Resolver error: {0}")]
    Resolver(#[from] ResolverError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Report serialization failed: {0}")]
    Report(#[from] serde_json::Error),
}
