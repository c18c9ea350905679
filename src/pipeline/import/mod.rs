//! File-scan-time registration: every document is probed and fingerprinted
//! synchronously when it enters a loan.

pub mod format;
pub mod importer;
pub mod local_metadata;

pub use format::*;
pub use importer::*;
pub use local_metadata::extract_local_metadata;

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::db::DatabaseError;

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("Loan not found: {0}")]
    LoanNotFound(Uuid),

    #[error("Fingerprint worker exited before reporting")]
    WorkerLost,

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}
