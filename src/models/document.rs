use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{DocumentStatus, ExtractionStatus, ExtractionStrategy};
use super::metadata::DocumentMetadata;

/// One uploaded file within a loan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub loan_id: Uuid,
    pub filename: String,
    pub file_path: String,
    pub size_bytes: u64,
    pub page_count: u32,
    pub uploaded_at: NaiveDateTime,
    pub strategy: Option<ExtractionStrategy>,
    /// Base64 SHA-256 over normalized text (over file bytes when there is no text layer).
    pub text_hash: Option<String>,
    /// Per-page perceptual hashes in page order.
    pub page_hashes: Vec<PageHashes>,
    pub document_phash_signature: Option<String>,
    pub status: DocumentStatus,
    pub master_document_id: Option<Uuid>,
    pub duplicate_count: u32,
    pub version_group_id: Option<String>,
    pub detected_date: Option<NaiveDate>,
    pub is_latest_version: bool,
    pub extraction_status: ExtractionStatus,
    pub deep_metadata: Option<DocumentMetadata>,
    pub needs_manual_review: bool,
}

/// Four independent fingerprints of one rendered page, base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageHashes {
    pub phash: String,
    pub dhash: String,
    pub ahash: String,
    pub whash: String,
}

impl Document {
    /// A freshly scanned file: nothing clustered, nothing extracted yet.
    pub fn new(loan_id: Uuid, filename: &str, file_path: &str, size_bytes: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            loan_id,
            filename: filename.to_string(),
            file_path: file_path.to_string(),
            size_bytes,
            page_count: 0,
            uploaded_at: chrono::Local::now().naive_local(),
            strategy: None,
            text_hash: None,
            page_hashes: Vec::new(),
            document_phash_signature: None,
            status: DocumentStatus::Unique,
            master_document_id: None,
            duplicate_count: 0,
            version_group_id: None,
            detected_date: None,
            is_latest_version: true,
            extraction_status: ExtractionStatus::Pending,
            deep_metadata: None,
            needs_manual_review: false,
        }
    }

    /// Readable documents take part in clustering; unreadable ones wait for review.
    pub fn is_clusterable(&self) -> bool {
        !self.needs_manual_review && self.text_hash.is_some()
    }

    /// Completeness reported by extraction, 0.0 when unknown.
    pub fn completeness(&self) -> f64 {
        self.deep_metadata
            .as_ref()
            .map(|m| m.completeness)
            .unwrap_or(0.0)
    }

    pub fn is_signed(&self) -> bool {
        self.deep_metadata
            .as_ref()
            .map(|m| m.has_signature)
            .unwrap_or(false)
    }
}
