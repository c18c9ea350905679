use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::unbounded;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::format::{sanitize_filename, scan_pdfs};
use super::local_metadata::extract_local_metadata;
use super::ImportError;
use crate::config::DedupConfig;
use crate::db::repository;
use crate::models::enums::{ExtractionStatus, ExtractionStrategy};
use crate::models::{Document, DocumentMetadata};
use crate::pipeline::fingerprint::{
    fingerprint_document, Fingerprint, FingerprintParams, PageRenderer,
};
use crate::pipeline::probe::{probe_pdf, ProbeError, TextLayerReader};

/// Import result reported per file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportResult {
    pub document_id: Option<Uuid>,
    pub filename: String,
    pub status: ImportStatus,
    pub strategy: Option<ExtractionStrategy>,
    pub page_count: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    /// Probed and fingerprinted.
    Registered,
    /// Stored, but unreadable; excluded from clustering.
    ManualReview,
    /// Could not be read from disk; nothing stored.
    Failed,
}

/// Everything learned about one file at scan time.
#[derive(Debug, Clone, PartialEq)]
pub struct FileAnalysis {
    pub size_bytes: u64,
    pub page_count: u32,
    pub strategy: Option<ExtractionStrategy>,
    pub fingerprint: Option<Fingerprint>,
    /// Set for text-only documents, read straight from the text layer.
    pub local_metadata: Option<DocumentMetadata>,
    /// Why the document needs manual review, if it does.
    pub review_reason: Option<String>,
}

impl FileAnalysis {
    fn unreadable(size_bytes: u64, reason: String) -> Self {
        Self {
            size_bytes,
            page_count: 0,
            strategy: None,
            fingerprint: None,
            local_metadata: None,
            review_reason: Some(reason),
        }
    }

    /// Copy the analysis onto a document record.
    pub fn apply_to(&self, doc: &mut Document) {
        doc.size_bytes = self.size_bytes;
        doc.page_count = self.page_count;
        doc.strategy = self.strategy;
        doc.needs_manual_review = self.review_reason.is_some();

        match &self.fingerprint {
            Some(fp) => {
                doc.text_hash = Some(fp.text_hash.clone());
                doc.page_hashes = fp.pages.clone();
                doc.document_phash_signature = Some(fp.signature.clone());
            }
            None => {
                doc.text_hash = None;
                doc.page_hashes.clear();
                doc.document_phash_signature = None;
            }
        }

        if let Some(meta) = &self.local_metadata {
            doc.detected_date = meta.latest_date();
            doc.deep_metadata = Some(meta.clone());
            doc.extraction_status = ExtractionStatus::Succeeded;
        } else if self.review_reason.is_some() && self.page_count == 0 {
            doc.extraction_status = ExtractionStatus::Failed;
        }
    }
}

/// Registers loan files: probes, fingerprints and stores them eagerly.
pub struct Importer {
    text_layer: Arc<dyn TextLayerReader>,
    renderer: Arc<dyn PageRenderer>,
    config: DedupConfig,
}

impl Importer {
    pub fn new(
        text_layer: Arc<dyn TextLayerReader>,
        renderer: Arc<dyn PageRenderer>,
        config: DedupConfig,
    ) -> Self {
        Self {
            text_layer,
            renderer,
            config,
        }
    }

    fn fingerprint_params(&self) -> FingerprintParams {
        FingerprintParams {
            dpi: self.config.fingerprint_dpi,
            hash_size: self.config.hash_size,
        }
    }

    /// Probe and fingerprint one file.
    ///
    /// Only a failure to read the file is an error; a corrupt PDF or a page
    /// that will not render comes back as an analysis flagged for review.
    pub fn analyze(&self, document_id: &Uuid, path: &Path) -> Result<FileAnalysis, ImportError> {
        let bytes = std::fs::read(path)?;
        let size_bytes = bytes.len() as u64;

        let probe = match probe_pdf(self.text_layer.as_ref(), &bytes, self.config.min_chars_per_page) {
            Ok(report) => report,
            Err(ProbeError::DocumentUnreadable { reason }) => {
                tracing::warn!(file = %path.display(), reason = %reason, "Document unreadable, flagged for review");
                return Ok(FileAnalysis::unreadable(size_bytes, reason));
            }
            Err(ProbeError::Io(e)) => return Err(e.into()),
        };

        let text = probe.full_text();
        let local_metadata = (probe.strategy == ExtractionStrategy::TextOnly)
            .then(|| extract_local_metadata(document_id, &text, probe.page_count));

        match fingerprint_document(
            &bytes,
            &text,
            probe.page_count,
            self.renderer.as_ref(),
            self.fingerprint_params(),
        ) {
            Ok(fingerprint) => Ok(FileAnalysis {
                size_bytes,
                page_count: probe.page_count,
                strategy: Some(probe.strategy),
                fingerprint: Some(fingerprint),
                local_metadata,
                review_reason: None,
            }),
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "Fingerprinting failed, flagged for review");
                Ok(FileAnalysis {
                    size_bytes,
                    page_count: probe.page_count,
                    strategy: Some(probe.strategy),
                    fingerprint: None,
                    local_metadata,
                    review_reason: Some(e.to_string()),
                })
            }
        }
    }

    /// Analyze many files across `fingerprint_workers` threads.
    ///
    /// Results come back in input order.
    pub fn analyze_all(
        &self,
        files: &[(Uuid, PathBuf)],
    ) -> Vec<Result<FileAnalysis, ImportError>> {
        let workers = self.config.fingerprint_workers.clamp(1, files.len().max(1));
        let (job_tx, job_rx) = unbounded::<usize>();
        let (result_tx, result_rx) = unbounded::<(usize, Result<FileAnalysis, ImportError>)>();

        for index in 0..files.len() {
            // Receiver is alive until the scope below ends.
            let _ = job_tx.send(index);
        }
        drop(job_tx);

        thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    while let Ok(index) = job_rx.recv() {
                        let (id, path) = &files[index];
                        if result_tx.send((index, self.analyze(id, path))).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(result_tx);

        let mut slots: Vec<Option<Result<FileAnalysis, ImportError>>> =
            (0..files.len()).map(|_| None).collect();
        for (index, result) in result_rx.iter() {
            slots[index] = Some(result);
        }
        slots
            .into_iter()
            .map(|slot| slot.unwrap_or(Err(ImportError::WorkerLost)))
            .collect()
    }

    /// Register a single file under `loan_id`.
    pub fn import_file(
        &self,
        conn: &Connection,
        loan_id: &Uuid,
        path: &Path,
    ) -> Result<ImportResult, ImportError> {
        ensure_loan(conn, loan_id)?;
        let document_id = Uuid::new_v4();
        let analysis = self.analyze(&document_id, path)?;
        store(conn, loan_id, document_id, path, &analysis, None)
    }

    /// Register every PDF found under `dir`.
    ///
    /// Files are fingerprinted in parallel and stored in path order, one
    /// millisecond of upload time apart, so re-uploads keep a stable order.
    pub fn import_directory(
        &self,
        conn: &Connection,
        loan_id: &Uuid,
        dir: &Path,
    ) -> Result<Vec<ImportResult>, ImportError> {
        ensure_loan(conn, loan_id)?;
        let paths = scan_pdfs(dir)?;
        tracing::info!(loan_id = %loan_id, files = paths.len(), dir = %dir.display(), "Importing loan files");

        let files: Vec<(Uuid, PathBuf)> = paths.into_iter().map(|p| (Uuid::new_v4(), p)).collect();
        let analyses = self.analyze_all(&files);
        let started = chrono::Local::now().naive_local();

        let mut results = Vec::with_capacity(files.len());
        for (i, ((document_id, path), analysis)) in files.iter().zip(analyses).enumerate() {
            match analysis {
                Ok(analysis) => {
                    let uploaded_at = started + chrono::Duration::milliseconds(i as i64);
                    results.push(store(conn, loan_id, *document_id, path, &analysis, Some(uploaded_at))?);
                }
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "Failed to import file");
                    results.push(ImportResult {
                        document_id: None,
                        filename: display_name(path),
                        status: ImportStatus::Failed,
                        strategy: None,
                        page_count: 0,
                    });
                }
            }
        }
        Ok(results)
    }

    /// Re-probe and re-fingerprint stored documents (records created
    /// without hashes, or after the render parameters changed).
    ///
    /// A file that can no longer be read flags its document for review.
    /// Returns how many documents were refreshed successfully.
    pub fn refresh_all(&self, conn: &Connection, docs: Vec<Document>) -> Result<usize, ImportError> {
        let files: Vec<(Uuid, PathBuf)> = docs
            .iter()
            .map(|d| (d.id, PathBuf::from(&d.file_path)))
            .collect();
        let analyses = self.analyze_all(&files);

        let mut refreshed = 0;
        for (mut doc, analysis) in docs.into_iter().zip(analyses) {
            let analysis = analysis.unwrap_or_else(|e| {
                tracing::warn!(document_id = %doc.id, error = %e, "Cannot re-read document, flagged for review");
                FileAnalysis::unreadable(doc.size_bytes, e.to_string())
            });
            analysis.apply_to(&mut doc);
            repository::update_fingerprints(conn, &doc)?;
            if let Some(meta) = &analysis.local_metadata {
                repository::commit_extraction(conn, &doc.id, ExtractionStatus::Succeeded, Some(meta))?;
            }
            if analysis.review_reason.is_none() {
                refreshed += 1;
            }
        }
        Ok(refreshed)
    }
}

fn ensure_loan(conn: &Connection, loan_id: &Uuid) -> Result<(), ImportError> {
    match repository::get_loan(conn, loan_id)? {
        Some(_) => Ok(()),
        None => Err(ImportError::LoanNotFound(*loan_id)),
    }
}

fn display_name(path: &Path) -> String {
    sanitize_filename(
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown"),
    )
}

fn store(
    conn: &Connection,
    loan_id: &Uuid,
    document_id: Uuid,
    path: &Path,
    analysis: &FileAnalysis,
    uploaded_at: Option<chrono::NaiveDateTime>,
) -> Result<ImportResult, ImportError> {
    let filename = display_name(path);
    let mut doc = Document::new(*loan_id, &filename, &path.to_string_lossy(), analysis.size_bytes);
    doc.id = document_id;
    if let Some(at) = uploaded_at {
        doc.uploaded_at = at;
    }
    analysis.apply_to(&mut doc);
    repository::insert_document(conn, &doc)?;

    let status = if doc.needs_manual_review {
        ImportStatus::ManualReview
    } else {
        ImportStatus::Registered
    };
    tracing::info!(
        document_id = %doc.id,
        file = %filename,
        strategy = ?doc.strategy,
        pages = doc.page_count,
        review = doc.needs_manual_review,
        "Document registered"
    );

    Ok(ImportResult {
        document_id: Some(doc.id),
        filename,
        status,
        strategy: doc.strategy,
        page_count: doc.page_count,
    })
}
