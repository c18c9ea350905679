use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rusqlite::Connection;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{DedupError, DedupProgressEvent, DedupReport, DedupStage};
use crate::config::DedupConfig;
use crate::db::{self, DatabaseError};
use crate::models::enums::{DedupStatus, ExtractionStatus};
use crate::models::Document;
use crate::pipeline::fingerprint::PageRenderer;
use crate::pipeline::import::Importer;
use crate::pipeline::orchestrator::{
    CancellationToken, DocumentOutcome, DocumentSource, MetadataExtractor, Orchestrator,
    OrchestratorError,
};
use crate::pipeline::probe::TextLayerReader;
use crate::pipeline::resolver::{resolve_loan, SimilarityParams};

/// How often a run refreshes its lock heartbeat; well under the minimum
/// stale-run lease.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

pub type ProgressCallback = Arc<dyn Fn(DedupProgressEvent) + Send + Sync>;

/// Collaborators and tunables of a run.
#[derive(Clone)]
pub struct DedupContext {
    pub text_layer: Arc<dyn TextLayerReader>,
    pub renderer: Arc<dyn PageRenderer>,
    pub extractor: Arc<dyn MetadataExtractor>,
    pub config: DedupConfig,
    pub progress: Option<ProgressCallback>,
}

impl DedupContext {
    pub fn new(
        text_layer: Arc<dyn TextLayerReader>,
        renderer: Arc<dyn PageRenderer>,
        extractor: Arc<dyn MetadataExtractor>,
        config: DedupConfig,
    ) -> Self {
        Self {
            text_layer,
            renderer,
            extractor,
            config,
            progress: None,
        }
    }

    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(DedupProgressEvent) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }

    fn emit(&self, loan_id: &Uuid, stage: DedupStage, completed: usize, total: usize) {
        if let Some(callback) = &self.progress {
            callback(DedupProgressEvent {
                loan_id: *loan_id,
                stage,
                completed,
                total,
            });
        }
    }
}

/// Handle on a run started by [`start_deduplication`].
///
/// Dropping the handle detaches the run; it does not cancel it.
pub struct DedupRunHandle {
    loan_id: Uuid,
    cancel: CancellationToken,
    thread: JoinHandle<Result<DedupReport, DedupError>>,
}

impl DedupRunHandle {
    pub fn loan_id(&self) -> Uuid {
        self.loan_id
    }

    /// Stop dispatching extraction work; the run ends as `failed`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    pub fn join(self) -> Result<DedupReport, DedupError> {
        self.thread.join().map_err(|_| DedupError::RunPanicked)?
    }
}

/// Take the loan's run lock and run in the background.
///
/// Fails immediately with `RunAlreadyInProgress` when a run holds the
/// lock. `conn` moves to the run thread, which is the only place it is
/// used from then on.
pub fn start_deduplication(
    conn: Connection,
    loan_id: Uuid,
    ctx: DedupContext,
) -> Result<DedupRunHandle, DedupError> {
    acquire_lock(&conn, &loan_id)?;

    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let thread = thread::spawn(move || {
        let result = execute(&conn, &loan_id, &ctx, &run_cancel);
        release_lock(&conn, &loan_id, result)
    });

    Ok(DedupRunHandle {
        loan_id,
        cancel,
        thread,
    })
}

/// Run deduplication for a loan on the calling thread.
pub fn run_deduplication(
    conn: &Connection,
    loan_id: &Uuid,
    ctx: &DedupContext,
    cancel: &CancellationToken,
) -> Result<DedupReport, DedupError> {
    acquire_lock(conn, loan_id)?;
    let result = execute(conn, loan_id, ctx, cancel);
    release_lock(conn, loan_id, result)
}

fn acquire_lock(conn: &Connection, loan_id: &Uuid) -> Result<(), DedupError> {
    match db::try_begin_run(conn, loan_id) {
        Ok(true) => {
            info!(loan_id = %loan_id, "Dedup run started");
            Ok(())
        }
        Ok(false) => Err(DedupError::RunAlreadyInProgress { loan_id: *loan_id }),
        Err(DatabaseError::NotFound { .. }) => Err(DedupError::LoanNotFound(*loan_id)),
        Err(e) => Err(e.into()),
    }
}

fn release_lock(
    conn: &Connection,
    loan_id: &Uuid,
    result: Result<DedupReport, DedupError>,
) -> Result<DedupReport, DedupError> {
    match result {
        Ok(report) => {
            let json = serde_json::to_string(&report)?;
            db::finish_run(conn, loan_id, DedupStatus::Completed, Some(&json))?;
            info!(
                loan_id = %loan_id,
                documents = report.documents,
                duplicates = report.duplicates,
                version_groups = report.version_groups,
                ambiguous = report.ambiguous_groups,
                elapsed_ms = report.elapsed_ms,
                "Dedup run completed"
            );
            Ok(report)
        }
        Err(e) => {
            error!(loan_id = %loan_id, error = %e, "Dedup run failed");
            if let Err(release) = db::finish_run(conn, loan_id, DedupStatus::Failed, None) {
                error!(loan_id = %loan_id, error = %release, "Could not release run lock");
            }
            Err(e)
        }
    }
}

fn execute(
    conn: &Connection,
    loan_id: &Uuid,
    ctx: &DedupContext,
    cancel: &CancellationToken,
) -> Result<DedupReport, DedupError> {
    let started = Instant::now();
    let mut report = DedupReport {
        loan_id: *loan_id,
        ..Default::default()
    };

    // ── Fingerprinting: anything stored without hashes ──
    let stale: Vec<Document> = db::list_documents_by_loan(conn, loan_id)?
        .into_iter()
        .filter(|d| d.text_hash.is_none() && !d.needs_manual_review)
        .collect();
    ctx.emit(loan_id, DedupStage::Fingerprinting, 0, stale.len());
    if !stale.is_empty() {
        let total = stale.len();
        let importer = Importer::new(
            Arc::clone(&ctx.text_layer),
            Arc::clone(&ctx.renderer),
            ctx.config.clone(),
        );
        report.fingerprinted = importer.refresh_all(conn, stale)?;
        ctx.emit(loan_id, DedupStage::Fingerprinting, total, total);
    }
    if cancel.is_cancelled() {
        return Err(DedupError::Cancelled);
    }
    beat(conn, loan_id);

    // ── Extraction: scanned and table documents without metadata ──
    let documents = db::list_documents_by_loan(conn, loan_id)?;
    let sources: Vec<DocumentSource> = documents.iter().filter_map(extraction_source).collect();
    let total = sources.len();
    ctx.emit(loan_id, DedupStage::Extracting, 0, total);

    let orchestrator = Orchestrator::new(
        Arc::clone(&ctx.extractor),
        Arc::clone(&ctx.renderer),
        &ctx.config,
    );
    let mut committed = 0usize;
    let mut sink = |outcome: DocumentOutcome| -> Result<(), OrchestratorError> {
        match &outcome {
            DocumentOutcome::Succeeded {
                document_id,
                metadata,
            } => db::commit_extraction(conn, document_id, ExtractionStatus::Succeeded, Some(metadata))?,
            DocumentOutcome::Failed { document_id, .. } => {
                db::commit_extraction(conn, document_id, ExtractionStatus::Failed, None)?
            }
        }
        committed += 1;
        ctx.emit(loan_id, DedupStage::Extracting, committed, total);
        Ok(())
    };

    let mut last_beat = Instant::now();
    let mut heartbeat = || {
        if last_beat.elapsed() >= HEARTBEAT_INTERVAL {
            beat(conn, loan_id);
            last_beat = Instant::now();
        }
    };

    let summary = match orchestrator.run_with_heartbeat(sources, cancel, &mut sink, &mut heartbeat) {
        Ok(summary) => summary,
        Err(OrchestratorError::Cancelled) => return Err(DedupError::Cancelled),
        Err(e) => return Err(e.into()),
    };
    report.jobs_queued = summary.jobs_queued;
    report.jobs_succeeded = summary.jobs_succeeded;
    report.jobs_retried = summary.jobs_retried;
    report.jobs_failed = summary.jobs_failed;
    report.extraction_succeeded = summary.documents_succeeded;
    report.extraction_failed = summary.documents_failed;

    if cancel.is_cancelled() {
        return Err(DedupError::Cancelled);
    }

    // ── Resolution ──
    beat(conn, loan_id);
    ctx.emit(loan_id, DedupStage::Resolving, 0, 1);
    let resolution = resolve_loan(conn, loan_id, &SimilarityParams::from(&ctx.config))?;

    let documents = db::list_documents_by_loan(conn, loan_id)?;
    report.documents = documents.len();
    report.unreadable = documents.iter().filter(|d| d.needs_manual_review).count();
    report.duplicate_clusters = resolution.duplicate_clusters;
    report.duplicates = resolution.duplicates;
    report.version_groups = resolution.groups.len();
    report.ambiguous_groups = resolution.ambiguous_groups();
    report.elapsed_ms = started.elapsed().as_millis() as u64;

    ctx.emit(loan_id, DedupStage::Completed, 1, 1);
    Ok(report)
}

fn beat(conn: &Connection, loan_id: &Uuid) {
    match db::touch_run(conn, loan_id) {
        Ok(true) => {}
        Ok(false) => warn!(loan_id = %loan_id, "Run lock no longer held while running"),
        Err(e) => warn!(loan_id = %loan_id, error = %e, "Could not refresh run heartbeat"),
    }
}

/// Documents that still need the external extractor.
fn extraction_source(doc: &Document) -> Option<DocumentSource> {
    let strategy = doc.strategy?;
    let wanted = strategy.requires_deep_extraction()
        && !doc.needs_manual_review
        && doc.extraction_status != ExtractionStatus::Succeeded
        && doc.page_count > 0;

    wanted.then(|| DocumentSource {
        document_id: doc.id,
        filename: doc.filename.clone(),
        path: doc.file_path.clone().into(),
        category: strategy,
        page_count: doc.page_count,
    })
}
