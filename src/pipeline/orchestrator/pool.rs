use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use base64::Engine;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::extractor::{page_id, ExtractionRequest, MetadataExtractor, PageImage};
use super::job::{plan_document, DocumentSource, ExtractionJob, JobIds, JobStatus};
use super::retry::RetryPolicy;
use super::validate::{validate_response, ExtractionOutcome};
use super::{DocumentOutcome, ExtractionSummary, OrchestratorError};
use crate::config::DedupConfig;
use crate::models::DocumentMetadata;
use crate::pipeline::fingerprint::PageRenderer;

/// How often idle loops re-check cancellation and shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Cooperative cancellation shared between a run and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct WorkerContext {
    extractor: Arc<dyn MetadataExtractor>,
    renderer: Arc<dyn PageRenderer>,
    policy: RetryPolicy,
    model: String,
}

struct JobResult {
    job: ExtractionJob,
    outcome: ExtractionOutcome,
}

pub struct Orchestrator {
    context: Arc<WorkerContext>,
    worker_count: usize,
}

impl Orchestrator {
    pub fn new(
        extractor: Arc<dyn MetadataExtractor>,
        renderer: Arc<dyn PageRenderer>,
        config: &DedupConfig,
    ) -> Self {
        Self {
            context: Arc::new(WorkerContext {
                extractor,
                renderer,
                policy: RetryPolicy::from_config(config),
                model: config.extractor_model.clone(),
            }),
            worker_count: config.worker_count.max(1),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.context.policy
    }

    /// Extract metadata for every source, handing each finished document to
    /// `sink` on the calling thread.
    ///
    /// Returns `Cancelled` once `cancel` fires: nothing further is
    /// dispatched, in-flight calls finish and their results are dropped.
    /// Documents already handed to the sink stay committed.
    pub fn run(
        &self,
        sources: Vec<DocumentSource>,
        cancel: &CancellationToken,
        sink: &mut dyn FnMut(DocumentOutcome) -> Result<(), OrchestratorError>,
    ) -> Result<ExtractionSummary, OrchestratorError> {
        self.run_with_heartbeat(sources, cancel, sink, &mut || {})
    }

    /// [`run`](Self::run), calling `heartbeat` on the coordinating thread at
    /// every poll while jobs are outstanding.
    pub fn run_with_heartbeat(
        &self,
        sources: Vec<DocumentSource>,
        cancel: &CancellationToken,
        sink: &mut dyn FnMut(DocumentOutcome) -> Result<(), OrchestratorError>,
        heartbeat: &mut dyn FnMut(),
    ) -> Result<ExtractionSummary, OrchestratorError> {
        let policy = &self.context.policy;
        let mut summary = ExtractionSummary::default();
        let mut ids = JobIds::default();
        let mut assembly: HashMap<Uuid, Assembly> = HashMap::new();
        let mut initial = Vec::new();

        for source in sources {
            let source = Arc::new(source);
            let jobs = plan_document(&source, policy.base.batch_size, &mut ids);
            if jobs.is_empty() {
                summary.documents_failed += 1;
                sink(DocumentOutcome::Failed {
                    document_id: source.document_id,
                    reason: "document has no pages".into(),
                })?;
                continue;
            }
            assembly.insert(source.document_id, Assembly::new(jobs.len()));
            initial.extend(jobs);
        }

        summary.jobs_queued = initial.len();
        if initial.is_empty() {
            return Ok(summary);
        }
        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }

        let mut pool = WorkerPool::start(self.worker_count.min(initial.len()), &self.context);
        let mut outstanding = 0usize;
        for job in initial {
            pool.submit(job)?;
            outstanding += 1;
        }
        info!(jobs = summary.jobs_queued, workers = pool.size(), "Extraction jobs queued");

        while outstanding > 0 {
            heartbeat();
            if cancel.is_cancelled() {
                warn!(outstanding, "Extraction cancelled, discarding in-flight results");
                pool.shutdown_and_join();
                return Err(OrchestratorError::Cancelled);
            }

            let JobResult { job, outcome } = match pool.recv_timeout(POLL_INTERVAL) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    pool.shutdown_and_join();
                    return Err(OrchestratorError::ChannelClosed);
                }
            };
            outstanding -= 1;

            let document_id = job.document_id();
            let Some(state) = assembly.get_mut(&document_id) else {
                continue;
            };

            match outcome {
                ExtractionOutcome::Ok(validated) => {
                    summary.jobs_succeeded += 1;
                    summary.jobs.push(job.record(JobStatus::Succeeded));
                    state.parts.push((job.first_page(), validated.into_inner()));
                    state.remaining -= 1;
                }
                failure => {
                    let reason = failure.failure_reason().unwrap_or_default();
                    // Once one batch of a document is lost the document fails
                    // regardless, so its other batches are not retried.
                    let retries = if state.failure.is_none() {
                        policy.retry_jobs(&job, &mut ids)
                    } else {
                        Vec::new()
                    };

                    if retries.is_empty() {
                        warn!(
                            document_id = %document_id,
                            job_id = job.id,
                            attempt = job.attempt,
                            reason = %reason,
                            "Extraction job failed permanently"
                        );
                        summary.jobs_failed += 1;
                        summary.jobs.push(job.record(JobStatus::Failed));
                        state.failure.get_or_insert(reason);
                        state.remaining -= 1;
                    } else {
                        warn!(
                            document_id = %document_id,
                            job_id = job.id,
                            attempt = job.attempt,
                            retry_jobs = retries.len(),
                            reason = %reason,
                            "Extraction job failed, retrying with degraded parameters"
                        );
                        summary.jobs_retried += 1;
                        summary.jobs.push(job.record(JobStatus::Retried));
                        state.remaining += retries.len() - 1;
                        for retry in retries {
                            pool.submit(retry)?;
                            outstanding += 1;
                        }
                    }
                }
            }

            if state.remaining == 0 {
                let outcome = match assembly.remove(&document_id) {
                    Some(state) => state.finish(document_id),
                    None => continue,
                };
                match &outcome {
                    DocumentOutcome::Succeeded { .. } => summary.documents_succeeded += 1,
                    DocumentOutcome::Failed { .. } => summary.documents_failed += 1,
                }
                if let Err(e) = sink(outcome) {
                    error!(document_id = %document_id, error = %e, "Committing extraction result failed");
                    pool.shutdown_and_join();
                    return Err(e);
                }
            }
        }

        pool.shutdown_and_join();
        info!(
            documents_succeeded = summary.documents_succeeded,
            documents_failed = summary.documents_failed,
            jobs_retried = summary.jobs_retried,
            "Extraction finished"
        );
        Ok(summary)
    }
}

/// Per-document result assembly.
struct Assembly {
    remaining: usize,
    parts: Vec<(usize, DocumentMetadata)>,
    failure: Option<String>,
}

impl Assembly {
    fn new(batches: usize) -> Self {
        Self {
            remaining: batches,
            parts: Vec::with_capacity(batches),
            failure: None,
        }
    }

    fn finish(mut self, document_id: Uuid) -> DocumentOutcome {
        if let Some(reason) = self.failure {
            return DocumentOutcome::Failed { document_id, reason };
        }
        self.parts.sort_by_key(|(first_page, _)| *first_page);
        let parts: Vec<DocumentMetadata> = self.parts.into_iter().map(|(_, m)| m).collect();
        match DocumentMetadata::merge(&parts) {
            Some(metadata) => DocumentOutcome::Succeeded {
                document_id,
                metadata,
            },
            None => DocumentOutcome::Failed {
                document_id,
                reason: "no metadata returned".into(),
            },
        }
    }
}

// ── Worker pool ──────────────────────────────────────────

struct WorkerPool {
    job_sender: Option<Sender<ExtractionJob>>,
    result_receiver: Receiver<JobResult>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    fn start(worker_count: usize, context: &Arc<WorkerContext>) -> Self {
        let (job_sender, job_receiver) = unbounded::<ExtractionJob>();
        let (result_sender, result_receiver) = unbounded::<JobResult>();
        let shutdown = Arc::new(AtomicBool::new(false));

        let workers = (0..worker_count.max(1))
            .map(|worker_id| {
                let job_rx = job_receiver.clone();
                let result_tx = result_sender.clone();
                let shutdown_flag = Arc::clone(&shutdown);
                let ctx = Arc::clone(context);
                thread::spawn(move || run_worker(worker_id, job_rx, result_tx, shutdown_flag, ctx))
            })
            .collect();

        Self {
            job_sender: Some(job_sender),
            result_receiver,
            workers,
            shutdown,
        }
    }

    fn size(&self) -> usize {
        self.workers.len()
    }

    fn submit(&self, job: ExtractionJob) -> Result<(), OrchestratorError> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(OrchestratorError::ChannelClosed);
        }
        self.job_sender
            .as_ref()
            .ok_or(OrchestratorError::ChannelClosed)?
            .send(job)
            .map_err(|_| OrchestratorError::ChannelClosed)
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<JobResult, RecvTimeoutError> {
        self.result_receiver.recv_timeout(timeout)
    }

    /// Stop dispatching and wait for workers to finish their current call.
    fn shutdown_and_join(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.job_sender.take();
        for (i, worker) in self.workers.drain(..).enumerate() {
            if worker.join().is_err() {
                error!(worker = i, "Extraction worker panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

fn run_worker(
    worker_id: usize,
    jobs: Receiver<ExtractionJob>,
    results: Sender<JobResult>,
    shutdown: Arc<AtomicBool>,
    ctx: Arc<WorkerContext>,
) {
    debug!(worker = worker_id, "Extraction worker started");

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        match jobs.recv_timeout(POLL_INTERVAL) {
            Ok(job) => {
                let outcome = execute_job(&job, &ctx);
                if results.send(JobResult { job, outcome }).is_err() {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!(worker = worker_id, "Extraction worker stopped");
}

fn execute_job(job: &ExtractionJob, ctx: &WorkerContext) -> ExtractionOutcome {
    let source = &job.source;
    let params = ctx.policy.params_for(job.attempt);
    let span = tracing::info_span!(
        "extraction_job",
        document_id = %source.document_id,
        job_id = job.id,
        attempt = job.attempt
    );
    let _guard = span.enter();
    let started = Instant::now();

    let pdf = match std::fs::read(&source.path) {
        Ok(bytes) => bytes,
        Err(e) => {
            return ExtractionOutcome::Failed(format!("Cannot read {}: {e}", source.path.display()))
        }
    };

    let mut pages = Vec::with_capacity(job.pages.len());
    for &page in &job.pages {
        match ctx.renderer.render_page(&pdf, page, params.dpi) {
            Ok(png) => pages.push(PageImage {
                page_id: page_id(&source.document_id, page),
                page_number: page + 1,
                png_base64: base64::engine::general_purpose::STANDARD.encode(png),
            }),
            Err(e) => return ExtractionOutcome::Failed(e.to_string()),
        }
    }

    let request = ExtractionRequest {
        model: ctx.model.clone(),
        document_id: source.document_id,
        filename: source.filename.clone(),
        category: source.category,
        attempt: job.attempt,
        page_count: source.page_count,
        pages,
    };

    let outcome = match ctx.extractor.extract(&request, params.timeout) {
        Ok(value) => validate_response(&value, &request.page_ids()),
        Err(OrchestratorError::ExtractionTimeout { .. }) => ExtractionOutcome::Timeout,
        Err(OrchestratorError::ExtractionMalformedOutput(e)) => ExtractionOutcome::SchemaError(e),
        Err(e) => ExtractionOutcome::Failed(e.to_string()),
    };

    debug!(
        pages = job.pages.len(),
        dpi = params.dpi,
        elapsed_ms = started.elapsed().as_millis() as u64,
        ok = outcome.is_ok(),
        "Extraction call finished"
    );
    outcome
}
