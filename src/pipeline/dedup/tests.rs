//! End-to-end runs over synthetic loan files.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::time::Duration;

use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

use super::*;
use crate::config::DedupConfig;
use crate::db::{self, open_database};
use crate::models::enums::{DedupStatus, DocumentStatus, ExtractionStatus, VersionGroupState};
use crate::models::{Document, Loan};
use crate::pipeline::fingerprint::MockPageRenderer;
use crate::pipeline::import::Importer;
use crate::pipeline::orchestrator::{mock_response, CancellationToken, MockExtractor, OrchestratorError};
use crate::pipeline::probe::test_pdfs::*;
use crate::pipeline::probe::LopdfTextLayer;

fn config() -> DedupConfig {
    DedupConfig {
        worker_count: 4,
        fingerprint_workers: 4,
        ..DedupConfig::default()
    }
}

fn context(extractor: Arc<MockExtractor>) -> DedupContext {
    DedupContext::new(
        Arc::new(LopdfTextLayer),
        Arc::new(MockPageRenderer::new(3)),
        extractor,
        config(),
    )
}

struct Env {
    dir: tempfile::TempDir,
    files: tempfile::TempDir,
    loan: Loan,
}

impl Env {
    fn new() -> Self {
        let env = Self {
            dir: tempfile::tempdir().unwrap(),
            files: tempfile::tempdir().unwrap(),
            loan: Loan::new("Loan 2024-117"),
        };
        db::insert_loan(&env.conn(), &env.loan).unwrap();
        env
    }

    /// Every call opens a fresh connection to the same file-backed database.
    fn conn(&self) -> Connection {
        open_database(&self.dir.path().join("loanprint.db")).unwrap()
    }

    fn write(&self, name: &str, bytes: &[u8]) {
        let path = self.files.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, bytes).unwrap();
    }

    fn import(&self) {
        let importer = Importer::new(
            Arc::new(LopdfTextLayer),
            Arc::new(MockPageRenderer::new(3)),
            config(),
        );
        importer
            .import_directory(&self.conn(), &self.loan.id, self.files.path())
            .unwrap();
    }

    fn documents(&self) -> Vec<Document> {
        db::list_documents_by_loan(&self.conn(), &self.loan.id).unwrap()
    }

    fn by_name(&self, name: &str) -> Document {
        self.documents()
            .into_iter()
            .find(|d| d.filename == name)
            .unwrap()
    }

    fn run(&self, extractor: Arc<MockExtractor>) -> Result<DedupReport, DedupError> {
        run_deduplication(
            &self.conn(),
            &self.loan.id,
            &context(extractor),
            &CancellationToken::new(),
        )
    }
}

fn grouping(docs: &[Document]) -> Vec<(Uuid, DocumentStatus, Option<Uuid>, Option<String>, bool)> {
    let mut rows: Vec<_> = docs
        .iter()
        .map(|d| {
            (
                d.id,
                d.status,
                d.master_document_id,
                d.version_group_id.clone(),
                d.is_latest_version,
            )
        })
        .collect();
    rows.sort_by_key(|r| r.0);
    rows
}

// ── Scenario A: byte-identical re-uploads ────────────────

#[test]
fn identical_uploads_collapse_to_first() {
    let env = Env::new();
    let bytes = scanned_pdf(2, "same-scan");
    for name in ["a.pdf", "b.pdf", "c.pdf"] {
        env.write(name, &bytes);
    }
    env.import();

    let report = env.run(Arc::new(MockExtractor::answering("Promissory Note"))).unwrap();
    assert_eq!(report.duplicate_clusters, 1);
    assert_eq!(report.duplicates, 2);

    let a = env.by_name("a.pdf");
    assert_eq!(a.status, DocumentStatus::Unique);
    assert_eq!(a.duplicate_count, 2);
    assert!(a.master_document_id.is_none());
    for name in ["b.pdf", "c.pdf"] {
        let dup = env.by_name(name);
        assert_eq!(dup.status, DocumentStatus::Duplicate);
        assert_eq!(dup.master_document_id, Some(a.id));
        assert_eq!(dup.text_hash, a.text_hash);
    }

    let canonical = db::list_canonical_documents(&env.conn(), &env.loan.id).unwrap();
    assert_eq!(canonical.len(), 1);
    assert_eq!(canonical[0].id, a.id);
}

// ── Scenario B: signed edit beats unsigned draft ─────────

fn form_response(req: &crate::pipeline::orchestrator::ExtractionRequest) -> serde_json::Value {
    let signed = req.filename.starts_with("signed");
    json!({
        "document_type": "Uniform Residential Loan Application",
        "detected_dates": [if signed { "2024-01-01" } else { "2023-12-01" }],
        "persons": ["Jane Doe"],
        "has_signature": signed,
        "completeness": 0.8,
        "key_identifiers": {
            "loan_number": "LN-4411",
            "borrower_name": "Jane Doe",
            "property_address": "12 Elm Street"
        },
        "page_ids": req.page_ids(),
    })
}

#[test]
fn signed_version_elected_latest() {
    let env = Env::new();
    env.write("draft.pdf", &scanned_pdf(2, "draft render"));
    env.write("signed.pdf", &scanned_pdf(2, "signed render"));
    env.import();

    let report = env
        .run(Arc::new(MockExtractor::new(|req| Ok(form_response(req)))))
        .unwrap();
    assert_eq!(report.version_groups, 1);
    assert_eq!(report.ambiguous_groups, 0);

    let signed = env.by_name("signed.pdf");
    let draft = env.by_name("draft.pdf");
    assert!(signed.is_latest_version);
    assert!(!draft.is_latest_version);
    assert_eq!(draft.status, DocumentStatus::Version);
    assert_eq!(signed.version_group_id, draft.version_group_id);
    assert_eq!(signed.detected_date, NaiveDate::from_ymd_opt(2024, 1, 1));

    let groups = db::list_version_groups(&env.conn(), &env.loan.id).unwrap();
    assert_eq!(groups[0].state, VersionGroupState::Resolved);
    assert_eq!(groups[0].latest_document_id, Some(signed.id));
}

#[test]
fn tied_versions_left_ambiguous_until_marked() {
    let env = Env::new();
    env.write("one.pdf", &scanned_pdf(1, "one"));
    env.write("two.pdf", &scanned_pdf(1, "two"));
    env.import();

    let extractor = Arc::new(MockExtractor::answering("Closing Disclosure"));
    let report = env.run(extractor.clone()).unwrap();
    assert_eq!(report.ambiguous_groups, 1);
    assert!(env.documents().iter().all(|d| !d.is_latest_version));

    let two = env.by_name("two.pdf");
    db::mark_as_latest(&env.conn(), &two.id).unwrap();
    env.run(extractor).unwrap();

    assert!(env.by_name("two.pdf").is_latest_version);
    assert!(!env.by_name("one.pdf").is_latest_version);
    let groups = db::list_version_groups(&env.conn(), &env.loan.id).unwrap();
    assert_eq!(groups[0].state, VersionGroupState::Manual);
}

// ── Scenario C: mixed loan with one forced failure ───────

fn table_doc(i: usize) -> Vec<u8> {
    let mut page = PageSpec::table(5, 3);
    page.lines.push((72.0, 560.0, format!("Statement period {i}")));
    build_pdf(&[page], &format!("table-{i}"))
}

fn text_doc(i: usize) -> Vec<u8> {
    let line = format!("Letter of explanation number {i} regarding a recent change of residence");
    text_pdf(&[&line, "The borrower confirms the details above are accurate."], &format!("text-{i}"))
}

/// Scans are bank statements of distinct borrowers; tables are five
/// closing disclosures in five revisions each, dated one day apart.
fn mixed_loan_response(req: &crate::pipeline::orchestrator::ExtractionRequest) -> serde_json::Value {
    let stem = req.filename.trim_end_matches(".pdf");
    let (kind, n) = stem.split_once('-').unwrap();
    let n: usize = n.parse().unwrap();

    let mut response = mock_response(req, "Bank Statement");
    match kind {
        "scan" => {
            response["key_identifiers"] = json!({ "borrower_name": format!("Borrower {n}") });
            response["detected_dates"] = json!(["2024-02-01"]);
        }
        "table" => {
            response["document_type"] = json!("Closing Disclosure");
            response["key_identifiers"] = json!({ "loan_number": format!("CD-{}", n / 5) });
            response["detected_dates"] = json!([format!("2024-01-{:02}", n % 5 + 1)]);
        }
        other => panic!("Unexpected extraction request for {other}"),
    }
    response
}

#[test]
fn mixed_loan_queues_fifty_jobs_and_recovers_forced_failure() {
    let env = Env::new();
    for i in 0..25 {
        env.write(&format!("scan-{i:02}.pdf"), &scanned_pdf(1, &format!("scan-{i}")));
        env.write(&format!("table-{i:02}.pdf"), &table_doc(i));
    }
    for i in 0..24 {
        env.write(&format!("text-{i:02}.pdf"), &text_doc(i));
    }
    env.import();

    let docs = env.documents();
    assert_eq!(docs.len(), 74);
    let count = |s| docs.iter().filter(|d| d.strategy == Some(s)).count();
    use crate::models::enums::ExtractionStrategy::*;
    assert_eq!((count(Scanned), count(TextWithTables), count(TextOnly)), (25, 25, 24));

    let extractor = Arc::new(MockExtractor::new(|req| {
        if req.filename == "scan-00.pdf" && req.attempt == 1 {
            Err(OrchestratorError::ExtractionTimeout { secs: 120 })
        } else {
            Ok(mixed_loan_response(req))
        }
    }));
    let report = env.run(extractor.clone()).unwrap();

    assert_eq!(report.jobs_queued, 50);
    assert_eq!(report.jobs_retried, 1);
    assert_eq!(report.extraction_succeeded, 50);
    assert_eq!(report.extraction_failed, 0);
    assert_eq!(extractor.calls(), 51);
    assert!(env
        .documents()
        .iter()
        .all(|d| d.extraction_status == ExtractionStatus::Succeeded));

    // Only the closing disclosures form version groups, each electing its
    // most recent revision.
    assert_eq!(report.duplicates, 0);
    assert_eq!(report.version_groups, 5);
    assert_eq!(report.ambiguous_groups, 0);
    let groups = db::list_version_groups(&env.conn(), &env.loan.id).unwrap();
    assert!(groups
        .iter()
        .all(|g| g.member_count == 5 && g.state == VersionGroupState::Resolved));

    for i in 0..25 {
        let table = env.by_name(&format!("table-{i:02}.pdf"));
        assert!(table.version_group_id.is_some());
        assert_eq!(table.is_latest_version, i % 5 == 4, "table-{i:02}.pdf");
        let scan = env.by_name(&format!("scan-{i:02}.pdf"));
        assert!(scan.version_group_id.is_none(), "Distinct borrowers never group");
        assert!(scan.is_latest_version);
    }

    let canonical = db::list_canonical_documents(&env.conn(), &env.loan.id).unwrap();
    assert_eq!(canonical.len(), 25 + 5 + 24);
}

#[test]
fn permanent_failures_are_terminal_and_non_fatal() {
    let env = Env::new();
    for i in 0..6 {
        env.write(&format!("scan-{i}.pdf"), &scanned_pdf(1, &format!("s{i}")));
    }
    env.import();

    let extractor = Arc::new(MockExtractor::new(|_| {
        Err(OrchestratorError::ExtractionMalformedOutput("not json".into()))
    }));
    let report = env.run(extractor.clone()).unwrap();

    assert_eq!(report.extraction_failed, 6);
    assert_eq!(report.jobs_failed, 6);
    assert_eq!(extractor.calls(), 12);
    let docs = env.documents();
    assert!(docs.iter().all(|d| d.extraction_status == ExtractionStatus::Failed));
    assert!(docs.iter().all(|d| d.deep_metadata.is_none()));

    let loan = db::get_loan(&env.conn(), &env.loan.id).unwrap().unwrap();
    assert_eq!(loan.dedup_status, DedupStatus::Completed);
}

#[test]
fn unreadable_file_does_not_block_run() {
    let env = Env::new();
    env.write("good.pdf", &scanned_pdf(1, "good"));
    env.write("broken.pdf", b"%PDF-1.7 truncated");
    env.import();

    let report = env.run(Arc::new(MockExtractor::answering("Appraisal Report"))).unwrap();
    assert_eq!(report.documents, 2);
    assert_eq!(report.unreadable, 1);
    assert_eq!(report.jobs_queued, 1);

    let broken = env.by_name("broken.pdf");
    assert!(broken.needs_manual_review);
    assert_eq!(broken.page_count, 0);

    let canonical = db::list_canonical_documents(&env.conn(), &env.loan.id).unwrap();
    assert_eq!(canonical.len(), 1);
    assert_eq!(canonical[0].id, env.by_name("good.pdf").id);
}

// ── Run lifecycle ────────────────────────────────────────

#[test]
fn report_persisted_and_rerun_idempotent() {
    let env = Env::new();
    env.write("draft.pdf", &scanned_pdf(2, "draft"));
    env.write("signed.pdf", &scanned_pdf(2, "signed"));
    env.write("copy/signed.pdf", &scanned_pdf(2, "signed"));
    env.import();

    let extractor = Arc::new(MockExtractor::new(|req| Ok(form_response(req))));
    let first = env.run(extractor.clone()).unwrap();
    let before = grouping(&env.documents());

    let loan = db::get_loan(&env.conn(), &env.loan.id).unwrap().unwrap();
    assert_eq!(loan.dedup_status, DedupStatus::Completed);
    let stored: DedupReport = serde_json::from_str(&loan.dedup_last_report.unwrap()).unwrap();
    assert_eq!(stored, first);

    let second = env.run(extractor.clone()).unwrap();
    assert_eq!(second.jobs_queued, 0, "Extracted documents are not re-sent");
    assert_eq!(grouping(&env.documents()), before);
    assert_eq!(extractor.calls(), 3);
}

#[test]
fn unknown_loan_rejected() {
    let env = Env::new();
    let result = run_deduplication(
        &env.conn(),
        &Uuid::new_v4(),
        &context(Arc::new(MockExtractor::answering("Note"))),
        &CancellationToken::new(),
    );
    assert!(matches!(result, Err(DedupError::LoanNotFound(_))));
}

fn blocking_extractor(release: Arc<AtomicBool>) -> Arc<MockExtractor> {
    Arc::new(MockExtractor::new(move |req| {
        for _ in 0..500 {
            if release.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(mock_response(req, "Note"))
    }))
}

#[test]
fn second_trigger_rejected_while_running() {
    let env = Env::new();
    env.write("a.pdf", &scanned_pdf(1, "a"));
    env.import();

    let release = Arc::new(AtomicBool::new(false));
    let handle =
        start_deduplication(env.conn(), env.loan.id, context(blocking_extractor(release.clone())))
            .unwrap();
    assert_eq!(handle.loan_id(), env.loan.id);

    let second = start_deduplication(
        env.conn(),
        env.loan.id,
        context(Arc::new(MockExtractor::answering("Note"))),
    );
    assert!(matches!(second, Err(DedupError::RunAlreadyInProgress { .. })));
    let loan = db::get_loan(&env.conn(), &env.loan.id).unwrap().unwrap();
    assert_eq!(loan.dedup_status, DedupStatus::Running);

    release.store(true, Ordering::SeqCst);
    let report = handle.join().unwrap();
    assert_eq!(report.extraction_succeeded, 1);

    // The lock is free again once the run completed.
    env.run(Arc::new(MockExtractor::answering("Note"))).unwrap();
}

#[test]
fn concurrent_triggers_admit_exactly_one() {
    let env = Env::new();
    env.write("a.pdf", &scanned_pdf(1, "a"));
    env.import();

    let release = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(6));
    let db_path = env.dir.path().join("loanprint.db");

    let attempts: Vec<_> = (0..6)
        .map(|_| {
            let barrier = barrier.clone();
            let ctx = context(blocking_extractor(release.clone()));
            let conn = open_database(&db_path).unwrap();
            let loan_id = env.loan.id;
            std::thread::spawn(move || {
                barrier.wait();
                start_deduplication(conn, loan_id, ctx)
            })
        })
        .collect();

    let results: Vec<_> = attempts.into_iter().map(|t| t.join().unwrap()).collect();
    release.store(true, Ordering::SeqCst);

    let mut started = 0;
    for result in results {
        match result {
            Ok(handle) => {
                started += 1;
                handle.join().unwrap();
            }
            Err(DedupError::RunAlreadyInProgress { .. }) => {}
            Err(other) => panic!("Unexpected error {other}"),
        }
    }
    assert_eq!(started, 1);
}

#[test]
fn cancelled_run_fails_without_partial_commits() {
    let env = Env::new();
    for i in 0..8 {
        env.write(&format!("scan-{i}.pdf"), &scanned_pdf(1, &format!("c{i}")));
    }
    env.import();

    let extractor = Arc::new(MockExtractor::new(|req| {
        std::thread::sleep(Duration::from_millis(20));
        Ok(mock_response(req, "Note"))
    }));
    let cancel = CancellationToken::new();
    let trip = cancel.clone();
    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = events.clone();
    let ctx = DedupContext {
        config: DedupConfig {
            worker_count: 1,
            ..config()
        },
        ..context(extractor.clone())
    }
    .with_progress(move |event| {
        if event.stage == DedupStage::Extracting && event.completed >= 1 {
            trip.cancel();
        }
        seen.lock().unwrap().push(event);
    });

    let result = run_deduplication(&env.conn(), &env.loan.id, &ctx, &cancel);
    assert!(matches!(result, Err(DedupError::Cancelled)));

    let loan = db::get_loan(&env.conn(), &env.loan.id).unwrap().unwrap();
    assert_eq!(loan.dedup_status, DedupStatus::Failed);

    let docs = env.documents();
    let done = docs
        .iter()
        .filter(|d| d.extraction_status == ExtractionStatus::Succeeded)
        .count();
    assert_eq!(done, 1);
    for d in &docs {
        assert_eq!(d.deep_metadata.is_some(), d.extraction_status == ExtractionStatus::Succeeded);
    }
    assert!(!events.lock().unwrap().iter().any(|e| e.stage == DedupStage::Resolving));

    // A later run picks up only what is left.
    let report = env.run(Arc::new(MockExtractor::answering("Note"))).unwrap();
    assert_eq!(report.jobs_queued, 7);
}

#[test]
fn progress_reports_every_stage() {
    let env = Env::new();
    env.write("a.pdf", &scanned_pdf(1, "a"));
    env.write("b.pdf", &scanned_pdf(1, "b"));
    env.import();

    // A record stored without hashes gets fingerprinted by the run.
    let late = env.files.path().join("late.pdf");
    std::fs::write(&late, scanned_pdf(1, "late")).unwrap();
    let doc = Document::new(env.loan.id, "late.pdf", &late.to_string_lossy(), 0);
    db::insert_document(&env.conn(), &doc).unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = events.clone();
    let ctx = context(Arc::new(MockExtractor::answering("Note")))
        .with_progress(move |e| seen.lock().unwrap().push(e));
    let report = run_deduplication(&env.conn(), &env.loan.id, &ctx, &CancellationToken::new()).unwrap();
    assert_eq!(report.fingerprinted, 1);
    assert_eq!(report.jobs_queued, 3);

    let events = events.lock().unwrap();
    let stages: Vec<DedupStage> = events.iter().map(|e| e.stage).collect();
    assert_eq!(stages.first(), Some(&DedupStage::Fingerprinting));
    assert_eq!(stages.last(), Some(&DedupStage::Completed));
    let extracted = events
        .iter()
        .filter(|e| e.stage == DedupStage::Extracting)
        .map(|e| e.completed)
        .max();
    assert_eq!(extracted, Some(3));
    assert!(events.iter().all(|e| e.loan_id == env.loan.id));
}

#[test]
fn files_are_read_from_their_stored_path() {
    let env = Env::new();
    env.write("a.pdf", &scanned_pdf(1, "a"));
    env.import();
    let doc = env.by_name("a.pdf");
    assert!(Path::new(&doc.file_path).exists());

    std::fs::remove_file(&doc.file_path).unwrap();
    let report = env.run(Arc::new(MockExtractor::answering("Note"))).unwrap();
    assert_eq!(report.extraction_failed, 1, "Missing file fails the document, not the run");
}
