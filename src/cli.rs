//! Command-line surface of the `loanprint` binary.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use rusqlite::Connection;
use thiserror::Error;
use uuid::Uuid;

use crate::config::{self, DedupConfig};
use crate::db::{self, DatabaseError};
use crate::models::Loan;
use crate::pipeline::dedup::{start_deduplication, DedupContext, DedupError};
use crate::pipeline::fingerprint::{LopdfImageRenderer, PageRenderer, PdfiumRenderer};
use crate::pipeline::import::{ImportError, ImportStatus, Importer};
use crate::pipeline::orchestrator::{HttpMetadataExtractor, OrchestratorError};
use crate::pipeline::probe::LopdfTextLayer;

#[derive(Parser, Debug)]
#[command(name = "loanprint", version)]
#[command(about = "Fingerprint, cluster and version-resolve loan-file PDFs")]
pub struct Cli {
    /// SQLite database (defaults to ~/.loanprint/loanprint.db)
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create an empty loan and print its id
    CreateLoan { name: String },
    /// Register every PDF under a directory
    Import { loan_id: Uuid, dir: PathBuf },
    /// Run deduplication and print the run report
    Dedup { loan_id: Uuid },
    /// Show the run state and document grouping of a loan
    Status { loan_id: Uuid },
    /// Resolve a version group manually
    MarkLatest { document_id: Uuid },
}

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Import(#[from] ImportError),

    #[error(transparent)]
    Dedup(#[from] DedupError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("Loan not found: {0}")]
    LoanNotFound(Uuid),
}

pub fn run(cli: Cli) -> Result<(), CliError> {
    let db_path = cli.database.unwrap_or_else(config::database_path);
    let conn = db::open_database(&db_path)?;
    let config = DedupConfig::from_env();
    // Only runs whose owner stopped heartbeating; a run live in another
    // process keeps its lock.
    db::recover_stale_runs(&conn, config.stale_run_lease())?;

    match cli.command {
        Command::CreateLoan { name } => {
            let loan = Loan::new(&name);
            db::insert_loan(&conn, &loan)?;
            println!("{}", loan.id);
        }
        Command::Import { loan_id, dir } => {
            let importer = Importer::new(Arc::new(LopdfTextLayer), renderer(), config);
            let results = importer.import_directory(&conn, &loan_id, &dir)?;
            for r in &results {
                let strategy = r.strategy.map(|s| s.as_str()).unwrap_or("-");
                println!("{:<40} {:<16} {:>4}p  {:?}", r.filename, strategy, r.page_count, r.status);
            }
            let review = results
                .iter()
                .filter(|r| r.status != ImportStatus::Registered)
                .count();
            println!("{} files, {} need attention", results.len(), review);
        }
        Command::Dedup { loan_id } => {
            let extractor = HttpMetadataExtractor::new(&config.extractor_url)?;
            let ctx = DedupContext::new(
                Arc::new(LopdfTextLayer),
                renderer(),
                Arc::new(extractor),
                config,
            )
            .with_progress(|event| {
                tracing::debug!(
                    stage = ?event.stage,
                    completed = event.completed,
                    total = event.total,
                    "Dedup progress"
                );
            });
            let handle = start_deduplication(conn, loan_id, ctx)?;
            let report = handle.join()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Status { loan_id } => print_status(&conn, &loan_id)?,
        Command::MarkLatest { document_id } => {
            let group = db::mark_as_latest(&conn, &document_id)?;
            println!("{} -> latest {}", group.id, document_id);
        }
    }
    Ok(())
}

/// PDFium when available, otherwise the embedded-image fallback.
fn renderer() -> Arc<dyn PageRenderer> {
    match PdfiumRenderer::new() {
        Ok(pdfium) => Arc::new(pdfium),
        Err(e) => {
            tracing::warn!(error = %e, "PDFium unavailable, rendering embedded page images only");
            Arc::new(LopdfImageRenderer)
        }
    }
}

fn print_status(conn: &Connection, loan_id: &Uuid) -> Result<(), CliError> {
    let loan = db::get_loan(conn, loan_id)?.ok_or(CliError::LoanNotFound(*loan_id))?;
    println!("Loan {} ({})", loan.name, loan.id);
    println!("  dedup status: {}", loan.dedup_status);
    if let Some(at) = loan.dedup_last_run {
        println!("  last run:     {at}");
    }

    for doc in db::list_documents_by_loan(conn, loan_id)? {
        let latest = if doc.is_latest_version { "*" } else { " " };
        println!(
            "{latest} {:<40} {:<9} {:<19} {:<9}{}",
            doc.filename,
            doc.status,
            doc.version_group_id.as_deref().unwrap_or("-"),
            doc.extraction_status,
            if doc.needs_manual_review { "  [review]" } else { "" }
        );
    }

    for group in db::list_version_groups(conn, loan_id)? {
        println!(
            "  group {} {} members={} latest={}",
            group.id,
            group.state,
            group.member_count,
            group
                .latest_document_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".into())
        );
    }
    Ok(())
}
