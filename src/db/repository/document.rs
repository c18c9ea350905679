use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use super::parse_uuid;
use crate::db::DatabaseError;
use crate::models::enums::*;
use crate::models::*;

const DOCUMENT_COLUMNS: &str = "id, loan_id, filename, file_path, size_bytes, page_count, uploaded_at,
     strategy, text_hash, visual_phash, visual_dhash, visual_ahash, visual_whash,
     document_phash_signature, status, master_document_id, duplicate_count, version_group_id,
     detected_date, is_latest_version, extraction_status, deep_metadata, needs_manual_review";

/// Clustering outcome for one document, written by the version resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentAssignment {
    pub document_id: Uuid,
    pub status: DocumentStatus,
    pub master_document_id: Option<Uuid>,
    pub duplicate_count: u32,
    pub version_group_id: Option<String>,
    pub is_latest_version: bool,
}

pub fn insert_document(conn: &Connection, doc: &Document) -> Result<(), DatabaseError> {
    let visual = VisualColumns::from_pages(&doc.page_hashes);
    let metadata = doc
        .deep_metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "INSERT INTO documents (id, loan_id, filename, file_path, size_bytes, page_count, uploaded_at,
         strategy, text_hash, visual_phash, visual_dhash, visual_ahash, visual_whash,
         document_phash_signature, status, master_document_id, duplicate_count, version_group_id,
         detected_date, is_latest_version, extraction_status, deep_metadata, needs_manual_review)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18,
                 ?19, ?20, ?21, ?22, ?23)",
        params![
            doc.id.to_string(),
            doc.loan_id.to_string(),
            doc.filename,
            doc.file_path,
            doc.size_bytes as i64,
            doc.page_count,
            doc.uploaded_at,
            doc.strategy.map(|s| s.as_str()),
            doc.text_hash,
            visual.phash,
            visual.dhash,
            visual.ahash,
            visual.whash,
            doc.document_phash_signature,
            doc.status.as_str(),
            doc.master_document_id.map(|id| id.to_string()),
            doc.duplicate_count,
            doc.version_group_id,
            doc.detected_date,
            doc.is_latest_version as i32,
            doc.extraction_status.as_str(),
            metadata,
            doc.needs_manual_review as i32,
        ],
    )?;
    Ok(())
}

pub fn get_document(conn: &Connection, id: &Uuid) -> Result<Option<Document>, DatabaseError> {
    let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1");
    let mut stmt = conn.prepare(&sql)?;

    let result = stmt.query_row(params![id.to_string()], read_document_row);

    match result {
        Ok(row) => Ok(Some(document_from_row(row)?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// All documents of a loan in upload order (ties broken by id).
pub fn list_documents_by_loan(
    conn: &Connection,
    loan_id: &Uuid,
) -> Result<Vec<Document>, DatabaseError> {
    let sql = format!(
        "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE loan_id = ?1 ORDER BY uploaded_at ASC, id ASC"
    );
    query_documents(conn, &sql, &loan_id.to_string())
}

/// Documents downstream stages should read: elected latest versions and
/// singletons. Duplicates, superseded versions and documents awaiting
/// manual review are excluded.
pub fn list_canonical_documents(
    conn: &Connection,
    loan_id: &Uuid,
) -> Result<Vec<Document>, DatabaseError> {
    let sql = format!(
        "SELECT {DOCUMENT_COLUMNS} FROM documents
         WHERE loan_id = ?1 AND status != 'duplicate' AND is_latest_version = 1
           AND needs_manual_review = 0
         ORDER BY uploaded_at ASC, id ASC"
    );
    query_documents(conn, &sql, &loan_id.to_string())
}

/// Persist the file-scan-time probe and fingerprint results.
pub fn update_fingerprints(conn: &Connection, doc: &Document) -> Result<(), DatabaseError> {
    let visual = VisualColumns::from_pages(&doc.page_hashes);
    let rows = conn.execute(
        "UPDATE documents SET page_count = ?2, strategy = ?3, text_hash = ?4,
         visual_phash = ?5, visual_dhash = ?6, visual_ahash = ?7, visual_whash = ?8,
         document_phash_signature = ?9, needs_manual_review = ?10, extraction_status = ?11
         WHERE id = ?1",
        params![
            doc.id.to_string(),
            doc.page_count,
            doc.strategy.map(|s| s.as_str()),
            doc.text_hash,
            visual.phash,
            visual.dhash,
            visual.ahash,
            visual.whash,
            doc.document_phash_signature,
            doc.needs_manual_review as i32,
            doc.extraction_status.as_str(),
        ],
    )?;
    ensure_updated(rows, &doc.id)
}

/// Commit the outcome of deep extraction for one document in a single statement.
///
/// A document either gets its complete merged metadata or none at all.
pub fn commit_extraction(
    conn: &Connection,
    document_id: &Uuid,
    status: ExtractionStatus,
    metadata: Option<&DocumentMetadata>,
) -> Result<(), DatabaseError> {
    let json = metadata.map(serde_json::to_string).transpose()?;
    let detected_date = metadata.and_then(|m| m.latest_date());

    let rows = conn.execute(
        "UPDATE documents SET extraction_status = ?2, deep_metadata = ?3, detected_date = ?4
         WHERE id = ?1",
        params![document_id.to_string(), status.as_str(), json, detected_date],
    )?;
    ensure_updated(rows, document_id)
}

/// Write every clustering assignment of a run atomically.
pub fn apply_assignments(
    conn: &Connection,
    assignments: &[DocumentAssignment],
) -> Result<(), DatabaseError> {
    let tx = conn.unchecked_transaction()?;
    write_assignments(&tx, assignments)?;
    tx.commit()?;
    Ok(())
}

/// Assignment writes without transaction control, for callers that batch
/// them with other writes.
///
/// Masters are written before their duplicates so the self-reference
/// always points at a row whose own master is already cleared.
pub(crate) fn write_assignments(
    conn: &Connection,
    assignments: &[DocumentAssignment],
) -> Result<(), DatabaseError> {
    let mut stmt = conn.prepare(
        "UPDATE documents SET status = ?2, master_document_id = ?3, duplicate_count = ?4,
         version_group_id = ?5, is_latest_version = ?6
         WHERE id = ?1",
    )?;

    let (masters, duplicates): (Vec<_>, Vec<_>) = assignments
        .iter()
        .partition(|a| a.master_document_id.is_none());

    for a in masters.into_iter().chain(duplicates) {
        let rows = stmt.execute(params![
            a.document_id.to_string(),
            a.status.as_str(),
            a.master_document_id.map(|id| id.to_string()),
            a.duplicate_count,
            a.version_group_id,
            a.is_latest_version as i32,
        ])?;
        ensure_updated(rows, &a.document_id)?;
    }
    Ok(())
}

fn ensure_updated(rows: usize, id: &Uuid) -> Result<(), DatabaseError> {
    if rows == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "Document".into(),
            id: id.to_string(),
        });
    }
    Ok(())
}

fn query_documents(
    conn: &Connection,
    sql: &str,
    loan_id: &str,
) -> Result<Vec<Document>, DatabaseError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![loan_id], read_document_row)?;

    let mut docs = Vec::new();
    for row in rows {
        docs.push(document_from_row(row?)?);
    }
    Ok(docs)
}

/// Per-page hashes flattened into four comma-separated columns.
struct VisualColumns {
    phash: Option<String>,
    dhash: Option<String>,
    ahash: Option<String>,
    whash: Option<String>,
}

impl VisualColumns {
    fn from_pages(pages: &[PageHashes]) -> Self {
        if pages.is_empty() {
            return Self { phash: None, dhash: None, ahash: None, whash: None };
        }
        Self {
            phash: join_pages(pages, |p| p.phash.as_str()),
            dhash: join_pages(pages, |p| p.dhash.as_str()),
            ahash: join_pages(pages, |p| p.ahash.as_str()),
            whash: join_pages(pages, |p| p.whash.as_str()),
        }
    }

    fn into_pages(self) -> Vec<PageHashes> {
        let split = |v: Option<String>| -> Vec<String> {
            v.filter(|s| !s.is_empty())
                .map(|s| s.split(',').map(String::from).collect())
                .unwrap_or_default()
        };
        let phash = split(self.phash);
        let dhash = split(self.dhash);
        let ahash = split(self.ahash);
        let whash = split(self.whash);

        phash
            .into_iter()
            .enumerate()
            .map(|(i, phash)| PageHashes {
                phash,
                dhash: dhash.get(i).cloned().unwrap_or_default(),
                ahash: ahash.get(i).cloned().unwrap_or_default(),
                whash: whash.get(i).cloned().unwrap_or_default(),
            })
            .collect()
    }
}

fn join_pages(pages: &[PageHashes], field: impl Fn(&PageHashes) -> &str) -> Option<String> {
    Some(pages.iter().map(field).collect::<Vec<_>>().join(","))
}

struct DocumentRow {
    id: String,
    loan_id: String,
    filename: String,
    file_path: String,
    size_bytes: i64,
    page_count: u32,
    uploaded_at: NaiveDateTime,
    strategy: Option<String>,
    text_hash: Option<String>,
    visual: VisualColumns,
    document_phash_signature: Option<String>,
    status: String,
    master_document_id: Option<String>,
    duplicate_count: u32,
    version_group_id: Option<String>,
    detected_date: Option<NaiveDate>,
    is_latest_version: i32,
    extraction_status: String,
    deep_metadata: Option<String>,
    needs_manual_review: i32,
}

fn read_document_row(row: &Row<'_>) -> rusqlite::Result<DocumentRow> {
    Ok(DocumentRow {
        id: row.get(0)?,
        loan_id: row.get(1)?,
        filename: row.get(2)?,
        file_path: row.get(3)?,
        size_bytes: row.get(4)?,
        page_count: row.get(5)?,
        uploaded_at: row.get(6)?,
        strategy: row.get(7)?,
        text_hash: row.get(8)?,
        visual: VisualColumns {
            phash: row.get(9)?,
            dhash: row.get(10)?,
            ahash: row.get(11)?,
            whash: row.get(12)?,
        },
        document_phash_signature: row.get(13)?,
        status: row.get(14)?,
        master_document_id: row.get(15)?,
        duplicate_count: row.get(16)?,
        version_group_id: row.get(17)?,
        detected_date: row.get(18)?,
        is_latest_version: row.get(19)?,
        extraction_status: row.get(20)?,
        deep_metadata: row.get(21)?,
        needs_manual_review: row.get(22)?,
    })
}

fn document_from_row(row: DocumentRow) -> Result<Document, DatabaseError> {
    let deep_metadata = row
        .deep_metadata
        .as_deref()
        .map(serde_json::from_str::<DocumentMetadata>)
        .transpose()?;

    Ok(Document {
        id: parse_uuid(&row.id)?,
        loan_id: parse_uuid(&row.loan_id)?,
        filename: row.filename,
        file_path: row.file_path,
        size_bytes: row.size_bytes.max(0) as u64,
        page_count: row.page_count,
        uploaded_at: row.uploaded_at,
        strategy: row.strategy.as_deref().map(ExtractionStrategy::from_str).transpose()?,
        text_hash: row.text_hash,
        page_hashes: row.visual.into_pages(),
        document_phash_signature: row.document_phash_signature,
        status: DocumentStatus::from_str(&row.status)?,
        master_document_id: row.master_document_id.as_deref().map(parse_uuid).transpose()?,
        duplicate_count: row.duplicate_count,
        version_group_id: row.version_group_id,
        detected_date: row.detected_date,
        is_latest_version: row.is_latest_version != 0,
        extraction_status: ExtractionStatus::from_str(&row.extraction_status)?,
        deep_metadata,
        needs_manual_review: row.needs_manual_review != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::insert_loan;
    use crate::db::sqlite::open_memory_database;

    fn setup() -> (Connection, Loan) {
        let conn = open_memory_database().unwrap();
        let loan = Loan::new("Test loan");
        insert_loan(&conn, &loan).unwrap();
        (conn, loan)
    }

    fn page(tag: &str) -> PageHashes {
        PageHashes {
            phash: format!("p{tag}"),
            dhash: format!("d{tag}"),
            ahash: format!("a{tag}"),
            whash: format!("w{tag}"),
        }
    }

    #[test]
    fn insert_and_get_round_trip() {
        let (conn, loan) = setup();
        let mut doc = Document::new(loan.id, "1003.pdf", "/in/1003.pdf", 2048);
        doc.page_count = 2;
        doc.strategy = Some(ExtractionStrategy::Scanned);
        doc.text_hash = Some("abc".into());
        doc.page_hashes = vec![page("1"), page("2")];
        insert_document(&conn, &doc).unwrap();

        let loaded = get_document(&conn, &doc.id).unwrap().unwrap();
        assert_eq!(loaded.filename, "1003.pdf");
        assert_eq!(loaded.strategy, Some(ExtractionStrategy::Scanned));
        assert_eq!(loaded.page_hashes, vec![page("1"), page("2")]);
        assert_eq!(loaded.uploaded_at, doc.uploaded_at);
    }

    #[test]
    fn canonical_excludes_manual_review() {
        let (conn, loan) = setup();
        let good = Document::new(loan.id, "good.pdf", "/good.pdf", 10);
        let mut broken = Document::new(loan.id, "broken.pdf", "/broken.pdf", 10);
        broken.needs_manual_review = true;
        insert_document(&conn, &good).unwrap();
        insert_document(&conn, &broken).unwrap();

        let canonical = list_canonical_documents(&conn, &loan.id).unwrap();
        assert_eq!(canonical.len(), 1);
        assert_eq!(canonical[0].id, good.id);
    }

    #[test]
    fn get_missing_document_is_none() {
        let (conn, _loan) = setup();
        assert!(get_document(&conn, &Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn commit_extraction_sets_metadata_and_date() {
        let (conn, loan) = setup();
        let doc = Document::new(loan.id, "a.pdf", "/a.pdf", 1);
        insert_document(&conn, &doc).unwrap();

        let metadata = DocumentMetadata {
            document_type: "Closing Disclosure".into(),
            detected_dates: vec![
                NaiveDate::from_ymd_opt(2023, 5, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            ],
            completeness: 0.8,
            ..Default::default()
        };
        commit_extraction(&conn, &doc.id, ExtractionStatus::Succeeded, Some(&metadata)).unwrap();

        let loaded = get_document(&conn, &doc.id).unwrap().unwrap();
        assert_eq!(loaded.extraction_status, ExtractionStatus::Succeeded);
        assert_eq!(loaded.deep_metadata, Some(metadata));
        assert_eq!(loaded.detected_date, NaiveDate::from_ymd_opt(2024, 1, 1));
    }

    #[test]
    fn commit_extraction_unknown_document_errors() {
        let (conn, _loan) = setup();
        let result = commit_extraction(&conn, &Uuid::new_v4(), ExtractionStatus::Failed, None);
        assert!(matches!(result, Err(DatabaseError::NotFound { .. })));
    }

    #[test]
    fn self_master_rejected_by_schema() {
        let (conn, loan) = setup();
        let doc = Document::new(loan.id, "a.pdf", "/a.pdf", 1);
        insert_document(&conn, &doc).unwrap();

        let result = apply_assignments(
            &conn,
            &[DocumentAssignment {
                document_id: doc.id,
                status: DocumentStatus::Duplicate,
                master_document_id: Some(doc.id),
                duplicate_count: 0,
                version_group_id: None,
                is_latest_version: false,
            }],
        );
        assert!(result.is_err());
    }

    #[test]
    fn canonical_listing_excludes_duplicates_and_superseded() {
        let (conn, loan) = setup();
        let master = Document::new(loan.id, "a.pdf", "/a.pdf", 1);
        let dup = Document::new(loan.id, "b.pdf", "/b.pdf", 1);
        let old = Document::new(loan.id, "c.pdf", "/c.pdf", 1);
        for d in [&master, &dup, &old] {
            insert_document(&conn, d).unwrap();
        }

        apply_assignments(
            &conn,
            &[
                DocumentAssignment {
                    document_id: dup.id,
                    status: DocumentStatus::Duplicate,
                    master_document_id: Some(master.id),
                    duplicate_count: 0,
                    version_group_id: None,
                    is_latest_version: false,
                },
                DocumentAssignment {
                    document_id: master.id,
                    status: DocumentStatus::Unique,
                    master_document_id: None,
                    duplicate_count: 1,
                    version_group_id: Some("vg-1".into()),
                    is_latest_version: true,
                },
                DocumentAssignment {
                    document_id: old.id,
                    status: DocumentStatus::Version,
                    master_document_id: None,
                    duplicate_count: 0,
                    version_group_id: Some("vg-1".into()),
                    is_latest_version: false,
                },
            ],
        )
        .unwrap();

        let canonical = list_canonical_documents(&conn, &loan.id).unwrap();
        assert_eq!(canonical.len(), 1);
        assert_eq!(canonical[0].id, master.id);

        let all = list_documents_by_loan(&conn, &loan.id).unwrap();
        assert_eq!(all.len(), 3);
        let loaded_dup = all.iter().find(|d| d.id == dup.id).unwrap();
        assert_eq!(loaded_dup.master_document_id, Some(master.id));
    }
}
