//! Version Resolver: exact-duplicate collapse, then version clustering and
//! latest-version election among the remaining masters.
//!
//! The resolver is a pure function of the loan's documents plus the prior
//! group states; `resolve_loan` wraps it with the database reads and writes.

pub mod ranking;
pub mod similarity;

use std::collections::{BTreeMap, HashMap};

use rusqlite::Connection;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::DedupConfig;
use crate::db::{self, DatabaseError, DocumentAssignment};
use crate::models::enums::{DocumentStatus, VersionGroupState};
use crate::models::{Document, VersionGroup};

pub use ranking::{compare_candidates, elect, Election};
pub use similarity::{are_versions, SimilarityParams};

#[derive(Error, Debug)]
pub enum ResolverError {
    #[error("Master chain detected at document {document_id}")]
    MasterChain { document_id: Uuid },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Clustering result for one loan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    /// One entry per document, sorted by document id.
    pub assignments: Vec<DocumentAssignment>,
    /// Non-trivial version groups, sorted by id.
    pub groups: Vec<VersionGroup>,
    pub duplicate_clusters: usize,
    pub duplicates: usize,
}

impl Resolution {
    pub fn ambiguous_groups(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| g.state == VersionGroupState::Ambiguous)
            .count()
    }

    pub fn assignment(&self, document_id: &Uuid) -> Option<&DocumentAssignment> {
        self.assignments
            .iter()
            .find(|a| a.document_id == *document_id)
    }
}

impl From<&DedupConfig> for SimilarityParams {
    fn from(config: &DedupConfig) -> Self {
        Self {
            phash_threshold: config.phash_threshold,
            page_match_ratio: config.page_match_ratio,
        }
    }
}

/// Deterministic id of a version group: stable for an unchanged member set.
pub fn version_group_id(member_ids: &[Uuid]) -> String {
    let mut ids: Vec<String> = member_ids.iter().map(|id| id.to_string()).collect();
    ids.sort();
    let digest = Sha256::digest(ids.join(",").as_bytes());
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("vg-{hex}")
}

/// Cluster `documents` of `loan_id`.
///
/// `previous` holds the loan's persisted groups; a `manual` decision is kept
/// when a group comes out with exactly the same membership.
pub fn resolve(
    loan_id: &Uuid,
    documents: &[Document],
    previous: &[VersionGroup],
    params: &SimilarityParams,
) -> Result<Resolution, ResolverError> {
    let mut sorted: Vec<&Document> = documents.iter().collect();
    sorted.sort_by_key(|d| d.id);

    let mut resolution = Resolution::default();
    let mut assignments: Vec<DocumentAssignment> = Vec::with_capacity(sorted.len());

    // Unreadable documents stay out of clustering.
    let (clusterable, excluded): (Vec<&Document>, Vec<&Document>) =
        sorted.into_iter().partition(|d| d.is_clusterable());
    assignments.extend(excluded.iter().map(|d| singleton(d.id, 0)));

    // ── Phase 1: exact duplicates ─────────────────────────

    let mut by_hash: BTreeMap<&str, Vec<&Document>> = BTreeMap::new();
    for &doc in &clusterable {
        if let Some(hash) = doc.text_hash.as_deref() {
            by_hash.entry(hash).or_default().push(doc);
        }
    }

    let mut masters: Vec<(&Document, u32)> = Vec::with_capacity(by_hash.len());
    for mut cluster in by_hash.into_values() {
        cluster.sort_by(|a, b| {
            a.uploaded_at
                .cmp(&b.uploaded_at)
                .then_with(|| b.completeness().total_cmp(&a.completeness()))
                .then_with(|| a.id.cmp(&b.id))
        });
        let master = cluster[0];
        let duplicate_count = (cluster.len() - 1) as u32;
        if duplicate_count > 0 {
            resolution.duplicate_clusters += 1;
            resolution.duplicates += duplicate_count as usize;
        }
        assignments.extend(cluster[1..].iter().map(|dup| DocumentAssignment {
            document_id: dup.id,
            status: DocumentStatus::Duplicate,
            master_document_id: Some(master.id),
            duplicate_count: 0,
            version_group_id: None,
            is_latest_version: false,
        }));
        masters.push((master, duplicate_count));
    }
    masters.sort_by_key(|(d, _)| d.id);

    // ── Phase 2: versions among distinct-hash masters ──────

    let master_docs: Vec<&Document> = masters.iter().map(|(d, _)| *d).collect();
    let manual: HashMap<&str, &VersionGroup> = previous
        .iter()
        .filter(|g| g.state == VersionGroupState::Manual)
        .map(|g| (g.id.as_str(), g))
        .collect();

    for component in similarity::cluster(&master_docs, params) {
        if component.len() == 1 {
            let (doc, duplicate_count) = masters[component[0]];
            assignments.push(singleton(doc.id, duplicate_count));
            continue;
        }

        let members: Vec<&Document> = component.iter().map(|&i| master_docs[i]).collect();
        let member_ids: Vec<Uuid> = members.iter().map(|d| d.id).collect();
        let group_id = version_group_id(&member_ids);

        let kept_manual = manual
            .get(group_id.as_str())
            .and_then(|g| g.latest_document_id)
            .filter(|id| member_ids.contains(id));

        let (state, latest) = match kept_manual {
            Some(id) => (VersionGroupState::Manual, Some(id)),
            None => match elect(&members) {
                Election::Latest(i) => (VersionGroupState::Resolved, Some(members[i].id)),
                Election::Ambiguous => {
                    warn!(
                        loan_id = %loan_id,
                        group_id = %group_id,
                        members = members.len(),
                        "Version group tied on every criterion, left for manual resolution"
                    );
                    (VersionGroupState::Ambiguous, None)
                }
            },
        };

        for &i in &component {
            let (doc, duplicate_count) = masters[i];
            let is_latest = latest == Some(doc.id);
            assignments.push(DocumentAssignment {
                document_id: doc.id,
                status: if is_latest || duplicate_count > 0 {
                    DocumentStatus::Unique
                } else {
                    DocumentStatus::Version
                },
                master_document_id: None,
                duplicate_count,
                version_group_id: Some(group_id.clone()),
                is_latest_version: is_latest,
            });
        }

        resolution.groups.push(VersionGroup {
            id: group_id,
            loan_id: *loan_id,
            state,
            member_count: members.len() as u32,
            latest_document_id: latest,
        });
    }

    assignments.sort_by_key(|a| a.document_id);
    resolution.groups.sort_by(|a, b| a.id.cmp(&b.id));
    validate_master_chains(&assignments)?;
    resolution.assignments = assignments;
    Ok(resolution)
}

fn singleton(document_id: Uuid, duplicate_count: u32) -> DocumentAssignment {
    DocumentAssignment {
        document_id,
        status: DocumentStatus::Unique,
        master_document_id: None,
        duplicate_count,
        version_group_id: None,
        is_latest_version: true,
    }
}

/// Arena check over the assignments: every master reference resolves to a
/// unique, self-mastered document and counts agree.
fn validate_master_chains(assignments: &[DocumentAssignment]) -> Result<(), ResolverError> {
    let by_id: HashMap<Uuid, &DocumentAssignment> =
        assignments.iter().map(|a| (a.document_id, a)).collect();
    let mut referenced: HashMap<Uuid, u32> = HashMap::new();

    for a in assignments {
        let Some(master_id) = a.master_document_id else {
            continue;
        };
        let chain = ResolverError::MasterChain {
            document_id: a.document_id,
        };
        if master_id == a.document_id {
            return Err(chain);
        }
        match by_id.get(&master_id) {
            Some(master)
                if master.master_document_id.is_none()
                    && master.status == DocumentStatus::Unique => {}
            _ => return Err(chain),
        }
        *referenced.entry(master_id).or_default() += 1;
    }

    for a in assignments {
        let expected = referenced.get(&a.document_id).copied().unwrap_or(0);
        if a.duplicate_count != expected {
            return Err(ResolverError::MasterChain {
                document_id: a.document_id,
            });
        }
    }
    Ok(())
}

/// Load, resolve and persist the grouping of one loan.
pub fn resolve_loan(
    conn: &Connection,
    loan_id: &Uuid,
    params: &SimilarityParams,
) -> Result<Resolution, ResolverError> {
    let documents = db::list_documents_by_loan(conn, loan_id)?;
    let previous = db::list_version_groups(conn, loan_id)?;

    let resolution = resolve(loan_id, &documents, &previous, params)?;

    db::persist_resolution(conn, loan_id, &resolution.assignments, &resolution.groups)?;

    info!(
        loan_id = %loan_id,
        documents = documents.len(),
        duplicate_clusters = resolution.duplicate_clusters,
        version_groups = resolution.groups.len(),
        ambiguous = resolution.ambiguous_groups(),
        "Version resolution persisted"
    );
    Ok(resolution)
}
