use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{DedupStatus, VersionGroupState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Loan {
    pub id: Uuid,
    pub name: String,
    pub created_at: NaiveDateTime,
    pub dedup_status: DedupStatus,
    pub dedup_last_run: Option<NaiveDateTime>,
    /// JSON-encoded report of the last finished run.
    pub dedup_last_report: Option<String>,
}

impl Loan {
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: chrono::Local::now().naive_local(),
            dedup_status: DedupStatus::Pending,
            dedup_last_run: None,
            dedup_last_report: None,
        }
    }
}

/// A cluster of successive edits of the same logical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionGroup {
    pub id: String,
    pub loan_id: Uuid,
    pub state: VersionGroupState,
    pub member_count: u32,
    pub latest_document_id: Option<Uuid>,
}
