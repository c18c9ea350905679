use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::document::{write_assignments, DocumentAssignment};
use super::parse_uuid;
use crate::db::DatabaseError;
use crate::models::enums::VersionGroupState;
use crate::models::VersionGroup;

/// Replace all version groups of a loan with the resolver's latest view.
pub fn replace_version_groups(
    conn: &Connection,
    loan_id: &Uuid,
    groups: &[VersionGroup],
) -> Result<(), DatabaseError> {
    let tx = conn.unchecked_transaction()?;
    write_version_groups(&tx, loan_id, groups)?;
    tx.commit()?;
    Ok(())
}

/// Persist a resolver pass: document assignments and version groups
/// commit together or not at all.
pub fn persist_resolution(
    conn: &Connection,
    loan_id: &Uuid,
    assignments: &[DocumentAssignment],
    groups: &[VersionGroup],
) -> Result<(), DatabaseError> {
    let tx = conn.unchecked_transaction()?;
    write_assignments(&tx, assignments)?;
    write_version_groups(&tx, loan_id, groups)?;
    tx.commit()?;
    Ok(())
}

fn write_version_groups(
    conn: &Connection,
    loan_id: &Uuid,
    groups: &[VersionGroup],
) -> Result<(), DatabaseError> {
    conn.execute(
        "DELETE FROM version_groups WHERE loan_id = ?1",
        params![loan_id.to_string()],
    )?;
    let mut stmt = conn.prepare(
        "INSERT INTO version_groups (id, loan_id, state, member_count, latest_document_id)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for group in groups {
        if group.loan_id != *loan_id {
            return Err(DatabaseError::ConstraintViolation(format!(
                "Version group {} belongs to another loan",
                group.id
            )));
        }
        stmt.execute(params![
            group.id,
            loan_id.to_string(),
            group.state.as_str(),
            group.member_count,
            group.latest_document_id.map(|id| id.to_string()),
        ])?;
    }
    Ok(())
}

pub fn list_version_groups(
    conn: &Connection,
    loan_id: &Uuid,
) -> Result<Vec<VersionGroup>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, loan_id, state, member_count, latest_document_id
         FROM version_groups WHERE loan_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![loan_id.to_string()], read_group_row)?;

    let mut groups = Vec::new();
    for row in rows {
        groups.push(group_from_row(row?)?);
    }
    Ok(groups)
}

pub fn get_version_group(
    conn: &Connection,
    loan_id: &Uuid,
    group_id: &str,
) -> Result<Option<VersionGroup>, DatabaseError> {
    conn.query_row(
        "SELECT id, loan_id, state, member_count, latest_document_id
         FROM version_groups WHERE loan_id = ?1 AND id = ?2",
        params![loan_id.to_string(), group_id],
        read_group_row,
    )
    .optional()?
    .map(group_from_row)
    .transpose()
}

/// Manually elect `document_id` as the latest version of its group.
///
/// Clears the flag on every other member, recomputes member statuses and
/// moves the group to `manual` so later runs keep the decision.
pub fn mark_as_latest(conn: &Connection, document_id: &Uuid) -> Result<VersionGroup, DatabaseError> {
    let tx = conn.unchecked_transaction()?;

    let found: Option<(String, String, Option<String>)> = tx
        .query_row(
            "SELECT loan_id, status, version_group_id FROM documents WHERE id = ?1",
            params![document_id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let Some((loan_id, status, group_id)) = found else {
        return Err(DatabaseError::NotFound {
            entity_type: "Document".into(),
            id: document_id.to_string(),
        });
    };

    // A running resolver would overwrite the decision.
    let dedup_status: String = tx.query_row(
        "SELECT dedup_status FROM loans WHERE id = ?1",
        params![loan_id],
        |row| row.get(0),
    )?;
    if dedup_status == "running" {
        return Err(DatabaseError::ConstraintViolation(format!(
            "Loan {loan_id} has a dedup run in progress"
        )));
    }
    if status == "duplicate" {
        return Err(DatabaseError::ConstraintViolation(format!(
            "Document {document_id} is a duplicate and cannot be elected latest"
        )));
    }
    let Some(group_id) = group_id else {
        return Err(DatabaseError::ConstraintViolation(format!(
            "Document {document_id} is not part of a version group"
        )));
    };

    tx.execute(
        "UPDATE documents SET
             is_latest_version = CASE WHEN id = ?3 THEN 1 ELSE 0 END,
             status = CASE
                 WHEN id = ?3 THEN 'unique'
                 WHEN duplicate_count = 0 THEN 'version'
                 ELSE 'unique'
             END
         WHERE loan_id = ?1 AND version_group_id = ?2 AND status != 'duplicate'",
        params![loan_id, group_id, document_id.to_string()],
    )?;

    let rows = tx.execute(
        "UPDATE version_groups SET state = 'manual', latest_document_id = ?3,
             updated_at = datetime('now')
         WHERE loan_id = ?1 AND id = ?2",
        params![loan_id, group_id, document_id.to_string()],
    )?;
    if rows == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "VersionGroup".into(),
            id: group_id,
        });
    }

    let group = tx
        .query_row(
            "SELECT id, loan_id, state, member_count, latest_document_id
             FROM version_groups WHERE loan_id = ?1 AND id = ?2",
            params![loan_id, group_id],
            read_group_row,
        )
        .map_err(DatabaseError::from)
        .and_then(group_from_row)?;

    tx.commit()?;
    tracing::info!(
        document_id = %document_id,
        version_group_id = %group.id,
        "Version group resolved manually"
    );
    Ok(group)
}

type GroupRow = (String, String, String, u32, Option<String>);

fn read_group_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<GroupRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn group_from_row(row: GroupRow) -> Result<VersionGroup, DatabaseError> {
    let (id, loan_id, state, member_count, latest) = row;
    Ok(VersionGroup {
        id,
        loan_id: parse_uuid(&loan_id)?,
        state: VersionGroupState::from_str(&state)?,
        member_count,
        latest_document_id: latest.as_deref().map(parse_uuid).transpose()?,
    })
}
