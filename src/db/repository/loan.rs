use std::str::FromStr;

use chrono::{Duration, NaiveDateTime};
use rusqlite::{params, Connection};
use uuid::Uuid;

use super::parse_uuid;
use crate::db::DatabaseError;
use crate::models::enums::DedupStatus;
use crate::models::Loan;

pub fn insert_loan(conn: &Connection, loan: &Loan) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO loans (id, name, created_at, dedup_status, dedup_last_run, dedup_last_report)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            loan.id.to_string(),
            loan.name,
            loan.created_at,
            loan.dedup_status.as_str(),
            loan.dedup_last_run,
            loan.dedup_last_report,
        ],
    )?;
    Ok(())
}

pub fn get_loan(conn: &Connection, id: &Uuid) -> Result<Option<Loan>, DatabaseError> {
    let result = conn.query_row(
        "SELECT id, name, created_at, dedup_status, dedup_last_run, dedup_last_report
         FROM loans WHERE id = ?1",
        params![id.to_string()],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, NaiveDateTime>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<NaiveDateTime>>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        },
    );

    match result {
        Ok((id, name, created_at, status, last_run, report)) => Ok(Some(Loan {
            id: parse_uuid(&id)?,
            name,
            created_at,
            dedup_status: DedupStatus::from_str(&status)?,
            dedup_last_run: last_run,
            dedup_last_report: report,
        })),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Atomically move a loan's run lock to `running`.
///
/// Compare-and-transition in one UPDATE: returns `Ok(false)` when another run
/// already holds the lock, never racing past a read-then-write check.
pub fn try_begin_run(conn: &Connection, loan_id: &Uuid) -> Result<bool, DatabaseError> {
    let now = chrono::Local::now().naive_local();
    let rows = conn.execute(
        "UPDATE loans SET dedup_status = 'running', dedup_last_run = ?2, dedup_heartbeat = ?2
         WHERE id = ?1 AND dedup_status IN ('pending', 'completed', 'failed')",
        params![loan_id.to_string(), now],
    )?;

    if rows == 1 {
        return Ok(true);
    }

    match get_loan(conn, loan_id)? {
        Some(_) => Ok(false),
        None => Err(DatabaseError::NotFound {
            entity_type: "Loan".into(),
            id: loan_id.to_string(),
        }),
    }
}

/// Release the run lock into a terminal state, recording the run report.
pub fn finish_run(
    conn: &Connection,
    loan_id: &Uuid,
    outcome: DedupStatus,
    report_json: Option<&str>,
) -> Result<(), DatabaseError> {
    if !DedupStatus::Running.can_transition_to(outcome) {
        return Err(DatabaseError::ConstraintViolation(format!(
            "Run cannot finish as '{outcome}'"
        )));
    }

    let rows = conn.execute(
        "UPDATE loans SET dedup_status = ?2, dedup_last_report = COALESCE(?3, dedup_last_report)
         WHERE id = ?1 AND dedup_status = 'running'",
        params![loan_id.to_string(), outcome.as_str(), report_json],
    )?;

    if rows == 0 {
        return Err(DatabaseError::ConstraintViolation(format!(
            "Loan {loan_id} has no running dedup run"
        )));
    }
    Ok(())
}

/// Refresh the heartbeat of a loan's active run.
///
/// Returns `false` when the loan no longer holds a running lock.
pub fn touch_run(conn: &Connection, loan_id: &Uuid) -> Result<bool, DatabaseError> {
    let now = chrono::Local::now().naive_local();
    let rows = conn.execute(
        "UPDATE loans SET dedup_heartbeat = ?2 WHERE id = ?1 AND dedup_status = 'running'",
        params![loan_id.to_string(), now],
    )?;
    Ok(rows == 1)
}

/// Fail runs whose owner stopped heartbeating more than `lease` ago.
///
/// A live run refreshes its heartbeat well within the lease, so only runs
/// abandoned by a crashed process are released.
pub fn recover_stale_runs(conn: &Connection, lease: Duration) -> Result<usize, DatabaseError> {
    let cutoff = chrono::Local::now().naive_local() - lease;
    let rows = conn.execute(
        "UPDATE loans SET dedup_status = 'failed'
         WHERE dedup_status = 'running'
           AND COALESCE(dedup_heartbeat, dedup_last_run, created_at) < ?1",
        params![cutoff],
    )?;
    if rows > 0 {
        tracing::warn!(loans = rows, "Recovered stale dedup runs abandoned by a previous process");
    }
    Ok(rows)
}

/// Delete a loan; documents and version groups cascade.
pub fn delete_loan(conn: &Connection, loan_id: &Uuid) -> Result<(), DatabaseError> {
    let deleted = conn.execute("DELETE FROM loans WHERE id = ?1", params![loan_id.to_string()])?;
    if deleted == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "Loan".into(),
            id: loan_id.to_string(),
        });
    }
    tracing::info!(loan_id = %loan_id, "Loan deleted with all documents");
    Ok(())
}
