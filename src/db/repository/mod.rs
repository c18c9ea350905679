//! Repository layer: entity-scoped database operations.
//!
//! All public functions are re-exported here.

mod document;
mod loan;
mod version_group;

pub use document::*;
pub use loan::*;
pub use version_group::*;

use uuid::Uuid;

use super::DatabaseError;

/// Parse a TEXT uuid column.
pub(crate) fn parse_uuid(value: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(value).map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))
}
