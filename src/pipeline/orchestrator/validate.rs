//! Boundary validation of extractor responses.
//!
//! Nothing the extractor returns reaches the rest of the pipeline unless it
//! passes the JSON schema, deserializes, and names exactly the pages that
//! were sent.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use jsonschema::JSONSchema;
use serde_json::Value;

use crate::models::DocumentMetadata;

const RESPONSE_SCHEMA: &str = include_str!("../../../resources/schemas/extraction_response.schema.json");

/// Metadata that has passed boundary validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedMetadata(DocumentMetadata);

impl ValidatedMetadata {
    pub fn metadata(&self) -> &DocumentMetadata {
        &self.0
    }

    pub fn into_inner(self) -> DocumentMetadata {
        self.0
    }
}

/// Result of one extraction attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionOutcome {
    Ok(ValidatedMetadata),
    SchemaError(String),
    Timeout,
    /// Transport, rendering or I/O failure before a response was received.
    Failed(String),
}

impl ExtractionOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    /// Short reason for logs and the failure ledger.
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            Self::Ok(_) => None,
            Self::SchemaError(e) => Some(format!("schema-invalid response: {e}")),
            Self::Timeout => Some("extractor timed out".into()),
            Self::Failed(e) => Some(e.clone()),
        }
    }
}

fn compiled_schema() -> Result<&'static JSONSchema, String> {
    static COMPILED: OnceLock<Result<JSONSchema, String>> = OnceLock::new();
    COMPILED
        .get_or_init(|| {
            let schema: Value = serde_json::from_str(RESPONSE_SCHEMA)
                .map_err(|e| format!("Invalid embedded schema JSON: {e}"))?;
            JSONSchema::compile(&schema).map_err(|e| format!("Failed to compile JSON schema: {e}"))
        })
        .as_ref()
        .map_err(Clone::clone)
}

/// Validate a raw response against the schema and the requested page ids.
pub fn validate_response(response: &Value, expected_page_ids: &[String]) -> ExtractionOutcome {
    let schema = match compiled_schema() {
        Ok(schema) => schema,
        Err(e) => return ExtractionOutcome::SchemaError(e),
    };

    if let Err(errors) = schema.validate(response) {
        let messages: Vec<String> = errors
            .map(|e| format!("{} at {}", e, e.instance_path))
            .collect();
        return ExtractionOutcome::SchemaError(messages.join("; "));
    }

    let metadata: DocumentMetadata = match serde_json::from_value(response.clone()) {
        Ok(m) => m,
        Err(e) => return ExtractionOutcome::SchemaError(e.to_string()),
    };

    let returned: BTreeSet<&str> = metadata.page_ids.iter().map(String::as_str).collect();
    let expected: BTreeSet<&str> = expected_page_ids.iter().map(String::as_str).collect();
    if returned != expected {
        return ExtractionOutcome::SchemaError(format!(
            "page_ids {:?} do not match requested pages {:?}",
            returned, expected
        ));
    }

    ExtractionOutcome::Ok(ValidatedMetadata(metadata))
}
