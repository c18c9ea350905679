use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Structured result of deep extraction, accepted only after schema validation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub document_type: String,
    pub detected_dates: Vec<NaiveDate>,
    pub persons: Vec<String>,
    pub has_signature: bool,
    /// 0.0 (empty form) to 1.0 (every field filled).
    pub completeness: f64,
    #[serde(default)]
    pub key_identifiers: KeyIdentifiers,
    /// Image identifiers of the pages this metadata was read from.
    pub page_ids: Vec<String>,
}

/// Identifiers that tie a form to a specific loan file.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeyIdentifiers {
    pub loan_number: Option<String>,
    pub borrower_name: Option<String>,
    pub property_address: Option<String>,
}

impl KeyIdentifiers {
    /// Case- and whitespace-insensitive comparison key.
    pub fn normalized(&self) -> (Option<String>, Option<String>, Option<String>) {
        (
            self.loan_number.as_deref().map(normalize_identifier),
            self.borrower_name.as_deref().map(normalize_identifier),
            self.property_address.as_deref().map(normalize_identifier),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.loan_number.is_none() && self.borrower_name.is_none() && self.property_address.is_none()
    }
}

fn normalize_identifier(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl DocumentMetadata {
    /// The most recent date found on the document.
    pub fn latest_date(&self) -> Option<NaiveDate> {
        self.detected_dates.iter().max().copied()
    }

    /// Normalized template key used for version clustering.
    pub fn type_key(&self) -> String {
        normalize_identifier(&self.document_type)
    }

    /// Fold per-batch results of one document into a single record.
    ///
    /// Batches arrive in any order; `parts` must be sorted by first page
    /// so the merge is deterministic.
    pub fn merge(parts: &[DocumentMetadata]) -> Option<DocumentMetadata> {
        let first = parts.first()?;
        let mut merged = DocumentMetadata {
            document_type: first.document_type.clone(),
            ..Default::default()
        };

        let mut completeness_sum = 0.0;
        let mut page_weight = 0usize;

        for part in parts {
            if is_unknown_type(&merged.document_type) && !is_unknown_type(&part.document_type) {
                merged.document_type = part.document_type.clone();
            }
            merged.detected_dates.extend(part.detected_dates.iter().copied());
            for person in &part.persons {
                if !merged.persons.contains(person) {
                    merged.persons.push(person.clone());
                }
            }
            merged.has_signature |= part.has_signature;

            let weight = part.page_ids.len().max(1);
            completeness_sum += part.completeness * weight as f64;
            page_weight += weight;

            let ids = &mut merged.key_identifiers;
            let other = &part.key_identifiers;
            if ids.loan_number.is_none() {
                ids.loan_number = other.loan_number.clone();
            }
            if ids.borrower_name.is_none() {
                ids.borrower_name = other.borrower_name.clone();
            }
            if ids.property_address.is_none() {
                ids.property_address = other.property_address.clone();
            }
            merged.page_ids.extend(part.page_ids.iter().cloned());
        }

        merged.detected_dates.sort_unstable();
        merged.detected_dates.dedup();
        merged.completeness = if page_weight == 0 {
            0.0
        } else {
            completeness_sum / page_weight as f64
        };

        Some(merged)
    }
}

fn is_unknown_type(document_type: &str) -> bool {
    let t = document_type.trim();
    t.is_empty() || t.eq_ignore_ascii_case("unknown")
}
