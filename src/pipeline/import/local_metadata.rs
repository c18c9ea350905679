//! Direct text extraction for documents whose native text layer is enough.
//!
//! Produces the same `DocumentMetadata` shape the external extractor
//! returns, so the resolver treats both sources alike.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use uuid::Uuid;

use crate::models::{DocumentMetadata, KeyIdentifiers};
use crate::pipeline::orchestrator::page_id;

/// Form titles recognised anywhere in the text, most specific first.
const KNOWN_FORMS: &[&str] = &[
    "Uniform Residential Loan Application",
    "Closing Disclosure",
    "Loan Estimate",
    "Promissory Note",
    "Deed of Trust",
    "Mortgage Insurance Certificate",
    "Title Commitment",
    "Purchase Agreement",
    "Appraisal Report",
    "Credit Report",
    "Bank Statement",
    "Verification of Employment",
    "Pay Stub",
    "Tax Return",
];

static ISO_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").unwrap());

static US_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,2})/(\d{1,2})/(\d{4})\b").unwrap());

static LONG_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(January|February|March|April|May|June|July|August|September|October|November|December)\s+(\d{1,2}),\s*(\d{4})\b").unwrap()
});

static SIGNATURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(/s/\s*[a-z]|\bdigitally\s+signed\b|\bsigned\s+by\b|\belectronically\s+signed\b)")
        .unwrap()
});

static LOAN_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bloan\s*(?:number|no\.?|#)\s*[:#]?\s*([A-Z0-9][A-Z0-9-]{3,})").unwrap()
});

static BORROWER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*borrower(?:'s)?(?:\s+name)?\s*:\s*([A-Za-z][A-Za-z .,'-]*[A-Za-z.])").unwrap()
});

static CO_BORROWER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*co-?borrower(?:'s)?(?:\s+name)?\s*:\s*([A-Za-z][A-Za-z .,'-]*[A-Za-z.])").unwrap()
});

static PROPERTY_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(?:subject\s+)?property\s+address\s*:\s*(\S[^\n]*\S)").unwrap()
});

/// Extract metadata from native text without the external service.
pub fn extract_local_metadata(document_id: &Uuid, text: &str, page_count: u32) -> DocumentMetadata {
    let document_type = detect_form(text).unwrap_or_else(|| "unknown".to_string());

    let mut detected_dates = find_dates(text);
    detected_dates.sort_unstable();
    detected_dates.dedup();

    let key_identifiers = KeyIdentifiers {
        loan_number: capture(&LOAN_NUMBER, text),
        borrower_name: capture(&BORROWER, text),
        property_address: capture(&PROPERTY_ADDRESS, text),
    };

    let mut persons = Vec::new();
    for name in [&key_identifiers.borrower_name, &capture(&CO_BORROWER, text)]
        .into_iter()
        .flatten()
    {
        if !persons.contains(name) {
            persons.push(name.clone());
        }
    }

    let found = [
        document_type != "unknown",
        !detected_dates.is_empty(),
        key_identifiers.loan_number.is_some(),
        key_identifiers.borrower_name.is_some(),
        key_identifiers.property_address.is_some(),
    ];
    let completeness = found.iter().filter(|f| **f).count() as f64 / found.len() as f64;

    DocumentMetadata {
        document_type,
        detected_dates,
        persons,
        has_signature: SIGNATURE.is_match(text),
        completeness,
        key_identifiers,
        page_ids: (0..page_count as usize).map(|p| page_id(document_id, p)).collect(),
    }
}

fn detect_form(text: &str) -> Option<String> {
    let lowered = text.to_lowercase();
    KNOWN_FORMS
        .iter()
        .find(|form| lowered.contains(&form.to_lowercase()))
        .map(|form| form.to_string())
}

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn find_dates(text: &str) -> Vec<NaiveDate> {
    let mut dates = Vec::new();

    for c in ISO_DATE.captures_iter(text) {
        if let (Ok(y), Ok(m), Ok(d)) = (c[1].parse::<i32>(), c[2].parse::<u32>(), c[3].parse::<u32>()) {
            dates.extend(NaiveDate::from_ymd_opt(y, m, d));
        }
    }
    for c in US_DATE.captures_iter(text) {
        if let (Ok(m), Ok(d), Ok(y)) = (c[1].parse::<u32>(), c[2].parse::<u32>(), c[3].parse::<i32>()) {
            dates.extend(NaiveDate::from_ymd_opt(y, m, d));
        }
    }
    for c in LONG_DATE.captures_iter(text) {
        let month = month_number(&c[1]);
        if let (Some(m), Ok(d), Ok(y)) = (month, c[2].parse::<u32>(), c[3].parse::<i32>()) {
            dates.extend(NaiveDate::from_ymd_opt(y, m, d));
        }
    }

    dates
}

fn month_number(name: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "january", "february", "march", "april", "may", "june", "july", "august", "september",
        "october", "november", "december",
    ];
    let lowered = name.to_lowercase();
    MONTHS
        .iter()
        .position(|m| *m == lowered)
        .map(|i| i as u32 + 1)
}
