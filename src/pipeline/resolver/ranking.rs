//! Latest-version election inside a version cluster.

use std::cmp::Ordering;

use crate::models::Document;

/// Completeness is compared in steps of this size; scores in the same
/// step tie.
const COMPLETENESS_STEP: f64 = 0.01;

/// Signed beats unsigned, then higher completeness, then the more recent
/// detected date (a missing date ranks below any date).
pub fn compare_candidates(a: &Document, b: &Document) -> Ordering {
    a.is_signed()
        .cmp(&b.is_signed())
        .then_with(|| completeness_step(a).cmp(&completeness_step(b)))
        .then_with(|| a.detected_date.cmp(&b.detected_date))
}

/// Fixed buckets keep the comparison a total order; a sliding tolerance
/// would not be transitive.
fn completeness_step(doc: &Document) -> i64 {
    (doc.completeness() / COMPLETENESS_STEP).round() as i64
}

/// Election result for one cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Election {
    Latest(usize),
    /// Two or more candidates tie on every criterion.
    Ambiguous,
}

/// Indices of `candidates` sharing the top rank.
pub fn top_ranked(candidates: &[&Document]) -> Vec<usize> {
    let Some(best) = candidates
        .iter()
        .copied()
        .reduce(|best, c| match compare_candidates(c, best) {
            Ordering::Greater => c,
            _ => best,
        })
    else {
        return Vec::new();
    };

    candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| compare_candidates(c, best) == Ordering::Equal)
        .map(|(i, _)| i)
        .collect()
}

pub fn elect(candidates: &[&Document]) -> Election {
    match top_ranked(candidates).as_slice() {
        [single] => Election::Latest(*single),
        _ => Election::Ambiguous,
    }
}
