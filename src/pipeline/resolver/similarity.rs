//! Version-sibling test between two distinct-hash masters.

use crate::models::Document;
use crate::pipeline::fingerprint::hamming_distance;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityParams {
    /// Maximum phash Hamming distance for two pages to match.
    pub phash_threshold: u32,
    /// Matching pages must exceed this share of compared pages.
    pub page_match_ratio: f64,
}

/// Same template, same key identifiers and a majority of visually matching pages.
pub fn are_versions(a: &Document, b: &Document, params: &SimilarityParams) -> bool {
    let (Some(meta_a), Some(meta_b)) = (&a.deep_metadata, &b.deep_metadata) else {
        return false;
    };

    let type_a = meta_a.type_key();
    if type_a.is_empty() || type_a == "unknown" || type_a != meta_b.type_key() {
        return false;
    }
    if meta_a.key_identifiers.normalized() != meta_b.key_identifiers.normalized() {
        return false;
    }

    pages_match(a, b, params)
}

/// Whole-document signature first, then page-by-page phash distance.
pub fn pages_match(a: &Document, b: &Document, params: &SimilarityParams) -> bool {
    if let (Some(sig_a), Some(sig_b)) = (&a.document_phash_signature, &b.document_phash_signature) {
        if sig_a == sig_b && !a.page_hashes.is_empty() {
            return true;
        }
    }

    let (len_a, len_b) = (a.page_hashes.len(), b.page_hashes.len());
    if len_a.abs_diff(len_b) > 1 {
        return false;
    }
    let compared = len_a.min(len_b);
    if compared == 0 {
        return false;
    }

    let matching = a
        .page_hashes
        .iter()
        .zip(&b.page_hashes)
        .filter(|(pa, pb)| {
            hamming_distance(&pa.phash, &pb.phash)
                .map(|d| d <= params.phash_threshold)
                .unwrap_or(false)
        })
        .count();

    matching as f64 > params.page_match_ratio * compared as f64
}

/// Connected components over the pairwise version relation.
///
/// Components and their members are returned in input order, so sorted
/// input gives a deterministic partition.
pub fn cluster(documents: &[&Document], params: &SimilarityParams) -> Vec<Vec<usize>> {
    let mut parent: Vec<usize> = (0..documents.len()).collect();

    for i in 0..documents.len() {
        for j in (i + 1)..documents.len() {
            if are_versions(documents[i], documents[j], params) {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[ri.max(rj)] = ri.min(rj);
                }
            }
        }
    }

    let mut components: Vec<Vec<usize>> = Vec::new();
    let mut slot_of_root = vec![usize::MAX; documents.len()];
    for i in 0..documents.len() {
        let root = find(&mut parent, i);
        if slot_of_root[root] == usize::MAX {
            slot_of_root[root] = components.len();
            components.push(Vec::new());
        }
        components[slot_of_root[root]].push(i);
    }
    components
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}
