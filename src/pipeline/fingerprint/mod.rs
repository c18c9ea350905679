//! Content fingerprinter: exact-match text hash and per-page perceptual hashes.
//!
//! Everything here is a pure function of the document bytes and the render
//! parameters, so documents can be fingerprinted in parallel in any order.

pub mod perceptual;
pub mod render;

use base64::Engine;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::models::PageHashes;

pub use perceptual::{hamming_distance, PageHasher};
pub use render::{LopdfImageRenderer, MockPageRenderer, PageRenderer, PdfiumRenderer};

#[derive(Error, Debug)]
pub enum FingerprintError {
    #[error("Document unreadable: {0}")]
    DocumentUnreadable(String),

    #[error("Rendering failed on page {page}: {reason}")]
    Rendering { page: usize, reason: String },

    #[error("Image processing error: {0}")]
    ImageProcessing(String),
}

/// Render parameters; changing any of them changes the page hashes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FingerprintParams {
    pub dpi: u32,
    pub hash_size: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint {
    pub text_hash: String,
    pub pages: Vec<PageHashes>,
    pub signature: String,
}

/// Collapse whitespace runs to one space and lowercase.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// SHA-256 over normalized text.
///
/// Documents without a text layer hash their raw bytes instead, so only
/// byte-identical scans collapse rather than every blank text layer.
pub fn compute_text_hash(text: &str, pdf_bytes: &[u8]) -> String {
    let normalized = normalize_text(text);
    let digest = if normalized.is_empty() {
        Sha256::digest(pdf_bytes)
    } else {
        Sha256::digest(normalized.as_bytes())
    };
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// Whole-document key over the ordered per-page phashes.
pub fn document_signature(pages: &[PageHashes]) -> String {
    let mut hasher = Sha256::new();
    for (i, page) in pages.iter().enumerate() {
        if i > 0 {
            hasher.update(b",");
        }
        hasher.update(page.phash.as_bytes());
    }
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Fingerprint one readable document.
///
/// `text` is the native text already read by the prober; `page_count`
/// pages are rendered at `params.dpi` and hashed.
pub fn fingerprint_document(
    pdf_bytes: &[u8],
    text: &str,
    page_count: u32,
    renderer: &dyn PageRenderer,
    params: FingerprintParams,
) -> Result<Fingerprint, FingerprintError> {
    let hasher = PageHasher::new(params.hash_size);

    let mut pages = Vec::with_capacity(page_count as usize);
    for page in 0..page_count as usize {
        let png = renderer.render_page(pdf_bytes, page, params.dpi)?;
        let image = image::load_from_memory(&png)
            .map_err(|e| FingerprintError::ImageProcessing(format!("Page {page}: {e}")))?;
        pages.push(hasher.hash_page(&image));
    }

    Ok(Fingerprint {
        text_hash: compute_text_hash(text, pdf_bytes),
        signature: document_signature(&pages),
        pages,
    })
}
