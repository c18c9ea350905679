use lopdf::content::Content;
use lopdf::Document;

use super::layout::{runs_from_operations, TextRun};
use super::ProbeError;

/// Native text layer of one page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageText {
    pub text: String,
    /// Positioned text-showing operations, for layout analysis.
    pub runs: Vec<TextRun>,
}

/// Native text extraction abstraction (allows mocking for tests).
pub trait TextLayerReader: Send + Sync {
    fn read_pages(&self, pdf_bytes: &[u8]) -> Result<Vec<PageText>, ProbeError>;
}

/// Reads the text layer with lopdf.
///
/// A page whose content stream cannot be decoded yields an empty page
/// rather than failing the whole document: a scan with one odd page is
/// still a scan.
pub struct LopdfTextLayer;

impl TextLayerReader for LopdfTextLayer {
    fn read_pages(&self, pdf_bytes: &[u8]) -> Result<Vec<PageText>, ProbeError> {
        let doc = Document::load_mem(pdf_bytes).map_err(|e| ProbeError::DocumentUnreadable {
            reason: format!("Failed to parse PDF: {e}"),
        })?;

        let mut pages = Vec::new();
        for (page_number, page_id) in doc.get_pages() {
            let runs = doc
                .get_page_content(page_id)
                .ok()
                .and_then(|data| Content::decode(&data).ok())
                .map(|content| runs_from_operations(&content.operations))
                .unwrap_or_default();

            let mut text = doc.extract_text(&[page_number]).unwrap_or_default();
            if text.trim().is_empty() && !runs.is_empty() {
                text = runs
                    .iter()
                    .map(|r| r.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
            }

            pages.push(PageText { text, runs });
        }

        Ok(pages)
    }
}
