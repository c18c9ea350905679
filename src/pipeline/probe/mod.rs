//! Structural prober: decides which extraction strategy a PDF needs.
//!
//! Native text density separates scanned documents from born-digital ones;
//! layout analysis over the text layer then separates documents with tables
//! (whose row/column structure native extraction loses) from plain text.

pub mod layout;
pub mod text_layer;

use thiserror::Error;

use crate::models::enums::ExtractionStrategy;

pub use layout::{count_grid_tables, count_text_tables, TextRun};
pub use text_layer::{LopdfTextLayer, PageText, TextLayerReader};

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Document unreadable: {reason}")]
    DocumentUnreadable { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of probing one readable PDF.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub page_count: u32,
    pub strategy: ExtractionStrategy,
    pub pages: Vec<PageProbe>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageProbe {
    pub text: String,
    pub tables: usize,
}

impl ProbeReport {
    /// Concatenated page texts in page order.
    pub fn full_text(&self) -> String {
        self.pages
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn table_count(&self) -> usize {
        self.pages.iter().map(|p| p.tables).sum()
    }
}

/// Classify a PDF by extraction strategy.
///
/// `min_chars_per_page` is the density (non-whitespace characters per page)
/// below which a document is treated as scanned.
pub fn probe_pdf(
    reader: &dyn TextLayerReader,
    pdf_bytes: &[u8],
    min_chars_per_page: usize,
) -> Result<ProbeReport, ProbeError> {
    let pages = reader.read_pages(pdf_bytes)?;
    if pages.is_empty() {
        return Err(ProbeError::DocumentUnreadable {
            reason: "PDF has no pages".into(),
        });
    }

    let probes: Vec<PageProbe> = pages
        .into_iter()
        .map(|page| {
            let tables = count_grid_tables(&page.runs).max(count_text_tables(&page.text));
            PageProbe {
                text: page.text,
                tables,
            }
        })
        .collect();

    let page_count = probes.len();
    let chars: usize = probes
        .iter()
        .map(|p| p.text.chars().filter(|c| !c.is_whitespace()).count())
        .sum();
    let density = chars / page_count;

    let strategy = if density < min_chars_per_page {
        ExtractionStrategy::Scanned
    } else if probes.iter().any(|p| p.tables > 0) {
        ExtractionStrategy::TextWithTables
    } else {
        ExtractionStrategy::TextOnly
    };

    tracing::debug!(
        pages = page_count,
        chars_per_page = density,
        strategy = %strategy,
        "Probed document structure"
    );

    Ok(ProbeReport {
        page_count: page_count as u32,
        strategy,
        pages: probes,
    })
}
