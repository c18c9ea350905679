use std::path::PathBuf;
use std::sync::Arc;

use uuid::Uuid;

use crate::models::enums::ExtractionStrategy;

/// A document queued for deep extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSource {
    pub document_id: Uuid,
    pub filename: String,
    pub path: PathBuf,
    pub category: ExtractionStrategy,
    pub page_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Succeeded,
    /// Failed, replaced by one or more retry jobs.
    Retried,
    Failed,
}

/// One call to the external extractor: a batch of pages of one document.
#[derive(Debug, Clone)]
pub struct ExtractionJob {
    pub id: u64,
    pub source: Arc<DocumentSource>,
    /// 1-based; the first try is attempt 1.
    pub attempt: u32,
    /// Zero-based page indices in this batch.
    pub pages: Vec<usize>,
    pub status: JobStatus,
}

impl ExtractionJob {
    pub fn document_id(&self) -> Uuid {
        self.source.document_id
    }

    pub fn first_page(&self) -> usize {
        self.pages.first().copied().unwrap_or(0)
    }

    pub fn record(&self, status: JobStatus) -> JobRecord {
        JobRecord {
            id: self.id,
            document_id: self.source.document_id,
            attempt: self.attempt,
            pages: self.pages.clone(),
            status,
        }
    }
}

/// Terminal state of a job, kept for the run ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: u64,
    pub document_id: Uuid,
    pub attempt: u32,
    pub pages: Vec<usize>,
    pub status: JobStatus,
}

/// Monotonic job ids for one run.
#[derive(Debug, Default)]
pub struct JobIds(u64);

impl JobIds {
    pub fn next(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }
}

/// Split `pages` into consecutive batches of at most `batch_size` pages.
pub fn batch_pages(pages: &[usize], batch_size: usize) -> Vec<Vec<usize>> {
    pages.chunks(batch_size.max(1)).map(<[usize]>::to_vec).collect()
}

/// First-attempt jobs for a document.
pub fn plan_document(
    source: &Arc<DocumentSource>,
    batch_size: usize,
    ids: &mut JobIds,
) -> Vec<ExtractionJob> {
    let pages: Vec<usize> = (0..source.page_count as usize).collect();
    batch_pages(&pages, batch_size)
        .into_iter()
        .map(|pages| ExtractionJob {
            id: ids.next(),
            source: Arc::clone(source),
            attempt: 1,
            pages,
            status: JobStatus::Queued,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(pages: u32) -> Arc<DocumentSource> {
        Arc::new(DocumentSource {
            document_id: Uuid::new_v4(),
            filename: "cd.pdf".into(),
            path: PathBuf::from("/tmp/cd.pdf"),
            category: ExtractionStrategy::Scanned,
            page_count: pages,
        })
    }

    #[test]
    fn batches_are_consecutive_and_bounded() {
        let batches = batch_pages(&[0, 1, 2, 3, 4, 5, 6], 3);
        assert_eq!(batches, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
    }

    #[test]
    fn zero_batch_size_treated_as_one() {
        assert_eq!(batch_pages(&[0, 1], 0).len(), 2);
    }

    #[test]
    fn plan_assigns_unique_ids_and_first_attempt() {
        let mut ids = JobIds::default();
        let doc = source(7);
        let jobs = plan_document(&doc, 3, &mut ids);
        assert_eq!(jobs.len(), 3);
        assert!(jobs.iter().all(|j| j.attempt == 1 && j.status == JobStatus::Queued));
        assert_eq!(jobs.iter().map(|j| j.id).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(jobs[2].first_page(), 6);
    }

    #[test]
    fn single_page_document_is_one_job() {
        let mut ids = JobIds::default();
        assert_eq!(plan_document(&source(1), 3, &mut ids).len(), 1);
        assert!(plan_document(&source(0), 3, &mut ids).is_empty());
    }
}
