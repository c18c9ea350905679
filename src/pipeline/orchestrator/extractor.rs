//! Client side of the external metadata extractor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::OrchestratorError;
use crate::models::enums::ExtractionStrategy;

/// One rendered page sent to the extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageImage {
    /// Stable identifier the extractor must echo back in `page_ids`.
    pub page_id: String,
    /// 1-based page number within the document.
    pub page_number: usize,
    pub png_base64: String,
}

/// Request body for `POST {extractor_url}/extract`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRequest {
    pub model: String,
    pub document_id: Uuid,
    pub filename: String,
    pub category: ExtractionStrategy,
    pub attempt: u32,
    pub page_count: u32,
    pub pages: Vec<PageImage>,
}

impl ExtractionRequest {
    pub fn page_ids(&self) -> Vec<String> {
        self.pages.iter().map(|p| p.page_id.clone()).collect()
    }
}

pub fn page_id(document_id: &Uuid, page_index: usize) -> String {
    format!("{document_id}:p{}", page_index + 1)
}

/// External extractor abstraction (allows mocking for tests).
///
/// Returns the raw response body; validation happens at the orchestrator
/// boundary, never here.
pub trait MetadataExtractor: Send + Sync {
    fn extract(
        &self,
        request: &ExtractionRequest,
        timeout: Duration,
    ) -> Result<Value, OrchestratorError>;
}

/// HTTP client for the extraction service.
pub struct HttpMetadataExtractor {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl HttpMetadataExtractor {
    pub fn new(base_url: &str) -> Result<Self, OrchestratorError> {
        let client = reqwest::blocking::Client::builder()
            .build()
            .map_err(|e| OrchestratorError::Transport(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

impl MetadataExtractor for HttpMetadataExtractor {
    fn extract(
        &self,
        request: &ExtractionRequest,
        timeout: Duration,
    ) -> Result<Value, OrchestratorError> {
        let url = format!("{}/extract", self.base_url);

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(request)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    OrchestratorError::ExtractionTimeout {
                        secs: timeout.as_secs(),
                    }
                } else if e.is_connect() {
                    OrchestratorError::Transport(format!("Extractor unreachable at {}", self.base_url))
                } else {
                    OrchestratorError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(OrchestratorError::Transport(format!(
                "Extractor returned {}: {}",
                status.as_u16(),
                body.chars().take(200).collect::<String>()
            )));
        }

        response.json::<Value>().map_err(|e| {
            if e.is_timeout() {
                OrchestratorError::ExtractionTimeout {
                    secs: timeout.as_secs(),
                }
            } else {
                OrchestratorError::ExtractionMalformedOutput(e.to_string())
            }
        })
    }
}

// ── Mock for testing ─────────────────────────────────────

type Responder = dyn Fn(&ExtractionRequest) -> Result<Value, OrchestratorError> + Send + Sync;

/// Scripted extractor: every call is answered by a closure.
pub struct MockExtractor {
    respond: Box<Responder>,
    calls: AtomicUsize,
}

impl MockExtractor {
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(&ExtractionRequest) -> Result<Value, OrchestratorError> + Send + Sync + 'static,
    {
        Self {
            respond: Box::new(respond),
            calls: AtomicUsize::new(0),
        }
    }

    /// Always answers with a valid response of the given type.
    pub fn answering(document_type: &str) -> Self {
        let document_type = document_type.to_string();
        Self::new(move |req| Ok(mock_response(req, &document_type)))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MetadataExtractor for MockExtractor {
    fn extract(
        &self,
        request: &ExtractionRequest,
        _timeout: Duration,
    ) -> Result<Value, OrchestratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.respond)(request)
    }
}

/// A schema-valid response echoing the request's page ids.
pub fn mock_response(request: &ExtractionRequest, document_type: &str) -> Value {
    json!({
        "document_type": document_type,
        "detected_dates": [],
        "persons": [],
        "has_signature": false,
        "completeness": 0.5,
        "key_identifiers": {},
        "page_ids": request.page_ids(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(pages: usize) -> ExtractionRequest {
        let document_id = Uuid::new_v4();
        ExtractionRequest {
            model: "loan-docs-v1".into(),
            document_id,
            filename: "note.pdf".into(),
            category: ExtractionStrategy::Scanned,
            attempt: 1,
            page_count: pages as u32,
            pages: (0..pages)
                .map(|i| PageImage {
                    page_id: page_id(&document_id, i),
                    page_number: i + 1,
                    png_base64: String::new(),
                })
                .collect(),
        }
    }

    #[test]
    fn page_ids_are_one_based() {
        let id = Uuid::nil();
        assert_eq!(page_id(&id, 0), "00000000-0000-0000-0000-000000000000:p1");
    }

    #[test]
    fn mock_counts_calls_and_echoes_pages() {
        let mock = MockExtractor::answering("Promissory Note");
        let req = request(2);
        let value = mock.extract(&req, Duration::from_secs(1)).unwrap();
        assert_eq!(mock.calls(), 1);
        assert_eq!(value["page_ids"].as_array().unwrap().len(), 2);
        assert_eq!(value["document_type"], "Promissory Note");
    }

    #[test]
    fn request_serializes_strategy_snake_case() {
        let json = serde_json::to_value(request(1)).unwrap();
        assert_eq!(json["category"], "scanned");
        assert_eq!(json["pages"][0]["page_number"], 1);
    }

    #[test]
    fn http_extractor_trims_trailing_slash() {
        let client = HttpMetadataExtractor::new("http://localhost:8088/").unwrap();
        assert_eq!(client.base_url, "http://localhost:8088");
    }

    /// Serve exactly one HTTP exchange on a local port: read the request,
    /// wait `delay`, then write `response` verbatim.
    fn serve_once(response: &'static str, delay: Duration) -> String {
        use std::io::{BufRead, BufReader, Read, Write};
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                if let Some((name, value)) = line.split_once(':') {
                    if name.eq_ignore_ascii_case("content-length") {
                        content_length = value.trim().parse().unwrap();
                    }
                }
            }
            let mut body = vec![0u8; content_length];
            reader.read_exact(&mut body).unwrap();

            std::thread::sleep(delay);
            let mut stream = stream;
            let _ = stream.write_all(response.as_bytes());
            let _ = stream.flush();
        });
        format!("http://{addr}")
    }

    #[test]
    fn http_extractor_returns_body_on_success() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 35\r\nConnection: close\r\n\r\n{\"document_type\":\"Promissory Note\"}",
            Duration::ZERO,
        );
        let client = HttpMetadataExtractor::new(&url).unwrap();
        let value = client.extract(&request(1), Duration::from_secs(5)).unwrap();
        assert_eq!(value["document_type"], "Promissory Note");
    }

    #[test]
    fn http_extractor_slow_response_is_timeout() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}",
            Duration::from_millis(1500),
        );
        let client = HttpMetadataExtractor::new(&url).unwrap();
        let result = client.extract(&request(1), Duration::from_millis(200));
        assert!(matches!(result, Err(OrchestratorError::ExtractionTimeout { .. })));
    }

    #[test]
    fn http_extractor_error_status_is_transport() {
        let url = serve_once(
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 10\r\nConnection: close\r\n\r\noverloaded",
            Duration::ZERO,
        );
        let client = HttpMetadataExtractor::new(&url).unwrap();
        match client.extract(&request(1), Duration::from_secs(5)) {
            Err(OrchestratorError::Transport(message)) => {
                assert!(message.contains("503"), "{message}");
                assert!(message.contains("overloaded"), "{message}");
            }
            other => panic!("Expected transport error, got {other:?}"),
        }
    }

    #[test]
    fn http_extractor_non_json_body_is_malformed() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 12\r\nConnection: close\r\n\r\nnot json at!",
            Duration::ZERO,
        );
        let client = HttpMetadataExtractor::new(&url).unwrap();
        let result = client.extract(&request(1), Duration::from_secs(5));
        assert!(matches!(result, Err(OrchestratorError::ExtractionMalformedOutput(_))));
    }

    #[test]
    fn http_extractor_unreachable_is_transport_error() {
        // Port 9 (discard) is closed on CI hosts.
        let client = HttpMetadataExtractor::new("http://127.0.0.1:9").unwrap();
        let result = client.extract(&request(1), Duration::from_secs(2));
        assert!(matches!(
            result,
            Err(OrchestratorError::Transport(_)) | Err(OrchestratorError::ExtractionTimeout { .. })
        ));
    }
}
