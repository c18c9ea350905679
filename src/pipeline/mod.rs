pub mod probe; // Structural prober: extraction strategy per PDF
pub mod fingerprint; // Text hash + per-page perceptual hashes
pub mod orchestrator; // Worker pool around the external extractor
pub mod resolver; // Duplicate collapse + version election
pub mod import; // File-scan-time registration
pub mod dedup; // Run lock + end-to-end run
