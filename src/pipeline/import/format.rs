use std::io::Read;
use std::path::{Path, PathBuf};

use super::ImportError;

/// PDF magic number.
const PDF_MAGIC: &[u8; 4] = b"%PDF";

/// Detect a PDF from its magic bytes (NOT the file extension).
pub fn is_pdf(path: &Path) -> Result<bool, ImportError> {
    let mut file = std::fs::File::open(path)?;
    let mut header = [0u8; 4];
    let read = file.read(&mut header)?;
    Ok(read == header.len() && &header == PDF_MAGIC)
}

/// Every PDF under `dir`, recursively, in path order.
///
/// Files that are not PDFs are skipped with a debug log; hidden entries
/// (`.DS_Store`, `.git`) are ignored entirely.
pub fn scan_pdfs(dir: &Path) -> Result<Vec<PathBuf>, ImportError> {
    if !dir.is_dir() {
        return Err(ImportError::NotADirectory(dir.to_path_buf()));
    }

    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let path = entry?.path();
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with('.'))
                .unwrap_or(false);
            if hidden {
                continue;
            }

            if path.is_dir() {
                pending.push(path);
            } else if is_pdf(&path)? {
                found.push(path);
            } else {
                tracing::debug!(file = %path.display(), "Skipping non-PDF file");
            }
        }
    }

    found.sort();
    Ok(found)
}

/// Sanitize a filename for storage and logs: strips path components and
/// control characters.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base.chars().filter(|c| !c.is_control()).collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        "unnamed.pdf".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_pdf_by_magic_not_extension() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("scan.bin");
        std::fs::write(&real, b"%PDF-1.7\n...").unwrap();
        let fake = dir.path().join("fake.pdf");
        std::fs::write(&fake, b"hello").unwrap();

        assert!(is_pdf(&real).unwrap());
        assert!(!is_pdf(&fake).unwrap());
    }

    #[test]
    fn scan_recurses_sorted_and_skips_hidden() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::create_dir(dir.path().join(".cache")).unwrap();
        for name in ["b.pdf", "a.pdf", "sub/c.pdf", ".cache/d.pdf"] {
            std::fs::write(dir.path().join(name), b"%PDF-1.4").unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), b"not a pdf").unwrap();

        let found = scan_pdfs(dir.path()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.pdf", "b.pdf", "sub/c.pdf"]);
    }

    #[test]
    fn scan_rejects_file_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.pdf");
        std::fs::write(&file, b"%PDF").unwrap();
        assert!(matches!(scan_pdfs(&file), Err(ImportError::NotADirectory(_))));
    }

    #[test]
    fn sanitize_strips_paths_and_controls() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\loans\\note.pdf"), "note.pdf");
        assert_eq!(sanitize_filename("bad\u{0007}name.pdf"), "badname.pdf");
        assert_eq!(sanitize_filename("   "), "unnamed.pdf");
    }
}
