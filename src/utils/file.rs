//! File utilities for batch ingestion.

use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

/// Calculate SHA-256 checksum of content.
pub fn calculate_checksum(content: &str) -> String {
    let hash = Sha256::digest(content.as_bytes());
    hex::encode(hash)
}

/// Derive a stable document id from a path relative to the ingestion root.
pub fn document_id_for_path(relative: &str) -> String {
    let hash = Sha256::digest(relative.as_bytes());
    hex::encode(&hash[..16])
}

/// Check if a file holds already-extracted text we can ingest.
pub fn is_ingestable_file(path: &Path) -> bool {
    match path.extension() {
        Some(ext) => is_text_extension(&ext.to_string_lossy().to_lowercase()),
        None => false,
    }
}

/// Read file content with size limit.
pub fn read_file_content(path: &Path, max_size: u64) -> std::io::Result<String> {
    let metadata = fs::metadata(path)?;

    if metadata.len() > max_size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "file exceeds maximum size: {} > {}",
                metadata.len(),
                max_size
            ),
        ));
    }

    fs::read_to_string(path)
}

/// Title for a document ingested from a file: the file stem with separators
/// turned into spaces.
pub fn title_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().replace(['_', '-'], " "))
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

/// Get the relative path from a base directory.
pub fn get_relative_path(base: &Path, path: &Path) -> Option<String> {
    path.strip_prefix(base)
        .ok()
        .map(|p| p.to_string_lossy().to_string())
}

fn is_text_extension(ext: &str) -> bool {
    matches!(
        ext,
        "txt" | "text" | "md" | "markdown" | "rst" | "adoc" | "org" | "html" | "htm" | "csv"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    #[test]
    fn test_calculate_checksum() {
        let checksum = calculate_checksum("hello world");
        assert_eq!(checksum.len(), 64);
    }

    #[test]
    fn test_document_id_is_stable() {
        let a = document_id_for_path("manuals/router.txt");
        assert_eq!(a.len(), 32);
        assert_eq!(a, document_id_for_path("manuals/router.txt"));
        assert_ne!(a, document_id_for_path("manuals/switch.txt"));
    }

    #[test]
    fn test_is_ingestable_file() {
        assert!(is_ingestable_file(&PathBuf::from("manual.txt")));
        assert!(is_ingestable_file(&PathBuf::from("README.MD")));
        assert!(!is_ingestable_file(&PathBuf::from("manual.pdf")));
        assert!(!is_ingestable_file(&PathBuf::from("Makefile")));
    }

    #[test]
    fn test_title_from_path() {
        assert_eq!(
            title_from_path(&PathBuf::from("/docs/quick_start-guide.txt")),
            "quick start guide"
        );
    }

    #[test]
    fn test_read_file_content_respects_limit() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", "x".repeat(64)).unwrap();
        assert!(read_file_content(file.path(), 10).is_err());
        assert_eq!(read_file_content(file.path(), 1024).unwrap().len(), 64);
    }
}
