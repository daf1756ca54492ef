//! Enrollment list loading.
//!
//! The owning service exports the complete set of enrolled descriptors as a
//! JSON array of `{id, owner_id, features}` records. Every load replaces the
//! engine cache wholesale.

use facegate_core::{Descriptor, DescriptorId, EnrolledDescriptor};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("failed to read enrollment file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed enrollment list: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Parse a JSON enrollment list.
pub fn parse(json: &str) -> Result<Vec<EnrolledDescriptor>, EnrollmentError> {
    Ok(serde_json::from_str(json)?)
}

/// Read the enrollment file. A missing file is an empty enrollment list.
pub fn read(path: &Path) -> Result<Vec<EnrolledDescriptor>, EnrollmentError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "enrollment file not found; starting with no enrolled faces");
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(EnrollmentError::Io { path: path.to_path_buf(), source });
        }
    };
    let enrollments = parse(&text)?;
    tracing::debug!(path = %path.display(), count = enrollments.len(), "enrollment file read");
    Ok(enrollments)
}

/// (id, descriptor) pairs as the recognizer cache takes them.
pub fn descriptor_pairs(
    enrollments: Vec<EnrolledDescriptor>,
) -> impl Iterator<Item = (DescriptorId, Descriptor)> {
    enrollments.into_iter().map(|e| (e.id, e.features))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list() {
        let list = parse(r#"[{"id": 4, "owner_id": 10, "features": [0.5, -0.5]}, {"id": 9, "owner_id": 10, "features": [1.0, 0.0]}]"#)
            .unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].owner_id, 10);
        let pairs: Vec<_> = descriptor_pairs(list).collect();
        assert_eq!(pairs[1], (9, Descriptor::new(vec![1.0, 0.0])));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(parse(r#"[{"id": 1}]"#), Err(EnrollmentError::Parse(_))));
        assert!(matches!(parse("{}"), Err(EnrollmentError::Parse(_))));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let list = read(&dir.path().join("enrollments.json")).unwrap();
        assert!(list.is_empty());
    }

    #[test]
    fn test_read_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("enrollments.json");
        std::fs::write(&path, r#"[{"id": 1, "owner_id": 2, "features": [0.1, 0.2, 0.3]}]"#).unwrap();
        let list = read(&path).unwrap();
        assert_eq!(list[0].id, 1);
        assert_eq!(list[0].features.len(), 3);
    }

    #[test]
    fn test_unreadable_path_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        // A directory cannot be read as a file.
        assert!(matches!(read(dir.path()), Err(EnrollmentError::Io { .. })));
    }
}
