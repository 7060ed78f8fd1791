//! Atomic document persistence: write-temp-then-rename, so a crash mid-write
//! never leaves a torn document on disk (§4.1, §9 "Atomic persistence").

use crate::error::StoreError;
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;

pub fn load<T: DeserializeOwned + Default>(
    path: &Path,
    document: &'static str,
) -> Result<T, StoreError> {
    if !path.exists() {
        return Ok(T::default());
    }
    let bytes = std::fs::read(path).map_err(|source| StoreError::Io { document, source })?;
    if bytes.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Serde { document, source })
}

/// Serializes `value` and writes it via a temp file in the same directory
/// followed by a rename, which is atomic on the same filesystem.
pub fn save<T: Serialize>(path: &Path, document: &'static str, value: &T) -> Result<(), StoreError> {
    let bytes =
        serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serde { document, source })?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| StoreError::Io { document, source })?;
    }

    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, &bytes).map_err(|source| StoreError::Io { document, source })?;
    std::fs::rename(&tmp_path, path).map_err(|source| StoreError::Io { document, source })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Doc {
        value: u32,
    }

    #[test]
    fn load_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let doc: Doc = load(&path, "doc").unwrap();
        assert_eq!(doc, Doc::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let doc = Doc { value: 42 };
        save(&path, "doc", &doc).unwrap();
        let loaded: Doc = load(&path, "doc").unwrap();
        assert_eq!(loaded, doc);
        assert!(!path.with_extension("tmp").exists(), "temp file must be renamed away");
    }

    #[test]
    fn save_leaves_previous_document_if_it_already_existed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        save(&path, "doc", &Doc { value: 1 }).unwrap();
        save(&path, "doc", &Doc { value: 2 }).unwrap();
        let loaded: Doc = load(&path, "doc").unwrap();
        assert_eq!(loaded, Doc { value: 2 });
    }
}
