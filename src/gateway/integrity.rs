//! Content hashing used to detect a script being swapped between
//! validation and launch.

use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::debug;

/// SHA-256 of the whole file as lower-case hex, or `None` when the file
/// cannot be read.
///
/// Uses `tokio::fs::read` so large scripts don't block the runtime.
pub async fn compute_hash(path: &Path) -> Option<String> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Some(hex::encode(Sha256::digest(&bytes))),
        Err(e) => {
            debug!("Could not hash {}: {e}", path.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hash_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hash-test.ps1");
        std::fs::write(&path, b"test content").unwrap();

        let first = compute_hash(&path).await.unwrap();
        let second = compute_hash(&path).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[tokio::test]
    async fn test_hash_known_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.ps1");
        std::fs::write(&path, b"").unwrap();

        assert_eq!(
            compute_hash(&path).await.unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn test_hash_changes_with_one_byte() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tamper.ps1");
        std::fs::write(&path, b"Write-Host 'hello'").unwrap();
        let before = compute_hash(&path).await.unwrap();

        std::fs::write(&path, b"Write-Host 'hellp'").unwrap();
        let after = compute_hash(&path).await.unwrap();
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn test_hash_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(compute_hash(&dir.path().join("nonexistent_file.ps1"))
            .await
            .is_none());
    }
}
