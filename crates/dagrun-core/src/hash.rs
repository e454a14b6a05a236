//! ContentHasher trait for definition versioning.
//!
//! Defined in dagrun-core so the engine can hash definitions without coupling
//! to a specific algorithm. The `Sha256ContentHasher` adapter lives in
//! dagrun-infra.

use dagrun_types::error::ValidationError;
use serde::Serialize;

/// Abstraction over content hashing.
///
/// The engine hashes the canonical JSON of a definition (or reusable task)
/// and stores a new version only when the hash changes.
pub trait ContentHasher: Send + Sync {
    /// Compute a hex-encoded hash of the given content.
    fn compute_hash(&self, content: &str) -> String;
}

/// Hash the canonical JSON serialization of a definition or task.
pub fn canonical_hash<H, T>(hasher: &H, value: &T) -> Result<String, ValidationError>
where
    H: ContentHasher + ?Sized,
    T: Serialize,
{
    let json = serde_json::to_string(value).map_err(|e| ValidationError::Malformed(e.to_string()))?;
    Ok(hasher.compute_hash(&json))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagrun_types::dag::{DagSpec, TaskSpec};

    /// Identity "hash" so tests can see what was hashed.
    struct EchoHasher;

    impl ContentHasher for EchoHasher {
        fn compute_hash(&self, content: &str) -> String {
            content.to_string()
        }
    }

    fn spec(image: &str) -> DagSpec {
        DagSpec {
            tasks: vec![TaskSpec {
                name: "a".into(),
                image: image.into(),
                command: vec!["true".into()],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_same_content_same_hash() {
        let a = canonical_hash(&EchoHasher, &spec("alpine")).unwrap();
        let b = canonical_hash(&EchoHasher, &spec("alpine")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_changed_field_changes_hash() {
        let a = canonical_hash(&EchoHasher, &spec("alpine")).unwrap();
        let b = canonical_hash(&EchoHasher, &spec("busybox")).unwrap();
        assert_ne!(a, b);
    }
}
