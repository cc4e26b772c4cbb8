//! Concrete test cases.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Concrete inputs produced by an SVM node, fed back to VM nodes.
///
/// The dispatcher treats the payload as opaque; equality of test cases is
/// content equality, and the pool dedups on [`TestCase::digest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestCase {
    /// Opaque serialized inputs.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl TestCase {
    /// Wrap raw input bytes.
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// SHA-256 over the payload; the pool's dedup key.
    #[must_use]
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(&self.data);
        hasher.finalize().into()
    }
}
