//! Sources the key pool loads its records from.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::domain::KeySeed;

/// Durable snapshot of pre-generated key pairs.
pub trait KeySource: Send + Sync {
    /// Read every seed in the snapshot
    fn load(&self) -> Result<Vec<KeySeed>>;
}

/// A JSON array of `{publicKey, secretKey}` objects on disk.
///
/// A missing file is an empty snapshot.
#[derive(Debug, Clone)]
pub struct JsonKeyFile {
    path: PathBuf,
}

impl JsonKeyFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeySource for JsonKeyFile {
    fn load(&self) -> Result<Vec<KeySeed>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read key snapshot: {}", self.path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse key snapshot: {}", self.path.display()))
    }
}

/// Seeds held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticKeys(pub Vec<KeySeed>);

impl StaticKeys {
    /// Seeds whose secret is derived from the public key, for fixtures
    pub fn named<I, S>(public_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(
            public_keys
                .into_iter()
                .map(|pk| {
                    let pk = pk.into();
                    let sk = format!("{}-secret", pk);
                    KeySeed::new(pk, sk)
                })
                .collect(),
        )
    }
}

impl KeySource for StaticKeys {
    fn load(&self) -> Result<Vec<KeySeed>> {
        Ok(self.0.clone())
    }
}
