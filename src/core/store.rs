//! Durable launch store.
//!
//! The store owns launch aggregates; this crate only reads key material and
//! writes back dependent wallets, launch state and the bundle outcome.
//! `JsonLaunchStore` keeps every aggregate in one JSON file, rewritten
//! atomically under an exclusive lock. `MemoryLaunchStore` is for tests and
//! embedding.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::RwLock;
use tracing::debug;

use crate::domain::{BundleOutcome, DependentBatch, LaunchAggregate, LaunchState};

/// Persistence for launch aggregates
#[async_trait]
pub trait LaunchStore: Send + Sync {
    /// Load one aggregate by mint identifier
    async fn find(&self, id: &str) -> Result<Option<LaunchAggregate>>;

    /// Insert or replace an aggregate
    async fn insert(&self, aggregate: LaunchAggregate) -> Result<()>;

    /// Store a funding batch on an existing aggregate
    async fn update_dependents(&self, id: &str, batch: DependentBatch) -> Result<()>;

    /// Every aggregate prepared by `owner_key`, oldest first
    async fn find_by_owner(&self, owner_key: &str) -> Result<Vec<LaunchAggregate>>;

    /// Overwrite the launch state; `bundle` replaces the last outcome when set
    async fn record_state(
        &self,
        id: &str,
        state: LaunchState,
        bundle: Option<BundleOutcome>,
    ) -> Result<()>;
}

fn missing(id: &str) -> anyhow::Error {
    anyhow!("Launch not found: {}", id)
}

fn apply_state(aggregate: &mut LaunchAggregate, state: LaunchState, bundle: Option<BundleOutcome>) {
    aggregate.state = state;
    if bundle.is_some() {
        aggregate.bundle = bundle;
    }
}

fn by_owner<'a>(
    aggregates: impl Iterator<Item = &'a LaunchAggregate>,
    owner_key: &str,
) -> Vec<LaunchAggregate> {
    let mut matches: Vec<LaunchAggregate> = aggregates
        .filter(|a| a.owner_key == owner_key)
        .cloned()
        .collect();
    matches.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    matches
}

const STORE_VERSION: u32 = 1;

/// On-disk layout of the JSON store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreFile {
    version: u32,

    #[serde(default)]
    launches: Vec<LaunchAggregate>,
}

impl StoreFile {
    fn get_mut(&mut self, id: &str) -> Result<&mut LaunchAggregate> {
        self.launches
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| missing(id))
    }
}

/// File-backed store: one JSON document holding every aggregate
#[derive(Debug, Clone)]
pub struct JsonLaunchStore {
    path: PathBuf,
}

impl JsonLaunchStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "launches.json".into());
        name.push(".lock");
        self.path.with_file_name(name)
    }

    /// Read the current contents; a missing file is an empty store
    async fn read(&self) -> Result<StoreFile> {
        read_file(&self.path).await
    }

    /// Read-modify-write under the exclusive lock
    async fn mutate<T, F>(&self, change: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut StoreFile) -> Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        let lock_path = self.lock_path();

        tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create store directory: {}", parent.display()))?;
            }

            let lock = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)
                .with_context(|| format!("Failed to open store lock: {}", lock_path.display()))?;
            lock.lock_exclusive()
                .context("Failed to acquire launch store lock")?;

            let mut file = read_file_blocking(&path)?;
            let value = change(&mut file)?;
            file.version = STORE_VERSION;
            write_file_blocking(&path, &file)?;

            // Lock is released when `lock` is dropped
            Ok(value)
        })
        .await
        .context("Launch store task failed")?
    }
}

async fn read_file(path: &Path) -> Result<StoreFile> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Ok(StoreFile::default());
    }

    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read launch store: {}", path.display()))?;

    parse(&content, path)
}

fn read_file_blocking(path: &Path) -> Result<StoreFile> {
    if !path.exists() {
        return Ok(StoreFile::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read launch store: {}", path.display()))?;

    parse(&content, path)
}

fn parse(content: &str, path: &Path) -> Result<StoreFile> {
    if content.trim().is_empty() {
        return Ok(StoreFile::default());
    }
    serde_json::from_str(content)
        .with_context(|| format!("Failed to parse launch store: {}", path.display()))
}

fn write_file_blocking(path: &Path, file: &StoreFile) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let content = serde_json::to_string_pretty(file).context("Failed to serialize launch store")?;

    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(content.as_bytes())
        .context("Failed to write launch store")?;
    tmp.as_file().sync_all().context("Failed to sync launch store")?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to replace launch store: {}", path.display()))?;

    debug!(path = %path.display(), count = file.launches.len(), "Launch store written");
    Ok(())
}

#[async_trait]
impl LaunchStore for JsonLaunchStore {
    async fn find(&self, id: &str) -> Result<Option<LaunchAggregate>> {
        let file = self.read().await?;
        Ok(file.launches.into_iter().find(|a| a.id == id))
    }

    async fn insert(&self, aggregate: LaunchAggregate) -> Result<()> {
        self.mutate(move |file| {
            match file.launches.iter().position(|a| a.id == aggregate.id) {
                Some(idx) => file.launches[idx] = aggregate,
                None => file.launches.push(aggregate),
            }
            Ok(())
        })
        .await
    }

    async fn update_dependents(&self, id: &str, batch: DependentBatch) -> Result<()> {
        let id = id.to_string();
        self.mutate(move |file| {
            file.get_mut(&id)?.apply_batch(batch);
            Ok(())
        })
        .await
    }

    async fn find_by_owner(&self, owner_key: &str) -> Result<Vec<LaunchAggregate>> {
        let file = self.read().await?;
        Ok(by_owner(file.launches.iter(), owner_key))
    }

    async fn record_state(
        &self,
        id: &str,
        state: LaunchState,
        bundle: Option<BundleOutcome>,
    ) -> Result<()> {
        let id = id.to_string();
        self.mutate(move |file| {
            apply_state(file.get_mut(&id)?, state, bundle);
            Ok(())
        })
        .await
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryLaunchStore {
    launches: RwLock<HashMap<String, LaunchAggregate>>,
}

impl MemoryLaunchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with `aggregates`
    pub fn with_launches(aggregates: impl IntoIterator<Item = LaunchAggregate>) -> Self {
        let launches = aggregates.into_iter().map(|a| (a.id.clone(), a)).collect();
        Self {
            launches: RwLock::new(launches),
        }
    }
}

#[async_trait]
impl LaunchStore for MemoryLaunchStore {
    async fn find(&self, id: &str) -> Result<Option<LaunchAggregate>> {
        Ok(self.launches.read().await.get(id).cloned())
    }

    async fn insert(&self, aggregate: LaunchAggregate) -> Result<()> {
        self.launches
            .write()
            .await
            .insert(aggregate.id.clone(), aggregate);
        Ok(())
    }

    async fn update_dependents(&self, id: &str, batch: DependentBatch) -> Result<()> {
        let mut launches = self.launches.write().await;
        launches.get_mut(id).ok_or_else(|| missing(id))?.apply_batch(batch);
        Ok(())
    }

    async fn find_by_owner(&self, owner_key: &str) -> Result<Vec<LaunchAggregate>> {
        Ok(by_owner(self.launches.read().await.values(), owner_key))
    }

    async fn record_state(
        &self,
        id: &str,
        state: LaunchState,
        bundle: Option<BundleOutcome>,
    ) -> Result<()> {
        let mut launches = self.launches.write().await;
        apply_state(launches.get_mut(id).ok_or_else(|| missing(id))?, state, bundle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DependentWallet;
    use chrono::Utc;
    use tempfile::TempDir;

    fn batch() -> DependentBatch {
        DependentBatch {
            dependents: vec![DependentWallet {
                public_key: "s1".into(),
                secret_key: "k1".into(),
            }],
            mixers: Vec::new(),
            total_funded: 1.5,
        }
    }

    #[tokio::test]
    async fn test_json_store_missing_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let store = JsonLaunchStore::new(temp.path().join("launches.json"));

        assert!(store.find("m1").await.unwrap().is_none());
        assert!(store.find_by_owner("owner").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_json_store_round_trips_updates() {
        let temp = TempDir::new().unwrap();
        let store = JsonLaunchStore::new(temp.path().join("nested").join("launches.json"));

        store
            .insert(LaunchAggregate::prepared("m1", "owner"))
            .await
            .unwrap();
        store.update_dependents("m1", batch()).await.unwrap();
        store
            .record_state(
                "m1",
                LaunchState::Bundled,
                Some(BundleOutcome {
                    success: true,
                    bundle_id: Some("B1".into()),
                    error: None,
                    recorded_at: Utc::now(),
                }),
            )
            .await
            .unwrap();

        // A fresh handle sees what the first one wrote
        let reopened = JsonLaunchStore::new(store.path());
        let launch = reopened.find("m1").await.unwrap().unwrap();
        assert_eq!(launch.dependent_wallets.len(), 1);
        assert_eq!(launch.total_funded, 1.5);
        assert_eq!(launch.state, LaunchState::Bundled);
        assert_eq!(launch.bundle.unwrap().bundle_id.as_deref(), Some("B1"));
        assert!(temp.path().join("nested").join("launches.json.lock").exists());
    }

    #[tokio::test]
    async fn test_record_state_keeps_previous_outcome() {
        let store = MemoryLaunchStore::with_launches([LaunchAggregate::prepared("m1", "o")]);
        let outcome = BundleOutcome {
            success: false,
            bundle_id: None,
            error: Some("rejected".into()),
            recorded_at: Utc::now(),
        };

        store
            .record_state("m1", LaunchState::Created, Some(outcome.clone()))
            .await
            .unwrap();
        store
            .record_state("m1", LaunchState::Failed { diagnostic: "x".into() }, None)
            .await
            .unwrap();

        let launch = store.find("m1").await.unwrap().unwrap();
        assert_eq!(launch.bundle, Some(outcome));
    }

    #[tokio::test]
    async fn test_updates_on_unknown_launch_fail() {
        let temp = TempDir::new().unwrap();
        let json = JsonLaunchStore::new(temp.path().join("launches.json"));
        let memory = MemoryLaunchStore::new();

        assert!(json.update_dependents("nope", batch()).await.is_err());
        assert!(json
            .record_state("nope", LaunchState::Created, None)
            .await
            .is_err());
        assert!(memory.update_dependents("nope", batch()).await.is_err());
    }

    #[tokio::test]
    async fn test_find_by_owner_filters_and_orders() {
        let mut first = LaunchAggregate::prepared("m1", "alice");
        first.created_at = Utc::now() - chrono::Duration::minutes(5);
        let second = LaunchAggregate::prepared("m2", "alice");
        let other = LaunchAggregate::prepared("m3", "bob");

        let store = MemoryLaunchStore::with_launches([second, other, first]);
        let ids: Vec<String> = store
            .find_by_owner("alice")
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec!["m1".to_string(), "m2".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_json_writes_are_not_lost() {
        let temp = TempDir::new().unwrap();
        let store = JsonLaunchStore::new(temp.path().join("launches.json"));

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .insert(LaunchAggregate::prepared(format!("m{}", i), "owner"))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.find_by_owner("owner").await.unwrap().len(), 8);
    }
}
