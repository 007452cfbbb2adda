//! Launch aggregate and its state machine.
//!
//! The aggregate is owned by the durable store; the coordinator only reads
//! the key material and mutates the dependent wallets, funding counter,
//! launch state and bundle outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A secondary wallet generated by the funding worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependentWallet {
    pub public_key: String,

    #[serde(alias = "private_key")]
    pub secret_key: String,
}

/// Batch result emitted by the funding worker on exit.
///
/// Accepts both the generic field names and the worker's native
/// `sniper_wallets` / `mixer_wallets` names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependentBatch {
    #[serde(alias = "sniper_wallets")]
    pub dependents: Vec<DependentWallet>,

    #[serde(default, alias = "mixer_wallets")]
    pub mixers: Vec<DependentWallet>,

    #[serde(default)]
    pub total_funded: f64,
}

/// Token metadata prepared before launch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetadata {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub symbol: Option<String>,

    #[serde(default)]
    pub description: Option<String>,
}

/// Where a launch stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum LaunchState {
    /// Mint prepared, token not created yet
    Prepared,

    /// Token created on chain
    Created,

    /// Token created and dependent bundle accepted
    Bundled,

    /// Token created, no dependent wallets to bundle
    NoSnipers,

    /// A stage's worker failed
    Failed { diagnostic: String },
}

impl Default for LaunchState {
    fn default() -> Self {
        Self::Prepared
    }
}

impl LaunchState {
    /// Short name for logs and responses
    pub fn name(&self) -> &'static str {
        match self {
            Self::Prepared => "prepared",
            Self::Created => "created",
            Self::Bundled => "bundled",
            Self::NoSnipers => "no_snipers",
            Self::Failed { .. } => "failed",
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// `Failed -> Created` is the caller-driven re-attempt of the create
    /// stage; nothing in this crate retries on its own.
    pub fn can_transition_to(&self, next: &LaunchState) -> bool {
        match (self, next) {
            (_, Self::Failed { .. }) => true,
            (Self::Prepared, Self::Created) => true,
            (Self::Failed { .. }, Self::Created) => true,
            (Self::Created, Self::Bundled) => true,
            (Self::Created, Self::NoSnipers) => true,
            _ => false,
        }
    }

    /// Whether the create stage may run from this state
    pub fn can_create(&self) -> bool {
        self.can_transition_to(&Self::Created)
    }
}

/// Informational record of the last bundle attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleOutcome {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub recorded_at: DateTime<Utc>,
}

/// Persisted launch record, keyed by mint identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchAggregate {
    /// Mint identifier
    pub id: String,

    /// Auth key of the owner that prepared the mint
    pub owner_key: String,

    #[serde(default)]
    pub deployer_public_key: String,

    #[serde(default)]
    pub buyer_public_key: String,

    /// Secret key of the buyer wallet that funds dependents
    #[serde(default)]
    pub buyer_secret_key: Option<String>,

    /// Public key of the token mint (a vanity key)
    #[serde(default)]
    pub token_mint_key: String,

    #[serde(default)]
    pub metadata_uri: Option<String>,

    #[serde(default)]
    pub metadata: TokenMetadata,

    #[serde(default)]
    pub dependent_wallets: Vec<DependentWallet>,

    #[serde(default)]
    pub mixer_wallets: Vec<DependentWallet>,

    #[serde(default)]
    pub total_funded: f64,

    #[serde(default)]
    pub state: LaunchState,

    #[serde(default)]
    pub bundle: Option<BundleOutcome>,

    pub created_at: DateTime<Utc>,
}

impl LaunchAggregate {
    /// A freshly prepared aggregate
    pub fn prepared(id: impl Into<String>, owner_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner_key: owner_key.into(),
            deployer_public_key: String::new(),
            buyer_public_key: String::new(),
            buyer_secret_key: None,
            token_mint_key: String::new(),
            metadata_uri: None,
            metadata: TokenMetadata::default(),
            dependent_wallets: Vec::new(),
            mixer_wallets: Vec::new(),
            total_funded: 0.0,
            state: LaunchState::Prepared,
            bundle: None,
            created_at: Utc::now(),
        }
    }

    /// Apply a funding batch
    pub fn apply_batch(&mut self, batch: DependentBatch) {
        self.dependent_wallets = batch.dependents;
        self.mixer_wallets = batch.mixers;
        self.total_funded = batch.total_funded;
    }
}
