//! Launch coordinator.
//!
//! Drives the launch worker and wallet worker against the durable store:
//! balance checks, funding of dependent wallets (streaming early-resolve),
//! and token creation followed by the dependent bundle (pipeline). Nothing
//! here retries; a failed stage is recorded and surfaced once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{
    BatchSink, CompletionHandle, FollowUp, NestedCall, ProcessOrchestrator, StatusMatcher,
    WorkerError,
};
use crate::domain::{
    BundleOutcome, DependentBatch, DependentWallet, LaunchAggregate, LaunchState, WorkerCommand,
};

use super::store::LaunchStore;

/// Status line the funding worker prints once the buyer transfer is sent
pub const DEFAULT_STATUS_PATTERN: &str =
    r"Buyer → Mixer \(wrapped\) transaction sent: ([A-Za-z0-9]+)";

/// Explorer prefix for transaction links
pub const DEFAULT_EXPLORER_TX_URL: &str = "https://solscan.io/tx/";

const LAMPORTS_PER_SOL: f64 = 1_000_000_000.0;

const DEFAULT_TOKEN_NAME: &str = "Token";
const DEFAULT_TOKEN_SYMBOL: &str = "TKN";
const DEFAULT_TOKEN_DESCRIPTION: &str = "Token created via launchkit";

const NO_DEPENDENTS: &str = "No sniper wallets found";

/// Launch coordination errors
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Launch not found: {0}")]
    NotFound(String),

    #[error("Launch {id} has no {field}")]
    MissingField { id: String, field: &'static str },

    #[error("Cannot {stage} launch {id} while it is {state}")]
    InvalidTransition {
        id: String,
        stage: &'static str,
        state: &'static str,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("Launch store error: {0:#}")]
    Store(anyhow::Error),
}

impl LaunchError {
    /// Stable kind tag used in responses
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::MissingField { .. } | Self::InvalidTransition { .. } => "invalid_state",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Worker(e) => e.kind(),
            Self::Store(_) => "store",
        }
    }

    /// Worker status text, when a worker failed
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::Worker(e) if !e.diagnostics().is_empty() => Some(e.diagnostics()),
            _ => None,
        }
    }
}

/// Worker and matching settings for a coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorSettings {
    pub launch_worker: WorkerCommand,
    pub wallet_worker: WorkerCommand,
    pub status_pattern: String,
    pub explorer_tx_url: String,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            launch_worker: WorkerCommand::new("snipebundle_service"),
            wallet_worker: WorkerCommand::new("wallet_service"),
            status_pattern: DEFAULT_STATUS_PATTERN.to_string(),
            explorer_tx_url: DEFAULT_EXPLORER_TX_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceCheck {
    pub balance: f64,
    pub has_enough: bool,
}

/// Early answer of a funding call
#[derive(Debug)]
pub struct FundingReceipt {
    pub signature: String,
    pub explorer_url: String,

    /// Background completion: worker exit and dependent persistence
    pub completion: CompletionHandle,
}

/// Inputs of the create stage. Secrets are never logged.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRequest {
    pub mint_id: String,
    pub deployer_secret_key: String,
    pub token_mint_secret_key: String,
    pub dev_buy_amount: f64,
}

/// Result of the bundle stage, reported next to a successful create
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleSubResult {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependent_count: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BundleSubResult {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            bundle_id: None,
            dependent_count: None,
            error: Some(error.into()),
        }
    }

    fn outcome(&self) -> BundleOutcome {
        BundleOutcome {
            success: self.success,
            bundle_id: self.bundle_id.clone(),
            error: self.error.clone(),
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LaunchReport {
    pub mint_id: String,
    pub signature: Option<String>,
    pub explorer_url: Option<String>,
    pub state: LaunchState,
    pub bundle: BundleSubResult,
}

/// Wallet keys returned by the wallet worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedWallet {
    pub public_key: String,
    pub secret_key: String,
}

/// Secret-free view of a launch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaunchSummary {
    pub id: String,
    pub token_mint_key: String,
    pub state: &'static str,
    pub dependent_count: usize,
    pub total_funded: f64,
    pub created_at: chrono::DateTime<Utc>,
}

impl From<&LaunchAggregate> for LaunchSummary {
    fn from(launch: &LaunchAggregate) -> Self {
        Self {
            id: launch.id.clone(),
            token_mint_key: launch.token_mint_key.clone(),
            state: launch.state.name(),
            dependent_count: launch.dependent_wallets.len(),
            total_funded: launch.total_funded,
            created_at: launch.created_at,
        }
    }
}

/// Writes a funding batch onto its launch
struct DependentsSink {
    store: Arc<dyn LaunchStore>,
    mint_id: String,
}

#[async_trait]
impl BatchSink<DependentBatch> for DependentsSink {
    async fn persist(&self, batch: DependentBatch) -> Result<()> {
        let count = batch.dependents.len();
        self.store
            .update_dependents(&self.mint_id, batch)
            .await
            .with_context(|| format!("Failed to store dependent wallets for {}", self.mint_id))?;
        info!(mint_id = %self.mint_id, count, "Stored dependent wallets");
        Ok(())
    }
}

fn malformed(reason: &str, payload: &Value) -> WorkerError {
    WorkerError::MalformedOutput {
        reason: reason.to_string(),
        output: payload.to_string(),
        diagnostics: String::new(),
    }
}

/// Text to keep on a failed launch
fn diagnostic_text(error: &WorkerError) -> String {
    if error.diagnostics().is_empty() {
        error.to_string()
    } else {
        error.diagnostics().to_string()
    }
}

fn non_empty<'a>(value: &'a str, name: &str) -> Result<&'a str, LaunchError> {
    if value.trim().is_empty() {
        return Err(LaunchError::InvalidRequest(format!("{} is required", name)));
    }
    Ok(value)
}

/// Coordinates worker calls for launches
#[derive(Clone)]
pub struct LaunchCoordinator {
    store: Arc<dyn LaunchStore>,
    orchestrator: ProcessOrchestrator,
    launch_worker: WorkerCommand,
    wallet_worker: WorkerCommand,
    matcher: StatusMatcher,
    explorer_tx_url: String,

    /// One create at a time per mint; entries live while a create runs
    creating: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl LaunchCoordinator {
    pub fn new(store: Arc<dyn LaunchStore>, settings: CoordinatorSettings) -> Result<Self> {
        let matcher = StatusMatcher::new(&settings.status_pattern)
            .with_context(|| format!("Invalid status pattern: {}", settings.status_pattern))?;
        debug!(
            launch_worker = %settings.launch_worker.program,
            pattern = matcher.pattern(),
            "Launch coordinator ready"
        );

        Ok(Self {
            store,
            orchestrator: ProcessOrchestrator::new(),
            launch_worker: settings.launch_worker,
            wallet_worker: settings.wallet_worker,
            matcher,
            explorer_tx_url: settings.explorer_tx_url,
            creating: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn explorer_url(&self, signature: &str) -> String {
        format!("{}{}", self.explorer_tx_url, signature)
    }

    async fn load(&self, mint_id: &str) -> Result<LaunchAggregate, LaunchError> {
        self.store
            .find(mint_id)
            .await
            .map_err(LaunchError::Store)?
            .ok_or_else(|| LaunchError::NotFound(mint_id.to_string()))
    }

    /// Write a state; failures are logged and never surfaced
    async fn record(&self, mint_id: &str, state: LaunchState, bundle: Option<BundleOutcome>) {
        let name = state.name();
        match self.store.record_state(mint_id, state, bundle).await {
            Ok(()) => info!(%mint_id, state = name, "Launch state recorded"),
            Err(e) => error!(%mint_id, state = name, error = %e, "Failed to record launch state"),
        }
    }

    /// Query a wallet balance (SOL) and compare it with `required`
    #[instrument(skip(self))]
    pub async fn check_balance(&self, wallet: &str, required: f64) -> Result<BalanceCheck, LaunchError> {
        non_empty(wallet, "wallet")?;
        if !required.is_finite() {
            return Err(LaunchError::InvalidRequest("required amount must be a number".into()));
        }

        let payload = self
            .orchestrator
            .invoke(&self.launch_worker.invocation("balance", [wallet]))
            .await?;

        let balance = payload
            .get("balance")
            .and_then(Value::as_f64)
            .ok_or_else(|| malformed("missing numeric balance", &payload))?;

        Ok(BalanceCheck {
            balance,
            has_enough: balance >= required,
        })
    }

    /// Fund `count` dependent wallets from the launch's buyer wallet.
    ///
    /// Answers as soon as the buyer transfer signature shows up on the
    /// status stream; the dependent wallets are stored when the worker exits.
    #[instrument(skip(self))]
    pub async fn fund_dependents(
        &self,
        mint_id: &str,
        count: u32,
        total_amount: f64,
    ) -> Result<FundingReceipt, LaunchError> {
        non_empty(mint_id, "mint_id")?;
        if count == 0 {
            return Err(LaunchError::InvalidRequest("count must be positive".into()));
        }
        if !(total_amount.is_finite() && total_amount > 0.0) {
            return Err(LaunchError::InvalidRequest("total_amount must be positive".into()));
        }

        let launch = self.load(mint_id).await?;
        let buyer_secret = launch
            .buyer_secret_key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| LaunchError::MissingField {
                id: mint_id.to_string(),
                field: "buyer secret key",
            })?;

        let invocation = self.launch_worker.invocation(
            "fund-snipers",
            [count.to_string(), total_amount.to_string(), buyer_secret],
        );
        let sink = DependentsSink {
            store: Arc::clone(&self.store),
            mint_id: mint_id.to_string(),
        };

        match self
            .orchestrator
            .invoke_streaming::<DependentBatch, _>(invocation, self.matcher.clone(), sink)
            .await
        {
            Ok(resolution) => {
                info!(signature = %resolution.identifier, "Funding transfer sent");
                Ok(FundingReceipt {
                    explorer_url: self.explorer_url(&resolution.identifier),
                    signature: resolution.identifier,
                    completion: resolution.completion,
                })
            }
            Err(e) => {
                warn!(kind = e.kind(), "Funding failed before the transfer was sent");
                let diagnostic = diagnostic_text(&e);
                self.record(mint_id, LaunchState::Failed { diagnostic }, None)
                    .await;
                Err(e.into())
            }
        }
    }

    /// Create the token, then bundle the stored dependent wallets.
    ///
    /// Only a create failure is an error. The bundle stage is reported in
    /// the returned sub-result whatever happens to it.
    ///
    /// Concurrent creates for the same mint run one after the other, so
    /// only the first can pass the state check and spawn the worker.
    #[instrument(skip(self, request), fields(mint_id = %request.mint_id))]
    pub async fn create_and_bundle(&self, request: CreateRequest) -> Result<LaunchReport, LaunchError> {
        non_empty(&request.mint_id, "mint_id")?;
        non_empty(&request.deployer_secret_key, "deployer_secret_key")?;
        non_empty(&request.token_mint_secret_key, "token_mint_secret_key")?;
        if !(request.dev_buy_amount.is_finite() && request.dev_buy_amount >= 0.0) {
            return Err(LaunchError::InvalidRequest("dev_buy_amount must be a non-negative number".into()));
        }

        let mint_id = request.mint_id.clone();
        let gate = self.create_gate(&mint_id);
        let result = {
            let _held = gate.lock().await;
            self.create_exclusive(request).await
        };
        drop(gate);
        self.release_create_gate(&mint_id);
        result
    }

    fn create_gate(&self, mint_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut creating = self.creating.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            creating
                .entry(mint_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Forget the gate once no other create is holding or waiting on it
    fn release_create_gate(&self, mint_id: &str) {
        let mut creating = self.creating.lock().unwrap_or_else(PoisonError::into_inner);
        if creating.get(mint_id).is_some_and(|gate| Arc::strong_count(gate) == 1) {
            creating.remove(mint_id);
        }
    }

    async fn create_exclusive(&self, request: CreateRequest) -> Result<LaunchReport, LaunchError> {
        let launch = self.load(&request.mint_id).await?;
        if !launch.state.can_create() {
            return Err(LaunchError::InvalidTransition {
                id: launch.id.clone(),
                stage: "create",
                state: launch.state.name(),
            });
        }

        let metadata_uri = launch
            .metadata_uri
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| LaunchError::MissingField {
                id: launch.id.clone(),
                field: "metadata uri",
            })?;

        let metadata = &launch.metadata;
        let invocation = self.launch_worker.invocation(
            "create-token",
            [
                request.deployer_secret_key,
                request.token_mint_secret_key,
                metadata_uri,
                request.dev_buy_amount.to_string(),
                metadata.name.clone().unwrap_or_else(|| DEFAULT_TOKEN_NAME.to_string()),
                metadata.symbol.clone().unwrap_or_else(|| DEFAULT_TOKEN_SYMBOL.to_string()),
                metadata
                    .description
                    .clone()
                    .unwrap_or_else(|| DEFAULT_TOKEN_DESCRIPTION.to_string()),
            ],
        );

        let outcome = match self
            .orchestrator
            .invoke_pipeline(&invocation, |_| self.prepare_bundle(&launch.id))
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                let diagnostic = diagnostic_text(&e);
                self.record(&launch.id, LaunchState::Failed { diagnostic }, None)
                    .await;
                return Err(e.into());
            }
        };

        let signature = outcome
            .primary
            .get("signature")
            .and_then(Value::as_str)
            .map(str::to_string);

        let (state, bundle) = match outcome.follow_up {
            FollowUp::Skipped => (LaunchState::NoSnipers, BundleSubResult::failed(NO_DEPENDENTS)),
            FollowUp::LookupFailed { error } => (LaunchState::Created, BundleSubResult::failed(error)),
            FollowUp::Completed { context, payload } => (
                LaunchState::Bundled,
                BundleSubResult {
                    success: true,
                    bundle_id: payload
                        .get("bundle_id")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    dependent_count: Some(context),
                    error: None,
                },
            ),
            FollowUp::Failed { error, .. } => {
                (LaunchState::Created, BundleSubResult::failed(error.to_string()))
            }
        };

        self.record(&launch.id, state.clone(), Some(bundle.outcome()))
            .await;

        Ok(LaunchReport {
            mint_id: launch.id.clone(),
            explorer_url: signature.as_deref().map(|s| self.explorer_url(s)),
            signature,
            state,
            bundle,
        })
    }

    /// Mark the launch created and build the bundle call for its dependents
    async fn prepare_bundle(&self, mint_id: &str) -> Result<Option<NestedCall<usize>>> {
        self.record(mint_id, LaunchState::Created, None).await;

        let launch = self
            .store
            .find(mint_id)
            .await?
            .ok_or_else(|| anyhow!("Launch {} is no longer in the store", mint_id))?;

        if launch.dependent_wallets.is_empty() {
            return Ok(None);
        }

        // The bundle worker reads the wallets under their native field names
        let wallets: Vec<Value> = launch
            .dependent_wallets
            .iter()
            .map(|w| json!({"public_key": w.public_key, "private_key": w.secret_key}))
            .collect();
        let wallets_json = serde_json::to_string(&wallets).context("Failed to encode dependent wallets")?;

        Ok(Some(NestedCall {
            invocation: self.launch_worker.invocation(
                "jito-bundle",
                [launch.token_mint_key.clone(), wallets_json, launch.deployer_public_key.clone()],
            ),
            context: launch.dependent_wallets.len(),
        }))
    }

    /// Dependent wallets stored for a launch
    pub async fn dependents_for(&self, mint_id: &str) -> Result<Vec<DependentWallet>, LaunchError> {
        Ok(self.load(mint_id).await?.dependent_wallets)
    }

    /// Launches prepared by `owner_key`
    pub async fn launches_for_owner(&self, owner_key: &str) -> Result<Vec<LaunchSummary>, LaunchError> {
        non_empty(owner_key, "owner_key")?;
        let launches = self
            .store
            .find_by_owner(owner_key)
            .await
            .map_err(LaunchError::Store)?;
        Ok(launches.iter().map(LaunchSummary::from).collect())
    }

    #[instrument(skip(self))]
    pub async fn generate_wallet(&self) -> Result<GeneratedWallet, LaunchError> {
        let payload = self
            .orchestrator
            .invoke(&self.wallet_worker.invocation("generate", Vec::<String>::new()))
            .await?;

        serde_json::from_value::<GeneratedWallet>(payload.clone())
            .map_err(|e| LaunchError::Worker(malformed(&e.to_string(), &payload)))
    }

    #[instrument(skip(self, secret_key))]
    pub async fn derive_public_key(&self, secret_key: &str) -> Result<String, LaunchError> {
        non_empty(secret_key, "secret_key")?;
        let payload = self
            .orchestrator
            .invoke(&self.wallet_worker.invocation("derive", [secret_key]))
            .await?;

        payload
            .get("public_key")
            .and_then(Value::as_str)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .ok_or_else(|| malformed("missing public_key", &payload).into())
    }

    /// Wallet balance in SOL
    #[instrument(skip(self))]
    pub async fn wallet_balance(&self, public_key: &str) -> Result<f64, LaunchError> {
        non_empty(public_key, "public_key")?;
        let payload = self
            .orchestrator
            .invoke(&self.wallet_worker.invocation("balance", [public_key]))
            .await?;

        let lamports = payload
            .get("balance")
            .and_then(Value::as_f64)
            .ok_or_else(|| malformed("missing numeric balance", &payload))?;

        Ok(lamports / LAMPORTS_PER_SOL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::MemoryLaunchStore;

    fn sh_worker(script: &str) -> WorkerCommand {
        WorkerCommand::new("sh").with_args(["-c", script, "worker"])
    }

    fn coordinator(launch_script: &str, wallet_script: &str) -> LaunchCoordinator {
        let settings = CoordinatorSettings {
            launch_worker: sh_worker(launch_script),
            wallet_worker: sh_worker(wallet_script),
            ..CoordinatorSettings::default()
        };
        LaunchCoordinator::new(Arc::new(MemoryLaunchStore::new()), settings).unwrap()
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let settings = CoordinatorSettings {
            status_pattern: "(".into(),
            ..CoordinatorSettings::default()
        };
        assert!(LaunchCoordinator::new(Arc::new(MemoryLaunchStore::new()), settings).is_err());
    }

    #[tokio::test]
    async fn test_check_balance_compares_required() {
        let coordinator = coordinator(r#"echo '{"balance": 2.5}'"#, "exit 1");

        let check = coordinator.check_balance("wallet", 2.0).await.unwrap();
        assert_eq!(check, BalanceCheck { balance: 2.5, has_enough: true });

        let check = coordinator.check_balance("wallet", 3.0).await.unwrap();
        assert!(!check.has_enough);
    }

    #[tokio::test]
    async fn test_check_balance_requires_number() {
        let coordinator = coordinator(r#"echo '{"balance": "lots"}'"#, "exit 1");
        let err = coordinator.check_balance("wallet", 1.0).await.unwrap_err();
        assert_eq!(err.kind(), "worker_output");
    }

    #[tokio::test]
    async fn test_worker_receives_subcommand_and_args() {
        // $0 is "worker"; $1 is the subcommand
        let coordinator = coordinator(
            r#"[ "$1" = balance ] && [ "$2" = W1 ] && echo '{"balance": 1}' || exit 9"#,
            "exit 1",
        );
        assert!(coordinator.check_balance("W1", 0.5).await.is_ok());
    }

    #[tokio::test]
    async fn test_wallet_operations() {
        let coordinator = coordinator(
            "exit 1",
            r#"case "$1" in
                generate) echo '{"success":true,"public_key":"PK","secret_key":"SK"}' ;;
                derive) echo '{"success":true,"public_key":"PK","secret_key":""}' ;;
                balance) echo '{"success":true,"balance":2500000000}' ;;
            esac"#,
        );

        let wallet = coordinator.generate_wallet().await.unwrap();
        assert_eq!(wallet.public_key, "PK");
        assert_eq!(wallet.secret_key, "SK");
        assert_eq!(coordinator.derive_public_key("SK").await.unwrap(), "PK");
        assert_eq!(coordinator.wallet_balance("PK").await.unwrap(), 2.5);
    }

    #[tokio::test]
    async fn test_derive_failure_is_application_error() {
        let coordinator = coordinator(
            "exit 1",
            r#"echo '{"success":false,"public_key":"","error_message":"Invalid private key length"}'"#,
        );
        let err = coordinator.derive_public_key("bad").await.unwrap_err();
        assert_eq!(err.kind(), "worker_application");
        assert_eq!(err.to_string(), "Invalid private key length");
    }

    #[tokio::test]
    async fn test_validation_happens_before_any_worker() {
        let coordinator = coordinator("exit 1", "exit 1");

        let err = coordinator.fund_dependents("m1", 0, 1.0).await.unwrap_err();
        assert!(matches!(err, LaunchError::InvalidRequest(_)));

        let err = coordinator.fund_dependents("m1", 2, 1.0).await.unwrap_err();
        assert!(matches!(err, LaunchError::NotFound(_)));
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn test_summary_hides_secrets() {
        let mut launch = LaunchAggregate::prepared("m1", "owner");
        launch.buyer_secret_key = Some("secret".into());
        let summary = serde_json::to_string(&LaunchSummary::from(&launch)).unwrap();
        assert!(!summary.contains("secret"));
        assert!(summary.contains("\"state\":\"prepared\""));
    }
}
