//! Request-facing adapter.
//!
//! Turns JSON requests into key pool and coordinator calls and every outcome
//! into a JSON response: `{"success": true, ...}` on success, or
//! `{"success": false, "kind": ..., "message": ...}` with the worker's
//! status text under `worker_stderr` when a worker failed.
//!
//! A funding call answers before its worker exits. The adapter keeps the
//! background completion of every such call so `drain` can wait for the
//! dependent wallets to be stored before the process goes away.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::adapters::CompletionHandle;
use crate::core::{CreateRequest, KeyPool, LaunchCoordinator, LaunchError, PoolError};

/// One request, tagged by `action`
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    CheckoutKey,
    ConfirmKey {
        public_key: String,
    },
    ReleaseKey {
        public_key: String,
    },
    PoolStats,
    CheckBalance {
        wallet: String,
        required_amount: f64,
    },
    FundDependents {
        mint_id: String,
        count: u32,
        total_amount: f64,
    },
    CreateAndBundle(CreateRequest),
    ListDependents {
        mint_id: String,
    },
    GenerateWallet,
    DerivePublicKey {
        secret_key: String,
    },
    WalletBalance {
        public_key: String,
    },
    LaunchesForOwner {
        owner_key: String,
    },
}

impl Request {
    pub fn action(&self) -> &'static str {
        match self {
            Self::CheckoutKey => "checkout_key",
            Self::ConfirmKey { .. } => "confirm_key",
            Self::ReleaseKey { .. } => "release_key",
            Self::PoolStats => "pool_stats",
            Self::CheckBalance { .. } => "check_balance",
            Self::FundDependents { .. } => "fund_dependents",
            Self::CreateAndBundle(_) => "create_and_bundle",
            Self::ListDependents { .. } => "list_dependents",
            Self::GenerateWallet => "generate_wallet",
            Self::DerivePublicKey { .. } => "derive_public_key",
            Self::WalletBalance { .. } => "wallet_balance",
            Self::LaunchesForOwner { .. } => "launches_for_owner",
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Launch(#[from] LaunchError),
}

impl ApiError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::Pool(PoolError::Exhausted) => "pool_exhausted",
            Self::Pool(PoolError::StateConflict { .. }) => "pool_state_conflict",
            Self::Pool(PoolError::Closed) => "pool_closed",
            Self::Launch(e) => e.kind(),
        }
    }

    /// Failure response body
    pub fn to_response(&self) -> Value {
        let mut body = json!({
            "success": false,
            "kind": self.kind(),
            "message": self.to_string(),
        });
        if let Self::Launch(e) = self {
            if let Some(stderr) = e.diagnostics() {
                body["worker_stderr"] = Value::String(stderr.to_string());
            }
        }
        body
    }
}

/// Success response: `fields` plus `success: true`
fn success(fields: Value) -> Value {
    let mut body = Map::new();
    body.insert("success".to_string(), Value::Bool(true));
    if let Value::Object(fields) = fields {
        body.extend(fields);
    }
    Value::Object(body)
}

/// Dispatches requests to the key pool and the coordinator
#[derive(Clone)]
pub struct Api {
    pool: Arc<KeyPool>,
    coordinator: LaunchCoordinator,

    /// Funding workers still running after their caller was answered
    completions: Arc<Mutex<JoinSet<()>>>,
}

impl Api {
    pub fn new(pool: Arc<KeyPool>, coordinator: LaunchCoordinator) -> Self {
        Self {
            pool,
            coordinator,
            completions: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    fn completions(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.completions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hold on to a funding call's completion until `drain`
    fn track(&self, mint_id: String, completion: CompletionHandle) {
        let mut completions = self.completions();
        while completions.try_join_next().is_some() {}

        completions.spawn(async move {
            match completion.wait().await {
                Ok(report) => info!(
                    %mint_id,
                    persisted = report.persisted,
                    "Funding worker finished"
                ),
                Err(e) => error!(%mint_id, error = %e, "Funding supervisor failed"),
            }
        });
    }

    /// Wait until every funding worker started through this adapter has
    /// exited and its batch write is done. Returns how many were awaited.
    pub async fn drain(&self) -> usize {
        let mut drained = 0;
        loop {
            let mut outstanding = std::mem::replace(&mut *self.completions(), JoinSet::new());
            if outstanding.is_empty() {
                return drained;
            }

            info!(count = outstanding.len(), "Waiting for funding workers to finish");
            while outstanding.join_next().await.is_some() {
                drained += 1;
            }
        }
    }

    /// Handle one raw request line; bytes that are not UTF-8 are an
    /// invalid request like any other malformed line
    pub async fn handle_bytes(&self, line: &[u8]) -> Value {
        match std::str::from_utf8(line) {
            Ok(line) => self.handle_line(line).await,
            Err(e) => ApiError::InvalidRequest(format!("request is not UTF-8: {}", e)).to_response(),
        }
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.pool
    }

    pub fn coordinator(&self) -> &LaunchCoordinator {
        &self.coordinator
    }

    /// Parse and handle one JSON line; the response echoes `id`
    pub async fn handle_line(&self, line: &str) -> Value {
        match serde_json::from_str::<Value>(line) {
            Ok(raw) => self.handle_value(raw).await,
            Err(e) => ApiError::InvalidRequest(format!("malformed JSON: {}", e)).to_response(),
        }
    }

    /// Handle one request document; the response echoes `id`
    pub async fn handle_value(&self, mut raw: Value) -> Value {
        let id = raw.as_object_mut().and_then(|obj| obj.remove("id"));

        let mut response = match serde_json::from_value::<Request>(raw) {
            Ok(request) => self.handle(request).await,
            Err(e) => ApiError::InvalidRequest(e.to_string()).to_response(),
        };

        if let Some(id) = id {
            response["id"] = id;
        }
        response
    }

    /// Handle one request, shaping the outcome into a response
    pub async fn handle(&self, request: Request) -> Value {
        let action = request.action();
        match self.dispatch(request).await {
            Ok(body) => {
                debug!(action, "Request succeeded");
                success(body)
            }
            Err(e) => {
                warn!(action, kind = e.kind(), error = %e, "Request failed");
                e.to_response()
            }
        }
    }

    /// Run one request
    pub async fn dispatch(&self, request: Request) -> Result<Value, ApiError> {
        match request {
            Request::CheckoutKey => {
                let record = self.pool.checkout()?;
                Ok(json!({
                    "public_key": record.public_key,
                    "secret_key": record.secret_key,
                }))
            }
            Request::ConfirmKey { public_key } => {
                self.pool.confirm(&public_key)?;
                Ok(json!({"message": "Vanity key confirmed and removed from pool"}))
            }
            Request::ReleaseKey { public_key } => {
                self.pool.release(&public_key)?;
                Ok(json!({"message": "Vanity key returned to pool"}))
            }
            Request::PoolStats => Ok(json!({"stats": self.pool.stats()})),
            Request::CheckBalance {
                wallet,
                required_amount,
            } => {
                let check = self
                    .coordinator
                    .check_balance(&wallet, required_amount)
                    .await?;
                Ok(json!({"balance": check.balance, "has_enough": check.has_enough}))
            }
            Request::FundDependents {
                mint_id,
                count,
                total_amount,
            } => {
                let receipt = self
                    .coordinator
                    .fund_dependents(&mint_id, count, total_amount)
                    .await?;
                self.track(mint_id, receipt.completion);
                Ok(json!({
                    "signature": receipt.signature,
                    "explorer_url": receipt.explorer_url,
                }))
            }
            Request::CreateAndBundle(create) => {
                let report = self.coordinator.create_and_bundle(create).await?;
                Ok(json!({
                    "mint_id": report.mint_id,
                    "signature": report.signature,
                    "explorer_url": report.explorer_url,
                    "state": report.state.name(),
                    "bundle": report.bundle,
                }))
            }
            Request::ListDependents { mint_id } => {
                let dependents = self.coordinator.dependents_for(&mint_id).await?;
                let keys: Vec<&str> = dependents.iter().map(|w| w.public_key.as_str()).collect();
                Ok(json!({"mint_id": mint_id, "count": keys.len(), "dependents": keys}))
            }
            Request::GenerateWallet => {
                let wallet = self.coordinator.generate_wallet().await?;
                Ok(json!({
                    "public_key": wallet.public_key,
                    "secret_key": wallet.secret_key,
                }))
            }
            Request::DerivePublicKey { secret_key } => {
                let public_key = self.coordinator.derive_public_key(&secret_key).await?;
                Ok(json!({"public_key": public_key}))
            }
            Request::WalletBalance { public_key } => {
                let balance = self.coordinator.wallet_balance(&public_key).await?;
                Ok(json!({"public_key": public_key, "balance": balance}))
            }
            Request::LaunchesForOwner { owner_key } => {
                let launches = self.coordinator.launches_for_owner(&owner_key).await?;
                Ok(json!({"launches": launches}))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CoordinatorSettings, LaunchStore, MemoryLaunchStore, StaticKeys};
    use crate::domain::{LaunchAggregate, WorkerCommand};

    fn api(keys: &[&str]) -> Api {
        let pool = KeyPool::from_source(&StaticKeys::named(keys.iter().copied())).unwrap();
        let coordinator = LaunchCoordinator::new(
            Arc::new(MemoryLaunchStore::new()),
            CoordinatorSettings::default(),
        )
        .unwrap();
        Api::new(Arc::new(pool), coordinator)
    }

    #[test]
    fn test_request_parsing() {
        let request: Request =
            serde_json::from_str(r#"{"action":"confirm_key","public_key":"A"}"#).unwrap();
        assert!(matches!(request, Request::ConfirmKey { ref public_key } if public_key == "A"));

        let request: Request = serde_json::from_str(
            r#"{"action":"create_and_bundle","mint_id":"m1","deployer_secret_key":"d",
                "token_mint_secret_key":"t","dev_buy_amount":1}"#,
        )
        .unwrap();
        assert_eq!(request.action(), "create_and_bundle");

        assert!(serde_json::from_str::<Request>(r#"{"action":"launch_rockets"}"#).is_err());
    }

    #[tokio::test]
    async fn test_checkout_and_confirm_shapes() {
        let api = api(&["A"]);

        let response = api.handle_line(r#"{"id":7,"action":"checkout_key"}"#).await;
        assert_eq!(response["success"], true);
        assert_eq!(response["public_key"], "A");
        assert_eq!(response["secret_key"], "A-secret");
        assert_eq!(response["id"], 7);

        let response = api.handle_line(r#"{"action":"checkout_key"}"#).await;
        assert_eq!(response["success"], false);
        assert_eq!(response["kind"], "pool_exhausted");
        assert_eq!(response["message"], "No available vanity mint keys");
        assert!(response.get("id").is_none());

        let response = api
            .handle_line(r#"{"action":"confirm_key","public_key":"A"}"#)
            .await;
        assert_eq!(response["success"], true);

        let response = api
            .handle_line(r#"{"action":"confirm_key","public_key":"A"}"#)
            .await;
        assert_eq!(response["kind"], "pool_state_conflict");
    }

    #[tokio::test]
    async fn test_pool_stats_shape() {
        let api = api(&["A", "B"]);
        let response = api.handle(Request::PoolStats).await;
        assert_eq!(
            response,
            json!({"success": true, "stats": {"total": 2, "available": 2, "pending": 0, "used": 0}})
        );
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let api = api(&[]);

        let response = api.handle_line("not json").await;
        assert_eq!(response["kind"], "invalid_request");

        let response = api.handle_line(r#"{"id":"x","action":"confirm_key"}"#).await;
        assert_eq!(response["kind"], "invalid_request");
        assert_eq!(response["id"], "x");
    }

    #[tokio::test]
    async fn test_non_utf8_line_is_invalid_request() {
        let api = api(&[]);

        let response = api.handle_bytes(b"\xff\xfe").await;
        assert_eq!(response["success"], false);
        assert_eq!(response["kind"], "invalid_request");

        let response = api.handle_bytes(br#"{"id":2,"action":"pool_stats"}"#).await;
        assert_eq!(response["success"], true);
        assert_eq!(response["id"], 2);
    }

    #[tokio::test]
    async fn test_drain_waits_for_funding_batch() {
        let mut launch = LaunchAggregate::prepared("m1", "owner");
        launch.buyer_secret_key = Some("buyer".into());
        let store = Arc::new(MemoryLaunchStore::with_launches([launch]));
        let script = concat!(
            "echo 'Buyer → Mixer (wrapped) transaction sent: SIG1' >&2; sleep 1; ",
            r#"echo '{"sniper_wallets":[{"public_key":"s1","secret_key":"k1"}],"total_funded":0.2}'"#,
        );
        let settings = CoordinatorSettings {
            launch_worker: WorkerCommand::new("sh").with_args(["-c", script, "worker"]),
            ..CoordinatorSettings::default()
        };
        let coordinator = LaunchCoordinator::new(Arc::clone(&store) as Arc<dyn LaunchStore>, settings).unwrap();
        let api = Api::new(Arc::new(KeyPool::new()), coordinator);

        let response = api
            .handle_line(r#"{"action":"fund_dependents","mint_id":"m1","count":1,"total_amount":0.2}"#)
            .await;
        assert_eq!(response["success"], true);
        assert_eq!(response["signature"], "SIG1");
        assert!(store.find("m1").await.unwrap().unwrap().dependent_wallets.is_empty());

        assert_eq!(api.drain().await, 1);
        let stored = store.find("m1").await.unwrap().unwrap();
        assert_eq!(stored.dependent_wallets.len(), 1);
        assert_eq!(api.drain().await, 0);
    }

    #[tokio::test]
    async fn test_closed_pool_kind() {
        let api = api(&["A"]);
        api.pool().shutdown();
        let response = api.handle(Request::CheckoutKey).await;
        assert_eq!(response["kind"], "pool_closed");
    }

    #[tokio::test]
    async fn test_unknown_launch_is_not_found() {
        let api = api(&[]);
        let response = api
            .handle_line(r#"{"action":"list_dependents","mint_id":"missing"}"#)
            .await;
        assert_eq!(response["success"], false);
        assert_eq!(response["kind"], "not_found");
    }
}
