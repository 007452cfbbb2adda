//! Streaming Early-Resolve Integration Tests
//!
//! The caller is answered from the status stream while the worker keeps
//! running; the batch result is written once, after exit.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use launchkit::adapters::{BatchSink, ProcessOrchestrator, StatusMatcher, WorkerError};
use launchkit::api::Api;
use launchkit::core::{
    CoordinatorSettings, JsonLaunchStore, KeyPool, LaunchCoordinator, LaunchError, LaunchStore,
    MemoryLaunchStore, DEFAULT_STATUS_PATTERN,
};
use launchkit::domain::{DependentBatch, LaunchAggregate, LaunchState, WorkerCommand, WorkerInvocation};
use tempfile::TempDir;

const SIGNAL: &str = "echo 'Buyer → Mixer (wrapped) transaction sent: SIG123' >&2";
const BATCH: &str = r#"echo '{"success":true,"dependents":[{"public_key":"s1","secret_key":"k1"},{"public_key":"s2","secret_key":"k2"}],"total_funded":0.4}'"#;

#[derive(Clone, Default)]
struct RecordingSink {
    batches: Arc<Mutex<Vec<DependentBatch>>>,
}

impl RecordingSink {
    fn count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }
}

#[async_trait]
impl BatchSink<DependentBatch> for RecordingSink {
    async fn persist(&self, batch: DependentBatch) -> Result<()> {
        self.batches.lock().unwrap().push(batch);
        Ok(())
    }
}

fn sh(script: &str) -> WorkerInvocation {
    WorkerInvocation::new("sh").args(["-c", script])
}

fn matcher() -> StatusMatcher {
    StatusMatcher::new(DEFAULT_STATUS_PATTERN).unwrap()
}

#[tokio::test]
async fn test_resolves_before_exit_and_persists_once_after() {
    let sink = RecordingSink::default();
    let script = format!("echo starting >&2; {}; sleep 1; {}", SIGNAL, BATCH);

    let resolution = ProcessOrchestrator::new()
        .invoke_streaming(sh(&script), matcher(), sink.clone())
        .await
        .unwrap();

    assert_eq!(resolution.identifier, "SIG123");
    assert!(!resolution.completion.is_finished());
    assert_eq!(sink.count(), 0);

    let report = resolution.completion.wait().await.unwrap();
    assert!(report.responded);
    assert!(report.persisted);
    assert!(report.diagnostics.contains("starting"));

    let batches = sink.batches.lock().unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].dependents.len(), 2);
    assert_eq!(batches[0].total_funded, 0.4);
}

#[tokio::test]
async fn test_failure_before_signal_reaches_caller_without_write() {
    let sink = RecordingSink::default();

    let err = ProcessOrchestrator::new()
        .invoke_streaming(sh("echo 'rpc unavailable' >&2; exit 5"), matcher(), sink.clone())
        .await
        .unwrap_err();

    match err {
        WorkerError::NonZeroExit { code, diagnostics } => {
            assert_eq!(code, 5);
            assert_eq!(diagnostics, "rpc unavailable");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(sink.count(), 0);
}

#[tokio::test]
async fn test_failure_after_signal_is_not_reported_to_caller() {
    let sink = RecordingSink::default();
    let script = format!("{}; echo 'bundle leg failed' >&2; exit 3", SIGNAL);

    let resolution = ProcessOrchestrator::new()
        .invoke_streaming(sh(&script), matcher(), sink.clone())
        .await
        .unwrap();
    assert_eq!(resolution.identifier, "SIG123");

    let report = resolution.completion.wait().await.unwrap();
    assert!(!report.persisted);
    assert_eq!(sink.count(), 0);
}

#[tokio::test]
async fn test_clean_exit_without_signal_does_not_hang() {
    let sink = RecordingSink::default();

    let err = ProcessOrchestrator::new()
        .invoke_streaming(sh(BATCH), matcher(), sink.clone())
        .await
        .unwrap_err();

    assert!(matches!(err, WorkerError::MissingSignal { .. }));
    // The batch was still there and is still stored
    assert_eq!(sink.count(), 1);
}

#[tokio::test]
async fn test_repeated_signal_answers_once() {
    let sink = RecordingSink::default();
    let script = format!(
        "{}; echo 'Buyer → Mixer (wrapped) transaction sent: SIG999' >&2; {}",
        SIGNAL, BATCH
    );

    let resolution = ProcessOrchestrator::new()
        .invoke_streaming(sh(&script), matcher(), sink.clone())
        .await
        .unwrap();
    assert_eq!(resolution.identifier, "SIG123");

    resolution.completion.wait().await.unwrap();
    assert_eq!(sink.count(), 1);
}

#[tokio::test]
async fn test_spawn_failure_is_reported() {
    let err = ProcessOrchestrator::new()
        .invoke_streaming(
            WorkerInvocation::new("/nonexistent/launchkit-funder"),
            matcher(),
            RecordingSink::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, WorkerError::Spawn { .. }));
}

fn funding_coordinator(script: &str, store: Arc<dyn LaunchStore>) -> LaunchCoordinator {
    let settings = CoordinatorSettings {
        launch_worker: WorkerCommand::new("sh").with_args(["-c", script, "worker"]),
        ..CoordinatorSettings::default()
    };
    LaunchCoordinator::new(store, settings).unwrap()
}

fn funded_launch() -> LaunchAggregate {
    let mut launch = LaunchAggregate::prepared("mint-1", "owner-1");
    launch.buyer_secret_key = Some("buyer-secret".into());
    launch
}

#[tokio::test]
async fn test_fund_dependents_stores_batch_on_launch() {
    let store = Arc::new(MemoryLaunchStore::with_launches([funded_launch()]));
    let script = format!(
        r#"[ "$1" = fund-snipers ] && [ "$2" = 2 ] && [ "$4" = buyer-secret ] || exit 64; {}; sleep 1; {}"#,
        SIGNAL, BATCH
    );
    let coordinator = funding_coordinator(&script, Arc::clone(&store) as Arc<dyn LaunchStore>);

    let receipt = coordinator.fund_dependents("mint-1", 2, 0.4).await.unwrap();
    assert_eq!(receipt.signature, "SIG123");
    assert_eq!(receipt.explorer_url, "https://solscan.io/tx/SIG123");

    let before = store.find("mint-1").await.unwrap().unwrap();
    assert!(before.dependent_wallets.is_empty());

    receipt.completion.wait().await.unwrap();

    let after = store.find("mint-1").await.unwrap().unwrap();
    assert_eq!(after.dependent_wallets.len(), 2);
    assert_eq!(after.total_funded, 0.4);
    assert_eq!(after.state, LaunchState::Prepared);
}

#[tokio::test]
async fn test_fund_dependents_failure_marks_launch_failed() {
    let store = Arc::new(MemoryLaunchStore::with_launches([funded_launch()]));
    let coordinator =
        funding_coordinator("echo 'insufficient buyer balance' >&2; exit 5", Arc::clone(&store) as Arc<dyn LaunchStore>);

    let err = coordinator.fund_dependents("mint-1", 2, 0.4).await.unwrap_err();
    assert_eq!(err.kind(), "worker_exit");
    assert_eq!(err.diagnostics(), Some("insufficient buyer balance"));

    let launch = store.find("mint-1").await.unwrap().unwrap();
    assert!(launch.dependent_wallets.is_empty());
    assert_eq!(
        launch.state,
        LaunchState::Failed {
            diagnostic: "insufficient buyer balance".into()
        }
    );
}

#[tokio::test]
async fn test_fund_dependents_requires_buyer_key() {
    let store = Arc::new(MemoryLaunchStore::with_launches([LaunchAggregate::prepared(
        "mint-1", "owner-1",
    )]));
    let coordinator = funding_coordinator("exit 0", store);

    let err = coordinator.fund_dependents("mint-1", 2, 0.4).await.unwrap_err();
    assert!(matches!(err, LaunchError::MissingField { .. }));
}

/// One request answered, then the runtime torn down, the way a one-shot
/// command line call ends. The funding batch must already be on disk.
#[test]
fn test_batch_is_stored_before_runtime_shutdown() {
    let temp = TempDir::new().unwrap();
    let store = JsonLaunchStore::new(temp.path().join("launches.json"));
    let finished = temp.path().join("worker_finished");
    let script = format!(
        "{}; sleep 1; {}; touch '{}'",
        SIGNAL,
        BATCH,
        finished.display()
    );

    let runtime = tokio::runtime::Runtime::new().unwrap();
    let response = runtime.block_on(async {
        store.insert(funded_launch()).await.unwrap();
        let api = Api::new(
            Arc::new(KeyPool::new()),
            funding_coordinator(&script, Arc::new(store.clone())),
        );

        let response = api
            .handle_line(r#"{"action":"fund_dependents","mint_id":"mint-1","count":2,"total_amount":0.4}"#)
            .await;
        api.drain().await;
        response
    });
    drop(runtime);

    assert_eq!(response["success"], true);
    assert_eq!(response["signature"], "SIG123");
    assert!(finished.exists());

    let runtime = tokio::runtime::Runtime::new().unwrap();
    let stored = runtime
        .block_on(store.find("mint-1"))
        .unwrap()
        .unwrap();
    assert_eq!(stored.dependent_wallets.len(), 2);
    assert_eq!(stored.total_funded, 0.4);
}
