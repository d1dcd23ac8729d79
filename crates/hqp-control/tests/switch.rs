//! Profile-switch orchestration with a scripted store and the fake daemon.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{closed_port, FakeHqplayer, FakeStore, StoreScript};
use hqp_control::{
    ClientOptions, ControlClient, PollPolicy, SwitchOrchestrator, SwitchOutcome, SwitchPhase,
};
use hqp_proto::{ControlError, ErrorKind};

fn policy(budget_ms: u64) -> PollPolicy {
    PollPolicy {
        budget: Duration::from_millis(budget_ms),
        probe_timeout: Duration::from_millis(100),
        interval: Duration::from_millis(20),
        max_interval: Duration::from_millis(50),
    }
}

fn client(addr: &str) -> Arc<ControlClient> {
    Arc::new(ControlClient::new(
        ClientOptions::new(addr).with_timeout(Duration::from_millis(500)),
    ))
}

fn orchestrator(
    store: &Arc<FakeStore>,
    client: &Arc<ControlClient>,
    budget_ms: u64,
) -> SwitchOrchestrator {
    SwitchOrchestrator::new(store.clone(), client.clone(), policy(budget_ms))
}

#[tokio::test]
async fn test_switch_waits_until_ready() {
    let daemon = FakeHqplayer::start().await;
    let store = Arc::new(
        FakeStore::new(
            vec!["pcm", "dsd"],
            StoreScript {
                restart_window: Duration::from_millis(150),
                ..Default::default()
            },
        )
        .attached_to(&daemon),
    );
    let client = client(&daemon.addr);
    let orch = orchestrator(&store, &client, 3000);

    let result = orch.switch("dsd", true, None).await.unwrap();

    assert_eq!(result.outcome, SwitchOutcome::Ready);
    assert!(result.activation_accepted);
    assert!(result.restarted);
    assert!(result.ready_observed);
    assert_eq!(result.error, None);
    assert_eq!(result.requested_profile.id, "dsd");
    assert!(result.elapsed_ms >= 150);
    assert_eq!(store.restart_calls.load(Ordering::SeqCst), 1);

    // Ready from the orchestrator agrees with an ordinary client call.
    client.get_status().await.unwrap();
    assert_eq!(orch.phase(), SwitchPhase::Idle);
}

#[tokio::test]
async fn test_unknown_profile_has_no_side_effects() {
    let daemon = FakeHqplayer::start().await;
    let store = Arc::new(FakeStore::new(vec!["pcm"], StoreScript::default()).attached_to(&daemon));
    let orch = orchestrator(&store, &client(&daemon.addr), 1000);

    let err = orch.switch("nope", true, None).await.unwrap_err();

    assert!(matches!(err, ControlError::ProfileNotFound(ref id) if id == "nope"));
    assert_eq!(store.activate_calls(), 0);
    assert_eq!(store.restart_calls.load(Ordering::SeqCst), 0);
    assert_eq!(orch.phase(), SwitchPhase::Idle);
}

#[tokio::test]
async fn test_invalid_profile_id_is_rejected() {
    let daemon = FakeHqplayer::start().await;
    let store = Arc::new(FakeStore::new(vec!["pcm"], StoreScript::default()));
    let orch = orchestrator(&store, &client(&daemon.addr), 1000);

    let err = orch.switch("../pcm", true, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(store.activate_calls(), 0);
}

#[tokio::test]
async fn test_concurrent_switch_fails_fast() {
    let daemon = FakeHqplayer::start().await;
    let store = Arc::new(
        FakeStore::new(
            vec!["pcm", "dsd"],
            StoreScript {
                activate_delay: Duration::from_millis(300),
                ..Default::default()
            },
        )
        .attached_to(&daemon),
    );
    let orch = Arc::new(orchestrator(&store, &client(&daemon.addr), 3000));

    let first = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.switch("pcm", true, None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(orch.phase(), SwitchPhase::Activating);

    let started = Instant::now();
    let err = orch.switch("dsd", true, None).await.unwrap_err();
    assert!(matches!(err, ControlError::SwitchInProgress(_)));
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(store.activate_calls(), 1);

    let result = first.await.unwrap().unwrap();
    assert_eq!(result.outcome, SwitchOutcome::Ready);
    assert_eq!(store.activate_calls(), 1);

    // Lease released: a new switch is accepted.
    orch.switch("dsd", false, None).await.unwrap();
    assert_eq!(store.activate_calls(), 2);
}

#[tokio::test]
async fn test_fire_and_forget_returns_without_polling() {
    // Nothing listens: any polling would burn the whole budget.
    let addr = closed_port().await;
    let store = Arc::new(FakeStore::new(vec!["pcm"], StoreScript::default()));
    let orch = orchestrator(&store, &client(&addr), 5000);

    let started = Instant::now();
    let result = orch.switch("pcm", false, None).await.unwrap();

    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(result.outcome, SwitchOutcome::Started);
    assert!(result.restarted);
    assert!(!result.ready_observed);
    assert!(result.is_success());
    assert_eq!(orch.phase(), SwitchPhase::Idle);
}

#[tokio::test]
async fn test_budget_expiry_is_timed_out_not_failed() {
    let addr = closed_port().await;
    let store = Arc::new(FakeStore::new(vec!["pcm"], StoreScript::default()));
    let orch = orchestrator(&store, &client(&addr), 30_000);

    let started = Instant::now();
    let result = orch
        .switch("pcm", true, Some(Duration::from_millis(300)))
        .await
        .unwrap();

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_millis(1500));
    assert_eq!(result.outcome, SwitchOutcome::TimedOut);
    assert!(result.activation_accepted);
    assert!(result.restarted);
    assert!(!result.ready_observed);
    assert_eq!(result.error, None);
}

#[tokio::test]
async fn test_activation_failure_skips_restart() {
    let daemon = FakeHqplayer::start().await;
    let store = Arc::new(FakeStore::new(
        vec!["pcm"],
        StoreScript {
            fail_activate: true,
            ..Default::default()
        },
    ));
    let orch = orchestrator(&store, &client(&daemon.addr), 1000);

    let result = orch.switch("pcm", true, None).await.unwrap();

    assert_eq!(result.outcome, SwitchOutcome::Failed);
    assert_eq!(result.error, Some(ErrorKind::ActivationFailed));
    assert!(!result.activation_accepted);
    assert!(!result.restarted);
    assert!(!result.ready_observed);
    assert_eq!(store.restart_calls.load(Ordering::SeqCst), 0);
    assert!(daemon.requests().is_empty());
}

#[tokio::test]
async fn test_restart_failure() {
    let daemon = FakeHqplayer::start().await;
    let store = Arc::new(FakeStore::new(
        vec!["pcm"],
        StoreScript {
            fail_restart: true,
            ..Default::default()
        },
    ));
    let orch = orchestrator(&store, &client(&daemon.addr), 1000);

    let result = orch.switch("pcm", true, None).await.unwrap();

    assert_eq!(result.outcome, SwitchOutcome::Failed);
    assert_eq!(result.error, Some(ErrorKind::RestartFailed));
    assert!(result.activation_accepted);
    assert!(!result.restarted);
    assert!(result.error_message.unwrap().contains("unit not found"));
}

#[tokio::test]
async fn test_cancelled_caller_does_not_interrupt_activation() {
    let daemon = FakeHqplayer::start().await;
    let store = Arc::new(
        FakeStore::new(
            vec!["pcm"],
            StoreScript {
                activate_delay: Duration::from_millis(200),
                ..Default::default()
            },
        )
        .attached_to(&daemon),
    );
    let orch = orchestrator(&store, &client(&daemon.addr), 3000);

    // Give up long before the activation completes.
    let abandoned =
        tokio::time::timeout(Duration::from_millis(50), orch.switch("pcm", true, None)).await;
    assert!(abandoned.is_err());
    assert_eq!(orch.phase(), SwitchPhase::Activating);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(store.activations_completed.load(Ordering::SeqCst), 1);
    assert_eq!(store.restart_calls.load(Ordering::SeqCst), 1);
    assert_eq!(orch.phase(), SwitchPhase::Idle);
}

#[tokio::test]
async fn test_cancelled_poll_releases_lease() {
    let addr = closed_port().await;
    let store = Arc::new(FakeStore::new(vec!["pcm"], StoreScript::default()));
    let orch = orchestrator(&store, &client(&addr), 10_000);

    let abandoned =
        tokio::time::timeout(Duration::from_millis(200), orch.switch("pcm", true, None)).await;
    assert!(abandoned.is_err());
    assert_eq!(store.restart_calls.load(Ordering::SeqCst), 1);
    assert_eq!(orch.phase(), SwitchPhase::Idle);
}

#[tokio::test]
async fn test_slow_activation_still_probes_once() {
    let daemon = FakeHqplayer::start().await;
    let store = Arc::new(
        FakeStore::new(
            vec!["pcm"],
            StoreScript {
                activate_delay: Duration::from_millis(300),
                ..Default::default()
            },
        )
        .attached_to(&daemon),
    );
    let orch = orchestrator(&store, &client(&daemon.addr), 30_000);

    let result = orch
        .switch("pcm", true, Some(Duration::from_millis(100)))
        .await
        .unwrap();

    assert_eq!(result.outcome, SwitchOutcome::Ready);
    assert!(result.ready_observed);
    assert_eq!(daemon.requests(), vec!["Status"]);
}
