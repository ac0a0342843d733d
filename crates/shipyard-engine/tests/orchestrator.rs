#![allow(unused_results)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;

use shipyard_core::errors::SandboxError;
use shipyard_core::events::DeploymentEvent;
use shipyard_core::files::{FileRecord, ProjectFiles};
use shipyard_core::ids::InstanceId;
use shipyard_core::sandbox::{CreateInstanceResponse, InstanceStatus};
use shipyard_core::{DeploymentOutcome, DeploymentRequest};
use shipyard_engine::{BroadcastObserver, DeploymentOrchestrator, OrchestratorConfig, OrchestratorDeps};
use shipyard_sandbox::{MockCall, MockFactory, MockReply, MockSandbox};
use shipyard_store::{Database, DeploymentHistoryRepo, DeploymentStatus};

struct Harness {
    orchestrator: DeploymentOrchestrator,
    sandbox: MockSandbox,
    factory: MockFactory,
    events: broadcast::Receiver<DeploymentEvent>,
}

fn project_files() -> Arc<ProjectFiles> {
    let files = Arc::new(ProjectFiles::new(vec![
        FileRecord::new("index.html", "<div id=root></div>"),
        FileRecord::new("package.json", "{}"),
        FileRecord::new("api-worker/index.ts", "export default {}"),
    ]));
    files.record_generated([FileRecord::new("src/App.tsx", "export const App = () => null")]);
    files
}

fn harness_with(configure: impl FnOnce(OrchestratorDeps) -> OrchestratorDeps) -> Harness {
    let sandbox = MockSandbox::new();
    let factory = MockFactory::new(sandbox.clone());
    let observer = Arc::new(BroadcastObserver::new(256));
    let events = observer.subscribe();

    let deps = OrchestratorDeps::new(Arc::new(factory.clone()), project_files()).with_observer(observer);
    let orchestrator = DeploymentOrchestrator::new(configure(deps), OrchestratorConfig::default());
    Harness {
        orchestrator,
        sandbox,
        factory,
        events,
    }
}

fn harness() -> Harness {
    harness_with(|deps| deps)
}

fn drain(rx: &mut broadcast::Receiver<DeploymentEvent>) -> Vec<DeploymentEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn network_error() -> MockReply<CreateInstanceResponse> {
    MockReply::Err(SandboxError::Network("connection refused".into()))
}

fn unhealthy() -> MockReply<InstanceStatus> {
    MockReply::Ok(InstanceStatus {
        success: true,
        is_healthy: false,
        ..Default::default()
    })
}

fn outcome_for(run_id: &str) -> Option<DeploymentOutcome> {
    Some(DeploymentOutcome {
        instance_id: InstanceId::from_raw(run_id),
        preview_url: Some(format!("https://{run_id}.preview.local")),
        tunnel_url: None,
    })
}

fn retry_delays(events: &[DeploymentEvent]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|e| match e {
            DeploymentEvent::AttemptFailed { retry_in_ms, .. } => Some(*retry_in_ms),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn concurrent_callers_share_one_deployment() {
    let h = harness();
    h.sandbox.push_create(MockReply::delayed(
        Duration::from_secs(5),
        MockReply::Ok(CreateInstanceResponse {
            success: true,
            run_id: Some("run-slow".into()),
            preview_url: Some("https://run-slow.preview.local".into()),
            ..Default::default()
        }),
    ));

    let callers: Vec<_> = (0..5)
        .map(|_| {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move { orchestrator.deploy(DeploymentRequest::all_files()).await })
        })
        .collect();
    let outcomes: Vec<_> = futures::future::join_all(callers)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert!(outcomes.iter().all(|o| *o == outcome_for("run-slow")));
    assert_eq!(h.sandbox.create_count(), 1);
    assert_eq!(h.sandbox.write_calls().len(), 1);

    let metrics = h.orchestrator.metrics().snapshot();
    assert_eq!(metrics.deployments_started, 1);
    assert_eq!(metrics.coalesced_callers, 4);
    assert!(!h.orchestrator.is_deploying());
}

#[tokio::test(start_paused = true)]
async fn backoff_doubles_then_caps() {
    let mut h = harness();
    for _ in 0..7 {
        h.sandbox.push_create(network_error());
    }

    let started = Instant::now();
    let outcome = h.orchestrator.deploy(DeploymentRequest::all_files()).await;

    assert_eq!(outcome, outcome_for("run-8"));
    assert_eq!(
        retry_delays(&drain(&mut h.events)),
        vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]
    );
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(91) && elapsed < Duration::from_secs(92));
}

#[tokio::test(start_paused = true)]
async fn third_consecutive_failure_rotates_session() {
    let mut h = harness();
    for _ in 0..3 {
        h.sandbox.push_create(network_error());
    }
    let before = h.orchestrator.session_id();

    let outcome = h.orchestrator.deploy(DeploymentRequest::all_files()).await;
    assert_eq!(outcome, outcome_for("run-4"));

    let after = h.orchestrator.session_id();
    assert_ne!(before, after);

    let failures: Vec<_> = drain(&mut h.events)
        .into_iter()
        .filter_map(|e| match e {
            DeploymentEvent::AttemptFailed {
                session_id,
                session_rotated,
                ..
            } => Some((session_id, session_rotated)),
            _ => None,
        })
        .collect();
    assert_eq!(
        failures,
        vec![
            (before.clone(), false),
            (before.clone(), false),
            (before.clone(), true)
        ]
    );

    // One client per session; the fourth attempt used a new one.
    assert_eq!(h.factory.sessions(), vec![before, after.clone()]);
    let last_create = h.sandbox.calls().into_iter().rev().find_map(|c| match c {
        MockCall::Create { session_id, .. } => Some(session_id),
        _ => None,
    });
    assert_eq!(last_create, Some(after));
    assert_eq!(h.orchestrator.metrics().snapshot().session_rotations, 1);
}

#[tokio::test(start_paused = true)]
async fn fatal_signature_rotates_immediately() {
    let mut h = harness();
    h.sandbox
        .push_write(MockReply::Err(SandboxError::Remote("Network connection lost.".into())));
    let before = h.orchestrator.session_id();

    let outcome = h.orchestrator.deploy(DeploymentRequest::all_files()).await;
    assert_eq!(outcome, outcome_for("run-2"));
    assert_ne!(h.orchestrator.session_id(), before);

    let rotated = drain(&mut h.events).into_iter().any(|e| {
        matches!(
            e,
            DeploymentEvent::AttemptFailed {
                attempt: 1,
                session_rotated: true,
                ..
            }
        )
    });
    assert!(rotated);
    assert_eq!(h.factory.sessions().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn fresh_instance_receives_full_file_set() {
    let h = harness();
    let everything = vec![
        "index.html".to_string(),
        "package.json".to_string(),
        "src/App.tsx".to_string(),
    ];

    h.orchestrator.deploy(DeploymentRequest::all_files()).await.unwrap();
    assert_eq!(h.sandbox.write_calls(), vec![everything.clone()]);

    // Healthy instance: only the requested delta.
    let delta = DeploymentRequest::new(vec![FileRecord::new("src/App.tsx", "v2")]);
    let outcome = h.orchestrator.deploy(delta.clone()).await;
    assert_eq!(outcome, outcome_for("run-1"));
    assert_eq!(h.sandbox.write_calls()[1], vec!["src/App.tsx".to_string()]);

    // Unhealthy instance: reprovisioned, so the delta widens to everything.
    h.sandbox.push_status(unhealthy());
    let outcome = h.orchestrator.deploy(delta).await;
    assert_eq!(outcome, outcome_for("run-2"));
    assert_eq!(h.sandbox.write_calls()[2], everything);
}

#[tokio::test(start_paused = true)]
async fn read_only_backend_files_are_never_written() {
    let h = harness();
    h.orchestrator.deploy(DeploymentRequest::all_files()).await.unwrap();

    let request = DeploymentRequest::new(vec![
        FileRecord::new("api-worker/index.ts", "export default { fetch() {} }"),
        FileRecord::new("src/App.tsx", "v2"),
    ]);
    h.orchestrator.deploy(request).await.unwrap();

    // Only the backend file requested: nothing to write, still a success.
    let only_backend = DeploymentRequest::new(vec![FileRecord::new("api-worker/index.ts", "x")]);
    assert_eq!(h.orchestrator.deploy(only_backend).await, outcome_for("run-1"));

    let writes = h.sandbox.write_calls();
    assert_eq!(writes.len(), 2);
    assert!(writes.iter().flatten().all(|p| !p.starts_with("api-worker/")));
    assert_eq!(h.orchestrator.metrics().snapshot().policy_drops, 3);
}

#[tokio::test(start_paused = true)]
async fn master_timeout_bounds_each_caller_from_when_it_joined() {
    let mut h = harness();
    // Attempt 16 lands at t=331s: after the first caller's ceiling, inside the joiner's.
    for _ in 0..15 {
        h.sandbox.push_create(network_error());
    }

    let first = tokio::spawn({
        let orchestrator = h.orchestrator.clone();
        async move {
            let started = Instant::now();
            let outcome = orchestrator.deploy(DeploymentRequest::all_files()).await;
            (outcome, started.elapsed())
        }
    });

    tokio::time::sleep(Duration::from_secs(200)).await;
    assert!(h.orchestrator.is_deploying());
    let joined = h.orchestrator.deploy(DeploymentRequest::all_files()).await;

    let (outcome, waited) = first.await.unwrap();
    assert_eq!(outcome, None);
    assert!(waited >= Duration::from_secs(300) && waited < Duration::from_secs(301));
    assert_eq!(joined, outcome_for("run-16"));

    let events = drain(&mut h.events);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, DeploymentEvent::TimedOut { .. }))
            .count(),
        1
    );
    assert!(events.iter().any(|e| matches!(e, DeploymentEvent::Completed { attempts: 16, .. })));
    assert_eq!(h.orchestrator.metrics().snapshot().deployments_timed_out, 1);
}

#[tokio::test(start_paused = true)]
async fn hung_attempts_time_out_and_the_caller_gives_up_at_the_ceiling() {
    let mut h = harness();
    for _ in 0..8 {
        h.sandbox.push_create(MockReply::delayed(Duration::from_secs(1000), network_error()));
    }

    let caller = tokio::spawn({
        let orchestrator = h.orchestrator.clone();
        async move {
            let started = Instant::now();
            let outcome = orchestrator.deploy(DeploymentRequest::all_files()).await;
            (outcome, started.elapsed())
        }
    });

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert!(retry_delays(&drain(&mut h.events)).is_empty());

    tokio::time::sleep(Duration::from_secs(2)).await;
    let events = drain(&mut h.events);
    assert!(events.iter().any(|e| matches!(
        e,
        DeploymentEvent::AttemptFailed { attempt: 1, error_kind, .. } if error_kind == "attempt_timeout"
    )));

    let (outcome, waited) = caller.await.unwrap();
    assert_eq!(outcome, None);
    assert!(waited >= Duration::from_secs(300) && waited < Duration::from_secs(301));
    // Later attempts queue behind the hung one instead of overlapping it.
    assert_eq!(h.sandbox.create_count(), 1);
    assert_eq!(h.orchestrator.metrics().snapshot().deployments_timed_out, 1);
    h.orchestrator.shutdown();
}

#[tokio::test(start_paused = true)]
async fn late_instance_from_abandoned_attempt_is_not_trusted() {
    let h = harness();
    h.sandbox.push_create(MockReply::delayed(
        Duration::from_secs(65),
        MockReply::Ok(CreateInstanceResponse {
            success: true,
            run_id: Some("run-slow".into()),
            preview_url: Some("https://run-slow.preview.local".into()),
            ..Default::default()
        }),
    ));
    h.sandbox
        .push_write(MockReply::Err(SandboxError::Network("connection reset".into())));

    let delta = DeploymentRequest::new(vec![FileRecord::new("src/App.tsx", "v2")]);
    let outcome = h.orchestrator.deploy(delta).await;

    // The abandoned attempt recorded run-slow but never finished writing it.
    assert_eq!(outcome, outcome_for("run-2"));
    assert_eq!(h.sandbox.create_count(), 2);
    let everything = vec![
        "index.html".to_string(),
        "package.json".to_string(),
        "src/App.tsx".to_string(),
    ];
    assert_eq!(h.sandbox.write_calls(), vec![everything.clone(), everything]);
}

#[tokio::test(start_paused = true)]
async fn new_deploy_after_timeout_supersedes_background_loop() {
    let mut h = harness();
    for _ in 0..15 {
        h.sandbox.push_create(network_error());
    }

    assert_eq!(h.orchestrator.deploy(DeploymentRequest::all_files()).await, None);
    assert!(!h.orchestrator.is_deploying());

    // The old loop sleeps until t=301s; the new deployment replaces it.
    let outcome = h.orchestrator.deploy(DeploymentRequest::all_files()).await;
    assert_eq!(outcome, outcome_for("run-16"));

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.sandbox.create_count(), 16, "superseded loop must stop");

    let events = drain(&mut h.events);
    let started: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            DeploymentEvent::Started { deployment_id, .. } => Some(deployment_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(started.len(), 2);
    assert!(events.iter().any(|e| matches!(
        e,
        DeploymentEvent::Superseded { deployment_id, superseded_by }
            if *deployment_id == started[0] && *superseded_by == started[1]
    )));
}

#[tokio::test(start_paused = true)]
async fn incomplete_provisioning_is_retried_after_one_second() {
    let mut h = harness();
    h.sandbox.push_create(MockReply::Ok(CreateInstanceResponse {
        success: true,
        run_id: None,
        preview_url: Some("https://x".into()),
        ..Default::default()
    }));

    let started = Instant::now();
    let outcome = h.orchestrator.deploy(DeploymentRequest::all_files()).await;
    assert_eq!(outcome, outcome_for("run-2"));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_secs(2));

    let failure = drain(&mut h.events).into_iter().find_map(|e| match e {
        DeploymentEvent::AttemptFailed {
            error_kind,
            retry_in_ms,
            ..
        } => Some((error_kind, retry_in_ms)),
        _ => None,
    });
    assert_eq!(failure, Some(("provisioning_incomplete".to_string(), 1000)));
}

#[tokio::test(start_paused = true)]
async fn unhealthy_instance_self_heals() {
    let mut h = harness();
    h.orchestrator.deploy(DeploymentRequest::all_files()).await.unwrap();
    assert_eq!(h.orchestrator.monitored_instance(), Some(InstanceId::from_raw("run-1")));

    // One report for the health tick, one for the healing deploy's own check.
    h.sandbox.push_status(unhealthy()).push_status(unhealthy());
    tokio::time::sleep(Duration::from_secs(31)).await;

    assert_eq!(h.sandbox.create_count(), 2);
    assert_eq!(
        h.orchestrator.instance().map(|i| i.instance_id),
        Some(InstanceId::from_raw("run-2"))
    );
    assert_eq!(h.orchestrator.monitored_instance(), Some(InstanceId::from_raw("run-2")));
    assert_eq!(h.orchestrator.metrics().snapshot().self_heals, 1);
    assert!(drain(&mut h.events)
        .iter()
        .any(|e| matches!(e, DeploymentEvent::SelfHealTriggered { .. })));
}

#[tokio::test(start_paused = true)]
async fn debugging_session_blocks_self_heal() {
    let h = harness();
    h.orchestrator.deploy(DeploymentRequest::all_files()).await.unwrap();
    h.orchestrator.set_debugging(true);
    assert!(h.orchestrator.is_debugging());

    h.sandbox.push_status(unhealthy()).push_status(unhealthy());
    tokio::time::sleep(Duration::from_secs(61)).await;

    assert_eq!(h.sandbox.create_count(), 1);
    assert_eq!(h.orchestrator.monitored_instance(), Some(InstanceId::from_raw("run-1")));
}

#[tokio::test(start_paused = true)]
async fn setup_commands_run_once_after_success() {
    let h = harness_with(|deps| deps.with_setup_commands(vec!["bun install".into()]));
    h.orchestrator.queue_setup_commands(["bun run build".to_string()]);

    h.orchestrator.deploy(DeploymentRequest::all_files()).await.unwrap();
    h.orchestrator
        .deploy(DeploymentRequest::new(vec![FileRecord::new("src/App.tsx", "v2")]))
        .await
        .unwrap();

    assert_eq!(
        h.sandbox.command_calls(),
        vec![vec!["bun install".to_string(), "bun run build".to_string()]]
    );
}

#[tokio::test(start_paused = true)]
async fn state_survives_restart() {
    let db = Database::in_memory().unwrap();
    let first = harness_with(|deps| deps.with_store(db.clone(), "demo"));
    first.orchestrator.deploy(DeploymentRequest::all_files()).await.unwrap();
    let session = first.orchestrator.session_id();
    first.orchestrator.shutdown();

    let second = harness_with(|deps| deps.with_store(db.clone(), "demo"));
    assert_eq!(second.orchestrator.session_id(), session);
    assert_eq!(
        second.orchestrator.instance().map(|i| i.instance_id),
        Some(InstanceId::from_raw("run-1"))
    );

    let outcome = second
        .orchestrator
        .deploy(DeploymentRequest::new(vec![FileRecord::new("src/App.tsx", "v2")]))
        .await;
    assert_eq!(outcome, outcome_for("run-1"));
    assert_eq!(second.sandbox.create_count(), 0);
    assert_eq!(second.sandbox.status_calls(), 1);

    let history = DeploymentHistoryRepo::new(db).list("demo", 10).unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|row| row.status == DeploymentStatus::Completed));
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_monitor_and_refuses_new_work() {
    let h = harness();
    h.orchestrator.deploy(DeploymentRequest::all_files()).await.unwrap();
    assert!(h.orchestrator.monitored_instance().is_some());

    h.orchestrator.shutdown();
    assert_eq!(h.orchestrator.monitored_instance(), None);
    assert_eq!(h.orchestrator.deploy(DeploymentRequest::all_files()).await, None);

    tokio::time::sleep(Duration::from_secs(90)).await;
    assert_eq!(h.sandbox.status_calls(), 0);
}
