//! Supervision of real child processes running the echo worker.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::sync::broadcast;

use switchyard::bridge::protocol::Params;
use switchyard::{
    CallOptions, CapabilityTable, Config, ErrorKind, ExitReason, HandlerRegistry, Payload,
    ProcessId, ProcessSpec, ProcessState, RestartPolicy, Role, Runtime, SpawnError,
    SupervisorConfig, SupervisorEvent,
};

const WORKER: &str = env!("CARGO_BIN_EXE_switchyard-echo-worker");

fn id(name: &str) -> ProcessId {
    ProcessId::new(name).unwrap()
}

fn params(v: Value) -> Params {
    v.as_object().cloned().unwrap()
}

fn worker(name: &str) -> ProcessSpec {
    ProcessSpec::new(id(name), Role::Worker, WORKER).with_env("SWITCHYARD_LOG", "warn")
}

fn controller(dir: &tempfile::TempDir, restart: RestartPolicy) -> Runtime {
    let supervisor = SupervisorConfig::default()
        .with_runtime_dir(dir.path())
        .with_heartbeat(
            Duration::from_millis(100),
            Duration::from_millis(400),
            Duration::from_millis(1200),
        )
        .with_spawn_timeout(Duration::from_secs(10))
        .with_restart(restart);
    Runtime::controller(
        id("controller"),
        Config::default().with_supervisor(supervisor),
        Arc::new(CapabilityTable::new()),
        HandlerRegistry::new(),
    )
    .unwrap()
}

fn quick_restarts(max_restarts: u32) -> RestartPolicy {
    RestartPolicy {
        max_restarts,
        initial_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(200),
        multiplier: 2.0,
    }
}

async fn next_matching(
    events: &mut broadcast::Receiver<SupervisorEvent>,
    wanted: impl Fn(&SupervisorEvent) -> bool,
) -> SupervisorEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("supervisor events ended: {e}"),
            }
        }
    })
    .await
    .expect("expected supervisor event not seen")
}

async fn request_exit(runtime: &Runtime, worker: &ProcessId, code: i32) {
    // The reply may or may not beat the exit.
    let _ = runtime
        .router()
        .call(
            worker,
            "worker.exit",
            params(json!({ "code": code })),
            Duration::from_secs(2),
        )
        .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_answers_calls() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = controller(&dir, RestartPolicy::never());
    let supervisor = runtime.supervisor().unwrap();
    let worker_1 = supervisor.spawn(worker("worker-1")).await.unwrap();
    assert_eq!(worker_1.role, Role::Worker);
    assert!(runtime.router().is_attached(&worker_1.id));

    let snap = supervisor.snapshot(&worker_1.id).unwrap();
    assert_eq!(snap.state, ProcessState::Ready);
    assert!(snap.pid.is_some());
    assert_eq!(snap.restarts, 0);

    let echoed = runtime
        .router()
        .call(
            &worker_1.id,
            "worker.echo",
            params(json!({ "hello": "world", "n": [1, 2, 3] })),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(echoed, json!({ "hello": "world", "n": [1, 2, 3] }));

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn large_payloads_cross_the_process_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = controller(&dir, RestartPolicy::never());
    let supervisor = runtime.supervisor().unwrap();
    let worker_1 = supervisor.spawn(worker("worker-1")).await.unwrap();
    let router = runtime.router();

    // Controller to worker.
    let bytes: Vec<u8> = (0..1024 * 1024).map(|i| (i % 7) as u8).collect();
    let expected_crc = crc32fast::hash(&bytes);
    let reply = router
        .call_with(
            &worker_1.id,
            "worker.digest",
            Params::new(),
            CallOptions::new()
                .with_timeout(Duration::from_secs(5))
                .with_payload(Payload::new("application/octet-stream", bytes)),
        )
        .await
        .unwrap();
    assert_eq!(reply.value["len"], 1024 * 1024);
    assert_eq!(reply.value["crc32"], expected_crc);
    assert_eq!(reply.value["shared"], true);

    // The worker's release comes back and the buffer is reclaimed.
    tokio::time::timeout(Duration::from_secs(5), async {
        while runtime.buffers().owned_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("buffer was never released by the worker");

    // Worker to controller.
    let reply = router
        .call_with(
            &worker_1.id,
            "worker.upload",
            params(json!({ "size": 300_000, "content_type": "image/png" })),
            CallOptions::new().with_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    let inbound = reply.payload.expect("upload carries a payload");
    assert!(inbound.is_shared());
    let payload = inbound.into_payload().unwrap();
    assert_eq!(payload.content_type, "image/png");
    assert_eq!(payload.len(), 300_000);
    assert_eq!(payload.bytes[251], 0);
    assert_eq!(reply.value["crc32"], crc32fast::hash(&payload.bytes));
    assert_eq!(runtime.buffers().mapped_count(), 0);

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hung_worker_is_degraded_then_terminated() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = controller(&dir, RestartPolicy::never());
    let supervisor = runtime.supervisor().unwrap();
    let mut events = supervisor.subscribe();
    let worker_1 = supervisor.spawn(worker("worker-1")).await.unwrap();

    // A buffer currently leased to the worker.
    let buffers = runtime.buffers();
    let meta = buffers
        .publish(&Payload::new("application/octet-stream", vec![7u8; 4096]))
        .unwrap();
    buffers.lease(&meta.handle, &worker_1.id).unwrap();
    assert!(buffers.release(&meta.handle, buffers.local()));
    assert_eq!(buffers.ref_count(&meta.handle), Some(1));

    let router = runtime.router().clone();
    let target = worker_1.id.clone();
    let hang = tokio::spawn(async move {
        router
            .call(
                &target,
                "worker.hang",
                params(json!({ "ms": 30_000 })),
                Duration::from_secs(60),
            )
            .await
    });

    let degraded = next_matching(&mut events, |e| matches!(e, SupervisorEvent::Degraded { .. })).await;
    let SupervisorEvent::Degraded { id: degraded_id, silent_for } = degraded else {
        unreachable!()
    };
    assert_eq!(degraded_id, worker_1.id);
    assert!(silent_for >= Duration::from_millis(400));

    let terminated = next_matching(&mut events, |e| {
        matches!(e, SupervisorEvent::Terminated { .. })
    })
    .await;
    assert_eq!(
        terminated,
        SupervisorEvent::Terminated {
            id: worker_1.id.clone(),
            reason: ExitReason::HeartbeatTimeout,
        }
    );

    let err = hang.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionLost);
    assert_eq!(runtime.router().pending_calls(), 0);
    assert!(!runtime.router().is_attached(&worker_1.id));
    assert!(!buffers.is_live(&meta.handle));
    assert!(!dir.path().join("worker-1.sock").exists());

    let failed = next_matching(&mut events, |e| matches!(e, SupervisorEvent::Failed { .. })).await;
    assert_eq!(
        failed,
        SupervisorEvent::Failed {
            id: worker_1.id.clone(),
            restarts: 0,
            reason: ExitReason::HeartbeatTimeout,
        }
    );
    let snap = supervisor.snapshot(&worker_1.id).unwrap();
    assert_eq!(snap.state, ProcessState::Terminated);
    assert_eq!(snap.exit_reason, Some(ExitReason::HeartbeatTimeout));

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crashing_worker_is_restarted_until_the_budget_runs_out() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = controller(&dir, quick_restarts(2));
    let supervisor = runtime.supervisor().unwrap();
    let mut events = supervisor.subscribe();
    let worker_1 = supervisor.spawn(worker("worker-1")).await.unwrap();

    for attempt in 1..=2u32 {
        request_exit(&runtime, &worker_1.id, 1).await;
        let terminated = next_matching(&mut events, |e| {
            matches!(e, SupervisorEvent::Terminated { .. })
        })
        .await;
        let SupervisorEvent::Terminated { reason, .. } = terminated else {
            unreachable!()
        };
        assert!(reason.is_failure(), "{reason}");

        let restarting = next_matching(&mut events, |e| {
            matches!(e, SupervisorEvent::Restarting { .. })
        })
        .await;
        let SupervisorEvent::Restarting { attempt: seen, delay, .. } = restarting else {
            unreachable!()
        };
        assert_eq!(seen, attempt);
        assert!(delay <= Duration::from_millis(200));

        next_matching(&mut events, |e| matches!(e, SupervisorEvent::Ready { .. })).await;
        let snap = supervisor.snapshot(&worker_1.id).unwrap();
        assert_eq!(snap.state, ProcessState::Ready);
        assert_eq!(snap.restarts, attempt);
        assert!(runtime.router().is_attached(&worker_1.id));
    }

    request_exit(&runtime, &worker_1.id, 1).await;
    let failed = next_matching(&mut events, |e| matches!(e, SupervisorEvent::Failed { .. })).await;
    let SupervisorEvent::Failed { restarts, .. } = failed else {
        unreachable!()
    };
    assert_eq!(restarts, 2);
    assert_eq!(
        supervisor.snapshot(&worker_1.id).unwrap().state,
        ProcessState::Terminated
    );

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clean_exit_is_not_restarted() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = controller(&dir, quick_restarts(3));
    let supervisor = runtime.supervisor().unwrap();
    let mut events = supervisor.subscribe();
    let worker_1 = supervisor.spawn(worker("worker-1")).await.unwrap();

    request_exit(&runtime, &worker_1.id, 0).await;

    let terminated = next_matching(&mut events, |e| {
        matches!(e, SupervisorEvent::Terminated { .. })
    })
    .await;
    assert_eq!(
        terminated,
        SupervisorEvent::Terminated {
            id: worker_1.id.clone(),
            reason: ExitReason::Exited { code: Some(0) },
        }
    );
    let restarted = tokio::time::timeout(
        Duration::from_millis(500),
        next_matching(&mut events, |e| {
            matches!(e, SupervisorEvent::Restarting { .. })
        }),
    )
    .await;
    assert!(restarted.is_err());

    // A terminated entry can be spawned again by hand.
    supervisor.spawn(worker("worker-1")).await.unwrap();
    assert_eq!(
        supervisor.snapshot(&worker_1.id).unwrap().state,
        ProcessState::Ready
    );

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_spawn_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = controller(&dir, RestartPolicy::never());
    let supervisor = runtime.supervisor().unwrap();
    supervisor.spawn(worker("worker-1")).await.unwrap();

    let err = supervisor.spawn(worker("worker-1")).await.unwrap_err();
    assert!(matches!(err, SpawnError::AlreadyRunning(ref dup) if dup == &id("worker-1")), "{err}");

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn terminate_fails_calls_in_flight_and_does_not_restart() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = controller(&dir, quick_restarts(3));
    let supervisor = runtime.supervisor().unwrap();
    let mut events = supervisor.subscribe();
    let worker_1 = supervisor.spawn(worker("worker-1")).await.unwrap();

    let router = runtime.router().clone();
    let target = worker_1.id.clone();
    let task = tokio::spawn(async move {
        router
            .call(&target, "worker.runTask", Params::new(), Duration::from_secs(30))
            .await
    });
    tokio::time::timeout(Duration::from_secs(5), async {
        while runtime.router().pending_calls() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert!(supervisor.terminate(&worker_1.id));
    assert!(!supervisor.terminate(&worker_1.id));

    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionLost);

    let terminated = next_matching(&mut events, |e| {
        matches!(e, SupervisorEvent::Terminated { .. })
    })
    .await;
    assert_eq!(
        terminated,
        SupervisorEvent::Terminated {
            id: worker_1.id.clone(),
            reason: ExitReason::Shutdown,
        }
    );
    let restarted = tokio::time::timeout(
        Duration::from_millis(300),
        next_matching(&mut events, |e| {
            matches!(e, SupervisorEvent::Restarting { .. })
        }),
    )
    .await;
    assert!(restarted.is_err());

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_stops_every_child() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = controller(&dir, quick_restarts(3));
    let supervisor = runtime.supervisor().unwrap();
    supervisor.spawn(worker("worker-1")).await.unwrap();
    supervisor
        .spawn(ProcessSpec::new(id("ui-host"), Role::UiHost, WORKER))
        .await
        .unwrap();
    assert_eq!(runtime.router().peers().len(), 2);

    runtime.shutdown().await;

    let processes = supervisor.processes();
    assert_eq!(processes.len(), 2);
    assert_eq!(processes[0].id, id("ui-host"));
    for snap in &processes {
        assert_eq!(snap.state, ProcessState::Terminated);
        assert_eq!(snap.exit_reason, Some(ExitReason::Shutdown));
    }
    assert!(runtime.router().peers().is_empty());
    assert!(!dir.path().join("worker-1.sock").exists());
    assert!(!dir.path().join("ui-host.sock").exists());

    let err = supervisor.spawn(worker("worker-2")).await.unwrap_err();
    assert!(matches!(err, SpawnError::ShutDown));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connections_from_other_processes_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = controller(&dir, RestartPolicy::never());
    let supervisor = runtime.supervisor().unwrap().clone();

    // The worker starts late, leaving room for someone else to connect first.
    let script = format!("sleep 0.5; exec '{WORKER}'");
    let spec = ProcessSpec::new(id("worker-1"), Role::Worker, "/bin/sh")
        .with_args(["-c", script.as_str()])
        .with_env("SWITCHYARD_LOG", "warn");
    let spawn = tokio::spawn(async move { supervisor.spawn(spec).await });

    let socket = dir.path().join("worker-1.sock");
    let mut impostor = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(stream) = UnixStream::connect(&socket).await {
                return stream;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("socket never appeared");

    let worker_1 = spawn.await.unwrap().unwrap();
    assert!(runtime.router().is_attached(&worker_1.id));

    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), impostor.read(&mut buf))
        .await
        .expect("impostor connection left open");
    assert_eq!(read.unwrap(), 0);

    let echoed = runtime
        .router()
        .call(
            &worker_1.id,
            "worker.echo",
            params(json!({ "ok": true })),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(echoed, json!({ "ok": true }));

    runtime.shutdown().await;
}
