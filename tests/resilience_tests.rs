use anyhow::Result;
use fixture_foundry::domain::{ExecProbe, PortBinding, ReadinessProbe};
use fixture_foundry::services::NetworkManager;
use fixture_foundry::test_support::MockRuntime;
use fixture_foundry::{ContainerService, ContainerSpec, Error};
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

fn exec_spec(timeout: Duration) -> ContainerSpec {
    ContainerSpec::new(
        "svc",
        "app:latest",
        ReadinessProbe::new(ExecProbe::new(["check-ready"]))
            .with_timeout(timeout)
            .with_interval(Duration::from_millis(20)),
    )
    .port(PortBinding::random(8080))
}

#[test]
fn test_never_ready_probe_times_out_and_removes_container() -> Result<()> {
    let runtime = Arc::new(MockRuntime::new());
    runtime.set_exec_exit_code(1);
    let service = ContainerService::new(runtime.clone());

    let started = Instant::now();
    let err = service
        .start(exec_spec(Duration::from_millis(200)), None)
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(err.is_health_check_timeout(), "unexpected error: {err}");
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(2));
    assert_eq!(runtime.container_count(), 0);

    match err {
        Error::ContainerStart(e) => assert!(e.is_timeout()),
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}

#[test]
fn test_teardown_runs_once_when_block_panics() {
    let runtime = Arc::new(MockRuntime::new());
    let service = ContainerService::new(runtime.clone());

    let mut id = String::new();
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let guard = service.start(exec_spec(Duration::from_secs(1)), None).unwrap();
        id = guard.id().to_string();
        panic!("assertion in test body");
    }));

    assert!(result.is_err());
    let removals = runtime
        .get_commands()
        .iter()
        .filter(|c| **c == format!("remove:{id}"))
        .count();
    assert_eq!(removals, 1);
    assert!(!runtime.container_exists(&id));
}

#[test]
fn test_stop_failure_still_removes() {
    let runtime = Arc::new(MockRuntime::new());
    let service = ContainerService::new(runtime.clone());
    let guard = service.start(exec_spec(Duration::from_secs(1)), None).unwrap();
    let id = guard.id().to_string();

    runtime.set_fail_on("stop");
    drop(guard);

    assert!(!runtime.container_exists(&id));
}

#[test]
fn test_random_host_ports_never_collide() {
    let runtime = Arc::new(MockRuntime::new());
    let service = ContainerService::new(runtime.clone());

    let guards: Vec<_> = (0..10)
        .map(|_| service.start(exec_spec(Duration::from_secs(1)), None).unwrap())
        .collect();
    let ports: HashSet<u16> = guards.iter().filter_map(|g| g.host_port(8080)).collect();

    assert_eq!(ports.len(), guards.len());
}

#[test]
fn test_returned_handle_passes_immediate_recheck() {
    let runtime = Arc::new(MockRuntime::new());
    let service = ContainerService::new(runtime.clone());

    let guard = service.start(exec_spec(Duration::from_secs(1)), None).unwrap();

    assert!(guard.check_ready().is_ok());
    assert!(guard.check_ready().is_ok());
}

#[test]
fn test_concurrent_network_holders() {
    let runtime = Arc::new(MockRuntime::new());
    let manager = NetworkManager::new(runtime.clone(), true);
    let holders = 8;
    let barrier = Arc::new(Barrier::new(holders));

    let threads: Vec<_> = (0..holders)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let lease = manager.acquire("ls-dev").unwrap();
                // Everyone holds a lease at this point.
                barrier.wait();
                assert!(manager.ref_count("ls-dev") >= 1);
                drop(lease);
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    let commands = runtime.get_commands();
    assert_eq!(commands.iter().filter(|c| *c == "network_create:ls-dev").count(), 1);
    assert_eq!(commands.iter().filter(|c| *c == "network_remove:ls-dev").count(), 1);
    assert_eq!(manager.ref_count("ls-dev"), 0);
}

#[test]
fn test_refcount_matches_active_holders() {
    let runtime = Arc::new(MockRuntime::new());
    let manager = NetworkManager::new(runtime.clone(), true);

    let mut leases = Vec::new();
    for expected in 1..=4 {
        leases.push(manager.acquire("ls-dev").unwrap());
        assert_eq!(manager.ref_count("ls-dev"), expected);
    }
    while let Some(lease) = leases.pop() {
        drop(lease);
        assert_eq!(manager.ref_count("ls-dev"), leases.len());
    }
    assert!(!runtime.network_exists("ls-dev"));
}
