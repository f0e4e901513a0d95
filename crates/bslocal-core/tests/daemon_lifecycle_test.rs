//! Daemon command lifecycle against fake tunnel binaries

#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use bslocal_core::manager::{LocalOptions, LocalTunnel, TunnelError, TunnelState};
use bslocal_core::process::{run_command, ProcessError};
use bslocal_core::ShutdownHooks;
use common::*;
use serial_test::serial;
use tempfile::TempDir;

fn tunnel_for(temp_dir: &TempDir, script: &str) -> LocalTunnel {
    let binary = install_fake_binary(temp_dir.path(), script);
    LocalTunnel::new(binary, TEST_KEY, "ci-run-42", Duration::from_secs(10)).unwrap()
}

#[tokio::test]
#[serial]
async fn test_start_connected() {
    let temp_dir = TempDir::new().unwrap();
    let mut tunnel = tunnel_for(&temp_dir, &daemon_script(START_CONNECTED, STOP_SUCCESS));

    let message = tunnel.start(&LocalOptions::default()).await.unwrap();

    assert_eq!(message, "Connected");
    assert_eq!(tunnel.state(), TunnelState::Started);
    assert_eq!(tunnel.pid(), Some(555));
    assert_eq!(tunnel.args().len(), 5);
    assert!(!tunnel.args().iter().any(|a| a == TEST_KEY || a == "--key"));

    // The key still reaches the binary
    let calls = recorded_calls(temp_dir.path());
    assert!(calls[0].contains(&format!("--key {TEST_KEY}")));
}

#[tokio::test]
#[serial]
async fn test_start_then_stop_returns_to_stopped() {
    let temp_dir = TempDir::new().unwrap();
    let mut tunnel = tunnel_for(&temp_dir, &daemon_script(START_CONNECTED, STOP_SUCCESS));

    tunnel.start(&LocalOptions::default()).await.unwrap();
    let message = tunnel.stop().await.unwrap();

    assert_eq!(message, "BrowserStackLocal stopped successfully");
    assert_eq!(tunnel.state(), TunnelState::Stopped);
    assert_eq!(tunnel.pid(), None);
    assert!(tunnel.args().is_empty());
}

#[tokio::test]
#[serial]
async fn test_start_twice_spawns_new_process() {
    let temp_dir = TempDir::new().unwrap();
    let start = r#"echo "{\"state\":\"connected\",\"pid\":$$,\"message\":\"Connected\"}""#;
    let mut tunnel = tunnel_for(&temp_dir, &daemon_script(start, STOP_SUCCESS));

    tunnel.start(&LocalOptions::default()).await.unwrap();
    let first = tunnel.pid();
    tunnel.start(&LocalOptions::default()).await.unwrap();
    let second = tunnel.pid();

    assert!(first.is_some() && second.is_some());
    assert_ne!(first, second);
    assert_eq!(tunnel.state(), TunnelState::Started);
    assert_eq!(recorded_calls(temp_dir.path()).len(), 2);
}

#[tokio::test]
#[serial]
async fn test_stop_untracked_instance_is_not_running() {
    let temp_dir = TempDir::new().unwrap();
    let mut tunnel = tunnel_for(&temp_dir, &daemon_script(START_CONNECTED, STOP_NOT_FOUND));

    let err = tunnel.stop().await.unwrap_err();

    match &err {
        TunnelError::NotRunning { message } => {
            assert!(message.to_lowercase().contains("process instance not found"))
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(tunnel.state(), TunnelState::Stopped);
    assert_eq!(tunnel.pid(), None);
    assert!(tunnel.args().is_empty());
}

#[tokio::test]
#[serial]
async fn test_failed_start_restores_stopped() {
    let temp_dir = TempDir::new().unwrap();
    let start = r#"echo '{"state":"disconnected","message":"Invalid key"}'"#;
    let mut tunnel = tunnel_for(&temp_dir, &daemon_script(start, STOP_SUCCESS));

    let err = tunnel.start(&LocalOptions::default()).await.unwrap_err();

    match &err {
        TunnelError::CommandFailed { message, raw, command } => {
            assert_eq!(message, "Invalid key");
            assert_eq!(raw["state"], "disconnected");
            assert!(!command.contains(TEST_KEY));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(tunnel.state(), TunnelState::Stopped);
    assert_eq!(tunnel.pid(), None);
}

#[tokio::test]
#[serial]
async fn test_failed_stop_keeps_started() {
    let temp_dir = TempDir::new().unwrap();
    let stop = r#"echo '{"state":"error","message":"Could not reach daemon"}'"#;
    let mut tunnel = tunnel_for(&temp_dir, &daemon_script(START_CONNECTED, stop));

    tunnel.start(&LocalOptions::default()).await.unwrap();
    let err = tunnel.stop().await.unwrap_err();

    assert!(matches!(err, TunnelError::CommandFailed { .. }));
    assert_eq!(tunnel.state(), TunnelState::Started);
    assert_eq!(tunnel.pid(), Some(555));
    assert_eq!(tunnel.args().len(), 5);
}

#[tokio::test]
#[serial]
async fn test_timeout_is_reported_and_state_restored() {
    let temp_dir = TempDir::new().unwrap();
    let binary = install_fake_binary(temp_dir.path(), "#!/bin/sh\nexec sleep 5\n");
    let mut tunnel =
        LocalTunnel::new(binary, TEST_KEY, "slow", Duration::from_millis(200)).unwrap();

    let started = std::time::Instant::now();
    let err = tunnel.start(&LocalOptions::default()).await.unwrap_err();

    assert!(err.is_timeout());
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(matches!(
        err,
        TunnelError::Process(ProcessError::Timeout { timeout_ms: 200, .. })
    ));
    assert_eq!(tunnel.state(), TunnelState::Stopped);
}

#[tokio::test]
#[serial]
async fn test_record_on_stderr_with_status_alias() {
    let temp_dir = TempDir::new().unwrap();
    let start = r#"echo "warming up"; echo '{"status":"Connected","pid":"777"}' >&2"#;
    let mut tunnel = tunnel_for(&temp_dir, &daemon_script(start, STOP_SUCCESS));

    let message = tunnel.start(&LocalOptions::default()).await.unwrap();

    assert_eq!(message, "Connected");
    assert_eq!(tunnel.pid(), Some(777));
    assert_eq!(tunnel.state(), TunnelState::Started);
}

#[tokio::test]
#[serial]
async fn test_unparseable_output_keeps_raw_text() {
    let temp_dir = TempDir::new().unwrap();
    let binary = install_fake_binary(
        temp_dir.path(),
        "#!/bin/sh\necho 'segfault in tunnel'\necho 'core dumped' >&2\nexit 139\n",
    );

    let args = vec!["--daemon".to_string(), "start".to_string()];
    let err = run_command(&binary, &args, Duration::from_secs(5))
        .await
        .unwrap_err();

    match err {
        ProcessError::Unparseable { stdout, stderr, .. } => {
            assert!(stdout.contains("segfault in tunnel"));
            assert!(stderr.contains("core dumped"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
#[serial]
async fn test_registered_start_and_stop() {
    let temp_dir = TempDir::new().unwrap();
    let source = Arc::new(StaticArchiveSource::with_script(
        &daemon_script(START_CONNECTED, STOP_SUCCESS),
        Some("\"etag-1\""),
    ));
    let controller = controller(temp_dir.path(), source);

    let (tunnel, message) = controller
        .start_registered(Some("ci-a"), None, &LocalOptions::default())
        .await
        .unwrap();
    assert_eq!(message, "Connected");
    assert_eq!(tunnel.local_identifier(), "ci-a");
    controller
        .start_registered(Some("ci-b"), None, &LocalOptions::default())
        .await
        .unwrap();

    assert_eq!(controller.list().await.unwrap(), vec!["ci-a", "ci-b"]);

    controller.stop_registered(Some("ci-a"), None).await.unwrap();
    assert_eq!(controller.list().await.unwrap(), vec!["ci-b"]);
}

#[tokio::test]
#[serial]
async fn test_registered_stop_of_gone_instance_unregisters() {
    let temp_dir = TempDir::new().unwrap();
    let source = Arc::new(StaticArchiveSource::with_script(
        &daemon_script(START_CONNECTED, STOP_NOT_FOUND),
        None,
    ));
    let controller = controller(temp_dir.path(), source);

    controller
        .start_registered(Some("ci-gone"), None, &LocalOptions::default())
        .await
        .unwrap();
    let err = controller
        .stop_registered(Some("ci-gone"), None)
        .await
        .unwrap_err();

    assert!(err.is_not_running());
    assert!(controller.list().await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn test_run_with_injects_identifier_and_stops_once() {
    let temp_dir = TempDir::new().unwrap();
    let source = Arc::new(StaticArchiveSource::with_script(
        &daemon_script(START_CONNECTED, STOP_SUCCESS),
        None,
    ));
    let controller = controller(temp_dir.path(), source);
    let hooks = ShutdownHooks::new();

    let command: Vec<String> = ["sh", "-c", r#"test "$BROWSERSTACK_LOCAL_IDENTIFIER" = ci-with"#]
        .iter()
        .map(|s| s.to_string())
        .collect();
    controller
        .run_with(Some("ci-with"), None, &LocalOptions::default(), &command, &hooks)
        .await
        .unwrap();
    hooks.run().await;

    let stops = recorded_calls(temp_dir.path())
        .iter()
        .filter(|call| call.contains("--daemon stop"))
        .count();
    assert_eq!(stops, 1);
    assert!(hooks.has_run());
    assert!(controller.list().await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn test_run_with_failing_command_still_stops() {
    let temp_dir = TempDir::new().unwrap();
    let source = Arc::new(StaticArchiveSource::with_script(
        &daemon_script(START_CONNECTED, STOP_SUCCESS),
        None,
    ));
    let controller = controller(temp_dir.path(), source);
    let hooks = ShutdownHooks::new();

    let command: Vec<String> = ["sh", "-c", "exit 4"].iter().map(|s| s.to_string()).collect();
    let err = controller
        .run_with(Some("ci-fail"), None, &LocalOptions::default(), &command, &hooks)
        .await
        .unwrap_err();

    assert!(matches!(err, TunnelError::CommandExited { code: Some(4), .. }));
    let calls = recorded_calls(temp_dir.path());
    assert_eq!(calls.iter().filter(|c| c.contains("--daemon stop")).count(), 1);
    assert!(controller.list().await.unwrap().is_empty());
}

fn shell(command: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), command.to_string()]
}

fn daemon_calls(dir: &std::path::Path, op: &str) -> usize {
    recorded_calls(dir)
        .iter()
        .filter(|call| call.contains(&format!("--daemon {op}")))
        .count()
}

#[tokio::test]
#[serial]
async fn test_run_with_malformed_registry_starts_nothing() {
    let temp_dir = TempDir::new().unwrap();
    let source = Arc::new(StaticArchiveSource::with_script(
        &daemon_script(START_CONNECTED, STOP_SUCCESS),
        None,
    ));
    let controller = controller(temp_dir.path(), source);
    std::fs::write(controller.registry().path(), "{ not json").unwrap();
    let hooks = ShutdownHooks::new();

    let err = controller
        .run_with(Some("ci-x"), None, &LocalOptions::default(), &shell("true"), &hooks)
        .await
        .unwrap_err();
    hooks.run().await;

    assert!(matches!(err, TunnelError::Registry(_)));
    assert_eq!(daemon_calls(temp_dir.path(), "start"), 0);
    assert_eq!(
        std::fs::read_to_string(controller.registry().path()).unwrap(),
        "{ not json"
    );
}

#[tokio::test]
#[serial]
async fn test_start_that_cannot_be_recorded_is_stopped() {
    let temp_dir = TempDir::new().unwrap();
    // The registry is corrupted while the daemon starts
    let start = format!(
        r#"{start}; echo '{{ not json' > "$(dirname "$0")/local-instances.json""#,
        start = START_CONNECTED
    );
    let source = Arc::new(StaticArchiveSource::with_script(
        &daemon_script(&start, STOP_SUCCESS),
        None,
    ));
    let controller = controller(temp_dir.path(), source);

    let err = controller
        .start_registered(Some("ci-lost"), None, &LocalOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, TunnelError::Registry(_)));
    assert_eq!(daemon_calls(temp_dir.path(), "start"), 1);
    assert_eq!(daemon_calls(temp_dir.path(), "stop"), 1);
}

#[tokio::test]
#[serial]
async fn test_run_with_reports_failed_stop() {
    let temp_dir = TempDir::new().unwrap();
    let stop = r#"echo '{"state":"error","message":"Could not reach daemon"}'"#;
    let source = Arc::new(StaticArchiveSource::with_script(
        &daemon_script(START_CONNECTED, stop),
        None,
    ));
    let controller = controller(temp_dir.path(), source);
    let hooks = ShutdownHooks::new();

    let err = controller
        .run_with(Some("ci-y"), None, &LocalOptions::default(), &shell("true"), &hooks)
        .await
        .unwrap_err();

    match err {
        TunnelError::CommandFailed { message, .. } => {
            assert!(message.contains("Could not reach daemon"))
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(daemon_calls(temp_dir.path(), "stop"), 1);
    assert_eq!(controller.list().await.unwrap(), vec!["ci-y"]);
}

#[tokio::test]
#[serial]
async fn test_stop_without_identifier_needs_a_recorded_tunnel() {
    let temp_dir = TempDir::new().unwrap();
    let source = Arc::new(StaticArchiveSource::with_script(
        &daemon_script(START_CONNECTED, STOP_SUCCESS),
        None,
    ));
    let controller = controller(temp_dir.path(), source);

    let err = controller.stop_registered(None, None).await.unwrap_err();
    assert!(matches!(err, TunnelError::InvalidIdentifier { .. }));
    assert_eq!(daemon_calls(temp_dir.path(), "stop"), 0);

    for identifier in ["ci-1", "ci-2"] {
        controller
            .start_registered(Some(identifier), None, &LocalOptions::default())
            .await
            .unwrap();
    }
    let err = controller.stop_registered(None, None).await.unwrap_err();
    assert!(matches!(err, TunnelError::InvalidIdentifier { .. }));
    assert_eq!(daemon_calls(temp_dir.path(), "stop"), 0);

    controller.stop_registered(Some("ci-1"), None).await.unwrap();
    controller.stop_registered(None, None).await.unwrap();

    let calls = recorded_calls(temp_dir.path());
    assert!(calls.last().unwrap().contains("--local-identifier ci-2"));
    assert!(controller.list().await.unwrap().is_empty());
}
