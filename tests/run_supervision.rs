//! End-to-end tests for the supervised run: completion, timeout, external
//! abort, transport failure and output ordering.
//!
//! The transport is a local `sh` process instead of ssh. The supervisor only
//! ever sees a command with piped stdout/stderr, so the behaviour under test
//! is identical.

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::process::Command;

use hostler::host::supervise::{ExecutionOutcome, RunRequest, supervise};
use hostler::output::{LineSink, OutputFormat, OutputLine, StreamKind};

/// Sink capturing every line the supervisor forwards.
#[derive(Default)]
struct CaptureSink {
    lines: Vec<(OutputLine, String)>,
}

impl LineSink for CaptureSink {
    fn write_line(&mut self, line: &OutputLine, rendered: &str) -> io::Result<()> {
        self.lines.push((line.clone(), rendered.to_string()));
        Ok(())
    }
}

fn sh(script: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script);
    cmd
}

fn request(command: &str) -> RunRequest {
    RunRequest {
        command: command.to_string(),
        timeout: Duration::ZERO,
        abort_check_url: None,
        format: OutputFormat::Raw,
    }
}

/// Serve a canned abort-check response on a local port.
async fn spawn_abort_server(is_aborted: bool) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let body = format!("{{\"is_aborted\":{is_aborted}}}");
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\n\
                 content-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });
    addr
}

// ---------------------------------------------------------------------------
// Terminal outcomes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn completion_reports_the_remote_exit_code() {
    let mut sink = CaptureSink::default();
    let outcome = supervise(sh("exit 7"), &request("exit 7"), &mut sink).await;
    match outcome {
        ExecutionOutcome::Completed { exit_code } => assert_eq!(exit_code, 7),
        other => panic!("expected completion, got {other:?}"),
    }
}

#[tokio::test]
async fn timeout_fires_and_kills_the_remote_process() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("survived");
    // The sleep's streams are redirected so the orphaned grandchild does not
    // keep the capture pipes open after the shell is killed.
    let script = format!("sleep 3 >/dev/null 2>&1 && touch {}", marker.display());
    let mut req = request(&script);
    req.timeout = Duration::from_millis(300);

    let started = Instant::now();
    let outcome = supervise(sh(&script), &req, &mut CaptureSink::default()).await;

    assert!(matches!(outcome, ExecutionOutcome::TimedOut), "got {outcome:?}");
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "timeout watcher fired late: {:?}",
        started.elapsed()
    );

    // The shell was killed before the sleep finished, so the marker command
    // never runs.
    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert!(!marker.exists(), "remote process outlived the supervised run");
}

#[tokio::test]
async fn abort_endpoint_cancels_the_run() {
    let server = spawn_abort_server(true).await;
    let script = "sleep 10";
    let mut req = request(script);
    req.abort_check_url = Some(format!("http://{server}/abort"));

    let started = Instant::now();
    let outcome = supervise(sh(script), &req, &mut CaptureSink::default()).await;

    assert!(matches!(outcome, ExecutionOutcome::Aborted), "got {outcome:?}");
    assert!(
        started.elapsed() < Duration::from_secs(8),
        "abort must fire well before natural completion: {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn non_aborted_endpoint_does_not_cancel() {
    let server = spawn_abort_server(false).await;
    let mut req = request("exit 0");
    req.abort_check_url = Some(format!("http://{server}/abort"));

    let outcome = supervise(sh("exit 0"), &req, &mut CaptureSink::default()).await;

    assert!(
        matches!(outcome, ExecutionOutcome::Completed { exit_code: 0 }),
        "got {outcome:?}"
    );
}

#[tokio::test]
async fn unspawnable_transport_fails_fast() {
    let mut cmd = Command::new("/nonexistent/hostler-test-transport");
    cmd.arg("x");
    let outcome = supervise(cmd, &request("x"), &mut CaptureSink::default()).await;
    assert!(
        matches!(outcome, ExecutionOutcome::TransportFailed { .. }),
        "got {outcome:?}"
    );
}

// ---------------------------------------------------------------------------
// Output transformation and ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn interleaved_output_preserves_arrival_order() {
    let script =
        "printf 'alpha\\n'; sleep 0.3; printf 'beta\\n' 1>&2; sleep 0.3; printf 'gamma\\n'";
    let mut req = request(script);
    req.format = OutputFormat::Json;
    let mut sink = CaptureSink::default();

    let outcome = supervise(sh(script), &req, &mut sink).await;
    assert!(
        matches!(outcome, ExecutionOutcome::Completed { exit_code: 0 }),
        "got {outcome:?}"
    );

    let texts: Vec<&str> = sink.lines.iter().map(|(l, _)| l.text.as_str()).collect();
    assert_eq!(texts, ["alpha", "beta", "gamma"]);

    let streams: Vec<StreamKind> = sink.lines.iter().map(|(l, _)| l.stream).collect();
    assert_eq!(
        streams,
        [StreamKind::Stdout, StreamKind::Stderr, StreamKind::Stdout]
    );

    let sequences: Vec<u64> = sink.lines.iter().map(|(l, _)| l.sequence).collect();
    assert_eq!(sequences, [0, 1, 2], "arrival order assigns the sequence");

    let first: serde_json::Value = serde_json::from_str(&sink.lines[0].1).unwrap();
    assert_eq!(first["stream"], "stdout");
    assert_eq!(first["sequence"], 0);
    assert_eq!(first["text"], "alpha");
}

#[tokio::test]
async fn raw_format_renders_lines_verbatim() {
    let script = "printf 'plain text  with spaces\\n'";
    let mut sink = CaptureSink::default();
    supervise(sh(script), &request(script), &mut sink).await;

    assert_eq!(sink.lines.len(), 1);
    assert_eq!(sink.lines[0].1, "plain text  with spaces");
}

#[tokio::test]
async fn output_before_termination_is_flushed() {
    let script = "printf 'early\\n'; sleep 5 >/dev/null 2>&1";
    let mut req = request(script);
    req.timeout = Duration::from_millis(500);
    let mut sink = CaptureSink::default();

    let outcome = supervise(sh(script), &req, &mut sink).await;

    assert!(matches!(outcome, ExecutionOutcome::TimedOut), "got {outcome:?}");
    assert_eq!(sink.lines.len(), 1, "partial output must not be lost");
    assert_eq!(sink.lines[0].0.text, "early");
}
