//! Supervised execution of a remote command.
//!
//! One supervised run races three watchers against each other: remote
//! completion, an optional timeout, and an optional externally polled abort
//! signal. The first watcher to fire decides the outcome; the losers are
//! canceled and the remote process is killed before [`supervise`] returns,
//! so no watcher or child process outlives the call.
//!
//! Captured output flows through the configured transform the moment each
//! line arrives, independent of which watcher eventually wins, so partial
//! output up to the termination point is never lost.

use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::output::{LineSink, OutputFormat, OutputLine, StreamKind, render};

/// How often the abort-check endpoint is polled.
pub const ABORT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Upper bound on a single abort-check request, so a slow or unreachable
/// endpoint can never stall detection of a local timeout or completion.
pub const ABORT_POLL_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on draining the stream readers after the race ends. A grandchild of
/// the remote command can keep the pipes open past the child's own exit; it
/// must not stall the return.
const READER_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Immutable description of one supervised run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Command to execute on the host.
    pub command: String,
    /// Maximum run duration; zero disables the timeout watcher.
    pub timeout: Duration,
    /// Abort-check endpoint; `None` disables the abort watcher.
    pub abort_check_url: Option<String>,
    /// Rendering for captured output lines.
    pub format: OutputFormat,
}

/// Terminal result of one supervised run.
///
/// The remote exit code exists only on a natural completion; for every other
/// outcome the remote process's true exit status is unknown or irrelevant and
/// is deliberately not representable.
#[derive(Debug)]
pub enum ExecutionOutcome {
    /// The remote command ran to completion with this exit code.
    Completed { exit_code: i32 },
    /// The configured timeout elapsed first.
    TimedOut,
    /// The abort-check endpoint reported the run as externally aborted.
    Aborted,
    /// The transport could not be started or its streams failed mid-run.
    TransportFailed { error: Error },
}

/// What the abort-check endpoint answers.
#[derive(Debug, Deserialize)]
struct AbortCheckResponse {
    #[serde(default)]
    is_aborted: bool,
}

type ReadEvent = std::io::Result<(StreamKind, String)>;

/// Run a fully prepared transport invocation under supervision.
///
/// `transport` is the complete command that executes `request.command` on the
/// host (`ssh … <command>` in production). Its stdout and stderr are captured
/// line by line, tagged with a global arrival sequence number, transformed
/// per `request.format` and written to `sink` immediately.
///
/// This function does not return until the child process is reaped and every
/// watcher task is joined, whatever the outcome.
pub async fn supervise(
    mut transport: Command,
    request: &RunRequest,
    sink: &mut dyn LineSink,
) -> ExecutionOutcome {
    transport
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    info!(
        command = %request.command,
        timeout_secs = request.timeout.as_secs(),
        has_abort_check = request.abort_check_url.is_some(),
        "starting supervised run"
    );

    let mut child = match transport.spawn() {
        Ok(child) => child,
        Err(e) => {
            return ExecutionOutcome::TransportFailed {
                error: Error::CommandFailed {
                    command: request.command.clone(),
                    output: format!("failed to start transport: {e}"),
                },
            };
        }
    };

    // Reader tasks, one per stream, feed a single arrival-ordered channel.
    // The channel is unbounded so a reader never blocks behind the race loop.
    let (line_tx, mut line_rx) = mpsc::unbounded_channel();
    let mut reader_tasks = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        reader_tasks.push(spawn_reader(StreamKind::Stdout, stdout, line_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        reader_tasks.push(spawn_reader(StreamKind::Stderr, stderr, line_tx.clone()));
    }
    // Only the readers hold senders, so the channel closes at double EOF.
    drop(line_tx);

    let (abort_tx, abort_rx) = oneshot::channel();
    let abort_task = request
        .abort_check_url
        .clone()
        .map(|url| tokio::spawn(poll_abort_endpoint(url, abort_tx)));

    let mut sequence = 0u64;
    let outcome = race_watchers(
        &mut child,
        request,
        sink,
        &mut line_rx,
        abort_rx,
        &mut sequence,
    )
    .await;

    // Teardown: the losing watchers and the child must not outlive the call.
    if let Some(task) = abort_task {
        task.abort();
        let _ = task.await;
    }
    if !matches!(outcome, ExecutionOutcome::Completed { .. }) {
        kill_child(&mut child).await;
    }
    for mut task in reader_tasks {
        if tokio::time::timeout(READER_DRAIN_GRACE, &mut task).await.is_err() {
            task.abort();
            let _ = task.await;
        }
    }
    flush_remaining(&mut line_rx, request.format, sink, &mut sequence);

    outcome
}

/// The first-wins race between completion, timeout and external abort,
/// forwarding output lines as they arrive.
async fn race_watchers(
    child: &mut Child,
    request: &RunRequest,
    sink: &mut dyn LineSink,
    line_rx: &mut mpsc::UnboundedReceiver<ReadEvent>,
    mut abort_rx: oneshot::Receiver<()>,
    sequence: &mut u64,
) -> ExecutionOutcome {
    let has_timeout = request.timeout > Duration::ZERO;
    let timeout = tokio::time::sleep(request.timeout);
    tokio::pin!(timeout);

    let mut streams_done = false;
    let mut abort_active = request.abort_check_url.is_some();

    loop {
        tokio::select! {
            event = line_rx.recv(), if !streams_done => match event {
                Some(Ok((stream, text))) => {
                    if let Err(error) = forward_line(stream, text, request.format, sink, sequence) {
                        return ExecutionOutcome::TransportFailed { error };
                    }
                }
                Some(Err(e)) => {
                    return ExecutionOutcome::TransportFailed {
                        error: Error::Io {
                            context: "reading transport output stream".to_string(),
                            source: e,
                        },
                    };
                }
                None => streams_done = true,
            },
            status = child.wait() => {
                return match status {
                    Ok(status) => {
                        let exit_code = exit_code_of(status);
                        debug!(exit_code, "remote command completed");
                        ExecutionOutcome::Completed { exit_code }
                    }
                    Err(e) => ExecutionOutcome::TransportFailed {
                        error: Error::Io {
                            context: "waiting for transport exit".to_string(),
                            source: e,
                        },
                    },
                };
            }
            () = &mut timeout, if has_timeout => {
                info!(timeout_secs = request.timeout.as_secs(), "supervised run timed out");
                return ExecutionOutcome::TimedOut;
            }
            fired = &mut abort_rx, if abort_active => match fired {
                Ok(()) => {
                    info!("supervised run aborted by external signal");
                    return ExecutionOutcome::Aborted;
                }
                // The abort watcher died without firing; run on without it.
                Err(_) => abort_active = false,
            },
        }
    }
}

fn forward_line(
    stream: StreamKind,
    text: String,
    format: OutputFormat,
    sink: &mut dyn LineSink,
    sequence: &mut u64,
) -> Result<(), Error> {
    let line = OutputLine {
        stream,
        sequence: *sequence,
        text,
    };
    *sequence += 1;
    let rendered = render(&line, format);
    sink.write_line(&line, &rendered).map_err(|e| Error::Io {
        context: "writing transformed output".to_string(),
        source: e,
    })
}

/// Flush lines that arrived before termination but were still queued when the
/// race ended. The readers have been joined, so this never blocks.
fn flush_remaining(
    line_rx: &mut mpsc::UnboundedReceiver<ReadEvent>,
    format: OutputFormat,
    sink: &mut dyn LineSink,
    sequence: &mut u64,
) {
    while let Ok(event) = line_rx.try_recv() {
        let Ok((stream, text)) = event else {
            continue;
        };
        if forward_line(stream, text, format, sink, sequence).is_err() {
            break;
        }
    }
}

fn spawn_reader<R>(
    stream: StreamKind,
    source: R,
    tx: mpsc::UnboundedSender<ReadEvent>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(source).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(text)) => {
                    if tx.send(Ok((stream, text))).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(e));
                    break;
                }
            }
        }
    })
}

/// Poll the abort-check endpoint until it reports the run as aborted.
///
/// A failing poll must never abort the run by itself, so request errors are
/// logged and polling continues.
async fn poll_abort_endpoint(url: String, fired: oneshot::Sender<()>) {
    let client = match reqwest::Client::builder()
        .timeout(ABORT_POLL_REQUEST_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "cannot build abort-check HTTP client, abort watcher disabled");
            return;
        }
    };

    loop {
        match check_abort(&client, &url).await {
            Ok(true) => {
                let _ = fired.send(());
                return;
            }
            Ok(false) => debug!(url = %url, "abort check: run still wanted"),
            Err(e) => warn!(url = %url, error = %e, "abort check failed"),
        }
        tokio::time::sleep(ABORT_POLL_INTERVAL).await;
    }
}

async fn check_abort(client: &reqwest::Client, url: &str) -> reqwest::Result<bool> {
    let response = client.get(url).send().await?.error_for_status()?;
    let body: AbortCheckResponse = response.json().await?;
    Ok(body.is_aborted)
}

/// Force-terminate the child and reap it. Tolerates a child that exited
/// between the watcher firing and the kill.
async fn kill_child(child: &mut Child) {
    match child.kill().await {
        Ok(()) => debug!("transport process terminated"),
        Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {}
        Err(e) => warn!(error = %e, "failed to kill transport process"),
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    // Terminated by a signal: report the conventional 128+N shell encoding.
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}
