//! Command-line client and worker front-ends.
//!
//! `client` reads delimiter-separated records from stdin and submits each
//! as a job, printing one result line per job. `worker` bridges jobs to a
//! shell command, either one subprocess per job (`--eof`) or one persistent
//! subprocess fed a line per job.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex as AsyncMutex;

use crate::broker::job::Priority;
use crate::client::{Client, WorkEvent};
use crate::error::{GearError, Result};
use crate::worker::{Concurrency, JobResult, WorkError, Worker, WorkerJob};

pub fn parse_priority(text: &str) -> Priority {
    match text {
        "low" => Priority::Low,
        "high" => Priority::High,
        _ => Priority::Normal,
    }
}

/// Submit one job per stdin record and print results, in order. The final
/// record's failure propagates as the process exit status.
pub async fn run_client(
    function: &str,
    server: &str,
    delimiter: &str,
    timeout: Duration,
    priority: Priority,
) -> Result<()> {
    let client = Client::connect(server).await?;
    client.set_response_timeout(timeout);
    client.set_error_handler(|e| eprintln!("Client error: {e}"));

    let mut input = Vec::new();
    tokio::io::stdin().read_to_end(&mut input).await?;

    submit_records(&client, function, &input, delimiter, timeout, priority).await
}

/// Drive the record loop for one input buffer. Every failure is reported to
/// stderr as it happens; the error of the last processed record, if any, is
/// returned so the subcommand exits non-zero.
pub async fn submit_records(
    client: &Client,
    function: &str,
    input: &[u8],
    delimiter: &str,
    timeout: Duration,
    priority: Priority,
) -> Result<()> {
    let mut last_failure: Option<GearError> = None;
    for token in split_tokens(input, delimiter.as_bytes()) {
        let token = trim_record(token);
        if token.is_empty() {
            continue;
        }

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        client
            .submit(function, token, priority, move |event| match event {
                WorkEvent::Complete(data) => {
                    let _ = tx.send(Ok(data));
                }
                WorkEvent::Fail => {
                    let _ = tx.send(Err("job failed".to_string()));
                }
                WorkEvent::Exception(data) => {
                    let _ = tx.send(Err(format!(
                        "job exception: {}",
                        String::from_utf8_lossy(&data)
                    )));
                }
                _ => {}
            })
            .await?;

        last_failure = match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(Ok(data))) => {
                println!("{}", String::from_utf8_lossy(&data));
                None
            }
            Ok(Some(Err(e))) => {
                eprintln!("Job error: {e}");
                Some(GearError::JobFailed(e))
            }
            Ok(None) | Err(_) => {
                eprintln!("Job timeout after {}s", timeout.as_secs());
                Some(GearError::TimedOut)
            }
        };
    }
    match last_failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Run a worker whose single function pipes job payloads through a shell
/// command.
pub async fn run_worker(name: &str, command: &str, server: &str, eof: bool) -> Result<()> {
    let worker = Worker::new(Concurrency::Unlimited);
    worker.add_server(server);
    worker.set_error_handler(|e| tracing::error!(error = %e, "Worker error"));
    worker.add_func(name, 0, shell_handler(command.to_string(), eof)).await?;

    tracing::info!(name, command, eof, "Worker started");
    tokio::select! {
        result = worker.work() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down worker");
            worker.shutdown().await;
        }
    }
    Ok(())
}

struct PersistentProc {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Build the job function for one shell command. Jobs serialize through the
/// handler's mutex in both modes.
fn shell_handler(
    command: String,
    eof: bool,
) -> impl Fn(WorkerJob) -> BoxFuture<'static, JobResult> + Send + Sync + 'static {
    let slot: Arc<AsyncMutex<Option<PersistentProc>>> = Arc::new(AsyncMutex::new(None));
    move |job: WorkerJob| {
        let command = command.clone();
        let slot = slot.clone();
        Box::pin(async move {
            let mut guard = slot.lock().await;
            if eof {
                run_oneshot(&command, job.data()).await
            } else {
                run_persistent(&mut guard, &command, job.data()).await
            }
        })
    }
}

/// `--eof` mode: fresh subprocess per job, payload to stdin, stdout back.
async fn run_oneshot(command: &str, data: &[u8]) -> JobResult {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to spawn subprocess");
            WorkError::Fail
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(data).await.map_err(|_| WorkError::Fail)?;
        // Dropping stdin sends EOF.
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|_| WorkError::Fail)?;
    if !output.status.success() {
        tracing::error!(
            status = ?output.status.code(),
            stderr = %String::from_utf8_lossy(&output.stderr),
            "Subprocess failed"
        );
        return Err(WorkError::Fail);
    }
    Ok(output.stdout)
}

/// Default mode: one long-lived subprocess; write the payload (newline
/// terminated) and read one output line per non-empty input line.
async fn run_persistent(
    slot: &mut Option<PersistentProc>,
    command: &str,
    data: &[u8],
) -> JobResult {
    let exited = slot
        .as_mut()
        .map(|p| matches!(p.child.try_wait(), Ok(Some(_))))
        .unwrap_or(false);
    if exited {
        tracing::warn!("Persistent subprocess exited, respawning");
        *slot = None;
    }
    if slot.is_none() {
        *slot = Some(spawn_persistent(command).map_err(|e| {
            tracing::error!(error = %e, "Failed to spawn persistent subprocess");
            WorkError::Fail
        })?);
    }
    let Some(proc) = slot.as_mut() else {
        return Err(WorkError::Fail);
    };
    match drive_persistent(proc, data).await {
        Ok(output) => Ok(output),
        Err(e) => {
            // The pipe state is unknown now; start clean next job.
            *slot = None;
            Err(e)
        }
    }
}

async fn drive_persistent(proc: &mut PersistentProc, data: &[u8]) -> JobResult {
    proc.stdin.write_all(data).await.map_err(|_| WorkError::Fail)?;
    if !data.ends_with(b"\n") {
        proc.stdin.write_all(b"\n").await.map_err(|_| WorkError::Fail)?;
    }
    proc.stdin.flush().await.map_err(|_| WorkError::Fail)?;

    let text = String::from_utf8_lossy(data);
    let expected = text.trim().split('\n').filter(|l| !l.is_empty()).count();

    let mut results = Vec::with_capacity(expected);
    for _ in 0..expected {
        let mut line = String::new();
        let n = proc
            .stdout
            .read_line(&mut line)
            .await
            .map_err(|_| WorkError::Fail)?;
        if n == 0 {
            return Err(WorkError::Fail);
        }
        results.push(line.trim_end_matches('\n').to_string());
    }
    Ok(results.join("\n").into_bytes())
}

fn spawn_persistent(command: &str) -> std::io::Result<PersistentProc> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| std::io::Error::other("subprocess stdin unavailable"))?;
    let stdout = child
        .stdout
        .take()
        .map(BufReader::new)
        .ok_or_else(|| std::io::Error::other("subprocess stdout unavailable"))?;
    Ok(PersistentProc {
        child,
        stdin,
        stdout,
    })
}

fn split_tokens<'a>(input: &'a [u8], delimiter: &[u8]) -> Vec<&'a [u8]> {
    if delimiter.is_empty() {
        return vec![input];
    }
    let mut tokens = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + delimiter.len() <= input.len() {
        if &input[i..i + delimiter.len()] == delimiter {
            tokens.push(&input[start..i]);
            i += delimiter.len();
            start = i;
        } else {
            i += 1;
        }
    }
    tokens.push(&input[start..]);
    tokens
}

fn trim_record(token: &[u8]) -> &[u8] {
    let mut token = token;
    while token.last() == Some(&b'\r') {
        token = &token[..token.len() - 1];
    }
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_on_newlines() {
        let tokens = split_tokens(b"1\n2\n\n3\n", b"\n");
        assert_eq!(tokens, vec![&b"1"[..], b"2", b"", b"3", b""]);
    }

    #[test]
    fn split_on_multibyte_delimiter() {
        let tokens = split_tokens(b"a::b::c", b"::");
        assert_eq!(tokens, vec![&b"a"[..], b"b", b"c"]);
    }

    #[test]
    fn priority_parsing_defaults_to_normal() {
        assert_eq!(parse_priority("low"), Priority::Low);
        assert_eq!(parse_priority("high"), Priority::High);
        assert_eq!(parse_priority("normal"), Priority::Normal);
        assert_eq!(parse_priority("nonsense"), Priority::Normal);
    }
}
