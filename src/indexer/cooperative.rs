//! Cooperative transport: waits on the helper yield to the caller's tokio
//! runtime instead of blocking a thread.
//!
//! Teardown matches the blocking transport: close the helper's input and
//! reap it, and kill it only when it stopped answering or does not exit in
//! time. Destructors cannot await, so [`CooperativeIndexer::shutdown_blocking`]
//! polls for the exit instead.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::config::HelperConfig;
use crate::error::{MailFtsError, Result};
use crate::indexer::protocol::{IndexerCommand, LineOutcome, ProtocolState, version_line};

const REAP_POLL_INTERVAL: Duration = Duration::from_millis(10);
const KILL_GRACE: Duration = Duration::from_secs(2);

/// A helper process driven from async code.
#[derive(Debug)]
pub struct CooperativeIndexer {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Lines<BufReader<ChildStdout>>,
    state: ProtocolState,
    timeout: Duration,
    last_used: Instant,
    timed_out: bool,
}

impl CooperativeIndexer {
    /// Start the helper and complete the handshake. Must run inside a tokio
    /// runtime.
    pub async fn spawn(helper: &HelperConfig, timeout: Duration) -> Result<Self> {
        let mut child = Command::new(&helper.program)
            .args(&helper.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                MailFtsError::process(format!(
                    "failed to start {}: {e}",
                    helper.program.display()
                ))
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            if let Err(e) = child.kill().await {
                log::debug!("kill helper: {e}");
            }
            return Err(MailFtsError::process("failed to capture helper pipes"));
        };
        log::debug!(
            "spawned helper {} (pid {:?})",
            helper.program.display(),
            child.id()
        );

        let mut indexer = CooperativeIndexer {
            child,
            stdin: Some(stdin),
            lines: BufReader::new(stdout).lines(),
            state: ProtocolState::AwaitingHandshake,
            timeout,
            last_used: Instant::now(),
            timed_out: false,
        };

        let handshake = match indexer.send(&format!("{}\n", version_line())).await {
            Ok(()) => indexer.wait_for_outcome().await,
            Err(e) => Err(e),
        };
        match handshake {
            Ok(LineOutcome::HandshakeDone) => Ok(indexer),
            Ok(other) => {
                indexer.kill_and_reap().await;
                Err(MailFtsError::protocol(format!(
                    "unexpected handshake outcome {other:?}"
                )))
            }
            Err(e) => {
                indexer.kill_and_reap().await;
                Err(e)
            }
        }
    }

    async fn send(&mut self, line: &str) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| MailFtsError::protocol("helper input already closed"))?;
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        written.map_err(|e| {
            self.state = ProtocolState::Closed;
            MailFtsError::protocol(format!("failed to write to helper: {e}"))
        })
    }

    async fn wait_for_outcome(&mut self) -> Result<LineOutcome> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.lines.next_line()).await {
                Ok(Ok(Some(line))) => match self.state.on_line(&line)? {
                    LineOutcome::Pending => continue,
                    outcome => return Ok(outcome),
                },
                Ok(Ok(None)) => return Err(self.state.on_eof()),
                Ok(Err(e)) => {
                    self.state = ProtocolState::Closed;
                    return Err(MailFtsError::protocol(format!(
                        "failed to read from helper: {e}"
                    )));
                }
                Err(_) => {
                    self.timed_out = true;
                    return Err(self.state.on_timeout());
                }
            }
        }
    }

    /// Send one command and wait for its reply payload.
    pub async fn run(&mut self, command: &IndexerCommand) -> Result<String> {
        let request = self.state.begin_request(command)?;
        self.last_used = Instant::now();
        self.send(&request).await?;

        let outcome = self.wait_for_outcome().await;
        self.last_used = Instant::now();
        match outcome? {
            LineOutcome::Reply(Ok(payload)) => Ok(payload),
            LineOutcome::Reply(Err(failure)) => Err(MailFtsError::protocol(failure)),
            other => Err(MailFtsError::protocol(format!(
                "unexpected outcome {other:?}"
            ))),
        }
    }

    pub fn is_usable(&self) -> bool {
        self.state.is_ready()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Stop the helper: close its input and reap it, or kill it when it
    /// stopped answering or does not exit in time.
    pub async fn shutdown(mut self) {
        if !self.timed_out {
            self.stdin.take();
            let timeout = self.timeout;
            let drained = tokio::time::timeout(timeout, async {
                while let Ok(Some(line)) = self.lines.next_line().await {
                    log::debug!("helper: {line}");
                }
                self.child.wait().await
            })
            .await;
            match drained {
                Ok(Ok(status)) => {
                    log::debug!("helper exited: {status}");
                    return;
                }
                Ok(Err(e)) => log::warn!("failed to reap helper: {e}"),
                Err(_) => log::warn!("helper did not exit, killing it"),
            }
        }
        self.kill_and_reap().await;
    }

    /// [`CooperativeIndexer::shutdown`] for callers that cannot await. Blocks
    /// the calling thread for at most the indexer timeout plus a short grace
    /// period after the kill.
    pub fn shutdown_blocking(mut self) {
        if !self.timed_out {
            self.stdin.take();
            let deadline = Instant::now() + self.timeout;
            loop {
                match self.child.try_wait() {
                    Ok(Some(status)) => {
                        log::debug!("helper exited: {status}");
                        return;
                    }
                    Ok(None) if Instant::now() < deadline => {
                        std::thread::sleep(REAP_POLL_INTERVAL)
                    }
                    Ok(None) => {
                        log::warn!("helper did not exit, killing it");
                        break;
                    }
                    Err(e) => {
                        log::warn!("failed to reap helper: {e}");
                        break;
                    }
                }
            }
        }

        self.stdin.take();
        if let Err(e) = self.child.start_kill() {
            log::debug!("kill helper: {e}");
        }
        let deadline = Instant::now() + KILL_GRACE;
        while Instant::now() < deadline {
            match self.child.try_wait() {
                Ok(Some(_)) | Err(_) => return,
                Ok(None) => std::thread::sleep(REAP_POLL_INTERVAL),
            }
        }
        log::warn!("helper did not exit after being killed");
    }

    /// Kill the helper and wait for it to exit.
    async fn kill_and_reap(&mut self) {
        self.stdin.take();
        self.state = ProtocolState::Closed;
        if let Err(e) = self.child.kill().await {
            log::debug!("kill helper: {e}");
        }
    }
}
