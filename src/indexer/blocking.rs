//! Blocking transport: the caller's thread waits for the helper.
//!
//! A reader thread turns the helper's stdout into a channel of lines, so
//! every wait is a `recv_timeout` bounded by the indexer timeout.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};

use crate::config::HelperConfig;
use crate::error::{MailFtsError, Result};
use crate::indexer::protocol::{IndexerCommand, LineOutcome, ProtocolState, version_line};

/// A helper process driven from a blocking caller.
#[derive(Debug)]
pub struct BlockingIndexer {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Receiver<std::io::Result<String>>,
    state: ProtocolState,
    timeout: Duration,
    last_used: Instant,
    timed_out: bool,
    finished: bool,
}

impl BlockingIndexer {
    /// Start the helper and complete the handshake.
    pub fn spawn(helper: &HelperConfig, timeout: Duration) -> Result<Self> {
        let mut child = Command::new(&helper.program)
            .args(&helper.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                MailFtsError::process(format!(
                    "failed to start {}: {e}",
                    helper.program.display()
                ))
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(MailFtsError::process("failed to capture helper pipes"));
        };

        let (tx, lines) = unbounded();
        let reader = thread::Builder::new()
            .name("mailfts-helper-reader".to_string())
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
        if let Err(e) = reader {
            let _ = child.kill();
            let _ = child.wait();
            return Err(MailFtsError::process(format!(
                "failed to start helper reader: {e}"
            )));
        }

        log::debug!("spawned helper {} (pid {})", helper.program.display(), child.id());

        let mut indexer = BlockingIndexer {
            child,
            stdin: Some(stdin),
            lines,
            state: ProtocolState::AwaitingHandshake,
            timeout,
            last_used: Instant::now(),
            timed_out: false,
            finished: false,
        };

        let handshake = indexer
            .send(&format!("{}\n", version_line()))
            .and_then(|_| indexer.wait_for_outcome())
            .and_then(|outcome| match outcome {
                LineOutcome::HandshakeDone => Ok(()),
                other => Err(MailFtsError::protocol(format!(
                    "unexpected handshake outcome {other:?}"
                ))),
            });
        if let Err(e) = handshake {
            indexer.terminate();
            return Err(e);
        }
        Ok(indexer)
    }

    fn send(&mut self, line: &str) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| MailFtsError::protocol("helper input already closed"))?;
        stdin
            .write_all(line.as_bytes())
            .and_then(|_| stdin.flush())
            .map_err(|e| {
                self.state = ProtocolState::Closed;
                MailFtsError::protocol(format!("failed to write to helper: {e}"))
            })
    }

    fn wait_for_outcome(&mut self) -> Result<LineOutcome> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.lines.recv_timeout(remaining) {
                Ok(Ok(line)) => match self.state.on_line(&line)? {
                    LineOutcome::Pending => continue,
                    outcome => return Ok(outcome),
                },
                Ok(Err(e)) => {
                    self.state = ProtocolState::Closed;
                    return Err(MailFtsError::protocol(format!(
                        "failed to read from helper: {e}"
                    )));
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.timed_out = true;
                    return Err(self.state.on_timeout());
                }
                Err(RecvTimeoutError::Disconnected) => return Err(self.state.on_eof()),
            }
        }
    }

    /// Send one command and wait for its reply payload.
    pub fn run(&mut self, command: &IndexerCommand) -> Result<String> {
        let request = self.state.begin_request(command)?;
        self.last_used = Instant::now();
        self.send(&request)?;

        let outcome = self.wait_for_outcome();
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

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Stop the helper: close its input and reap it, or kill it when it
    /// stopped answering or does not exit in time.
    pub fn shutdown(mut self) {
        if self.timed_out {
            self.terminate();
        } else {
            self.close_gracefully();
        }
    }

    fn close_gracefully(&mut self) {
        self.stdin.take();
        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.lines.recv_timeout(remaining) {
                Ok(Ok(line)) => log::debug!("helper: {line}"),
                Ok(Err(_)) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    log::warn!("helper {} did not exit, killing it", self.child.id());
                    self.terminate();
                    return;
                }
            }
        }
        match self.child.wait() {
            Ok(status) => log::debug!("helper {} exited: {status}", self.child.id()),
            Err(e) => log::warn!("failed to reap helper {}: {e}", self.child.id()),
        }
        self.finished = true;
    }

    fn terminate(&mut self) {
        self.stdin.take();
        if let Err(e) = self.child.kill() {
            log::debug!("kill helper {}: {e}", self.child.id());
        }
        if let Err(e) = self.child.wait() {
            log::warn!("failed to reap helper {}: {e}", self.child.id());
        }
        self.state = ProtocolState::Closed;
        self.finished = true;
    }
}

impl Drop for BlockingIndexer {
    fn drop(&mut self) {
        if !self.finished {
            self.terminate();
        }
    }
}
