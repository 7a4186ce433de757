//! Line protocol spoken with the indexer helper.
//!
//! ```text
//! core   -> helper   version 1
//! helper -> core     version 1
//! core   -> helper   3f9c0a17d2e4b865\tindex /spool/101.body.1.x1Y2.spill application/pdf
//! helper -> core     3f9c0a17d2e4b865\tOK\t/spool/101.body.1.x1Y2.spill.txt
//! ```
//!
//! [`ProtocolState`] is the single state machine both the blocking and the
//! cooperative transports feed lines into; the transports only differ in how
//! they wait for the next line.

use std::fmt;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{MailFtsError, Result};

/// Protocol version exchanged in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// The handshake line, without newline.
pub fn version_line() -> String {
    format!("version {PROTOCOL_VERSION}")
}

lazy_static! {
    /// Lines that system frameworks print on stdout before the helper gets
    /// a chance to answer the handshake.
    static ref NOISE_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"^\s*$").unwrap(),
        Regex::new(r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}(\.\d+)? \S+\[\d+:[0-9a-fA-Fx]+\] ").unwrap(),
        Regex::new(r"^objc\[\d+\]: ").unwrap(),
        Regex::new(r"^[\w.-]+\[\d+\]: ").unwrap(),
        Regex::new(r"^(WARNING|NOTE|DEBUG|INFO): ").unwrap(),
    ];
}

/// Whether `line` is recognised framework chatter.
pub fn is_noise(line: &str) -> bool {
    NOISE_PATTERNS.iter().any(|pattern| pattern.is_match(line))
}

/// Random per-request tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTag(String);

impl RequestTag {
    pub fn random() -> Self {
        RequestTag(format!("{:016x}", rand::random::<u64>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A request for the helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexerCommand {
    /// Extract the text of a spilled part.
    Index {
        path: PathBuf,
        content_type: String,
    },
    /// Produce the shadow text for a uid whose documents went through the
    /// helper.
    Shadow { path: PathBuf, ids: String },
}

impl IndexerCommand {
    /// The file the command works on.
    pub fn input_path(&self) -> &Path {
        match self {
            IndexerCommand::Index { path, .. } | IndexerCommand::Shadow { path, .. } => path,
        }
    }

    /// Where the helper has to put its text: the input path with `.txt`
    /// appended.
    pub fn output_path(&self) -> PathBuf {
        let mut output = self.input_path().as_os_str().to_owned();
        output.push(".txt");
        PathBuf::from(output)
    }
}

impl fmt::Display for IndexerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexerCommand::Index { path, content_type } => {
                write!(f, "index {} {content_type}", path.display())
            }
            IndexerCommand::Shadow { path, ids } => {
                write!(f, "shadow {} ids={ids}", path.display())
            }
        }
    }
}

/// Where a session is in the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolState {
    /// Version sent, waiting for the helper's version line.
    AwaitingHandshake,
    /// Ready for the next command.
    Ready,
    /// A command is outstanding.
    AwaitingReply { tag: RequestTag, command: String },
    /// Unusable; the session has to be torn down.
    Closed,
}

/// What a received line meant.
#[derive(Debug, PartialEq, Eq)]
pub enum LineOutcome {
    /// Nothing decided yet; keep reading.
    Pending,
    /// The handshake completed.
    HandshakeDone,
    /// The outstanding command got its answer.
    Reply(std::result::Result<String, String>),
}

impl ProtocolState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ProtocolState::Ready)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ProtocolState::Closed)
    }

    /// Move to `AwaitingReply` and return the request line to send.
    pub fn begin_request(&mut self, command: &IndexerCommand) -> Result<String> {
        if !self.is_ready() {
            return Err(MailFtsError::protocol(format!(
                "cannot send a command in state {self:?}"
            )));
        }
        let tag = RequestTag::random();
        let command = command.to_string();
        let line = format!("{tag}\t{command}\n");
        *self = ProtocolState::AwaitingReply { tag, command };
        Ok(line)
    }

    /// Feed one received line (without its newline).
    pub fn on_line(&mut self, line: &str) -> Result<LineOutcome> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        match self {
            ProtocolState::AwaitingHandshake => {
                if line == version_line() {
                    *self = ProtocolState::Ready;
                    Ok(LineOutcome::HandshakeDone)
                } else if let Some(version) = line.strip_prefix("version ") {
                    *self = ProtocolState::Closed;
                    Err(MailFtsError::protocol(format!(
                        "helper speaks version {version}, expected {PROTOCOL_VERSION}"
                    )))
                } else if is_noise(line) {
                    log::debug!("discarding helper noise: {line}");
                    Ok(LineOutcome::Pending)
                } else {
                    *self = ProtocolState::Closed;
                    Err(MailFtsError::protocol(format!(
                        "unexpected line before handshake: {line:?}"
                    )))
                }
            }
            ProtocolState::Ready => {
                log::debug!("helper: {line}");
                Ok(LineOutcome::Pending)
            }
            ProtocolState::AwaitingReply { tag, command } => {
                let Some(rest) = line
                    .strip_prefix(tag.as_str())
                    .and_then(|rest| rest.strip_prefix('\t'))
                else {
                    log::debug!("helper: {line}");
                    return Ok(LineOutcome::Pending);
                };

                if let Some(payload) = rest.strip_prefix("OK\t") {
                    let payload = payload.to_string();
                    *self = ProtocolState::Ready;
                    Ok(LineOutcome::Reply(Ok(payload)))
                } else if rest == "OK" {
                    *self = ProtocolState::Ready;
                    Ok(LineOutcome::Reply(Ok(String::new())))
                } else {
                    let failure = format!("{command}: {rest}");
                    *self = ProtocolState::Closed;
                    Ok(LineOutcome::Reply(Err(failure)))
                }
            }
            ProtocolState::Closed => Err(MailFtsError::protocol("session is closed")),
        }
    }

    /// The helper closed its output.
    pub fn on_eof(&mut self) -> MailFtsError {
        let previous = std::mem::replace(self, ProtocolState::Closed);
        MailFtsError::protocol(format!("helper closed its output in state {previous:?}"))
    }

    /// Nothing arrived in time.
    pub fn on_timeout(&mut self) -> MailFtsError {
        let previous = std::mem::replace(self, ProtocolState::Closed);
        MailFtsError::protocol(format!("helper timed out in state {previous:?}"))
    }
}
