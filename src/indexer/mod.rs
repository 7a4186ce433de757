//! External indexer sessions.
//!
//! Content the core should not parse itself (anything that is not plain text,
//! or too large to keep in memory) is spilled to a file and handed to a helper
//! process. The helper answers with the path of a text file, which the core
//! then adds to the engine, so the engine only ever has one writer.

pub mod blocking;
pub mod cooperative;
pub mod protocol;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::HelperConfig;
use crate::error::{MailFtsError, Result};

pub use blocking::BlockingIndexer;
pub use cooperative::CooperativeIndexer;
pub use protocol::{IndexerCommand, PROTOCOL_VERSION};

/// How a session waits for the helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// The calling thread blocks.
    Synchronous,
    /// The calling task yields to the tokio scheduler.
    Cooperative,
}

impl ExecMode {
    /// Cooperative when called from inside a tokio runtime.
    pub fn detect() -> Self {
        if cooperative_available() {
            ExecMode::Cooperative
        } else {
            ExecMode::Synchronous
        }
    }
}

/// Whether a tokio runtime is driving the current thread.
pub fn cooperative_available() -> bool {
    tokio::runtime::Handle::try_current().is_ok()
}

/// One live helper connection.
#[derive(Debug)]
pub enum IndexerSession {
    Blocking(BlockingIndexer),
    Cooperative(CooperativeIndexer),
}

impl IndexerSession {
    pub fn start_blocking(helper: &HelperConfig, timeout: Duration) -> Result<Self> {
        BlockingIndexer::spawn(helper, timeout).map(IndexerSession::Blocking)
    }

    pub async fn start_cooperative(helper: &HelperConfig, timeout: Duration) -> Result<Self> {
        CooperativeIndexer::spawn(helper, timeout)
            .await
            .map(IndexerSession::Cooperative)
    }

    pub fn mode(&self) -> ExecMode {
        match self {
            IndexerSession::Blocking(_) => ExecMode::Synchronous,
            IndexerSession::Cooperative(_) => ExecMode::Cooperative,
        }
    }

    pub fn is_usable(&self) -> bool {
        match self {
            IndexerSession::Blocking(indexer) => indexer.is_usable(),
            IndexerSession::Cooperative(indexer) => indexer.is_usable(),
        }
    }

    pub fn idle_for(&self) -> Duration {
        match self {
            IndexerSession::Blocking(indexer) => indexer.idle_for(),
            IndexerSession::Cooperative(indexer) => indexer.idle_for(),
        }
    }

    /// Run a command from blocking code.
    pub fn run_blocking(&mut self, command: &IndexerCommand) -> Result<ExtractedText> {
        match self {
            IndexerSession::Blocking(indexer) => indexer
                .run(command)
                .and_then(|payload| ExtractedText::new(&payload, command)),
            IndexerSession::Cooperative(_) => Err(MailFtsError::invalid_operation(
                "cooperative helper session driven from blocking code",
            )),
        }
    }

    /// Run a command from async code.
    pub async fn run(&mut self, command: &IndexerCommand) -> Result<ExtractedText> {
        let payload = match self {
            IndexerSession::Blocking(indexer) => indexer.run(command),
            IndexerSession::Cooperative(indexer) => indexer.run(command).await,
        };
        payload.and_then(|payload| ExtractedText::new(&payload, command))
    }

    /// Tear down from blocking code. Both transports close the helper's
    /// input first and kill it only when it does not exit in time.
    pub fn shutdown_blocking(self) {
        match self {
            IndexerSession::Blocking(indexer) => indexer.shutdown(),
            IndexerSession::Cooperative(indexer) => indexer.shutdown_blocking(),
        }
    }

    pub async fn shutdown(self) {
        match self {
            IndexerSession::Blocking(indexer) => indexer.shutdown(),
            IndexerSession::Cooperative(indexer) => indexer.shutdown().await,
        }
    }
}

/// Text file produced by the helper. Removed when dropped.
#[derive(Debug)]
pub struct ExtractedText {
    path: PathBuf,
}

impl ExtractedText {
    /// Accept the helper's reply to `command`. The helper may only hand back
    /// the command's own output file, and that file must be a regular file.
    fn new(payload: &str, command: &IndexerCommand) -> Result<Self> {
        let expected = command.output_path();
        let reported = PathBuf::from(payload.trim());
        let same_path = reported == expected
            || matches!(
                (fs::canonicalize(&reported), fs::canonicalize(&expected)),
                (Ok(a), Ok(b)) if a == b
            );
        if !same_path {
            discard_output(&expected);
            return Err(MailFtsError::protocol(format!(
                "helper answered {payload:?}, expected {}",
                expected.display()
            )));
        }

        match fs::symlink_metadata(&expected) {
            Ok(metadata) if metadata.is_file() => Ok(ExtractedText { path: expected }),
            Ok(_) => {
                discard_output(&expected);
                Err(MailFtsError::protocol(format!(
                    "helper output {} is not a regular file",
                    expected.display()
                )))
            }
            Err(_) => Err(MailFtsError::protocol(format!(
                "helper reported missing output {payload:?}"
            ))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ExtractedText {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            log::warn!("failed to remove {}: {e}", self.path.display());
        }
    }
}

/// Remove a rejected output entry. A symlink is removed, never its target.
fn discard_output(path: &Path) {
    if fs::symlink_metadata(path).is_ok()
        && let Err(e) = fs::remove_file(path)
    {
        log::warn!("failed to remove {}: {e}", path.display());
    }
}
