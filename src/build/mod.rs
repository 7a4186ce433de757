//! The build pipeline.
//!
//! A [`BuildSession`] receives the parts of messages in uid order, buffers
//! each part, and turns it into one engine document when the next part
//! starts. Small text parts go straight into the engine; everything else is
//! spilled to disk and extracted by the helper. When a uid is complete its
//! shadow document is written, listing every document the uid produced.
//!
//! Documents live only in memory until commit, except that creating a
//! fragment writes fragment 0 out. A session that ends without committing
//! removes everything it added and writes the removals out when anything
//! reached disk.
//!
//! Flushing is queued as [`Action`]s. Preparing an action is plain
//! synchronous work; an action that needs the helper yields a [`HelperJob`],
//! which the blocking driver runs on the calling thread and the async driver
//! awaits. Both drivers complete the job the same way.

pub mod spill;

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

use crate::engine::{DocumentKey, DocumentSource, FragmentDocId, Location};
use crate::error::{MailFtsError, Result};
use crate::fragment::IndexSet;
use crate::indexer::{ExtractedText, IndexerCommand, IndexerSession, cooperative_available};
use crate::lock::IndexLock;
use crate::mailbox::MailboxIndex;
use crate::meta::{MetaDocument, MetaStore};
use crate::shadow::{ShadowProperties, ShadowRecorder, shadow_marker, write_shadow};

pub use spill::SpillFile;

lazy_static! {
    static ref FILENAME_PARAM: Regex =
        Regex::new(r#"(?i)filename\*?\s*=\s*"?([^";]+)"?"#).unwrap();
}

/// Content type with parameters stripped, lower-cased. Empty means
/// `text/plain`.
pub fn normalize_content_type(content_type: &str) -> String {
    let bare = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if bare.is_empty() {
        "text/plain".to_string()
    } else {
        bare
    }
}

/// Whether the engine can index this content type without the helper.
pub fn is_text_like(content_type: &str) -> bool {
    content_type == "text" || content_type.starts_with("text/")
}

/// Guess a content type from the filename in a Content-Disposition value.
pub fn content_type_from_disposition(disposition: &str) -> Option<&'static str> {
    let captures = FILENAME_PARAM.captures(disposition)?;
    let filename = captures.get(1)?.as_str().trim();
    // RFC 2231 values look like UTF-8''name.pdf
    let filename = filename.rsplit('\'').next().unwrap_or(filename);
    let extension = filename.rsplit_once('.')?.1.to_ascii_lowercase();

    let content_type = match extension.as_str() {
        "pdf" => "application/pdf",
        "txt" | "text" | "log" => "text/plain",
        "htm" | "html" => "text/html",
        "csv" => "text/csv",
        "md" => "text/markdown",
        "xml" => "text/xml",
        "ics" => "text/calendar",
        "rtf" => "application/rtf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "odt" => "application/vnd.oasis.opendocument.text",
        _ => return None,
    };
    Some(content_type)
}

/// The part being accumulated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildKey {
    pub key: DocumentKey,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildState {
    Idle,
    Accumulating(BuildKey),
    Flushing,
    Failed,
}

/// Counters reported when a session ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildStats {
    /// Documents added to the engine, shadows excluded.
    pub documents: usize,
    /// Parts that went through the helper.
    pub spilled: usize,
    /// Parts dropped because the helper failed on them.
    pub skipped: usize,
    pub shadows: usize,
    pub committed: bool,
    pub last_indexed_uid: u32,
}

#[derive(Debug)]
enum PartBuffer {
    Memory(Vec<u8>),
    Spilled(SpillFile),
}

impl PartBuffer {
    fn empty() -> Self {
        PartBuffer::Memory(Vec::new())
    }

    fn len(&self) -> u64 {
        match self {
            PartBuffer::Memory(bytes) => bytes.len() as u64,
            PartBuffer::Spilled(spill) => spill.len(),
        }
    }
}

#[derive(Debug)]
enum Action {
    FlushDocument { part: BuildKey, buffer: PartBuffer },
    FlushShadow,
}

#[derive(Debug)]
enum JobTarget {
    Document(BuildKey),
    Shadow(ShadowProperties),
}

/// Work that needs the helper. The spill file lives until the job is
/// completed.
#[derive(Debug)]
struct HelperJob {
    target: JobTarget,
    command: IndexerCommand,
    _spill: SpillFile,
}

enum Step {
    Done,
    Helper(HelperJob),
}

/// One indexing pass over a mailbox, holding its write lock.
#[derive(Debug)]
pub struct BuildSession<'a> {
    mailbox: &'a MailboxIndex,
    set: IndexSet,
    meta: MetaDocument,
    state: BuildState,
    buffer: PartBuffer,
    recorder: ShadowRecorder,
    last_uid: Option<u32>,
    body_sequence: u32,
    fragment: Option<u32>,
    fell_back: bool,
    indexer: Option<IndexerSession>,
    spill_dir: PathBuf,
    actions: VecDeque<Action>,
    stats: BuildStats,
    /// Every document added so far, shadows included.
    added: Vec<FragmentDocId>,
    /// Whether fragment files were written before commit.
    written_early: bool,
    lock: Option<IndexLock>,
}

impl<'a> BuildSession<'a> {
    pub(crate) fn new(
        mailbox: &'a MailboxIndex,
        set: IndexSet,
        meta: MetaDocument,
        lock: IndexLock,
    ) -> Self {
        let spill_dir = mailbox.config().spill_dir.resolve(mailbox.dir());
        log::debug!(
            "build session on {} (last indexed uid {})",
            mailbox.dir().display(),
            meta.last_indexed_uid
        );
        BuildSession {
            mailbox,
            set,
            meta,
            state: BuildState::Idle,
            buffer: PartBuffer::empty(),
            recorder: ShadowRecorder::new(),
            last_uid: None,
            body_sequence: 0,
            fragment: None,
            fell_back: false,
            indexer: None,
            spill_dir,
            actions: VecDeque::new(),
            stats: BuildStats::default(),
            added: Vec::new(),
            written_early: false,
            lock: Some(lock),
        }
    }

    pub fn state(&self) -> &BuildState {
        &self.state
    }

    pub fn stats(&self) -> &BuildStats {
        &self.stats
    }

    /// Highest uid persisted before this session started.
    pub fn last_indexed_uid(&self) -> u32 {
        self.meta.last_indexed_uid
    }

    /// Whether a part of this build already went through the helper.
    pub fn fell_back(&self) -> bool {
        self.fell_back
    }

    /// Start the header part of `uid`.
    pub fn begin_header(&mut self, uid: u32) -> Result<()> {
        let next = self.transition(uid, Some((Location::Header, "text/plain".to_string())))?;
        self.drive_blocking()?;
        self.state = next;
        Ok(())
    }

    /// Start a body part of `uid`. Returns `false` for multipart containers,
    /// which are not indexed themselves; the caller feeds their children.
    pub fn begin_body(
        &mut self,
        uid: u32,
        content_type: &str,
        disposition: Option<&str>,
    ) -> Result<bool> {
        let body = classify_body(content_type, disposition);
        let accepted = body.is_some();
        let next = self.transition(uid, body.map(|ct| (Location::Body, ct)))?;
        self.drive_blocking()?;
        self.state = next;
        Ok(accepted)
    }

    pub async fn begin_header_async(&mut self, uid: u32) -> Result<()> {
        let next = self.transition(uid, Some((Location::Header, "text/plain".to_string())))?;
        self.drive_async().await?;
        self.state = next;
        Ok(())
    }

    pub async fn begin_body_async(
        &mut self,
        uid: u32,
        content_type: &str,
        disposition: Option<&str>,
    ) -> Result<bool> {
        let body = classify_body(content_type, disposition);
        let accepted = body.is_some();
        let next = self.transition(uid, body.map(|ct| (Location::Body, ct)))?;
        self.drive_async().await?;
        self.state = next;
        Ok(accepted)
    }

    /// Add bytes to the current part. Parts that outgrow the accumulation
    /// limit continue in a spill file.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        self.check_usable()?;
        let BuildState::Accumulating(part) = &self.state else {
            return Err(MailFtsError::invalid_operation(
                "append without a current part",
            ));
        };

        let limit = self.mailbox.config().accumulation_limit_bytes as u64;
        let outgrown = matches!(&self.buffer, PartBuffer::Memory(_))
            && self.buffer.len() + data.len() as u64 > limit;
        let result = (|| -> Result<()> {
            if outgrown {
                let mut spill = SpillFile::create(&self.spill_dir, &part.key)?;
                if let PartBuffer::Memory(bytes) = &self.buffer {
                    spill.write(bytes)?;
                }
                self.buffer = PartBuffer::Spilled(spill);
            }
            match &mut self.buffer {
                PartBuffer::Memory(bytes) => bytes.extend_from_slice(data),
                PartBuffer::Spilled(spill) => spill.write(data)?,
            }
            Ok(())
        })();

        if result.is_err() {
            self.fail();
        }
        result
    }

    /// [`BuildSession::append`] for async callers. Appending only buffers or
    /// spills, so it never waits on the helper.
    pub async fn append_async(&mut self, data: &[u8]) -> Result<()> {
        self.append(data)
    }

    /// End the session. Unless cancelled, pending parts and the last shadow
    /// are flushed and the new last indexed uid is persisted. The helper is
    /// shut down and the write lock released in every case.
    pub fn deinit(mut self, cancel: bool) -> Result<BuildStats> {
        let result = match self.finish(cancel) {
            Ok(true) => self.drive_blocking().and_then(|_| self.commit()),
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        };
        if let Some(indexer) = self.indexer.take() {
            indexer.shutdown_blocking();
        }
        self.lock.take();
        self.report_abort(&result);
        result.map(|_| self.stats.clone())
    }

    pub async fn deinit_async(mut self, cancel: bool) -> Result<BuildStats> {
        let result = match self.finish(cancel) {
            Ok(true) => match self.drive_async().await {
                Ok(()) => self.commit(),
                Err(e) => Err(e),
            },
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        };
        if let Some(indexer) = self.indexer.take() {
            indexer.shutdown().await;
        }
        self.lock.take();
        self.report_abort(&result);
        result.map(|_| self.stats.clone())
    }

    fn report_abort(&self, result: &Result<()>) {
        if let Err(e) = result {
            log::info!(
                "build on {} aborted, nothing committed: {e}",
                self.mailbox.dir().display()
            );
        }
    }

    fn check_usable(&self) -> Result<()> {
        match self.state {
            BuildState::Failed => Err(MailFtsError::invalid_operation(
                "build session failed earlier",
            )),
            BuildState::Flushing => Err(MailFtsError::invalid_operation(
                "build session is still flushing",
            )),
            _ => Ok(()),
        }
    }

    /// Queue the flush of the current part (and of the previous uid's
    /// shadow when the uid changes) and return the state to enter once the
    /// queue has run.
    fn transition(&mut self, uid: u32, next: Option<(Location, String)>) -> Result<BuildState> {
        self.check_usable()?;
        if let Some(last) = self.last_uid
            && uid < last
        {
            self.fail();
            return Err(MailFtsError::UidOrder { uid, last });
        }

        self.queue_pending(Some(uid));
        if self.last_uid != Some(uid) {
            self.body_sequence = 0;
        }
        self.last_uid = Some(uid);

        Ok(match next {
            Some((Location::Body, content_type)) => {
                self.body_sequence += 1;
                BuildState::Accumulating(BuildKey {
                    key: DocumentKey::new(uid, Location::Body, self.body_sequence),
                    content_type,
                })
            }
            Some((location, content_type)) => BuildState::Accumulating(BuildKey {
                key: DocumentKey::new(uid, location, 0),
                content_type,
            }),
            None => BuildState::Idle,
        })
    }

    fn queue_pending(&mut self, next_uid: Option<u32>) {
        let previous = std::mem::replace(&mut self.state, BuildState::Flushing);
        let buffer = std::mem::replace(&mut self.buffer, PartBuffer::empty());
        if let BuildState::Accumulating(part) = previous {
            self.actions.push_back(Action::FlushDocument { part, buffer });
        }
        if self.last_uid.is_some() && self.last_uid != next_uid {
            self.actions.push_back(Action::FlushShadow);
        }
    }

    /// Returns whether the session should be committed.
    fn finish(&mut self, cancel: bool) -> Result<bool> {
        if self.state == BuildState::Failed {
            self.discard();
            return if cancel {
                Ok(false)
            } else {
                Err(MailFtsError::invalid_operation(
                    "build session failed earlier, nothing committed",
                ))
            };
        }
        if cancel {
            log::info!("build on {} cancelled", self.mailbox.dir().display());
            self.discard();
            return Ok(false);
        }
        self.queue_pending(None);
        Ok(true)
    }

    fn commit(&mut self) -> Result<()> {
        let mut meta = self.meta.clone();
        meta.last_indexed_uid = meta.last_indexed_uid.max(self.stats.last_indexed_uid);
        self.written_early = true;
        let result = self
            .set
            .primary()
            .and_then(|primary| MetaStore::save(primary, &meta))
            .and_then(|_| self.set.flush_all());
        match result {
            Ok(()) => {
                self.meta = meta;
                self.added.clear();
                self.written_early = false;
                self.state = BuildState::Idle;
                self.stats.last_indexed_uid = self.meta.last_indexed_uid;
                self.stats.committed = true;
                log::info!(
                    "committed build on {}: {} documents, {} through helper, {} skipped, last uid {}",
                    self.mailbox.dir().display(),
                    self.stats.documents,
                    self.stats.spilled,
                    self.stats.skipped,
                    self.meta.last_indexed_uid
                );
                Ok(())
            }
            Err(e) => {
                self.mailbox.mark_suspect();
                self.fail();
                Err(e)
            }
        }
    }

    fn discard(&mut self) {
        self.actions.clear();
        self.buffer = PartBuffer::empty();
        self.recorder.clear();
        self.roll_back();
    }

    /// Remove the documents added since the session started.
    fn roll_back(&mut self) {
        let added = std::mem::take(&mut self.added);
        for id in &added {
            let removed = self
                .set
                .fragment(id.fragment)
                .and_then(|fragment| fragment.remove_document(id.id));
            if let Err(e) = removed {
                log::warn!("failed to roll back document {id}: {e}");
            }
        }
        if !added.is_empty() {
            log::debug!("rolled back {} documents", added.len());
        }

        if self.written_early {
            self.written_early = false;
            let written = self
                .set
                .primary()
                .and_then(|primary| MetaStore::save(primary, &self.meta))
                .and_then(|_| self.set.flush_all());
            if let Err(e) = written {
                log::warn!(
                    "failed to write rollback on {}: {e}",
                    self.mailbox.dir().display()
                );
                self.mailbox.mark_suspect();
            }
        }
    }

    fn fail(&mut self) {
        self.discard();
        self.state = BuildState::Failed;
    }

    fn drive_blocking(&mut self) -> Result<()> {
        let result = (|| -> Result<()> {
            while let Some(action) = self.actions.pop_front() {
                if let Step::Helper(job) = self.prepare(action)? {
                    let extracted = self.helper_blocking(&job.command);
                    self.complete(job, extracted)?;
                }
            }
            Ok(())
        })();
        if result.is_err() {
            self.fail();
        }
        result
    }

    async fn drive_async(&mut self) -> Result<()> {
        let result = async {
            while let Some(action) = self.actions.pop_front() {
                if let Step::Helper(job) = self.prepare(action)? {
                    let extracted = self.helper_async(&job.command).await;
                    self.complete(job, extracted)?;
                }
            }
            Ok::<(), MailFtsError>(())
        }
        .await;
        if result.is_err() {
            self.fail();
        }
        result
    }

    fn helper_blocking(&mut self, command: &IndexerCommand) -> Result<ExtractedText> {
        let timeout = self.mailbox.config().indexer_timeout();
        let mut indexer = match self.indexer.take() {
            Some(indexer @ IndexerSession::Blocking(_))
                if indexer.is_usable() && indexer.idle_for() <= timeout =>
            {
                indexer
            }
            other => {
                if let Some(stale) = other {
                    log::debug!("retiring helper session");
                    stale.shutdown_blocking();
                }
                IndexerSession::start_blocking(&self.mailbox.config().helper, timeout)?
            }
        };

        let result = indexer.run_blocking(command);
        match &result {
            Ok(_) => self.indexer = Some(indexer),
            Err(e) => {
                log::warn!("helper failed on `{command}`: {e}");
                indexer.shutdown_blocking();
            }
        }
        result
    }

    async fn helper_async(&mut self, command: &IndexerCommand) -> Result<ExtractedText> {
        let timeout = self.mailbox.config().indexer_timeout();
        let mut indexer = match self.indexer.take() {
            Some(indexer) if indexer.is_usable() && indexer.idle_for() <= timeout => indexer,
            other => {
                if let Some(stale) = other {
                    log::debug!("retiring helper session");
                    stale.shutdown().await;
                }
                let helper = &self.mailbox.config().helper;
                if cooperative_available() {
                    IndexerSession::start_cooperative(helper, timeout).await?
                } else {
                    IndexerSession::start_blocking(helper, timeout)?
                }
            }
        };

        let result = indexer.run(command).await;
        match &result {
            Ok(_) => self.indexer = Some(indexer),
            Err(e) => {
                log::warn!("helper failed on `{command}`: {e}");
                indexer.shutdown().await;
            }
        }
        result
    }

    /// Pick the fragment for `pending_bytes` more data.
    fn place(&mut self, pending_bytes: u64) -> Result<u32> {
        let threshold = self.mailbox.config().fragment_threshold_bytes;
        let count = self.set.fragment_count();
        let number = self
            .set
            .assign_fragment(self.fragment, pending_bytes, threshold, &mut self.meta)?;
        if self.set.fragment_count() > count {
            self.written_early = true;
        }
        self.fragment = Some(number);
        Ok(number)
    }

    fn add_document(
        &mut self,
        part: &BuildKey,
        source: DocumentSource<'_>,
        size: u64,
    ) -> Result<()> {
        let number = self.place(size)?;
        let id = self
            .set
            .fragment(number)?
            .add_document(&part.key.to_string(), source, &part.content_type)
            .inspect_err(|_| self.mailbox.mark_suspect())?;
        let id = FragmentDocId::new(number, id);
        self.added.push(id);
        self.recorder.record(part.key.uid, id);
        self.stats.documents += 1;
        Ok(())
    }

    fn add_shadow(&mut self, properties: &ShadowProperties, text: &str) -> Result<()> {
        let number = self.place(text.len() as u64)?;
        let id = write_shadow(
            self.set.fragment(number)?,
            number,
            properties,
            DocumentSource::Text(text),
        )
        .inspect_err(|_| self.mailbox.mark_suspect())?;
        self.added.push(id);
        self.stats.shadows += 1;
        self.stats.last_indexed_uid = self.stats.last_indexed_uid.max(properties.uid);
        Ok(())
    }

    fn prepare(&mut self, action: Action) -> Result<Step> {
        match action {
            Action::FlushDocument { part, buffer } => {
                self.recorder.begin(part.key.uid);
                if buffer.len() == 0 {
                    log::debug!("{} is empty, not indexed", part.key);
                    return Ok(Step::Done);
                }

                let limit = self.mailbox.config().accumulation_limit_bytes;
                let mut spill = match buffer {
                    PartBuffer::Memory(bytes)
                        if is_text_like(&part.content_type)
                            && bytes.len() <= limit
                            && !self.fell_back =>
                    {
                        let text = String::from_utf8_lossy(&bytes);
                        self.add_document(&part, DocumentSource::Text(&text), bytes.len() as u64)?;
                        return Ok(Step::Done);
                    }
                    PartBuffer::Memory(bytes) => {
                        let mut spill = SpillFile::create(&self.spill_dir, &part.key)?;
                        spill.write(&bytes)?;
                        spill
                    }
                    PartBuffer::Spilled(spill) => spill,
                };
                spill.finish()?;

                if !self.fell_back {
                    log::info!("{} goes through the helper; so does the rest of this build", part.key);
                    self.fell_back = true;
                }
                self.stats.spilled += 1;
                Ok(Step::Helper(HelperJob {
                    command: IndexerCommand::Index {
                        path: spill.path().to_path_buf(),
                        content_type: part.content_type.clone(),
                    },
                    target: JobTarget::Document(part),
                    _spill: spill,
                }))
            }
            Action::FlushShadow => {
                let Some(properties) = self.recorder.take() else {
                    return Ok(Step::Done);
                };
                let marker = shadow_marker(properties.uid);
                if !self.fell_back {
                    self.add_shadow(&properties, &marker)?;
                    return Ok(Step::Done);
                }

                let key = DocumentKey::new(properties.uid, Location::Shadow, 0);
                let mut spill = SpillFile::create(&self.spill_dir, &key)?;
                spill.write(marker.as_bytes())?;
                spill.finish()?;
                Ok(Step::Helper(HelperJob {
                    command: IndexerCommand::Shadow {
                        path: spill.path().to_path_buf(),
                        ids: properties.ids_csv(),
                    },
                    target: JobTarget::Shadow(properties),
                    _spill: spill,
                }))
            }
        }
    }

    fn complete(&mut self, job: HelperJob, extracted: Result<ExtractedText>) -> Result<()> {
        match (job.target, extracted) {
            (JobTarget::Document(part), Ok(text)) => {
                let size = fs::metadata(text.path())?.len();
                self.add_document(&part, DocumentSource::Path(text.path()), size)
            }
            (JobTarget::Document(part), Err(e @ MailFtsError::IndexerProtocol(_))) => {
                log::warn!("skipping {}: {e}", part.key);
                self.stats.skipped += 1;
                Ok(())
            }
            (JobTarget::Document(_), Err(e)) => Err(e),
            (JobTarget::Shadow(properties), Ok(text)) => {
                let marker = shadow_marker(properties.uid);
                let content = fs::read_to_string(text.path())?;
                if tokenizes_to_marker(&content, &marker) {
                    self.add_shadow(&properties, &content)
                } else {
                    log::warn!(
                        "helper shadow for uid {} lacks its marker, writing it inline",
                        properties.uid
                    );
                    self.add_shadow(&properties, &marker)
                }
            }
            (JobTarget::Shadow(properties), Err(e)) => {
                log::warn!(
                    "helper failed on the shadow for uid {}, writing it inline: {e}",
                    properties.uid
                );
                let marker = shadow_marker(properties.uid);
                self.add_shadow(&properties, &marker)
            }
        }
    }
}

impl Drop for BuildSession<'_> {
    fn drop(&mut self) {
        self.discard();
        if let Some(indexer) = self.indexer.take() {
            indexer.shutdown_blocking();
        }
        self.lock.take();
    }
}

fn classify_body(content_type: &str, disposition: Option<&str>) -> Option<String> {
    let content_type = normalize_content_type(content_type);
    if content_type.starts_with("multipart/") {
        return None;
    }
    if content_type == "application/octet-stream"
        && let Some(inferred) = disposition.and_then(content_type_from_disposition)
    {
        return Some(inferred.to_string());
    }
    Some(content_type)
}

fn tokenizes_to_marker(content: &str, marker: &str) -> bool {
    content.split_whitespace().any(|word| word == marker)
}
