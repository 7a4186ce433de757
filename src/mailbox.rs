//! The per-mailbox index.
//!
//! [`MailboxIndex`] is what a mail server holds for one mailbox. Every
//! operation takes the index lock for its duration, opens the index set,
//! checks the meta document, and rebuilds the set from scratch when it is
//! stale or unreadable.
//!
//! ```no_run
//! use mailfts::config::IndexConfig;
//! use mailfts::mailbox::MailboxIndex;
//! use mailfts::search::{MailQuery, SearchScope};
//!
//! # fn main() -> mailfts::error::Result<()> {
//! let mut index = MailboxIndex::open("/var/mail/alice/INBOX.fts", 1700000000, IndexConfig::default())?;
//!
//! let mut build = index.build_init()?;
//! build.begin_header(100)?;
//! build.append(b"Subject: hello")?;
//! build.begin_body(100, "text/plain", None)?;
//! build.append(b"hello world")?;
//! build.deinit(false)?;
//!
//! let result = index.lookup(&MailQuery::new().phrase("hello"), SearchScope::ALL)?;
//! assert!(result.definite.contains(&100));
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::build::BuildSession;
use crate::config::IndexConfig;
use crate::engine::{FileEngine, IndexSchema, SearchEngine};
use crate::error::{MailFtsError, Result};
use crate::expunge::{self, CompactionStats, ExpungeManager};
use crate::fragment::{IndexSet, LOCK_FILE_NAME};
use crate::lock::{IndexLock, LockMode, LockRegistry, OwnerToken};
use crate::meta::{MetaDocument, MetaStore};
use crate::search::{LookupResult, MailQuery, ScoredLookupResult, SearchExecutor, SearchScope};

/// An index set opened under the lock.
#[derive(Debug)]
pub(crate) struct LockedIndex {
    pub set: IndexSet,
    pub meta: MetaDocument,
    pub lock: IndexLock,
}

/// Summary of an index, as reported by [`MailboxIndex::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStatus {
    pub directory: PathBuf,
    pub exists: bool,
    pub uid_validity: u32,
    pub fragments: u32,
    pub fragment_sizes: Vec<u64>,
    pub documents: u64,
    pub last_indexed_uid: u32,
    pub deferred_expunges: usize,
    pub deferred_since: Option<DateTime<Utc>>,
    pub pending_expunges: usize,
}

/// Full-text index of one mailbox.
#[derive(Debug)]
pub struct MailboxIndex {
    dir: PathBuf,
    uid_validity: u32,
    config: IndexConfig,
    engine: Arc<dyn SearchEngine>,
    locks: Arc<LockRegistry>,
    token: OwnerToken,
    expunge: ExpungeManager,
    suspect: AtomicBool,
}

impl MailboxIndex {
    /// Open the index in `dir` with the built-in engine and a private lock
    /// registry. Nothing is touched on disk until the first operation.
    pub fn open<P: AsRef<Path>>(dir: P, uid_validity: u32, config: IndexConfig) -> Result<Self> {
        Self::with_engine(
            dir,
            uid_validity,
            config,
            Arc::new(FileEngine::new()),
            Arc::new(LockRegistry::new()),
        )
    }

    /// Open with an explicit engine and a lock registry shared with the other
    /// mailbox indexes of the process.
    pub fn with_engine<P: AsRef<Path>>(
        dir: P,
        uid_validity: u32,
        config: IndexConfig,
        engine: Arc<dyn SearchEngine>,
        locks: Arc<LockRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(MailboxIndex {
            dir: dir.as_ref().to_path_buf(),
            uid_validity,
            config,
            engine,
            locks,
            token: OwnerToken::new(),
            expunge: ExpungeManager::new(),
            suspect: AtomicBool::new(false),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn uid_validity(&self) -> u32 {
        self.uid_validity
    }

    pub fn token(&self) -> OwnerToken {
        self.token
    }

    /// Ask the next open to verify every fragment. Set after engine errors.
    pub(crate) fn mark_suspect(&self) {
        if !self.suspect.swap(true, Ordering::AcqRel) {
            log::warn!("index {} marked suspect", self.dir.display());
        }
    }

    fn schema(&self) -> IndexSchema {
        IndexSchema {
            min_term_length: self.config.min_term_length,
        }
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE_NAME)
    }

    /// Open the set and its meta document, verifying all fragments when the
    /// index was marked suspect.
    fn load(&self, writable: bool) -> Result<(IndexSet, MetaDocument)> {
        let mut set = IndexSet::open(&self.dir, Arc::clone(&self.engine), self.schema(), writable)?;
        let meta = MetaStore::load_current(set.primary()?, self.uid_validity)?;
        set.set_fragment_count(meta.fragment_count);
        if self.suspect.load(Ordering::Acquire) {
            set.open_all()?;
            self.suspect.store(false, Ordering::Release);
            log::info!("verified {} fragments of {}", set.fragment_count(), self.dir.display());
        }
        Ok((set, meta))
    }

    fn create(&self) -> Result<(IndexSet, MetaDocument)> {
        let meta = MetaDocument::new(self.uid_validity);
        let set = IndexSet::create(&self.dir, Arc::clone(&self.engine), self.schema(), &meta)?;
        self.suspect.store(false, Ordering::Release);
        Ok((set, meta))
    }

    /// Take the lock in `mode` and open the index set.
    ///
    /// A missing index is created under an exclusive lock and reported as
    /// `None` under a shared one. A stale or unreadable index is deleted and
    /// recreated; under a shared lock that needs a temporary upgrade. An index
    /// written by a newer version is reported as `IndexForeign`.
    pub(crate) fn open_locked(&self, mode: LockMode) -> Result<Option<LockedIndex>> {
        fs::create_dir_all(&self.dir)?;
        let mut lock = self
            .locks
            .lock(&self.lock_path(), mode, self.config.lock_timeout(), self.token)?;

        if !IndexSet::exists(&self.dir) {
            if mode == LockMode::Shared {
                return Ok(None);
            }
            let (set, meta) = self.create()?;
            return Ok(Some(LockedIndex { set, meta, lock }));
        }

        let reason = match self.load(mode == LockMode::Exclusive) {
            Ok((set, meta)) => return Ok(Some(LockedIndex { set, meta, lock })),
            Err(e) if e.needs_rebuild() => e,
            Err(e) => return Err(e),
        };

        if mode == LockMode::Shared && !lock.try_upgrade()? {
            drop(lock);
            lock = self.locks.lock(
                &self.lock_path(),
                LockMode::Exclusive,
                self.config.lock_timeout(),
                self.token,
            )?;
            // Someone may have rebuilt it while we waited.
            match self.load(false) {
                Ok((set, meta)) => {
                    lock.downgrade()?;
                    return Ok(Some(LockedIndex { set, meta, lock }));
                }
                Err(e) if e.needs_rebuild() => {}
                Err(e) => return Err(e),
            }
        }

        log::warn!("rebuilding index {}: {reason}", self.dir.display());
        IndexSet::delete_all(&self.dir)?;
        let (set, meta) = self.create()?;

        if mode == LockMode::Shared {
            drop(set);
            lock.downgrade()?;
            let (set, meta) = self.load(false)?;
            return Ok(Some(LockedIndex { set, meta, lock }));
        }
        Ok(Some(LockedIndex { set, meta, lock }))
    }

    fn open_exclusive(&self) -> Result<LockedIndex> {
        self.open_locked(LockMode::Exclusive)?
            .ok_or_else(|| MailFtsError::invalid_operation("exclusive open returned no index"))
    }

    /// Start an indexing pass. The session holds the write lock until it
    /// ends.
    pub fn build_init(&mut self) -> Result<BuildSession<'_>> {
        let LockedIndex { set, meta, lock } = self.open_exclusive()?;
        Ok(BuildSession::new(self, set, meta, lock))
    }

    /// Highest uid whose documents are in the index (0 for a new index).
    pub fn last_indexed_uid(&self) -> Result<u32> {
        Ok(self
            .open_locked(LockMode::Shared)?
            .map_or(0, |locked| locked.meta.last_indexed_uid))
    }

    /// Note an expunged uid. It is hidden from this index's searches at
    /// once, but only persisted by [`MailboxIndex::commit_expunges`].
    pub fn defer_expunge(&mut self, uid: u32) {
        self.expunge.defer(uid);
    }

    /// Persist the pending expunges. Returns how many were committed.
    pub fn commit_expunges(&mut self) -> Result<usize> {
        if !self.expunge.has_pending() {
            return Ok(0);
        }
        let LockedIndex { set, mut meta, lock } = self.open_exclusive()?;
        let uids = self.expunge.to_commit();
        meta.defer_expunges(&uids, Utc::now());
        MetaStore::save(set.primary()?, &meta)?;
        set.flush_all()?;
        drop(lock);

        self.expunge.clear();
        log::debug!(
            "committed {} expunges, {} now deferred in {}",
            uids.len(),
            meta.expunged_uids.len(),
            self.dir.display()
        );
        Ok(uids.len())
    }

    pub fn cancel_expunges(&mut self) {
        self.expunge.cancel();
    }

    pub fn pending_expunges(&self) -> &BTreeSet<u32> {
        self.expunge.pending()
    }

    /// Whether the committed expunges call for a compaction.
    pub fn should_compact(&self) -> Result<bool> {
        Ok(self
            .open_locked(LockMode::Shared)?
            .is_some_and(|locked| expunge::should_compact(&locked.meta, &self.config, Utc::now())))
    }

    /// Remove the documents of every committed expunge and compact the
    /// fragments.
    pub fn compact(&mut self) -> Result<CompactionStats> {
        let LockedIndex {
            mut set,
            mut meta,
            lock,
        } = self.open_exclusive()?;
        let stats = expunge::compact(&mut set, &mut meta, self.config.compact_batch_size)
            .inspect_err(|e| {
                if matches!(e, MailFtsError::Engine(_)) {
                    self.mark_suspect();
                }
            })?;
        drop(set);
        drop(lock);
        Ok(stats)
    }

    /// Commit pending expunges and compact when the thresholds say so.
    pub fn optimize(&mut self) -> Result<Option<CompactionStats>> {
        self.commit_expunges()?;
        if self.should_compact()? {
            return self.compact().map(Some);
        }
        Ok(None)
    }

    fn executor_excluded(&self, meta: &MetaDocument) -> BTreeSet<u32> {
        meta.expunged_uids
            .iter()
            .chain(self.expunge.pending())
            .copied()
            .collect()
    }

    fn with_searcher<T>(
        &self,
        search: impl FnOnce(&SearchExecutor<'_>) -> Result<T>,
    ) -> Result<Option<T>> {
        let Some(LockedIndex { mut set, meta, lock }) = self.open_locked(LockMode::Shared)? else {
            return Ok(None);
        };
        set.open_all()?;
        let executor = SearchExecutor::new(
            &set,
            self.executor_excluded(&meta),
            self.config.min_term_length,
            self.config.search_batch_size,
            self.config.search_budget(),
        );
        let result = search(&executor).inspect_err(|e| {
            if e.needs_rebuild() {
                self.mark_suspect();
            }
        });
        drop(executor);
        drop(set);
        drop(lock);
        result.map(Some)
    }

    /// Uids matching `query` within `scope`.
    pub fn lookup(&self, query: &MailQuery, scope: SearchScope) -> Result<LookupResult> {
        Ok(self
            .with_searcher(|executor| executor.lookup(query, scope))?
            .unwrap_or_default())
    }

    /// Uids matching every query, with summed scores ascending by uid.
    pub fn lookup_scored(
        &self,
        queries: &[MailQuery],
        scope: SearchScope,
    ) -> Result<ScoredLookupResult> {
        Ok(self
            .with_searcher(|executor| executor.lookup_scored(queries, scope))?
            .unwrap_or_default())
    }

    pub fn status(&self) -> Result<IndexStatus> {
        let mut status = IndexStatus {
            directory: self.dir.clone(),
            exists: false,
            uid_validity: self.uid_validity,
            fragments: 0,
            fragment_sizes: Vec::new(),
            documents: 0,
            last_indexed_uid: 0,
            deferred_expunges: 0,
            deferred_since: None,
            pending_expunges: self.expunge.pending().len(),
        };
        let Some(LockedIndex { mut set, meta, lock }) = self.open_locked(LockMode::Shared)? else {
            return Ok(status);
        };
        set.open_all()?;

        status.exists = true;
        status.fragments = set.fragment_count();
        status.fragment_sizes = (0..set.fragment_count())
            .map(|number| set.fragment_size(number))
            .collect();
        status.documents = set
            .open_fragments()
            .map(|(_, index)| index.document_count())
            .sum();
        status.last_indexed_uid = meta.last_indexed_uid;
        status.deferred_expunges = meta.expunged_uids.len();
        status.deferred_since = meta.deferred_since;
        drop(set);
        drop(lock);
        Ok(status)
    }

    /// Delete every fragment. The next operation starts from an empty index.
    pub fn delete(&mut self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let lock = self.locks.lock(
            &self.lock_path(),
            LockMode::Exclusive,
            self.config.lock_timeout(),
            self.token,
        )?;
        IndexSet::delete_all(&self.dir)?;
        self.expunge.clear();
        drop(lock);
        Ok(())
    }

    /// Delete and recreate the index, empty.
    pub fn rebuild(&mut self) -> Result<()> {
        self.delete()?;
        self.open_exclusive().map(drop)
    }
}
