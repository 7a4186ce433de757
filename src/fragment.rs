//! Index sets and fragment allocation.
//!
//! An engine index can hold at most 2^32 documents, so a mailbox index is a
//! set of fragment files `fragment.<n>.idx`. Fragment 0 always exists and
//! carries the meta document; further fragments are created when the ones
//! in use grow past the size threshold.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::engine::{EngineIndex, IndexSchema, SearchEngine};
use crate::error::{MailFtsError, Result};
use crate::meta::{MetaDocument, MetaStore};

/// Name of the lock file guarding an index directory.
pub const LOCK_FILE_NAME: &str = "fragment.lock";

/// Path of fragment `number` inside `dir`.
pub fn fragment_path(dir: &Path, number: u32) -> PathBuf {
    dir.join(format!("fragment.{number}.idx"))
}

fn is_fragment_file(name: &str) -> bool {
    name.strip_prefix("fragment.")
        .and_then(|rest| rest.strip_suffix(".idx").or_else(|| rest.strip_suffix(".tmp")))
        .is_some_and(|number| number.parse::<u32>().is_ok())
}

/// The open fragments of one mailbox index.
#[derive(Debug)]
pub struct IndexSet {
    dir: PathBuf,
    engine: Arc<dyn SearchEngine>,
    schema: IndexSchema,
    writable: bool,
    fragment_count: u32,
    handles: BTreeMap<u32, Box<dyn EngineIndex>>,
}

impl IndexSet {
    /// Open fragment 0 of an existing set.
    pub fn open(
        dir: &Path,
        engine: Arc<dyn SearchEngine>,
        schema: IndexSchema,
        writable: bool,
    ) -> Result<Self> {
        let handle = engine.open_index(&fragment_path(dir, 0), writable)?;
        Ok(IndexSet {
            dir: dir.to_path_buf(),
            engine,
            schema,
            writable,
            fragment_count: 1,
            handles: BTreeMap::from([(0, handle)]),
        })
    }

    /// Create fragment 0 of a new set and write its meta document.
    pub fn create(
        dir: &Path,
        engine: Arc<dyn SearchEngine>,
        schema: IndexSchema,
        meta: &MetaDocument,
    ) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = fragment_path(dir, 0);
        let created = engine
            .create_index(&path, &schema)
            .and_then(|handle| {
                MetaStore::save(handle.as_ref(), meta)?;
                handle.flush()?;
                Ok(handle)
            });
        let handle = match created {
            Ok(handle) => handle,
            Err(e) => {
                remove_partial(&path);
                return Err(e);
            }
        };
        log::info!("created index set in {}", dir.display());

        Ok(IndexSet {
            dir: dir.to_path_buf(),
            engine,
            schema,
            writable: true,
            fragment_count: meta.fragment_count.max(1),
            handles: BTreeMap::from([(0, handle)]),
        })
    }

    /// Whether fragment 0 exists in `dir`.
    pub fn exists(dir: &Path) -> bool {
        fragment_path(dir, 0).exists()
    }

    /// Delete every fragment file in `dir`. The lock file stays.
    pub fn delete_all(dir: &Path) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if entry.file_name().to_str().is_some_and(is_fragment_file) {
                fs::remove_file(entry.path())?;
            }
        }
        log::warn!("deleted index set in {}", dir.display());
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn fragment_count(&self) -> u32 {
        self.fragment_count
    }

    /// Adopt the fragment count recorded in the meta document.
    pub fn set_fragment_count(&mut self, count: u32) {
        self.fragment_count = count.max(1);
    }

    /// Fragment 0, always open.
    pub fn primary(&self) -> Result<&dyn EngineIndex> {
        self.handles
            .get(&0)
            .map(|handle| handle.as_ref())
            .ok_or_else(|| MailFtsError::corrupt("fragment 0 is not open"))
    }

    /// Fragment `number`, opening it on first use.
    pub fn fragment(&mut self, number: u32) -> Result<&dyn EngineIndex> {
        if number >= self.fragment_count {
            return Err(MailFtsError::invalid_operation(format!(
                "fragment {number} does not exist ({} fragments)",
                self.fragment_count
            )));
        }
        if !self.handles.contains_key(&number) {
            let handle = self
                .engine
                .open_index(&fragment_path(&self.dir, number), self.writable)?;
            self.handles.insert(number, handle);
        }
        self.primary_or(number)
    }

    fn primary_or(&self, number: u32) -> Result<&dyn EngineIndex> {
        self.handles
            .get(&number)
            .map(|handle| handle.as_ref())
            .ok_or_else(|| MailFtsError::corrupt(format!("fragment {number} is not open")))
    }

    /// Open every fragment listed in the meta document.
    pub fn open_all(&mut self) -> Result<()> {
        for number in 0..self.fragment_count {
            self.fragment(number)?;
        }
        Ok(())
    }

    /// Open fragments in order. Call [`IndexSet::open_all`] first to see them all.
    pub fn open_fragments(&self) -> impl Iterator<Item = (u32, &dyn EngineIndex)> {
        self.handles
            .iter()
            .map(|(number, handle)| (*number, handle.as_ref()))
    }

    /// Size of fragment `number` once flushed (0 when missing). Open
    /// fragments count documents not yet written out.
    pub fn fragment_size(&self, number: u32) -> u64 {
        if let Some(handle) = self.handles.get(&number) {
            return handle.size_bytes();
        }
        fs::metadata(fragment_path(&self.dir, number))
            .map(|metadata| metadata.len())
            .unwrap_or(0)
    }

    /// Choose the fragment the next document goes to.
    ///
    /// `current` is kept while it stays below `threshold` with the pending
    /// bytes added; otherwise the first fragment with room for them is used,
    /// and when there is none a new fragment is created and recorded in
    /// `meta`. A document larger than the threshold gets a fresh fragment.
    pub fn assign_fragment(
        &mut self,
        current: Option<u32>,
        pending_bytes: u64,
        threshold: u64,
        meta: &mut MetaDocument,
    ) -> Result<u32> {
        if let Some(current) = current
            && current < self.fragment_count
            && self.fragment_size(current).saturating_add(pending_bytes) < threshold
        {
            return Ok(current);
        }

        if let Some(number) = (0..self.fragment_count)
            .find(|&number| self.fragment_size(number).saturating_add(pending_bytes) < threshold)
        {
            return Ok(number);
        }

        self.create_fragment(meta)
    }

    fn create_fragment(&mut self, meta: &mut MetaDocument) -> Result<u32> {
        if !self.writable {
            return Err(MailFtsError::invalid_operation(
                "creating a fragment requires the write lock",
            ));
        }

        let number = self.fragment_count;
        let path = fragment_path(&self.dir, number);
        let handle = match self.engine.create_index(&path, &self.schema) {
            Ok(handle) => handle,
            Err(e) => {
                remove_partial(&path);
                return Err(e);
            }
        };

        let mut updated = meta.clone();
        updated.fragment_count = number + 1;
        let persisted = self
            .primary()
            .and_then(|primary| MetaStore::save(primary, &updated).and_then(|_| primary.flush()));
        if let Err(e) = persisted {
            drop(handle);
            remove_partial(&path);
            return Err(e);
        }

        *meta = updated;
        self.fragment_count = number + 1;
        self.handles.insert(number, handle);
        log::info!("created fragment {number} in {}", self.dir.display());
        Ok(number)
    }

    pub fn flush_all(&self) -> Result<()> {
        for handle in self.handles.values() {
            handle.flush()?;
        }
        Ok(())
    }

    /// Compact every fragment; opens the ones not yet open.
    pub fn compact_all(&mut self) -> Result<()> {
        self.open_all()?;
        for (number, handle) in &self.handles {
            log::debug!("compacting fragment {number}");
            handle.compact()?;
        }
        Ok(())
    }
}

fn remove_partial(path: &Path) {
    if path.exists()
        && let Err(e) = fs::remove_file(path)
    {
        log::warn!("failed to remove partial fragment {}: {e}", path.display());
    }
}
