//! The meta document.
//!
//! Fragment 0 carries one reserved document whose property blob records the
//! state of the whole index set: format version, mailbox uid validity,
//! fragment count, the highest indexed uid, and the expunges waiting for
//! compaction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::{DocumentId, DocumentSource, EngineIndex, EngineQuery};
use crate::error::{MailFtsError, Result};

/// Version written by this build.
pub const META_VERSION: u32 = 2;

/// Engine name of the meta document.
pub const META_DOCUMENT_NAME: &str = "meta";

/// Indexed text of the meta document, used to find it again.
const META_MARKER: &str = "mailftsmetadocument";

/// Persistent state of an index set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaDocument {
    pub version: u32,
    pub uid_validity: u32,
    pub fragment_count: u32,
    pub last_indexed_uid: u32,
    pub expunged_uids: Vec<u32>,
    pub deferred_since: Option<DateTime<Utc>>,
}

impl MetaDocument {
    /// State of a freshly created index set.
    pub fn new(uid_validity: u32) -> Self {
        MetaDocument {
            version: META_VERSION,
            uid_validity,
            fragment_count: 1,
            last_indexed_uid: 0,
            expunged_uids: Vec::new(),
            deferred_since: None,
        }
    }

    /// Merge uids into the deferred list, keeping it sorted and unique.
    pub fn defer_expunges(&mut self, uids: &[u32], now: DateTime<Utc>) {
        if uids.is_empty() {
            return;
        }
        if self.expunged_uids.is_empty() {
            self.deferred_since = Some(now);
        }
        self.expunged_uids.extend_from_slice(uids);
        self.expunged_uids.sort_unstable();
        self.expunged_uids.dedup();
    }

    pub fn clear_expunges(&mut self) {
        self.expunged_uids.clear();
        self.deferred_since = None;
    }

    pub fn is_expunged(&self, uid: u32) -> bool {
        self.expunged_uids.binary_search(&uid).is_ok()
    }
}

/// Result of reading the meta document.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaLoad {
    /// Usable state.
    Current(MetaDocument),
    /// Old version, other uid validity, or unreadable: rebuild.
    Stale(String),
    /// Written by a newer version: leave alone.
    Foreign(u32),
}

/// Reads and writes the meta document of fragment 0.
pub struct MetaStore;

impl MetaStore {
    fn locate(index: &dyn EngineIndex) -> Result<Option<DocumentId>> {
        let mut search = index.search(&EngineQuery::phrase(META_MARKER), false)?;
        while let Some(batch) = search.next_batch(16, None)? {
            if let Some(hit) = batch.iter().find(|hit| hit.name == META_DOCUMENT_NAME) {
                return Ok(Some(hit.id));
            }
        }
        Ok(None)
    }

    /// Read and classify the meta document.
    pub fn load(index: &dyn EngineIndex, uid_validity: u32) -> Result<MetaLoad> {
        let Some(id) = Self::locate(index)? else {
            return Ok(MetaLoad::Stale("meta document missing".to_string()));
        };
        let Some(blob) = index.get_properties(id)? else {
            return Ok(MetaLoad::Stale("meta document has no properties".to_string()));
        };

        // Check the version before the full shape so newer layouts are
        // recognised even when they no longer parse.
        let raw: serde_json::Value = match serde_json::from_slice(&blob) {
            Ok(raw) => raw,
            Err(e) => return Ok(MetaLoad::Stale(format!("unreadable meta document: {e}"))),
        };
        let version = raw.get("version").and_then(|v| v.as_u64()).unwrap_or(0);
        if version > u64::from(META_VERSION) {
            return Ok(MetaLoad::Foreign(u32::try_from(version).unwrap_or(u32::MAX)));
        }
        if version < u64::from(META_VERSION) {
            return Ok(MetaLoad::Stale(format!(
                "meta version {version}, expected {META_VERSION}"
            )));
        }

        let meta: MetaDocument = match serde_json::from_value(raw) {
            Ok(meta) => meta,
            Err(e) => return Ok(MetaLoad::Stale(format!("unreadable meta document: {e}"))),
        };
        if meta.uid_validity != uid_validity {
            return Ok(MetaLoad::Stale(format!(
                "uid validity changed from {} to {uid_validity}",
                meta.uid_validity
            )));
        }
        if meta.fragment_count == 0 {
            return Ok(MetaLoad::Stale("meta document lists no fragments".to_string()));
        }
        Ok(MetaLoad::Current(meta))
    }

    /// Load, turning anything but a current document into an error.
    pub fn load_current(index: &dyn EngineIndex, uid_validity: u32) -> Result<MetaDocument> {
        match Self::load(index, uid_validity)? {
            MetaLoad::Current(meta) => Ok(meta),
            MetaLoad::Stale(reason) => Err(MailFtsError::corrupt(reason)),
            MetaLoad::Foreign(version) => Err(MailFtsError::IndexForeign(format!(
                "meta version {version}"
            ))),
        }
    }

    /// Persist `meta`. Callers hold the write lock.
    pub fn save(index: &dyn EngineIndex, meta: &MetaDocument) -> Result<()> {
        let blob = serde_json::to_vec(meta)?;
        let id = match Self::locate(index)? {
            Some(id) => id,
            None => index.add_document(
                META_DOCUMENT_NAME,
                DocumentSource::Text(META_MARKER),
                "text/plain",
            )?,
        };
        index.set_properties(id, &blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{FileEngine, IndexSchema, SearchEngine};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn fresh_index(dir: &TempDir) -> Box<dyn EngineIndex> {
        FileEngine::new()
            .create_index(&dir.path().join("fragment.0.idx"), &IndexSchema::default())
            .unwrap()
    }

    #[test]
    fn test_fresh_meta_roundtrip() {
        let dir = TempDir::new().unwrap();
        let index = fresh_index(&dir);

        assert_eq!(
            MetaStore::load(index.as_ref(), 7).unwrap(),
            MetaLoad::Stale("meta document missing".to_string())
        );

        MetaStore::save(index.as_ref(), &MetaDocument::new(7)).unwrap();
        let meta = MetaStore::load_current(index.as_ref(), 7).unwrap();
        assert_eq!(meta.last_indexed_uid, 0);
        assert!(meta.expunged_uids.is_empty());
        assert_eq!(meta.fragment_count, 1);

        // saving again updates in place
        let mut meta = meta;
        meta.last_indexed_uid = 42;
        MetaStore::save(index.as_ref(), &meta).unwrap();
        assert_eq!(MetaStore::load_current(index.as_ref(), 7).unwrap(), meta);
        assert_eq!(index.document_count(), 1);
    }

    #[test]
    fn test_uid_validity_and_version_checks() {
        let dir = TempDir::new().unwrap();
        let index = fresh_index(&dir);

        MetaStore::save(index.as_ref(), &MetaDocument::new(7)).unwrap();
        assert!(matches!(
            MetaStore::load(index.as_ref(), 8).unwrap(),
            MetaLoad::Stale(_)
        ));

        let mut older = MetaDocument::new(7);
        older.version = META_VERSION - 1;
        MetaStore::save(index.as_ref(), &older).unwrap();
        assert!(matches!(
            MetaStore::load(index.as_ref(), 7).unwrap(),
            MetaLoad::Stale(_)
        ));

        let mut newer = MetaDocument::new(7);
        newer.version = META_VERSION + 1;
        MetaStore::save(index.as_ref(), &newer).unwrap();
        assert_eq!(
            MetaStore::load(index.as_ref(), 7).unwrap(),
            MetaLoad::Foreign(META_VERSION + 1)
        );
        assert!(matches!(
            MetaStore::load_current(index.as_ref(), 7),
            Err(MailFtsError::IndexForeign(_))
        ));
    }

    #[test]
    fn test_deferred_since_tracks_first_deferral() {
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();
        let mut meta = MetaDocument::new(1);

        meta.defer_expunges(&[5, 3], t1);
        meta.defer_expunges(&[3, 9], t2);
        assert_eq!(meta.expunged_uids, vec![3, 5, 9]);
        assert_eq!(meta.deferred_since, Some(t1));
        assert!(meta.is_expunged(5));

        meta.clear_expunges();
        assert_eq!(meta.deferred_since, None);
        meta.defer_expunges(&[1], t2);
        assert_eq!(meta.deferred_since, Some(t2));
    }
}
