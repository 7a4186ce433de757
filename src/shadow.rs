//! Shadow documents.
//!
//! Every indexed message gets one small synthetic document whose text is a
//! marker derived from its uid and whose properties list the ids of all real
//! documents built for that uid, in whatever fragment they landed. Expunge
//! finds everything belonging to a uid with a single term query.

use serde::{Deserialize, Serialize};

use crate::engine::{
    DocumentKey, DocumentSource, EngineIndex, EngineQuery, FragmentDocId, Location,
};
use crate::error::{MailFtsError, Result};
use crate::fragment::IndexSet;

/// Indexed text of the shadow document for `uid`.
pub fn shadow_marker(uid: u32) -> String {
    format!("mailftsshadow{uid}")
}

/// Property blob of a shadow document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowProperties {
    pub uid: u32,
    pub shadow_ids: Vec<FragmentDocId>,
}

impl ShadowProperties {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// `ids=` argument for the helper's `shadow` command.
    pub fn ids_csv(&self) -> String {
        self.shadow_ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Collects the real document ids of the uid being built.
#[derive(Debug, Default)]
pub struct ShadowRecorder {
    uid: Option<u32>,
    ids: Vec<FragmentDocId>,
}

impl ShadowRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember that `id` was produced for `uid`.
    pub fn record(&mut self, uid: u32, id: FragmentDocId) {
        debug_assert!(self.uid.is_none_or(|current| current == uid));
        self.uid = Some(uid);
        self.ids.push(id);
    }

    /// Note that `uid` is being built even if it produces no documents.
    pub fn begin(&mut self, uid: u32) {
        if self.uid.is_none() {
            self.uid = Some(uid);
        }
    }

    pub fn uid(&self) -> Option<u32> {
        self.uid
    }

    /// Take the pending shadow, leaving the recorder empty.
    pub fn take(&mut self) -> Option<ShadowProperties> {
        let uid = self.uid.take()?;
        Some(ShadowProperties {
            uid,
            shadow_ids: std::mem::take(&mut self.ids),
        })
    }

    pub fn clear(&mut self) {
        self.uid = None;
        self.ids.clear();
    }
}

/// Add the shadow document for `properties` to `index`.
pub fn write_shadow(
    index: &dyn EngineIndex,
    fragment: u32,
    properties: &ShadowProperties,
    source: DocumentSource<'_>,
) -> Result<FragmentDocId> {
    let key = DocumentKey::new(properties.uid, Location::Shadow, 0);
    let id = index.add_document(&key.to_string(), source, "text/plain")?;
    index.set_properties(id, &properties.to_bytes()?)?;
    Ok(FragmentDocId::new(fragment, id))
}

/// Everything recorded for one uid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedShadow {
    /// The shadow documents themselves.
    pub shadows: Vec<FragmentDocId>,
    /// The real documents they list.
    pub documents: Vec<FragmentDocId>,
}

/// Find the shadow documents of `uid` across all open fragments.
///
/// `None` when the uid has no shadow; that only means there is nothing left
/// to remove for it.
pub fn resolve_shadow(set: &IndexSet, uid: u32) -> Result<Option<ResolvedShadow>> {
    let query = EngineQuery::phrase(shadow_marker(uid));
    let mut resolved = ResolvedShadow::default();

    for (number, index) in set.open_fragments() {
        let mut search = index.search(&query, false)?;
        while let Some(batch) = search.next_batch(16, None)? {
            for hit in batch {
                let is_shadow = DocumentKey::parse(&hit.name)
                    .is_some_and(|key| key.uid == uid && key.location == Location::Shadow);
                if !is_shadow {
                    continue;
                }
                resolved.shadows.push(FragmentDocId::new(number, hit.id));

                let Some(blob) = index.get_properties(hit.id)? else {
                    log::warn!("shadow for uid {uid} in fragment {number} has no properties");
                    continue;
                };
                let properties = ShadowProperties::from_bytes(&blob).map_err(|e| {
                    MailFtsError::corrupt(format!("shadow for uid {uid} is unreadable: {e}"))
                })?;
                resolved.documents.extend(properties.shadow_ids);
            }
        }
    }

    Ok((!resolved.shadows.is_empty()).then_some(resolved))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{FileEngine, IndexSchema};
    use crate::meta::MetaDocument;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_recorder_take() {
        let mut recorder = ShadowRecorder::new();
        assert!(recorder.take().is_none());

        recorder.begin(9);
        let empty = recorder.take().unwrap();
        assert_eq!(empty.uid, 9);
        assert!(empty.shadow_ids.is_empty());

        let id = FragmentDocId::new(0, crate::engine::DocumentId::from_engine(4));
        recorder.record(10, id);
        recorder.record(10, id);
        let props = recorder.take().unwrap();
        assert_eq!(props.shadow_ids.len(), 2);
        assert_eq!(props.ids_csv(), "0.4,0.4");
        assert!(recorder.uid().is_none());
    }

    #[test]
    fn test_resolve_spans_fragments() {
        let dir = TempDir::new().unwrap();
        let mut meta = MetaDocument::new(1);
        let mut set = IndexSet::create(
            dir.path(),
            Arc::new(FileEngine::new()),
            IndexSchema::default(),
            &meta,
        )
        .unwrap();

        let a = set
            .fragment(0)
            .unwrap()
            .add_document("5/header/0", DocumentSource::Text("Subject: a"), "text/plain")
            .unwrap();
        set.fragment(0).unwrap().flush().unwrap();
        let threshold = set.fragment_size(0);
        let second = set.assign_fragment(Some(0), 0, threshold, &mut meta).unwrap();
        assert_eq!(second, 1);
        let b = set
            .fragment(1)
            .unwrap()
            .add_document("5/body/1", DocumentSource::Text("body"), "text/plain")
            .unwrap();

        let properties = ShadowProperties {
            uid: 5,
            shadow_ids: vec![FragmentDocId::new(0, a), FragmentDocId::new(1, b)],
        };
        let marker = shadow_marker(5);
        write_shadow(
            set.fragment(1).unwrap(),
            1,
            &properties,
            DocumentSource::Text(&marker),
        )
        .unwrap();

        let resolved = resolve_shadow(&set, 5).unwrap().unwrap();
        assert_eq!(resolved.documents, properties.shadow_ids);
        assert_eq!(resolved.shadows.len(), 1);
        assert!(resolve_shadow(&set, 6).unwrap().is_none());
    }
}
