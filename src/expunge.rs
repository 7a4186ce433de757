//! Deferred expunges and compaction.
//!
//! Expunged uids are first collected in memory, then committed to the meta
//! document, where they hide the uid from searches. Compaction later removes
//! the uid's documents through its shadow and shrinks the fragments.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::IndexConfig;
use crate::error::Result;
use crate::fragment::IndexSet;
use crate::meta::{MetaDocument, MetaStore};
use crate::shadow::resolve_shadow;

/// Uids expunged in this process but not committed yet.
#[derive(Debug, Default, Clone)]
pub struct ExpungeManager {
    pending: BTreeSet<u32>,
}

impl ExpungeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defer(&mut self, uid: u32) {
        self.pending.insert(uid);
    }

    pub fn pending(&self) -> &BTreeSet<u32> {
        &self.pending
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Pending uids in ascending order, for merging into the meta document.
    /// The list stays until [`ExpungeManager::clear`] confirms the commit.
    pub fn to_commit(&self) -> Vec<u32> {
        self.pending.iter().copied().collect()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Forget the pending uids without committing them.
    pub fn cancel(&mut self) {
        if !self.pending.is_empty() {
            log::debug!("cancelled {} pending expunges", self.pending.len());
        }
        self.pending.clear();
    }
}

/// Where an index stands with its expunges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ExpungeState {
    Clean,
    Deferred {
        count: usize,
        since: Option<DateTime<Utc>>,
    },
}

impl ExpungeState {
    pub fn of(meta: &MetaDocument) -> Self {
        if meta.expunged_uids.is_empty() {
            ExpungeState::Clean
        } else {
            ExpungeState::Deferred {
                count: meta.expunged_uids.len(),
                since: meta.deferred_since,
            }
        }
    }
}

/// Whether enough expunges piled up, or waited long enough, to compact.
pub fn should_compact(meta: &MetaDocument, config: &IndexConfig, now: DateTime<Utc>) -> bool {
    if meta.expunged_uids.is_empty() {
        return false;
    }
    if meta.expunged_uids.len() >= config.compact_expunges as usize {
        return true;
    }
    meta.deferred_since
        .is_some_and(|since| now - since >= config.compact_age())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompactionStats {
    pub uids: usize,
    pub batches: usize,
    /// Real documents removed (already removed ones included).
    pub documents_removed: usize,
    pub shadows_removed: usize,
    /// Uids that had no shadow left.
    pub missing_shadows: usize,
}

/// Remove the documents of every deferred uid, then clear the list and
/// compact the fragments.
///
/// `meta` only changes when everything succeeded; on error the deferred list
/// is intact and the next compaction retries all of it. Callers hold the
/// write lock.
pub fn compact(
    set: &mut IndexSet,
    meta: &mut MetaDocument,
    batch_size: usize,
) -> Result<CompactionStats> {
    let mut stats = CompactionStats::default();
    if meta.expunged_uids.is_empty() {
        return Ok(stats);
    }
    set.open_all()?;

    for batch in meta.expunged_uids.chunks(batch_size.max(1)) {
        stats.batches += 1;
        for &uid in batch {
            stats.uids += 1;
            let Some(resolved) = resolve_shadow(set, uid)? else {
                log::debug!("uid {uid} has no shadow, nothing to remove");
                stats.missing_shadows += 1;
                continue;
            };
            for id in resolved.documents.iter().chain(&resolved.shadows) {
                set.fragment(id.fragment)?.remove_document(id.id)?;
            }
            stats.documents_removed += resolved.documents.len();
            stats.shadows_removed += resolved.shadows.len();
        }
        log::debug!(
            "compaction batch {} done ({} uids so far)",
            stats.batches,
            stats.uids
        );
    }

    let mut updated = meta.clone();
    updated.clear_expunges();
    MetaStore::save(set.primary()?, &updated)?;
    set.flush_all()?;
    set.compact_all()?;
    *meta = updated;

    log::info!(
        "compacted {}: {} uids, {} documents removed",
        set.dir().display(),
        stats.uids,
        stats.documents_removed
    );
    Ok(stats)
}
