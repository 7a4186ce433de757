//! Search engine capability.
//!
//! The mailbox index never implements inverted indexing itself. It talks to
//! an engine through [`SearchEngine`] (create/open index files) and
//! [`EngineIndex`] (documents, properties, search, flush, compact). The
//! crate ships [`FileEngine`], a single-file engine good enough for tests and
//! small mailboxes; other engines plug in through the same traits.

pub mod file;

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation;

use crate::error::{MailFtsError, Result};

pub use file::FileEngine;

/// Engine-assigned document id, only meaningful inside the fragment that
/// produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(u64);

impl DocumentId {
    /// Wrap an engine-internal id. Only engine implementations call this.
    pub fn from_engine(raw: u64) -> Self {
        DocumentId(raw)
    }

    /// The engine-internal value. Only engine implementations call this.
    pub fn engine_value(self) -> u64 {
        self.0
    }
}

/// A document id qualified by the fragment that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FragmentDocId {
    pub fragment: u32,
    pub id: DocumentId,
}

impl FragmentDocId {
    pub fn new(fragment: u32, id: DocumentId) -> Self {
        FragmentDocId { fragment, id }
    }
}

impl fmt::Display for FragmentDocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.fragment, self.id.0)
    }
}

/// Which part of a message a document was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    Header,
    Body,
    Shadow,
}

impl Location {
    pub fn as_str(self) -> &'static str {
        match self {
            Location::Header => "header",
            Location::Body => "body",
            Location::Shadow => "shadow",
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Location {
    type Err = MailFtsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "header" => Ok(Location::Header),
            "body" => Ok(Location::Body),
            "shadow" => Ok(Location::Shadow),
            _ => Err(MailFtsError::corrupt(format!("unknown document location {s:?}"))),
        }
    }
}

/// Identity of a mail document, rendered to the engine as `uid/where/seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentKey {
    pub uid: u32,
    pub location: Location,
    pub sequence: u32,
}

impl DocumentKey {
    pub fn new(uid: u32, location: Location, sequence: u32) -> Self {
        DocumentKey {
            uid,
            location,
            sequence,
        }
    }

    /// Parse an engine document name; `None` for names that are not mail
    /// documents (the meta document, foreign entries).
    pub fn parse(name: &str) -> Option<Self> {
        let mut parts = name.split('/');
        let uid = parts.next()?.parse().ok()?;
        let location = parts.next()?.parse().ok()?;
        let sequence = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(DocumentKey::new(uid, location, sequence))
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.uid, self.location, self.sequence)
    }
}

/// Document content handed to the engine.
#[derive(Debug, Clone, Copy)]
pub enum DocumentSource<'a> {
    Text(&'a str),
    Path(&'a Path),
}

/// Per-index settings fixed at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSchema {
    /// Terms shorter than this many characters are dropped.
    pub min_term_length: usize,
}

impl Default for IndexSchema {
    fn default() -> Self {
        IndexSchema { min_term_length: 1 }
    }
}

/// Lower-cased words of `text`, dropping words shorter than `min_len`.
///
/// Engines index documents with these terms, and searches use the same rule
/// to tell which query words can be looked up at all.
pub fn tokenize(text: &str, min_len: usize) -> Vec<String> {
    text.unicode_words()
        .filter(|word| word.chars().count() >= min_len)
        .map(str::to_lowercase)
        .collect()
}

/// How a query term must match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermKind {
    /// All words present and adjacent, in order.
    Phrase,
    /// The text occurs anywhere, possibly inside words.
    Substring,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineTerm {
    pub text: String,
    pub kind: TermKind,
}

/// Conjunction of terms evaluated per document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineQuery {
    pub terms: Vec<EngineTerm>,
}

impl EngineQuery {
    pub fn phrase<S: Into<String>>(text: S) -> Self {
        EngineQuery {
            terms: vec![EngineTerm {
                text: text.into(),
                kind: TermKind::Phrase,
            }],
        }
    }
}

/// One matching document.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineMatch {
    pub id: DocumentId,
    pub name: String,
    pub score: f32,
}

/// An in-progress search that yields matches in bounded batches.
pub trait EngineSearch: Send {
    /// Pull up to `max` matches, spending at most `budget`. Returns `None`
    /// once the search is exhausted; a batch may be empty when the budget ran
    /// out before anything matched.
    fn next_batch(&mut self, max: usize, budget: Option<Duration>)
    -> Result<Option<Vec<EngineMatch>>>;
}

/// An open index file.
pub trait EngineIndex: Send + Sync + fmt::Debug {
    /// Add a document and return its id.
    fn add_document(
        &self,
        name: &str,
        source: DocumentSource<'_>,
        content_type: &str,
    ) -> Result<DocumentId>;

    /// Replace the property blob of a document.
    fn set_properties(&self, id: DocumentId, properties: &[u8]) -> Result<()>;

    /// Property blob of a document, `None` when it has none or is gone.
    fn get_properties(&self, id: DocumentId) -> Result<Option<Vec<u8>>>;

    /// Remove a document; removing an unknown id is a no-op.
    fn remove_document(&self, id: DocumentId) -> Result<()>;

    /// Start a search.
    fn search<'a>(&'a self, query: &EngineQuery, scoring: bool)
    -> Result<Box<dyn EngineSearch + 'a>>;

    /// Persist pending changes.
    fn flush(&self) -> Result<()>;

    /// Reclaim space held by removed documents.
    fn compact(&self) -> Result<()>;

    /// Number of live documents.
    fn document_count(&self) -> u64;

    /// Bytes the index occupies on disk once flushed, unflushed changes
    /// included.
    fn size_bytes(&self) -> u64;
}

/// Factory for index files.
pub trait SearchEngine: Send + Sync + fmt::Debug {
    fn create_index(&self, path: &Path, schema: &IndexSchema) -> Result<Box<dyn EngineIndex>>;

    fn open_index(&self, path: &Path, writable: bool) -> Result<Box<dyn EngineIndex>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_key_names() {
        let key = DocumentKey::new(100, Location::Body, 2);
        assert_eq!(key.to_string(), "100/body/2");
        assert_eq!(DocumentKey::parse("100/body/2"), Some(key));
        assert_eq!(DocumentKey::parse("meta"), None);
        assert_eq!(DocumentKey::parse("1/attachment/0"), None);
        assert_eq!(DocumentKey::parse("1/body/0/extra"), None);
    }

    #[test]
    fn test_fragment_doc_id_serde() {
        let id = FragmentDocId::new(2, DocumentId::from_engine(17));
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#"{"fragment":2,"id":17}"#);
        assert_eq!(id.to_string(), "2.17");
    }
}
