//! Single-file search engine.
//!
//! Each index lives in one file: a small header (magic, format version,
//! CRC32 of the payload) followed by a bincode payload holding every
//! document's token stream and property blob. The whole index is loaded on
//! open and rewritten on flush, which keeps the engine simple and makes file
//! size track document volume the way the fragment allocator expects.
//!
//! A term to document map is kept in memory and rebuilt on open. Phrase
//! terms narrow a search to the documents holding every phrase word;
//! substring-only searches scan all live documents.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::engine::{
    DocumentId, DocumentSource, EngineIndex, EngineMatch, EngineQuery, EngineSearch, IndexSchema,
    SearchEngine, TermKind, tokenize,
};
use crate::error::{MailFtsError, Result};

const MAGIC: &[u8; 4] = b"MFTS";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 12;

/// Engine storing each index in a single file.
#[derive(Debug, Default, Clone)]
pub struct FileEngine;

impl FileEngine {
    pub fn new() -> Self {
        FileEngine
    }
}

impl SearchEngine for FileEngine {
    fn create_index(&self, path: &Path, schema: &IndexSchema) -> Result<Box<dyn EngineIndex>> {
        if path.exists() {
            return Err(MailFtsError::engine(format!(
                "index already exists: {}",
                path.display()
            )));
        }

        let index = FileIndex {
            path: path.to_path_buf(),
            writable: true,
            data: RwLock::new(IndexData {
                schema: schema.clone(),
                next_id: 1,
                documents: BTreeMap::new(),
                postings: AHashMap::new(),
            }),
            dirty: AtomicBool::new(true),
        };
        index.flush()?;
        Ok(Box::new(index))
    }

    fn open_index(&self, path: &Path, writable: bool) -> Result<Box<dyn EngineIndex>> {
        let mut data = read_index_file(path)?;
        data.rebuild_postings();
        Ok(Box::new(FileIndex {
            path: path.to_path_buf(),
            writable,
            data: RwLock::new(data),
            dirty: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredDocument {
    name: String,
    content_type: String,
    tokens: Vec<String>,
    properties: Option<Vec<u8>>,
    removed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexData {
    schema: IndexSchema,
    next_id: u64,
    documents: BTreeMap<u64, StoredDocument>,
    #[serde(skip)]
    postings: AHashMap<String, BTreeSet<u64>>,
}

impl IndexData {
    fn rebuild_postings(&mut self) {
        self.postings.clear();
        for (id, doc) in self.documents.iter().filter(|(_, doc)| !doc.removed) {
            for token in &doc.tokens {
                self.postings.entry(token.clone()).or_default().insert(*id);
            }
        }
    }

    fn post(&mut self, id: u64, tokens: &[String]) {
        for token in tokens {
            self.postings.entry(token.clone()).or_default().insert(id);
        }
    }

    fn unpost(&mut self, id: u64, tokens: &[String]) {
        for token in tokens {
            if let Some(ids) = self.postings.get_mut(token) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.postings.remove(token);
                }
            }
        }
    }

    /// Live documents that can match `terms`, in id order.
    fn candidates(&self, terms: &[PreparedTerm]) -> Vec<u64> {
        let mut narrowed: Option<BTreeSet<u64>> = None;
        let words = terms
            .iter()
            .filter_map(|term| match term {
                PreparedTerm::Phrase(words) => Some(words),
                PreparedTerm::Substring(_) => None,
            })
            .flatten();
        for word in words {
            let ids = self.postings.get(word).cloned().unwrap_or_default();
            narrowed = Some(match narrowed {
                Some(current) => current.intersection(&ids).copied().collect(),
                None => ids,
            });
        }

        match narrowed {
            Some(ids) => ids.into_iter().collect(),
            None => self
                .documents
                .iter()
                .filter(|(_, doc)| !doc.removed)
                .map(|(id, _)| *id)
                .collect(),
        }
    }
}

#[derive(Debug)]
struct FileIndex {
    path: PathBuf,
    writable: bool,
    data: RwLock<IndexData>,
    dirty: AtomicBool,
}

impl FileIndex {
    fn check_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(MailFtsError::engine(format!(
                "index opened read-only: {}",
                self.path.display()
            )))
        }
    }

    fn write_file(&self, data: &IndexData) -> Result<()> {
        let payload = bincode::serialize(data)?;
        let checksum = crc32fast::hash(&payload);

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(MAGIC)?;
            file.write_all(&FORMAT_VERSION.to_le_bytes())?;
            file.write_all(&checksum.to_le_bytes())?;
            file.write_all(&payload)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

fn read_index_file(path: &Path) -> Result<IndexData> {
    let mut file = File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            MailFtsError::engine(format!("index not found: {}", path.display()))
        } else {
            MailFtsError::Io(e)
        }
    })?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;

    if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
        return Err(MailFtsError::corrupt(format!(
            "not an index file: {}",
            path.display()
        )));
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != FORMAT_VERSION {
        return Err(MailFtsError::corrupt(format!(
            "unsupported index format {version}: {}",
            path.display()
        )));
    }
    let checksum = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    let payload = &bytes[HEADER_LEN..];
    if crc32fast::hash(payload) != checksum {
        return Err(MailFtsError::corrupt(format!(
            "checksum mismatch: {}",
            path.display()
        )));
    }

    bincode::deserialize(payload)
        .map_err(|e| MailFtsError::corrupt(format!("{}: {e}", path.display())))
}

fn phrase_hits(tokens: &[String], phrase: &[String]) -> usize {
    if phrase.is_empty() || phrase.len() > tokens.len() {
        return 0;
    }
    tokens
        .windows(phrase.len())
        .filter(|window| *window == phrase)
        .count()
}

fn substring_hits(joined: &str, needle: &str) -> usize {
    if needle.is_empty() {
        return 0;
    }
    joined.matches(needle).count()
}

enum PreparedTerm {
    Phrase(Vec<String>),
    Substring(String),
}

impl EngineIndex for FileIndex {
    fn add_document(
        &self,
        name: &str,
        source: DocumentSource<'_>,
        content_type: &str,
    ) -> Result<DocumentId> {
        self.check_writable()?;

        let text = match source {
            DocumentSource::Text(text) => text.to_string(),
            DocumentSource::Path(path) => {
                String::from_utf8_lossy(&fs::read(path)?).into_owned()
            }
        };

        let mut data = self.data.write();
        if data.next_id > u64::from(u32::MAX) {
            return Err(MailFtsError::engine(format!(
                "document ceiling reached in {}",
                self.path.display()
            )));
        }
        let tokens = tokenize(&text, data.schema.min_term_length);
        let id = data.next_id;
        data.next_id += 1;
        data.post(id, &tokens);
        data.documents.insert(
            id,
            StoredDocument {
                name: name.to_string(),
                content_type: content_type.to_string(),
                tokens,
                properties: None,
                removed: false,
            },
        );
        self.dirty.store(true, Ordering::Release);

        Ok(DocumentId::from_engine(id))
    }

    fn set_properties(&self, id: DocumentId, properties: &[u8]) -> Result<()> {
        self.check_writable()?;

        let mut data = self.data.write();
        match data.documents.get_mut(&id.engine_value()) {
            Some(doc) if !doc.removed => {
                doc.properties = Some(properties.to_vec());
                self.dirty.store(true, Ordering::Release);
                Ok(())
            }
            _ => Err(MailFtsError::engine(format!(
                "no document {} in {}",
                id.engine_value(),
                self.path.display()
            ))),
        }
    }

    fn get_properties(&self, id: DocumentId) -> Result<Option<Vec<u8>>> {
        let data = self.data.read();
        Ok(data
            .documents
            .get(&id.engine_value())
            .filter(|doc| !doc.removed)
            .and_then(|doc| doc.properties.clone()))
    }

    fn remove_document(&self, id: DocumentId) -> Result<()> {
        self.check_writable()?;

        let mut data = self.data.write();
        let tokens = match data.documents.get_mut(&id.engine_value()) {
            Some(doc) if !doc.removed => {
                doc.removed = true;
                doc.properties = None;
                std::mem::take(&mut doc.tokens)
            }
            _ => return Ok(()),
        };
        data.unpost(id.engine_value(), &tokens);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn search<'a>(
        &'a self,
        query: &EngineQuery,
        scoring: bool,
    ) -> Result<Box<dyn EngineSearch + 'a>> {
        let data = self.data.read();
        let min_len = data.schema.min_term_length;
        let terms = query
            .terms
            .iter()
            .map(|term| match term.kind {
                TermKind::Phrase => PreparedTerm::Phrase(tokenize(&term.text, min_len)),
                TermKind::Substring => PreparedTerm::Substring(term.text.to_lowercase()),
            })
            .collect::<Vec<_>>();
        let candidates = data.candidates(&terms);

        Ok(Box::new(FileSearch {
            index: self,
            terms,
            scoring,
            candidates,
            cursor: 0,
        }))
    }

    fn flush(&self) -> Result<()> {
        if !self.dirty.load(Ordering::Acquire) {
            return Ok(());
        }
        self.check_writable()?;

        let data = self.data.read();
        self.write_file(&data)?;
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    fn compact(&self) -> Result<()> {
        self.check_writable()?;

        let mut data = self.data.write();
        let before = data.documents.len();
        data.documents.retain(|_, doc| !doc.removed);
        log::debug!(
            "compacted {}: {} -> {} documents",
            self.path.display(),
            before,
            data.documents.len()
        );
        self.write_file(&data)?;
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    fn document_count(&self) -> u64 {
        self.data
            .read()
            .documents
            .values()
            .filter(|doc| !doc.removed)
            .count() as u64
    }

    fn size_bytes(&self) -> u64 {
        let payload = bincode::serialized_size(&*self.data.read()).unwrap_or(0);
        HEADER_LEN as u64 + payload
    }
}

struct FileSearch<'a> {
    index: &'a FileIndex,
    terms: Vec<PreparedTerm>,
    scoring: bool,
    candidates: Vec<u64>,
    cursor: usize,
}

impl FileSearch<'_> {
    fn score(&self, doc: &StoredDocument) -> Option<f32> {
        if self.terms.is_empty() {
            return None;
        }
        let joined = doc.tokens.join(" ");
        let mut total = 0usize;
        for term in &self.terms {
            let hits = match term {
                PreparedTerm::Phrase(phrase) => phrase_hits(&doc.tokens, phrase),
                PreparedTerm::Substring(needle) => substring_hits(&joined, needle),
            };
            if hits == 0 {
                return None;
            }
            total += hits;
        }
        Some(if self.scoring { total as f32 } else { 0.0 })
    }
}

impl EngineSearch for FileSearch<'_> {
    fn next_batch(
        &mut self,
        max: usize,
        budget: Option<Duration>,
    ) -> Result<Option<Vec<EngineMatch>>> {
        if self.cursor >= self.candidates.len() {
            return Ok(None);
        }

        let started = Instant::now();
        let index = self.index;
        let data = index.data.read();
        let mut batch = Vec::new();

        while self.cursor < self.candidates.len() && batch.len() < max.max(1) {
            let id = self.candidates[self.cursor];
            self.cursor += 1;

            if let Some(doc) = data.documents.get(&id).filter(|doc| !doc.removed)
                && let Some(score) = self.score(doc)
            {
                batch.push(EngineMatch {
                    id: DocumentId::from_engine(id),
                    name: doc.name.clone(),
                    score,
                });
            }

            if budget.is_some_and(|budget| started.elapsed() >= budget) {
                break;
            }
        }

        Ok(Some(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineTerm;
    use tempfile::TempDir;

    fn drain(search: &mut dyn EngineSearch) -> Vec<EngineMatch> {
        let mut all = Vec::new();
        while let Some(batch) = search.next_batch(2, None).unwrap() {
            all.extend(batch);
        }
        all
    }

    fn create(dir: &TempDir) -> Box<dyn EngineIndex> {
        FileEngine::new()
            .create_index(&dir.path().join("test.idx"), &IndexSchema::default())
            .unwrap()
    }

    #[test]
    fn test_phrase_and_substring_search() {
        let dir = TempDir::new().unwrap();
        let index = create(&dir);

        index
            .add_document("1/body/0", DocumentSource::Text("Hello brave new world"), "text/plain")
            .unwrap();
        index
            .add_document("2/body/0", DocumentSource::Text("world, hello!"), "text/plain")
            .unwrap();

        let phrase = EngineQuery::phrase("hello brave");
        let hits = drain(index.search(&phrase, false).unwrap().as_mut());
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "1/body/0");

        let substring = EngineQuery {
            terms: vec![EngineTerm {
                text: "ORL".to_string(),
                kind: TermKind::Substring,
            }],
        };
        let hits = drain(index.search(&substring, true).unwrap().as_mut());
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|hit| hit.score >= 1.0));
    }

    #[test]
    fn test_flush_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.idx");
        let index = create(&dir);

        let id = index
            .add_document("meta", DocumentSource::Text("marker"), "text/plain")
            .unwrap();
        index.set_properties(id, b"{\"a\":1}").unwrap();
        index.flush().unwrap();
        drop(index);

        let reopened = FileEngine::new().open_index(&path, false).unwrap();
        assert_eq!(reopened.document_count(), 1);
        assert_eq!(reopened.get_properties(id).unwrap().unwrap(), b"{\"a\":1}");
        assert!(reopened.remove_document(id).is_err());
    }

    #[test]
    fn test_remove_is_idempotent_and_compact_shrinks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.idx");
        let index = create(&dir);

        let text = "lorem ipsum dolor sit amet ".repeat(200);
        let id = index
            .add_document("1/body/0", DocumentSource::Text(&text), "text/plain")
            .unwrap();
        index.flush().unwrap();
        let size_before = fs::metadata(&path).unwrap().len();

        index.remove_document(id).unwrap();
        index.remove_document(id).unwrap();
        index.remove_document(DocumentId::from_engine(999)).unwrap();
        index.compact().unwrap();

        assert_eq!(index.document_count(), 0);
        assert!(fs::metadata(&path).unwrap().len() < size_before);
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.idx");
        fs::write(&path, b"garbage that is not an index").unwrap();

        let err = FileEngine::new().open_index(&path, true).unwrap_err();
        assert!(err.needs_rebuild());
    }

    #[test]
    fn test_postings_follow_removal_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.idx");
        let index = create(&dir);

        let gone = index
            .add_document("1/body/1", DocumentSource::Text("quarterly budget"), "text/plain")
            .unwrap();
        index
            .add_document("2/body/1", DocumentSource::Text("budget review"), "text/plain")
            .unwrap();
        index
            .add_document("3/body/1", DocumentSource::Text("holiday plans"), "text/plain")
            .unwrap();
        index.remove_document(gone).unwrap();
        index.flush().unwrap();

        let query = EngineQuery::phrase("budget");
        let hits = drain(index.search(&query, false).unwrap().as_mut());
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "2/body/1");

        drop(index);
        let reopened = FileEngine::new().open_index(&path, false).unwrap();
        let hits = drain(reopened.search(&query, false).unwrap().as_mut());
        assert_eq!(hits.len(), 1);
        let missing = EngineQuery::phrase("nothing");
        assert!(drain(reopened.search(&missing, false).unwrap().as_mut()).is_empty());
    }

    #[test]
    fn test_size_counts_unflushed_documents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.idx");
        let index = create(&dir);
        assert_eq!(index.size_bytes(), fs::metadata(&path).unwrap().len());

        index
            .add_document("1/body/1", DocumentSource::Text("some words to store"), "text/plain")
            .unwrap();
        assert!(index.size_bytes() > fs::metadata(&path).unwrap().len());

        index.flush().unwrap();
        assert_eq!(index.size_bytes(), fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn test_min_term_length() {
        assert_eq!(tokenize("a bb ccc", 2), vec!["bb", "ccc"]);
        assert_eq!(tokenize("Hello, World", 1), vec!["hello", "world"]);
    }
}
