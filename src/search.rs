//! Searching a mailbox index.
//!
//! A query is a conjunction of arguments. Each argument is either a phrase,
//! which the engine matches exactly, or a substring, which it can only match
//! approximately. Arguments are searched one at a time and intersected per
//! uid, so one argument may match the header and another a body part.
//! Results come back as uid sets split into definite matches and matches the
//! caller has to verify against the message itself.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crossbeam_channel::unbounded;
use serde::Serialize;

use crate::engine::{DocumentKey, EngineMatch, EngineQuery, EngineTerm, Location, TermKind, tokenize};
use crate::error::Result;
use crate::fragment::IndexSet;

/// Which parts of a message a search looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SearchScope {
    pub header: bool,
    pub body: bool,
}

impl SearchScope {
    pub const HEADER: SearchScope = SearchScope {
        header: true,
        body: false,
    };
    pub const BODY: SearchScope = SearchScope {
        header: false,
        body: true,
    };
    pub const ALL: SearchScope = SearchScope {
        header: true,
        body: true,
    };

    pub fn includes(&self, location: Location) -> bool {
        match location {
            Location::Header => self.header,
            Location::Body => self.body,
            Location::Shadow => false,
        }
    }
}

impl Default for SearchScope {
    fn default() -> Self {
        SearchScope::ALL
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Quoted text: all words, adjacent and in order.
    Phrase,
    /// Free text that may occur inside words.
    Substring,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchArg {
    pub text: String,
    pub mode: MatchMode,
}

/// A conjunction of search arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailQuery {
    pub args: Vec<SearchArg>,
}

impl MailQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phrase<S: Into<String>>(mut self, text: S) -> Self {
        self.args.push(SearchArg {
            text: text.into(),
            mode: MatchMode::Phrase,
        });
        self
    }

    pub fn substring<S: Into<String>>(mut self, text: S) -> Self {
        self.args.push(SearchArg {
            text: text.into(),
            mode: MatchMode::Substring,
        });
        self
    }
}

/// A query translated for the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedQuery {
    /// `None` when no argument survived term filtering.
    pub engine: Option<EngineQuery>,
    /// Whether matches are exact.
    pub definite: bool,
}

impl PreparedQuery {
    /// Translate `query`, dropping what the index cannot look up.
    ///
    /// Words shorter than `min_term_length` were never indexed. A phrase that
    /// loses some of its words is searched with the rest, and a query that
    /// lost anything is no longer definite.
    pub fn new(query: &MailQuery, min_term_length: usize) -> Self {
        let mut terms = Vec::new();
        let mut definite = true;

        for arg in &query.args {
            match arg.mode {
                MatchMode::Phrase => {
                    let all = tokenize(&arg.text, 1);
                    let kept = tokenize(&arg.text, min_term_length);
                    if kept.len() < all.len() {
                        definite = false;
                    }
                    if !kept.is_empty() {
                        terms.push(EngineTerm {
                            text: kept.join(" "),
                            kind: TermKind::Phrase,
                        });
                    }
                }
                MatchMode::Substring => {
                    definite = false;
                    let text = arg.text.trim();
                    if text.chars().count() >= min_term_length.max(1) {
                        terms.push(EngineTerm {
                            text: text.to_string(),
                            kind: TermKind::Substring,
                        });
                    }
                }
            }
        }

        PreparedQuery {
            engine: (!terms.is_empty()).then_some(EngineQuery { terms }),
            definite,
        }
    }
}

/// Result of [`SearchExecutor::lookup`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LookupResult {
    pub definite: BTreeSet<u32>,
    pub maybe: BTreeSet<u32>,
    /// The index could not narrow the search; every message is a candidate.
    pub unsearchable: bool,
}

/// Result of [`SearchExecutor::lookup_scored`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScoredLookupResult {
    pub definite: BTreeSet<u32>,
    pub maybe: BTreeSet<u32>,
    /// Summed scores, ascending by uid.
    pub scores: Vec<(u32, f32)>,
    pub unsearchable: bool,
}

/// Runs queries over every fragment of an open index set.
#[derive(Debug)]
pub struct SearchExecutor<'s> {
    set: &'s IndexSet,
    excluded: BTreeSet<u32>,
    min_term_length: usize,
    batch_size: usize,
    budget: Option<Duration>,
}

impl<'s> SearchExecutor<'s> {
    /// `set` must have all its fragments open. Uids in `excluded` never
    /// appear in results.
    pub fn new(
        set: &'s IndexSet,
        excluded: BTreeSet<u32>,
        min_term_length: usize,
        batch_size: usize,
        budget: Option<Duration>,
    ) -> Self {
        SearchExecutor {
            set,
            excluded,
            min_term_length,
            batch_size: batch_size.max(1),
            budget,
        }
    }

    pub fn lookup(&self, query: &MailQuery, scope: SearchScope) -> Result<LookupResult> {
        let prepared = PreparedQuery::new(query, self.min_term_length);
        let Some(engine_query) = &prepared.engine else {
            return Ok(LookupResult {
                unsearchable: true,
                ..Default::default()
            });
        };

        let uids = self.collect_all(engine_query, scope, false)?;
        let mut result = LookupResult::default();
        let target = if prepared.definite {
            &mut result.definite
        } else {
            &mut result.maybe
        };
        target.extend(uids.into_keys());
        Ok(result)
    }

    /// All `queries` must match. A uid is definite only when every query
    /// matched it definitely; its score is the sum over the queries.
    pub fn lookup_scored(
        &self,
        queries: &[MailQuery],
        scope: SearchScope,
    ) -> Result<ScoredLookupResult> {
        let mut combined: Option<BTreeMap<u32, f32>> = None;
        let mut definite = true;

        for query in queries {
            let prepared = PreparedQuery::new(query, self.min_term_length);
            let Some(engine_query) = &prepared.engine else {
                // Cannot narrow; the caller verifies this part.
                definite = false;
                continue;
            };
            definite &= prepared.definite;

            let scores = self.collect_all(engine_query, scope, true)?;
            combined = Some(intersect(combined, scores));
        }

        let Some(combined) = combined else {
            return Ok(ScoredLookupResult {
                unsearchable: true,
                ..Default::default()
            });
        };

        let mut result = ScoredLookupResult::default();
        let target = if definite {
            &mut result.definite
        } else {
            &mut result.maybe
        };
        target.extend(combined.keys().copied());
        result.scores = combined.into_iter().collect();
        Ok(result)
    }

    /// Uids matching every term of `query`, each term searched on its own.
    fn collect_all(
        &self,
        query: &EngineQuery,
        scope: SearchScope,
        scoring: bool,
    ) -> Result<BTreeMap<u32, f32>> {
        let mut combined = None;
        for term in &query.terms {
            let single = EngineQuery {
                terms: vec![term.clone()],
            };
            let scores = self.collect(&single, scope, scoring)?;
            let narrowed = intersect(combined, scores);
            if narrowed.is_empty() {
                return Ok(narrowed);
            }
            combined = Some(narrowed);
        }
        Ok(combined.unwrap_or_default())
    }

    /// Search every open fragment in parallel and merge matches by uid,
    /// summing scores.
    fn collect(
        &self,
        query: &EngineQuery,
        scope: SearchScope,
        scoring: bool,
    ) -> Result<BTreeMap<u32, f32>> {
        let (tx, rx) = unbounded::<(u32, Result<Vec<EngineMatch>>)>();
        let mut merged = BTreeMap::new();
        let mut failure = None;

        std::thread::scope(|scope_handle| {
            for (number, index) in self.set.open_fragments() {
                let tx = tx.clone();
                let batch_size = self.batch_size;
                let budget = self.budget;
                scope_handle.spawn(move || {
                    let mut search = match index.search(query, scoring) {
                        Ok(search) => search,
                        Err(e) => {
                            let _ = tx.send((number, Err(e)));
                            return;
                        }
                    };
                    loop {
                        match search.next_batch(batch_size, budget) {
                            Ok(Some(batch)) => {
                                if tx.send((number, Ok(batch))).is_err() {
                                    return;
                                }
                            }
                            Ok(None) => return,
                            Err(e) => {
                                let _ = tx.send((number, Err(e)));
                                return;
                            }
                        }
                    }
                });
            }
            drop(tx);

            for (number, batch) in rx {
                match batch {
                    Ok(matches) => self.merge(&mut merged, matches, scope),
                    Err(e) => {
                        log::warn!("search of fragment {number} failed: {e}");
                        failure.get_or_insert(e);
                    }
                }
            }
        });

        match failure {
            Some(e) => Err(e),
            None => Ok(merged),
        }
    }

    fn merge(&self, merged: &mut BTreeMap<u32, f32>, matches: Vec<EngineMatch>, scope: SearchScope) {
        for hit in matches {
            let Some(key) = DocumentKey::parse(&hit.name) else {
                continue;
            };
            if !scope.includes(key.location) || self.excluded.contains(&key.uid) {
                continue;
            }
            *merged.entry(key.uid).or_insert(0.0) += hit.score;
        }
    }
}

/// Uids present in both, scores summed. `None` stands for no earlier
/// argument.
fn intersect(
    combined: Option<BTreeMap<u32, f32>>,
    scores: BTreeMap<u32, f32>,
) -> BTreeMap<u32, f32> {
    match combined {
        None => scores,
        Some(previous) => previous
            .into_iter()
            .filter_map(|(uid, score)| scores.get(&uid).map(|other| (uid, score + other)))
            .collect(),
    }
}
