//! The read path: map terms to closest matches, reduce postings across
//! clauses, sort, window, and resolve documents.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;

use ahash::{AHashMap, AHashSet};
use rayon::prelude::*;
use tracing::debug;

use crate::column::Hit;
use crate::config::Config;
use crate::directory::Directory;
use crate::docs::Document;
use crate::error::Result;
use crate::model::SimilarityModel;
use crate::postings::PostingsStore;
use crate::query::{Occur, Query, Scorer, SimilarityScorer};

/// One result row: the document, its id, and its final score.
#[derive(Debug, Clone)]
pub struct ScoredDocument {
    pub doc_id: u64,
    pub score: f32,
    pub fields: Document,
}

/// A query's outcome: the total match count and the windowed documents.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub total: usize,
    pub documents: Vec<ScoredDocument>,
}

/// A read session targeting a single collection.
///
/// Column readers, postings handles, and document readers are opened per
/// query and released when the query completes.
pub struct QuerySession {
    collection_id: u64,
    directory: Arc<Directory>,
    model: Arc<dyn SimilarityModel>,
    config: Config,
    scorer: Box<dyn Scorer>,
}

impl QuerySession {
    pub fn new(
        collection_id: u64,
        directory: Arc<Directory>,
        model: Arc<dyn SimilarityModel>,
        config: Config,
    ) -> Self {
        QuerySession {
            collection_id,
            directory,
            model,
            config,
            scorer: Box::new(SimilarityScorer),
        }
    }

    /// Replace the default pass-through scorer.
    pub fn with_scorer(mut self, scorer: Box<dyn Scorer>) -> Self {
        self.scorer = scorer;
        self
    }

    /// Run a query: closest-match every term, combine clause results,
    /// score, sort, window, and read the surviving documents.
    pub fn query(&self, query: &Query) -> Result<QueryResult> {
        let started = Instant::now();
        let mapped = self.map(query)?;
        debug!(collection = self.collection_id, elapsed = ?started.elapsed(), "map");

        let timer = Instant::now();
        let accumulated = self.reduce(query, mapped)?;
        debug!(collection = self.collection_id, elapsed = ?timer.elapsed(), "reduce");

        let timer = Instant::now();
        let total = accumulated.len();
        let mut ranked: Vec<(u64, f32)> = accumulated
            .into_iter()
            .map(|(doc_id, acc)| (doc_id, self.scorer.score(doc_id, acc)))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });

        let skip = query.skip.min(total);
        let take = if query.take == 0 {
            total - skip
        } else {
            query.take.min(total - skip)
        };
        let window = &ranked[skip..skip + take];
        debug!(collection = self.collection_id, total, elapsed = ?timer.elapsed(), "sort");

        let mut docs_reader = self.directory.document_reader(self.collection_id)?;
        let mut documents = Vec::with_capacity(window.len());
        for &(doc_id, score) in window {
            let fields = match docs_reader.as_mut() {
                Some(reader) => reader
                    .read_document(doc_id, &query.select)?
                    .unwrap_or_default(),
                None => Document::default(),
            };
            documents.push(ScoredDocument {
                doc_id,
                score,
                fields,
            });
        }

        Ok(QueryResult { total, documents })
    }

    /// Map every clause's tokens to their closest on-disk matches. The
    /// result is one `Option<Hit>` per token, aligned with the clause's
    /// token order; a missing column yields no matches, not an error.
    fn map(&self, query: &Query) -> Result<Vec<Vec<Option<Hit>>>> {
        query
            .clauses
            .par_iter()
            .map(|clause| {
                let tokens = self.model.tokenize(&clause.value);

                let reader = match self.directory.key_id(self.collection_id, &clause.field)? {
                    Some(key_id) => self.directory.column_reader(
                        self.collection_id,
                        key_id,
                        Arc::clone(&self.model),
                        &self.config,
                    )?,
                    None => None,
                };
                let Some(reader) = reader else {
                    return Ok(vec![None; tokens.len()]);
                };

                tokens
                    .iter()
                    .map(|token| {
                        let hit = reader.closest_match(token)?;
                        Ok(hit.filter(|hit| hit.score > 0.0))
                    })
                    .collect()
            })
            .collect()
    }

    /// Combine per-term matches into one score per document.
    fn reduce(
        &self,
        query: &Query,
        mapped: Vec<Vec<Option<Hit>>>,
    ) -> Result<AHashMap<u64, f32>> {
        let mut postings = self.directory.postings_reader(self.collection_id)?;
        let mut accumulator: AHashMap<u64, f32> = AHashMap::new();
        let mut initialized = false;

        for (clause, hits) in query.clauses.iter().zip(mapped) {
            if clause.phrase {
                // A phrase's tokens are summed into one per-clause map:
                // documents matching more of the phrase score higher.
                let mut clause_map: AHashMap<u64, f32> = AHashMap::new();
                for hit in hits.into_iter().flatten() {
                    for doc_id in resolve(&mut postings, &hit)? {
                        *clause_map.entry(doc_id).or_insert(0.0) += hit.score;
                    }
                }
                combine(&mut accumulator, &mut initialized, clause_map, clause.occur);
            } else {
                for hit in hits {
                    let mut term_map: AHashMap<u64, f32> = AHashMap::new();
                    if let Some(hit) = hit {
                        for doc_id in resolve(&mut postings, &hit)? {
                            term_map.insert(doc_id, hit.score);
                        }
                    }
                    combine(&mut accumulator, &mut initialized, term_map, clause.occur);
                }
            }
        }

        Ok(accumulator)
    }
}

/// The document ids a hit resolves to: the winner's list plus the lists of
/// any nodes that tied it.
fn resolve(postings: &mut Option<PostingsStore>, hit: &Hit) -> Result<AHashSet<u64>> {
    let mut ids = AHashSet::new();
    if let Some(store) = postings.as_mut() {
        for &offset in &hit.postings_offsets {
            ids.extend(store.read(offset)?);
        }
    }
    Ok(ids)
}

/// Fold one term's matches into the accumulator. The first term
/// initializes it regardless of occur, so a leading must-not yields an
/// empty result.
fn combine(
    accumulator: &mut AHashMap<u64, f32>,
    initialized: &mut bool,
    map: AHashMap<u64, f32>,
    occur: Occur,
) {
    if !*initialized {
        *initialized = true;
        if occur != Occur::MustNot {
            *accumulator = map;
        }
        return;
    }

    match occur {
        Occur::Must => accumulator.retain(|doc_id, _| map.contains_key(doc_id)),
        Occur::Should => {
            for (doc_id, score) in map {
                accumulator
                    .entry(doc_id)
                    .and_modify(|acc| *acc = acc.max(score) + (*acc + score) / 2.0)
                    .or_insert(score);
            }
        }
        Occur::MustNot => {
            for doc_id in map.keys() {
                accumulator.remove(doc_id);
            }
        }
    }
}
