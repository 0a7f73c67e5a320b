//! Closest-match traversal over a column's serialized pages.
//!
//! Two physical strategies implement the same logical traversal: buffered
//! sequential reads through the index file, and bounded memory-mapped views.
//! Pages are scanned in parallel; every page is visited exactly once; the
//! per-page hits reduce to a single best candidate.
//!
//! Tie rule, applied identically in both modes and in the final reduction:
//! a strictly higher score replaces the best candidate; a candidate tying
//! the best accumulates its postings offsets onto it only when the tied
//! score is strictly positive.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use memmap2::Mmap;
use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::debug;

use crate::column::page::PageInfo;
use crate::column::{BLOCK_SIZE, NodeBlock};
use crate::config::{Config, ReadMode};
use crate::error::{CanopyError, Result};
use crate::model::{SimilarityModel, SliceVectorSource};
use crate::tree::{TERMINATOR_BOTH, TERMINATOR_RIGHT_ONLY, VectorNode, VectorTree};
use crate::vector::SparseVector;

/// The closest match found for a query vector: the winning score and the
/// postings offsets it resolves to (plural after ties).
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub score: f32,
    pub postings_offsets: Vec<u64>,
}

/// Reads closest-match answers for one column directly from its pages.
///
/// A reader is opened per query and holds no open file handles between
/// calls; each scan acquires and releases its own streams or mapped views.
pub struct ColumnReader {
    ix_path: PathBuf,
    vec_path: PathBuf,
    pages: Arc<Vec<PageInfo>>,
    model: Arc<dyn SimilarityModel>,
    read_mode: ReadMode,
    buffer_size: usize,
}

impl ColumnReader {
    pub fn new(
        ix_path: PathBuf,
        vec_path: PathBuf,
        pages: Arc<Vec<PageInfo>>,
        model: Arc<dyn SimilarityModel>,
        config: &Config,
    ) -> Self {
        ColumnReader {
            ix_path,
            vec_path,
            pages,
            model,
            read_mode: config.read_mode(),
            buffer_size: config.read_buffer_size(),
        }
    }

    /// The page extents this reader scans.
    pub fn pages(&self) -> &[PageInfo] {
        &self.pages
    }

    /// Find the closest node to `query` across every page. Returns `None`
    /// for a column with no pages.
    pub fn closest_match(&self, query: &SparseVector) -> Result<Option<Hit>> {
        if self.pages.is_empty() {
            return Ok(None);
        }

        let started = Instant::now();
        let hits = match self.read_mode {
            ReadMode::Buffered => self.scan_buffered(query)?,
            ReadMode::Mmap => self.scan_mmap(query)?,
        };

        let mut best: Option<Hit> = None;
        for hit in hits {
            merge_hit(&mut best, hit);
        }

        debug!(
            ix = %self.ix_path.display(),
            pages = self.pages.len(),
            elapsed = ?started.elapsed(),
            "column scan"
        );

        Ok(best)
    }

    /// Buffered-disk scan: workers share a FIFO of pages. A worker pops a
    /// page and traverses it; when a branch ends with unclaimed pages left,
    /// the same traversal seeks to the next one and resumes, so each page is
    /// scanned exactly once.
    fn scan_buffered(&self, query: &SparseVector) -> Result<Vec<Hit>> {
        let queue: Mutex<VecDeque<PageInfo>> =
            Mutex::new(self.pages.iter().copied().collect());
        let worker_count = self
            .pages
            .len()
            .min(rayon::current_num_threads())
            .max(1);
        let outcomes: Mutex<Vec<Result<Vec<Hit>>>> = Mutex::new(Vec::new());

        rayon::scope(|scope| {
            for _ in 0..worker_count {
                scope.spawn(|_| {
                    let outcome = self.buffered_worker(query, &queue);
                    outcomes.lock().push(outcome);
                });
            }
        });

        let mut hits = Vec::new();
        for outcome in outcomes.into_inner() {
            hits.extend(outcome?);
        }

        Ok(hits)
    }

    fn buffered_worker(
        &self,
        query: &SparseVector,
        queue: &Mutex<VecDeque<PageInfo>>,
    ) -> Result<Vec<Hit>> {
        let mut ix = BufReader::with_capacity(self.buffer_size, File::open(&self.ix_path)?);
        let mut vectors = File::open(&self.vec_path)?;
        let mut hits = Vec::new();

        loop {
            let Some(page) = queue.lock().pop_front() else {
                break;
            };

            validate_extent(&page)?;
            ix.seek(SeekFrom::Start(page.offset))?;

            if let Some(hit) = self.traverse_buffered(query, queue, &mut ix, &mut vectors)? {
                hits.push(hit);
            }
        }

        Ok(hits)
    }

    fn traverse_buffered(
        &self,
        query: &SparseVector,
        queue: &Mutex<VecDeque<PageInfo>>,
        ix: &mut BufReader<File>,
        vectors: &mut File,
    ) -> Result<Option<Hit>> {
        let mut best: Option<Hit> = None;
        let mut block = [0u8; BLOCK_SIZE];

        loop {
            ix.read_exact(&mut block)
                .map_err(|_| CanopyError::corrupt("node block truncated"))?;
            let node = NodeBlock::decode(&block)?;

            let vector = self.model.deserialize_vector(
                vectors,
                node.vector_offset,
                node.component_count as usize,
            )?;
            let angle = self.model.score(query, &vector);
            record(&mut best, angle, node.postings_offset);

            if angle >= self.model.identical_angle() {
                // An identical match terminates descent; pick up at the
                // next unclaimed page, if any.
                if !next_page(ix, queue)? {
                    break;
                }
            } else if angle > self.model.fold_angle() {
                if node.has_left() {
                    // The pre-order successor is the left child.
                } else if !next_page(ix, queue)? {
                    break;
                }
            } else if node.terminator == TERMINATOR_BOTH {
                // The right child sits `weight` blocks past the node's own
                // block; one of those was just consumed by the read above.
                ix.seek_relative((node.weight as i64 - 1) * BLOCK_SIZE as i64)?;
            } else if node.terminator == TERMINATOR_RIGHT_ONLY {
                // The pre-order successor is the right child.
            } else if !next_page(ix, queue)? {
                break;
            }
        }

        Ok(best)
    }

    /// Memory-mapped scan: one bounded view per page, one task per page, no
    /// cross-page continuation.
    fn scan_mmap(&self, query: &SparseVector) -> Result<Vec<Hit>> {
        let ix_file = File::open(&self.ix_path)?;
        let vec_file = File::open(&self.vec_path)?;
        let ix_map = map_file(&ix_file)?;
        let vec_map = map_file(&vec_file)?;
        let ix_bytes = ix_map.as_deref().unwrap_or(&[]);
        let vec_bytes = vec_map.as_deref().unwrap_or(&[]);

        let hits = self
            .pages
            .par_iter()
            .map(|page| {
                validate_extent(page)?;

                let start = page.offset as usize;
                let end = start + page.length as usize;
                let blocks = ix_bytes.get(start..end).ok_or_else(|| {
                    CanopyError::corrupt(format!(
                        "page at {} runs past the end of the index file",
                        page.offset
                    ))
                })?;

                self.traverse_blocks(query, blocks, vec_bytes)
            })
            .collect::<Result<Vec<Option<Hit>>>>()?;

        Ok(hits.into_iter().flatten().collect())
    }

    fn traverse_blocks(
        &self,
        query: &SparseVector,
        blocks: &[u8],
        vec_bytes: &[u8],
    ) -> Result<Option<Hit>> {
        let block_count = blocks.len() / BLOCK_SIZE;
        let mut best: Option<Hit> = None;
        let mut index = 0usize;

        while index < block_count {
            let node = NodeBlock::decode(&blocks[index * BLOCK_SIZE..(index + 1) * BLOCK_SIZE])?;

            let mut source = SliceVectorSource::new(vec_bytes);
            let vector = self.model.deserialize_vector(
                &mut source,
                node.vector_offset,
                node.component_count as usize,
            )?;
            let angle = self.model.score(query, &vector);
            record(&mut best, angle, node.postings_offset);

            let next = if angle >= self.model.identical_angle() {
                break;
            } else if angle > self.model.fold_angle() {
                if node.has_left() {
                    index + 1
                } else {
                    break;
                }
            } else if node.terminator == TERMINATOR_BOTH {
                index + node.weight as usize
            } else if node.terminator == TERMINATOR_RIGHT_ONLY {
                index + 1
            } else {
                break;
            };

            if next >= block_count {
                return Err(CanopyError::corrupt(
                    "page ends where a child block was expected",
                ));
            }
            index = next;
        }

        Ok(best)
    }

    /// Rebuild one page's tree from its block stream, for diagnostics and
    /// round-trip verification.
    pub fn read_tree(&self, page: usize) -> Result<VectorTree> {
        let info = *self.pages.get(page).ok_or_else(|| {
            CanopyError::index(format!("column has no page {page}"))
        })?;
        validate_extent(&info)?;

        let mut ix = BufReader::with_capacity(self.buffer_size, File::open(&self.ix_path)?);
        let mut vectors = File::open(&self.vec_path)?;
        ix.seek(SeekFrom::Start(info.offset))?;

        let block_count = info.length as usize / BLOCK_SIZE;
        let mut blocks = Vec::with_capacity(block_count);
        let mut buf = [0u8; BLOCK_SIZE];

        for _ in 0..block_count {
            ix.read_exact(&mut buf)
                .map_err(|_| CanopyError::corrupt("node block truncated"))?;
            let node = NodeBlock::decode(&buf)?;

            let vector = self.model.deserialize_vector(
                &mut vectors,
                node.vector_offset,
                node.component_count as usize,
            )?;

            blocks.push((
                VectorNode::from_disk(vector, vec![node.postings_offset], node.weight),
                node.terminator,
            ));
        }

        VectorTree::from_preorder(blocks)
    }
}

/// Record a candidate against the running best under the tie rule.
fn record(best: &mut Option<Hit>, score: f32, postings_offset: u64) {
    match best {
        None => {
            *best = Some(Hit {
                score,
                postings_offsets: vec![postings_offset],
            });
        }
        Some(hit) if score > hit.score => {
            *hit = Hit {
                score,
                postings_offsets: vec![postings_offset],
            };
        }
        Some(hit) if score > 0.0 && score == hit.score => {
            hit.postings_offsets.push(postings_offset);
        }
        Some(_) => {}
    }
}

/// Reduce a finished traversal's hit into the overall best under the same
/// tie rule.
fn merge_hit(best: &mut Option<Hit>, hit: Hit) {
    match best {
        None => *best = Some(hit),
        Some(current) if hit.score > current.score => *current = hit,
        Some(current) if hit.score > 0.0 && hit.score == current.score => {
            current.postings_offsets.extend(hit.postings_offsets);
        }
        Some(_) => {}
    }
}

fn next_page(ix: &mut BufReader<File>, queue: &Mutex<VecDeque<PageInfo>>) -> Result<bool> {
    let Some(page) = queue.lock().pop_front() else {
        return Ok(false);
    };

    validate_extent(&page)?;
    ix.seek(SeekFrom::Start(page.offset))?;
    Ok(true)
}

fn validate_extent(page: &PageInfo) -> Result<()> {
    if page.length == 0 || page.length % BLOCK_SIZE as u64 != 0 {
        return Err(CanopyError::corrupt(format!(
            "page length {} is not a whole number of node blocks",
            page.length
        )));
    }
    Ok(())
}

fn map_file(file: &File) -> Result<Option<Mmap>> {
    if file.metadata()?.len() == 0 {
        return Ok(None);
    }
    // Safety: canopy never mutates flushed files; the format is append-only
    // and appends land past every mapped page.
    Ok(Some(unsafe { Mmap::map(file)? }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_replaces_on_higher_score() {
        let mut best = None;
        record(&mut best, 0.4, 10);
        record(&mut best, 0.9, 20);
        record(&mut best, 0.5, 30);

        let hit = best.unwrap();
        assert_eq!(hit.score, 0.9);
        assert_eq!(hit.postings_offsets, vec![20]);
    }

    #[test]
    fn test_record_accumulates_positive_ties() {
        let mut best = None;
        record(&mut best, 0.7, 10);
        record(&mut best, 0.7, 20);

        let hit = best.unwrap();
        assert_eq!(hit.postings_offsets, vec![10, 20]);
    }

    #[test]
    fn test_record_zero_scores_never_tie() {
        let mut best = None;
        record(&mut best, 0.0, 10);
        record(&mut best, 0.0, 20);

        let hit = best.unwrap();
        assert_eq!(hit.postings_offsets, vec![10]);
    }

    #[test]
    fn test_merge_hit_applies_the_same_tie_rule() {
        let mut best = None;
        merge_hit(
            &mut best,
            Hit {
                score: 0.6,
                postings_offsets: vec![1],
            },
        );
        merge_hit(
            &mut best,
            Hit {
                score: 0.6,
                postings_offsets: vec![2],
            },
        );
        merge_hit(
            &mut best,
            Hit {
                score: 0.2,
                postings_offsets: vec![3],
            },
        );

        let hit = best.unwrap();
        assert_eq!(hit.score, 0.6);
        assert_eq!(hit.postings_offsets, vec![1, 2]);
    }

    #[test]
    fn test_extent_validation() {
        assert!(validate_extent(&PageInfo {
            offset: 0,
            length: BLOCK_SIZE as u64 * 4
        })
        .is_ok());
        assert!(validate_extent(&PageInfo {
            offset: 0,
            length: 10
        })
        .is_err());
    }
}
