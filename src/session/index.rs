//! Concurrent tree construction for one collection.
//!
//! Work items flow through a bounded channel into a fixed pool of worker
//! threads. The channel's capacity is the backpressure: `send` blocks the
//! producer while the pool is behind. Each column's tree sits behind its
//! own lock, so distinct columns are built concurrently while one tree's
//! mutation stays serialized.

use std::fs::File;
use std::sync::Arc;
use std::thread::JoinHandle;

use ahash::AHashMap;
use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::column::{ColumnWriter, PageIndexWriter};
use crate::config::Config;
use crate::directory::Directory;
use crate::error::{CanopyError, Result};
use crate::model::SimilarityModel;
use crate::postings::PostingsStore;
use crate::tree::{VectorNode, VectorTree};
use crate::vector::SparseVector;

struct WorkItem {
    doc_id: u64,
    key_id: u64,
    vector: SparseVector,
}

type ColumnMap = RwLock<AHashMap<u64, Arc<Mutex<VectorTree>>>>;

/// Shape diagnostics for one column's in-memory tree.
#[derive(Debug, Clone, Copy)]
pub struct ColumnInfo {
    pub key_id: u64,
    pub node_count: usize,
    pub doc_count: usize,
    pub depth: usize,
    pub width: usize,
}

/// An indexing session targeting a single collection.
///
/// The session exclusively owns its collection's in-memory trees and its
/// write-side streams for its lifetime; two sessions must not target the
/// same collection concurrently.
pub struct IndexSession {
    collection_id: u64,
    directory: Arc<Directory>,
    model: Arc<dyn SimilarityModel>,
    columns: Arc<ColumnMap>,
    sender: Option<Sender<WorkItem>>,
    workers: Vec<JoinHandle<()>>,
    vector_stream: File,
    postings: PostingsStore,
    flushed: bool,
}

impl IndexSession {
    pub fn new(
        collection_id: u64,
        directory: Arc<Directory>,
        model: Arc<dyn SimilarityModel>,
        config: &Config,
    ) -> Result<Self> {
        let vector_stream = directory.open_append(directory.vector_path(collection_id))?;
        let postings = directory.postings(collection_id)?;

        let columns: Arc<ColumnMap> = Arc::new(RwLock::new(AHashMap::new()));
        let (sender, receiver) = bounded(config.index_queue_size());
        let thread_count = config.index_thread_count();

        let mut workers = Vec::with_capacity(thread_count);
        for n in 0..thread_count {
            let receiver: Receiver<WorkItem> = receiver.clone();
            let columns = Arc::clone(&columns);
            let model = Arc::clone(&model);

            let handle = std::thread::Builder::new()
                .name(format!("canopy-index-{n}"))
                .spawn(move || {
                    for item in receiver {
                        let tree = column_tree(&columns, item.key_id);
                        tree.lock()
                            .add(VectorNode::new(item.vector, item.doc_id), model.as_ref());
                    }
                })?;
            workers.push(handle);
        }

        info!(
            collection = collection_id,
            threads = thread_count,
            "started indexing session"
        );

        Ok(IndexSession {
            collection_id,
            directory,
            model,
            columns,
            sender: Some(sender),
            workers,
            vector_stream,
            postings,
            flushed: false,
        })
    }

    pub fn collection_id(&self) -> u64 {
        self.collection_id
    }

    /// Tokenize `value` and enqueue one work item per token. Blocks while
    /// the work queue is full.
    pub fn put_value(&self, doc_id: u64, key_id: u64, value: &str) -> Result<()> {
        for vector in self.model.tokenize(value) {
            self.put(doc_id, key_id, vector)?;
        }
        Ok(())
    }

    /// Enqueue one `(docId, keyId, vector)` occurrence. Blocks while the
    /// work queue is full.
    pub fn put(&self, doc_id: u64, key_id: u64, vector: SparseVector) -> Result<()> {
        let sender = self.sender.as_ref().ok_or_else(|| {
            CanopyError::invalid_operation("put into a flushed index session")
        })?;

        sender
            .send(WorkItem {
                doc_id,
                key_id,
                vector,
            })
            .map_err(|_| CanopyError::index("indexing workers are gone"))?;

        Ok(())
    }

    /// Items currently waiting in the work queue.
    pub fn queue_len(&self) -> usize {
        self.sender.as_ref().map(Sender::len).unwrap_or(0)
    }

    /// Shape diagnostics for every column built so far.
    pub fn index_info(&self) -> Vec<ColumnInfo> {
        let columns = self.columns.read();
        let mut info: Vec<ColumnInfo> = columns
            .iter()
            .map(|(&key_id, tree)| {
                let tree = tree.lock();
                let (depth, width) = tree.size();
                ColumnInfo {
                    key_id,
                    node_count: tree.len(),
                    doc_count: tree.doc_count(),
                    depth,
                    width,
                }
            })
            .collect();
        info.sort_unstable_by_key(|column| column.key_id);
        info
    }

    /// Drain the queue, wait for every in-flight apply, and serialize each
    /// column's tree as one on-disk page. Idempotent; a second call is a
    /// no-op. After a flush the session no longer accepts work.
    pub fn flush(&mut self) -> Result<()> {
        if self.flushed {
            return Ok(());
        }
        self.flushed = true;

        // Closing the channel lets the workers drain it and exit; joining
        // them is the full barrier flush requires.
        drop(self.sender.take());
        for worker in self.workers.drain(..) {
            worker
                .join()
                .map_err(|_| CanopyError::index("an indexing worker panicked"))?;
        }

        let columns = self.columns.read();
        let mut key_ids: Vec<u64> = columns.keys().copied().collect();
        key_ids.sort_unstable();

        for key_id in key_ids {
            let tree = columns[&key_id].lock();
            if tree.is_empty() {
                continue;
            }

            let index_stream = self
                .directory
                .open_append(self.directory.index_path(self.collection_id, key_id))?;
            let mut writer = ColumnWriter::new(self.collection_id, key_id, index_stream);
            let mut page_index = PageIndexWriter::new(
                self.directory
                    .open_append(self.directory.page_index_path(self.collection_id, key_id))?,
            );

            let page = writer.create_page(
                &tree,
                self.model.as_ref(),
                &mut self.vector_stream,
                &mut self.postings,
                &mut page_index,
            )?;
            page_index.flush()?;

            debug!(
                collection = self.collection_id,
                key = key_id,
                nodes = tree.len(),
                length = page.length,
                "flushed column"
            );
        }
        drop(columns);

        self.directory.invalidate_page_info(self.collection_id);
        info!(collection = self.collection_id, "flushed indexing session");

        Ok(())
    }
}

impl Drop for IndexSession {
    fn drop(&mut self) {
        if !self.flushed {
            if let Err(e) = self.flush() {
                error!(collection = self.collection_id, error = %e, "flush on drop failed");
            }
        }
    }
}

fn column_tree(columns: &ColumnMap, key_id: u64) -> Arc<Mutex<VectorTree>> {
    if let Some(tree) = columns.read().get(&key_id) {
        return Arc::clone(tree);
    }

    let mut columns = columns.write();
    Arc::clone(
        columns
            .entry(key_id)
            .or_insert_with(|| Arc::new(Mutex::new(VectorTree::new()))),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TextModel;

    fn session(dir: &tempfile::TempDir, config: &Config) -> IndexSession {
        let directory = Arc::new(Directory::open(dir.path()).unwrap());
        IndexSession::new(1, directory, Arc::new(TextModel::new()), config).unwrap()
    }

    #[test]
    fn test_flush_drains_and_serializes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new();
        let mut session = session(&dir, &config);

        for doc_id in 0..50 {
            session.put_value(doc_id, 0, "cat").unwrap();
            session.put_value(doc_id, 1, "dog").unwrap();
        }
        session.flush().unwrap();

        assert_eq!(session.queue_len(), 0);
        let info = session.index_info();
        assert_eq!(info.len(), 2);
        // All fifty "cat" occurrences merged into one node per column.
        assert_eq!(info[0].node_count, 1);
        assert_eq!(info[0].doc_count, 50);

        assert!(dir.path().join("1.0.ix").exists());
        assert!(dir.path().join("1.1.ixtp").exists());
    }

    #[test]
    fn test_flush_is_idempotent_and_put_after_flush_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new();
        let mut session = session(&dir, &config);

        session.put_value(1, 0, "cat").unwrap();
        session.flush().unwrap();
        session.flush().unwrap();

        let pages =
            crate::column::read_page_info(dir.path().join("1.0.ixtp")).unwrap();
        assert_eq!(pages.len(), 1);

        assert!(matches!(
            session.put_value(2, 0, "bat"),
            Err(CanopyError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_distinct_columns_do_not_share_trees() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new();
        let mut session = session(&dir, &config);

        session.put_value(1, 0, "cat").unwrap();
        session.put_value(2, 7, "cat").unwrap();
        session.flush().unwrap();

        let info = session.index_info();
        assert_eq!(
            info.iter().map(|c| c.key_id).collect::<Vec<_>>(),
            vec![0, 7]
        );
        assert!(info.iter().all(|c| c.node_count == 1 && c.doc_count == 1));
    }
}
