//! Serializes a column's similarity tree into one on-disk page.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};

use tracing::debug;

use crate::column::page::{PageIndexWriter, PageInfo};
use crate::column::NodeBlock;
use crate::error::{CanopyError, Result};
use crate::model::SimilarityModel;
use crate::postings::PostingsStore;
use crate::tree::VectorTree;

/// Writes pre-order pages of node blocks into a column's index file.
///
/// Postings and vector payloads land in the collection-wide streams; the
/// node blocks reference them by offset. A page is staged in memory and
/// appended in one write, so the index file never holds a partial page.
pub struct ColumnWriter {
    collection_id: u64,
    key_id: u64,
    index_stream: File,
}

impl ColumnWriter {
    pub fn new(collection_id: u64, key_id: u64, index_stream: File) -> Self {
        ColumnWriter {
            collection_id,
            key_id,
            index_stream,
        }
    }

    /// Serialize `tree` as one page: postings first, then each node's vector
    /// payload, then the node blocks, and finally the page's extent into the
    /// page index.
    pub fn create_page(
        &mut self,
        tree: &VectorTree,
        model: &dyn SimilarityModel,
        vector_stream: &mut File,
        postings: &mut PostingsStore,
        page_index: &mut PageIndexWriter,
    ) -> Result<PageInfo> {
        let mut blocks = Vec::new();

        for id in tree.preorder() {
            let node = tree.node(id);

            let postings_offset = if node.doc_ids().is_empty() {
                // A node rebuilt from disk keeps its original list.
                *node.postings_offsets().first().ok_or_else(|| {
                    CanopyError::index("node holds neither document ids nor a postings offset")
                })?
            } else {
                let mut ids: Vec<u64> = node.doc_ids().iter().copied().collect();
                ids.sort_unstable();
                postings.append(&ids)?
            };

            let vector_offset = vector_stream.seek(SeekFrom::End(0))?;
            model.serialize_vector(node.vector(), vector_stream)?;

            NodeBlock {
                vector_offset,
                postings_offset,
                component_count: node.vector().component_count() as u32,
                weight: node.weight(),
                terminator: node.terminator(),
            }
            .encode(&mut blocks)?;
        }

        let offset = self.index_stream.seek(SeekFrom::End(0))?;
        self.index_stream.write_all(&blocks)?;
        page_index.write(offset, blocks.len() as u64)?;

        let (depth, width) = tree.size();
        debug!(
            collection = self.collection_id,
            key = self.key_id,
            offset,
            length = blocks.len(),
            depth,
            width,
            "serialized column page"
        );

        Ok(PageInfo {
            offset,
            length: blocks.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;

    use super::*;
    use crate::column::BLOCK_SIZE;
    use crate::model::TextModel;

    #[test]
    fn test_page_extent_matches_tree_size() {
        let dir = tempfile::tempdir().unwrap();
        let model = TextModel::new();

        let mut tree = VectorTree::new();
        for (doc_id, word) in ["cat", "bat", "xyz"].iter().enumerate() {
            tree.insert(model.tokenize(word).remove(0), doc_id as u64, &model);
        }

        let open = |name: &str| {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(dir.path().join(name))
                .unwrap()
        };

        let mut writer = ColumnWriter::new(1, 0, open("1.0.ix"));
        let mut vectors = open("1.vec");
        let mut postings = PostingsStore::open(dir.path().join("1.pos")).unwrap();
        let mut page_index = PageIndexWriter::new(open("1.0.ixtp"));

        let page = writer
            .create_page(&tree, &model, &mut vectors, &mut postings, &mut page_index)
            .unwrap();

        assert_eq!(page.offset, 0);
        assert_eq!(page.length as usize, tree.len() * BLOCK_SIZE);

        // A second flush appends behind the first page.
        let second = writer
            .create_page(&tree, &model, &mut vectors, &mut postings, &mut page_index)
            .unwrap();
        assert_eq!(second.offset, page.length);

        let pages = crate::column::read_page_info(dir.path().join("1.0.ixtp")).unwrap();
        assert_eq!(pages, vec![page, second]);
    }
}
