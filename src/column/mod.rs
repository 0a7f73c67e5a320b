//! Per-column on-disk index: paged serialization and closest-match reads.
//!
//! A column is one field's similarity tree within a collection. Each flush
//! appends one page (a pre-order run of node blocks) to the column's index
//! file and records its extent in the page index. Queries scan pages in
//! parallel and reduce to a single best hit.

pub mod page;
pub mod reader;
pub mod writer;

pub use page::{PageIndexWriter, PageInfo, read_page_info};
pub use reader::{ColumnReader, Hit};
pub use writer::ColumnWriter;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{CanopyError, Result};
use crate::tree::{TERMINATOR_BOTH, TERMINATOR_LEFT_ONLY, TERMINATOR_NONE, TERMINATOR_RIGHT_ONLY};

/// Size in bytes of one serialized node block:
/// `vectorOffset:i64, postingsOffset:i64, componentCount:u32, weight:u32,
/// terminator:u8`.
pub const BLOCK_SIZE: usize = 25;

/// One decoded node block from a column's index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeBlock {
    pub vector_offset: u64,
    pub postings_offset: u64,
    pub component_count: u32,
    pub weight: u32,
    pub terminator: u8,
}

impl NodeBlock {
    /// Append this block's [`BLOCK_SIZE`] bytes to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        out.write_i64::<LittleEndian>(self.vector_offset as i64)?;
        out.write_i64::<LittleEndian>(self.postings_offset as i64)?;
        out.write_u32::<LittleEndian>(self.component_count)?;
        out.write_u32::<LittleEndian>(self.weight)?;
        out.write_u8(self.terminator)?;
        Ok(())
    }

    /// Decode one block. The terminator byte is validated; offsets are not,
    /// since only the streams they point into can judge them.
    pub fn decode(block: &[u8]) -> Result<NodeBlock> {
        debug_assert_eq!(block.len(), BLOCK_SIZE);

        let mut cursor = block;
        let vector_offset = cursor.read_i64::<LittleEndian>()?;
        let postings_offset = cursor.read_i64::<LittleEndian>()?;
        let component_count = cursor.read_u32::<LittleEndian>()?;
        let weight = cursor.read_u32::<LittleEndian>()?;
        let terminator = cursor.read_u8()?;

        if vector_offset < 0 || postings_offset < 0 {
            return Err(CanopyError::corrupt(
                "node block holds a negative stream offset",
            ));
        }
        if terminator > TERMINATOR_NONE {
            return Err(CanopyError::corrupt(format!(
                "unknown node terminator {terminator}"
            )));
        }

        Ok(NodeBlock {
            vector_offset: vector_offset as u64,
            postings_offset: postings_offset as u64,
            component_count,
            weight,
            terminator,
        })
    }

    /// Whether the pre-order successor of this block is the node's left
    /// child.
    pub fn has_left(&self) -> bool {
        self.terminator == TERMINATOR_BOTH || self.terminator == TERMINATOR_LEFT_ONLY
    }

    /// Whether the node has a right child.
    pub fn has_right(&self) -> bool {
        self.terminator == TERMINATOR_BOTH || self.terminator == TERMINATOR_RIGHT_ONLY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_round_trip() {
        let block = NodeBlock {
            vector_offset: 4096,
            postings_offset: 72,
            component_count: 3,
            weight: 5,
            terminator: TERMINATOR_BOTH,
        };

        let mut bytes = Vec::new();
        block.encode(&mut bytes).unwrap();
        assert_eq!(bytes.len(), BLOCK_SIZE);

        assert_eq!(NodeBlock::decode(&bytes).unwrap(), block);
    }

    #[test]
    fn test_unknown_terminator_is_corrupt() {
        let block = NodeBlock {
            vector_offset: 0,
            postings_offset: 0,
            component_count: 0,
            weight: 1,
            terminator: TERMINATOR_RIGHT_ONLY,
        };

        let mut bytes = Vec::new();
        block.encode(&mut bytes).unwrap();
        bytes[BLOCK_SIZE - 1] = 9;

        assert!(matches!(
            NodeBlock::decode(&bytes),
            Err(CanopyError::Corrupt(_))
        ));
    }
}
