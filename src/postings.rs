//! The postings store: append-only paged lists of document ids.
//!
//! A list lives in one or more pages chained through a `nextPageOffset`
//! header field; `-1` terminates the chain. Pages are never rewritten --
//! growing a list appends a fresh page and patches the previous tail's
//! `next` field, which is the only in-place write in the format.
//!
//! Page layout: `count:i64, nextPageOffset:i64`, then `count` document ids
//! (`u64` each).

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::Path;

use ahash::AHashSet;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{CanopyError, Result};

/// Size of the `(count, next)` page header.
const HEADER_SIZE: u64 = 16;

/// An open postings file for one collection.
pub struct PostingsStore {
    file: File,
}

impl PostingsStore {
    /// Open (creating if necessary) the postings file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        Ok(PostingsStore { file })
    }

    /// Open the postings file at `path` for reading. Returns `None` when the
    /// file does not exist, which a reader treats as "no postings".
    pub fn open_existing<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => Ok(Some(PostingsStore { file })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Append a new single-page list, returning its offset (the list's id).
    pub fn append(&mut self, ids: &[u64]) -> Result<u64> {
        let offset = self.file.seek(SeekFrom::End(0))?;

        self.file.write_i64::<LittleEndian>(ids.len() as i64)?;
        self.file.write_i64::<LittleEndian>(-1)?;
        for &id in ids {
            self.file.write_u64::<LittleEndian>(id)?;
        }

        Ok(offset)
    }

    /// Append `ids` as a new page chained onto the list at `offset`. Walks
    /// to the chain's tail, appends, and patches the tail's `next` field.
    /// Returns the new page's offset.
    pub fn append_to(&mut self, offset: u64, ids: &[u64]) -> Result<u64> {
        let mut tail = offset;

        loop {
            let (_, next) = self.read_header(tail)?;
            match next {
                None => break,
                Some(next) => {
                    if next <= tail {
                        return Err(CanopyError::corrupt(format!(
                            "postings chain at {offset} does not advance"
                        )));
                    }
                    tail = next;
                }
            }
        }

        let page_offset = self.append(ids)?;

        // Patch the old tail's next pointer; the second header word.
        self.file.seek(SeekFrom::Start(tail + 8))?;
        self.file.write_i64::<LittleEndian>(page_offset as i64)?;

        Ok(page_offset)
    }

    /// Read the full list at `offset`, following the page chain. A document
    /// id appearing twice within one chain means the file is corrupt.
    pub fn read(&mut self, offset: u64) -> Result<AHashSet<u64>> {
        let mut ids = AHashSet::new();
        let mut cursor = Some(offset);

        while let Some(page_offset) = cursor {
            let (count, next) = self.read_header(page_offset)?;

            for _ in 0..count {
                let id = self
                    .file
                    .read_u64::<LittleEndian>()
                    .map_err(|_| truncated(page_offset))?;

                if !ids.insert(id) {
                    return Err(CanopyError::corrupt(format!(
                        "postings page at {page_offset} repeats document id {id}"
                    )));
                }
            }

            if let Some(next) = next {
                if next <= page_offset {
                    return Err(CanopyError::corrupt(format!(
                        "postings chain at {offset} does not advance"
                    )));
                }
            }
            cursor = next;
        }

        Ok(ids)
    }

    /// Apply a batch write payload, returning one list offset per entry.
    ///
    /// Payload layout: `entryCount:u32`, then `entryCount` id counts
    /// (`u32` each), then `entryCount` target offsets (`i64` each, `-1`
    /// meaning "new list"), then the concatenated ids (`u64` each). A
    /// payload whose declared counts disagree with its length is rejected
    /// before any byte is written.
    pub fn write_batch(&mut self, payload: &[u8]) -> Result<Vec<u64>> {
        let entries = parse_batch(payload)?;
        let mut offsets = Vec::with_capacity(entries.len());

        for (target, ids) in entries {
            let offset = match target {
                None => self.append(&ids)?,
                Some(existing) => {
                    self.append_to(existing, &ids)?;
                    existing
                }
            };
            offsets.push(offset);
        }

        Ok(offsets)
    }

    fn read_header(&mut self, offset: u64) -> Result<(u64, Option<u64>)> {
        self.file.seek(SeekFrom::Start(offset))?;

        let count = self
            .file
            .read_i64::<LittleEndian>()
            .map_err(|_| truncated(offset))?;
        let next = self
            .file
            .read_i64::<LittleEndian>()
            .map_err(|_| truncated(offset))?;

        if count < 0 {
            return Err(CanopyError::corrupt(format!(
                "postings page at {offset} declares a negative count"
            )));
        }

        let next = match next {
            -1 => None,
            n if n < 0 => {
                return Err(CanopyError::corrupt(format!(
                    "postings page at {offset} holds an invalid next offset {n}"
                )));
            }
            n => Some(n as u64),
        };

        Ok((count as u64, next))
    }
}

fn truncated(offset: u64) -> CanopyError {
    CanopyError::corrupt(format!(
        "postings page at {offset} runs past the end of the file"
    ))
}

fn parse_batch(payload: &[u8]) -> Result<Vec<(Option<u64>, Vec<u64>)>> {
    let malformed = |what: &str| {
        CanopyError::index(format!("malformed postings batch: {what}"))
    };

    let mut cursor = payload;
    let entry_count = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| malformed("missing entry count"))? as usize;

    let mut lengths = Vec::with_capacity(entry_count);
    for _ in 0..entry_count {
        let len = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| malformed("missing id count"))?;
        lengths.push(len as usize);
    }

    let mut targets = Vec::with_capacity(entry_count);
    for _ in 0..entry_count {
        let target = cursor
            .read_i64::<LittleEndian>()
            .map_err(|_| malformed("missing target offset"))?;
        targets.push(if target < 0 {
            None
        } else {
            Some(target as u64)
        });
    }

    let declared: usize = lengths.iter().sum();
    if cursor.len() != declared * 8 {
        return Err(malformed("declared id counts disagree with payload size"));
    }

    let mut entries = Vec::with_capacity(entry_count);
    for (target, len) in targets.into_iter().zip(lengths) {
        let mut ids = Vec::with_capacity(len);
        for _ in 0..len {
            ids.push(cursor.read_u64::<LittleEndian>()?);
        }
        entries.push((target, ids));
    }

    Ok(entries)
}

/// Encode a batch write payload for [`PostingsStore::write_batch`].
pub fn encode_batch(entries: &[(Option<u64>, Vec<u64>)]) -> Vec<u8> {
    let id_total: usize = entries.iter().map(|(_, ids)| ids.len()).sum();
    let mut payload = Vec::with_capacity(4 + entries.len() * 12 + id_total * 8);

    payload.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for (_, ids) in entries {
        payload.extend_from_slice(&(ids.len() as u32).to_le_bytes());
    }
    for (target, _) in entries {
        let target = target.map(|t| t as i64).unwrap_or(-1);
        payload.extend_from_slice(&target.to_le_bytes());
    }
    for (_, ids) in entries {
        for id in ids {
            payload.extend_from_slice(&id.to_le_bytes());
        }
    }

    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, PostingsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = PostingsStore::open(dir.path().join("col.pos")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_append_then_read() {
        let (_dir, mut store) = store();

        let a = store.append(&[1, 2, 3]).unwrap();
        let b = store.append(&[9]).unwrap();

        assert_eq!(store.read(a).unwrap(), [1, 2, 3].into_iter().collect());
        assert_eq!(store.read(b).unwrap(), [9].into_iter().collect());
    }

    #[test]
    fn test_append_to_chains_a_new_page() {
        let (_dir, mut store) = store();

        let offset = store.append(&[1, 2]).unwrap();
        store.append_to(offset, &[3, 4]).unwrap();
        store.append_to(offset, &[5]).unwrap();

        assert_eq!(
            store.read(offset).unwrap(),
            [1, 2, 3, 4, 5].into_iter().collect()
        );
    }

    #[test]
    fn test_duplicate_id_in_chain_is_corrupt() {
        let (_dir, mut store) = store();

        let offset = store.append(&[1, 2]).unwrap();
        store.append_to(offset, &[2]).unwrap();

        assert!(matches!(
            store.read(offset),
            Err(CanopyError::Corrupt(_))
        ));
    }

    #[test]
    fn test_read_past_end_is_corrupt() {
        let (_dir, mut store) = store();
        store.append(&[1]).unwrap();

        assert!(matches!(store.read(9999), Err(CanopyError::Corrupt(_))));
    }

    #[test]
    fn test_write_batch_round_trip() {
        let (_dir, mut store) = store();

        let first = store.append(&[7]).unwrap();
        let payload = encode_batch(&[(None, vec![1, 2]), (Some(first), vec![8, 9])]);

        let offsets = store.write_batch(&payload).unwrap();
        assert_eq!(offsets.len(), 2);
        assert_eq!(offsets[1], first);

        assert_eq!(store.read(offsets[0]).unwrap(), [1, 2].into_iter().collect());
        assert_eq!(
            store.read(first).unwrap(),
            [7, 8, 9].into_iter().collect()
        );
    }

    #[test]
    fn test_malformed_batch_writes_nothing() {
        let (_dir, mut store) = store();

        let mut payload = encode_batch(&[(None, vec![1, 2, 3])]);
        payload.truncate(payload.len() - 8); // drop one declared id

        assert!(store.write_batch(&payload).is_err());
        assert_eq!(store.file.metadata().unwrap().len(), 0);
    }
}
