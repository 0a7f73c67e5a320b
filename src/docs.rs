//! The document store: raw field values keyed by document id.
//!
//! Records are bincode-encoded field lists appended to `{collection}.docs`,
//! each prefixed with its length and a CRC32 of the payload. A fixed-width
//! offset index (`{collection}.dix`) maps a document id to its record, so
//! document ids are the ordinals of insertion.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::error::{CanopyError, Result};

/// A stored field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl FieldValue {
    /// The text form a field is tokenized from; `None` for non-text values,
    /// which are stored but not indexed.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Text(text) => write!(f, "{text}"),
            FieldValue::Integer(n) => write!(f, "{n}"),
            FieldValue::Float(n) => write!(f, "{n}"),
            FieldValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// A document's stored fields, in insertion order.
pub type Document = Vec<(String, FieldValue)>;

/// Bytes per `.dix` record: `offset:u64, length:u64`.
const INDEX_RECORD_SIZE: u64 = 16;

/// Appends documents for one collection.
pub struct DocumentWriter {
    records: File,
    index: File,
    next_doc_id: u64,
}

impl DocumentWriter {
    /// Open the store's write side, picking up after any existing records.
    pub fn open(records_path: PathBuf, index_path: PathBuf) -> Result<Self> {
        let open = |path: &PathBuf| {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)
        };

        let records = open(&records_path)?;
        let index = open(&index_path)?;
        let next_doc_id = index.metadata()?.len() / INDEX_RECORD_SIZE;

        Ok(DocumentWriter {
            records,
            index,
            next_doc_id,
        })
    }

    /// Append a document, returning the id it was assigned.
    pub fn append(&mut self, fields: &Document) -> Result<u64> {
        let payload = bincode::serialize(fields)?;
        let checksum = crc32fast::hash(&payload);

        let offset = self.records.seek(SeekFrom::End(0))?;
        self.records.write_u32::<LittleEndian>(payload.len() as u32)?;
        self.records.write_u32::<LittleEndian>(checksum)?;
        self.records.write_all(&payload)?;

        self.index.seek(SeekFrom::End(0))?;
        self.index.write_u64::<LittleEndian>(offset)?;
        self.index
            .write_u64::<LittleEndian>(8 + payload.len() as u64)?;

        let doc_id = self.next_doc_id;
        self.next_doc_id += 1;
        Ok(doc_id)
    }

    /// The id the next appended document will receive.
    pub fn next_doc_id(&self) -> u64 {
        self.next_doc_id
    }
}

/// Reads documents for one collection. Opened per query; file handles are
/// acquired on open and released on drop.
pub struct DocumentReader {
    records: File,
    index: File,
    doc_count: u64,
}

impl DocumentReader {
    /// Open the store's read side. Returns `None` when the collection has
    /// no stored documents.
    pub fn open(records_path: PathBuf, index_path: PathBuf) -> Result<Option<Self>> {
        let index = match File::open(&index_path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let records = File::open(&records_path)?;
        let doc_count = index.metadata()?.len() / INDEX_RECORD_SIZE;

        Ok(Some(DocumentReader {
            records,
            index,
            doc_count,
        }))
    }

    pub fn doc_count(&self) -> u64 {
        self.doc_count
    }

    /// Read one document, keeping only the fields named in `select` (all
    /// fields when `select` is empty). Unknown ids yield `None`.
    pub fn read_document(&mut self, doc_id: u64, select: &[String]) -> Result<Option<Document>> {
        if doc_id >= self.doc_count {
            return Ok(None);
        }

        self.index
            .seek(SeekFrom::Start(doc_id * INDEX_RECORD_SIZE))?;
        let offset = self.index.read_u64::<LittleEndian>()?;
        let length = self.index.read_u64::<LittleEndian>()?;

        if length < 8 {
            return Err(CanopyError::corrupt(format!(
                "document {doc_id} declares an impossible record length {length}"
            )));
        }

        self.records.seek(SeekFrom::Start(offset))?;
        let payload_len = self.records.read_u32::<LittleEndian>()?;
        let checksum = self.records.read_u32::<LittleEndian>()?;

        if payload_len as u64 != length - 8 {
            return Err(CanopyError::corrupt(format!(
                "document {doc_id} record length disagrees with its index entry"
            )));
        }

        let mut payload = vec![0u8; payload_len as usize];
        self.records.read_exact(&mut payload).map_err(|_| {
            CanopyError::corrupt(format!("document {doc_id} record is truncated"))
        })?;

        if crc32fast::hash(&payload) != checksum {
            return Err(CanopyError::corrupt(format!(
                "document {doc_id} failed its checksum"
            )));
        }

        let fields: Document = bincode::deserialize(&payload)?;
        if select.is_empty() {
            return Ok(Some(fields));
        }

        Ok(Some(
            fields
                .into_iter()
                .filter(|(name, _)| select.iter().any(|s| s == name))
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let records = dir.path().join("1.docs");
        let index = dir.path().join("1.dix");
        (dir, records, index)
    }

    #[test]
    fn test_append_then_read_round_trip() {
        let (_dir, records, index) = fixture();

        let mut writer = DocumentWriter::open(records.clone(), index.clone()).unwrap();
        let doc: Document = vec![
            ("title".into(), FieldValue::Text("cat".into())),
            ("year".into(), FieldValue::Integer(2009)),
        ];
        let id = writer.append(&doc).unwrap();
        assert_eq!(id, 0);
        assert_eq!(writer.next_doc_id(), 1);

        let mut reader = DocumentReader::open(records, index).unwrap().unwrap();
        assert_eq!(reader.doc_count(), 1);
        assert_eq!(reader.read_document(0, &[]).unwrap().unwrap(), doc);
        assert_eq!(reader.read_document(9, &[]).unwrap(), None);
    }

    #[test]
    fn test_field_selection() {
        let (_dir, records, index) = fixture();

        let mut writer = DocumentWriter::open(records.clone(), index.clone()).unwrap();
        writer
            .append(&vec![
                ("title".into(), FieldValue::Text("cat".into())),
                ("body".into(), FieldValue::Text("a cat sat".into())),
            ])
            .unwrap();

        let mut reader = DocumentReader::open(records, index).unwrap().unwrap();
        let doc = reader
            .read_document(0, &["title".into()])
            .unwrap()
            .unwrap();
        assert_eq!(doc, vec![("title".into(), FieldValue::Text("cat".into()))]);
    }

    #[test]
    fn test_corrupted_payload_fails_checksum() {
        let (_dir, records, index) = fixture();

        let mut writer = DocumentWriter::open(records.clone(), index.clone()).unwrap();
        writer
            .append(&vec![("title".into(), FieldValue::Text("cat".into()))])
            .unwrap();

        // Flip a payload byte behind the header.
        let mut bytes = std::fs::read(&records).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&records, bytes).unwrap();

        let mut reader = DocumentReader::open(records, index).unwrap().unwrap();
        assert!(matches!(
            reader.read_document(0, &[]),
            Err(CanopyError::Corrupt(_))
        ));
    }

    #[test]
    fn test_missing_store_reads_as_none() {
        let (_dir, records, index) = fixture();
        assert!(DocumentReader::open(records, index).unwrap().is_none());
    }

    #[test]
    fn test_writer_resumes_doc_ids() {
        let (_dir, records, index) = fixture();

        let mut writer = DocumentWriter::open(records.clone(), index.clone()).unwrap();
        writer
            .append(&vec![("title".into(), FieldValue::Text("one".into()))])
            .unwrap();
        drop(writer);

        let writer = DocumentWriter::open(records, index).unwrap();
        assert_eq!(writer.next_doc_id(), 1);
    }
}
