//! Document writes: store fields, then feed the indexing pipeline.

use std::sync::Arc;

use chrono::Utc;

use crate::config::Config;
use crate::directory::Directory;
use crate::docs::{Document, DocumentWriter, FieldValue};
use crate::error::Result;
use crate::model::SimilarityModel;
use crate::session::IndexSession;

/// A write session targeting a single collection.
///
/// Every document is stamped with a `_created` timestamp. Fields whose
/// names begin with `_` are stored but not indexed; non-text fields are
/// likewise stored only.
pub struct WriteSession {
    collection_id: u64,
    directory: Arc<Directory>,
    docs: DocumentWriter,
    index: IndexSession,
}

impl WriteSession {
    pub fn new(
        collection_id: u64,
        directory: Arc<Directory>,
        model: Arc<dyn SimilarityModel>,
        config: &Config,
    ) -> Result<Self> {
        let docs = directory.document_writer(collection_id)?;
        let index = IndexSession::new(collection_id, Arc::clone(&directory), model, config)?;

        Ok(WriteSession {
            collection_id,
            directory,
            docs,
            index,
        })
    }

    /// Store and index one document, returning the id it was assigned.
    pub fn put(&mut self, mut fields: Document) -> Result<u64> {
        fields.push((
            "_created".into(),
            FieldValue::Integer(Utc::now().timestamp_millis()),
        ));

        let doc_id = self.docs.append(&fields)?;

        for (name, value) in &fields {
            if name.starts_with('_') {
                continue;
            }
            let Some(text) = value.as_text() else {
                continue;
            };

            let key_id = self
                .directory
                .get_or_create_key_id(self.collection_id, name)?;
            self.index.put_value(doc_id, key_id, text)?;
        }

        Ok(doc_id)
    }

    /// Documents written so far (stored count, not merged-cluster count).
    pub fn doc_count(&self) -> u64 {
        self.docs.next_doc_id()
    }

    /// Flush the indexing pipeline; see [`IndexSession::flush`].
    pub fn flush(&mut self) -> Result<()> {
        self.index.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docs::DocumentReader;
    use crate::model::TextModel;

    #[test]
    fn test_put_stores_stamps_and_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let directory = Arc::new(Directory::open(dir.path()).unwrap());
        let cid = directory.collection_id("books");

        let mut session = WriteSession::new(
            cid,
            Arc::clone(&directory),
            Arc::new(TextModel::new()),
            &Config::new(),
        )
        .unwrap();

        let doc_id = session
            .put(vec![
                ("title".into(), FieldValue::Text("cat".into())),
                ("year".into(), FieldValue::Integer(2009)),
                ("_private".into(), FieldValue::Text("hidden".into())),
            ])
            .unwrap();
        session.flush().unwrap();

        assert_eq!(doc_id, 0);

        // Only the text field outside the underscore namespace was indexed.
        assert_eq!(directory.key_id(cid, "title").unwrap(), Some(0));
        assert_eq!(directory.key_id(cid, "year").unwrap(), None);
        assert_eq!(directory.key_id(cid, "_private").unwrap(), None);

        // The stored record kept everything, plus the timestamp stamp.
        let mut reader = DocumentReader::open(
            directory.docs_path(cid),
            directory.docs_index_path(cid),
        )
        .unwrap()
        .unwrap();
        let fields = reader.read_document(doc_id, &[]).unwrap().unwrap();
        assert_eq!(fields.len(), 4);
        assert!(fields.iter().any(|(name, _)| name == "_created"));
        assert!(fields.iter().any(|(name, _)| name == "_private"));
    }
}
