//! A data directory holding collections and their on-disk artifacts.
//!
//! The directory owns everything that is shared across sessions against the
//! same data: file naming, stream creation, the page-location cache, and the
//! persisted field-name registry. All of that state is instance-owned, so
//! multiple directories (and their sessions) coexist in one process.
//!
//! Per collection `c` and column `k` the artifacts are `c.vec` (vector
//! payloads), `c.k.ix` (node blocks), `c.k.ixtp` (page index), `c.pos`
//! (postings), `c.docs`/`c.dix` (stored documents), and `c.kmap` (field
//! registry).

use std::fs::{File, OpenOptions};
use std::hash::BuildHasher;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ahash::AHashMap;
use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;

use crate::column::{ColumnReader, PageInfo, read_page_info};
use crate::config::Config;
use crate::docs::{DocumentReader, DocumentWriter};
use crate::error::Result;
use crate::model::SimilarityModel;
use crate::postings::PostingsStore;

/// Per-collection field registry: the ordinal of a field name's hash in the
/// `.kmap` file is its key id.
#[derive(Debug, Default)]
struct KeyMap {
    by_hash: AHashMap<u64, u64>,
    loaded: bool,
}

/// A handle on one data directory.
#[derive(Debug)]
pub struct Directory {
    root: PathBuf,
    page_cache: Mutex<AHashMap<(u64, u64), Arc<Vec<PageInfo>>>>,
    key_maps: Mutex<AHashMap<u64, KeyMap>>,
}

impl Directory {
    /// Open a data directory, creating it if necessary.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;

        Ok(Directory {
            root,
            page_cache: Mutex::new(AHashMap::new()),
            key_maps: Mutex::new(AHashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The stable 64-bit hash of a collection or field name. Persisted in
    /// `.kmap`, so the seeds are fixed.
    pub fn hash_name(name: &str) -> u64 {
        ahash::RandomState::with_seeds(
            0x517c_c1b7_2722_0a95,
            0x6c62_272e_07bb_0142,
            0x2f8f_9b4f_27a5_e7d3,
            0x0b4e_8a5d_9d6c_3f71,
        )
        .hash_one(name)
    }

    /// The collection id for a collection name.
    pub fn collection_id(&self, name: &str) -> u64 {
        Self::hash_name(name)
    }

    pub fn vector_path(&self, collection_id: u64) -> PathBuf {
        self.root.join(format!("{collection_id}.vec"))
    }

    pub fn postings_path(&self, collection_id: u64) -> PathBuf {
        self.root.join(format!("{collection_id}.pos"))
    }

    pub fn index_path(&self, collection_id: u64, key_id: u64) -> PathBuf {
        self.root.join(format!("{collection_id}.{key_id}.ix"))
    }

    pub fn page_index_path(&self, collection_id: u64, key_id: u64) -> PathBuf {
        self.root.join(format!("{collection_id}.{key_id}.ixtp"))
    }

    pub fn docs_path(&self, collection_id: u64) -> PathBuf {
        self.root.join(format!("{collection_id}.docs"))
    }

    pub fn docs_index_path(&self, collection_id: u64) -> PathBuf {
        self.root.join(format!("{collection_id}.dix"))
    }

    pub fn key_map_path(&self, collection_id: u64) -> PathBuf {
        self.root.join(format!("{collection_id}.kmap"))
    }

    /// Open a stream for appending. The file is created if absent; callers
    /// seek to the end before writing.
    pub fn open_append(&self, path: PathBuf) -> Result<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(file)
    }

    /// The postings store for a collection, opened for writing.
    pub fn postings(&self, collection_id: u64) -> Result<PostingsStore> {
        PostingsStore::open(self.postings_path(collection_id))
    }

    /// The postings store for a collection, if it exists on disk.
    pub fn postings_reader(&self, collection_id: u64) -> Result<Option<PostingsStore>> {
        PostingsStore::open_existing(self.postings_path(collection_id))
    }

    /// The document store's write side for a collection.
    pub fn document_writer(&self, collection_id: u64) -> Result<DocumentWriter> {
        DocumentWriter::open(
            self.docs_path(collection_id),
            self.docs_index_path(collection_id),
        )
    }

    /// The document store's read side for a collection, if any documents
    /// were stored.
    pub fn document_reader(&self, collection_id: u64) -> Result<Option<DocumentReader>> {
        DocumentReader::open(
            self.docs_path(collection_id),
            self.docs_index_path(collection_id),
        )
    }

    /// The page extents of a column, cached until the next flush against
    /// the collection.
    pub fn page_info(&self, collection_id: u64, key_id: u64) -> Result<Arc<Vec<PageInfo>>> {
        let mut cache = self.page_cache.lock();

        if let Some(pages) = cache.get(&(collection_id, key_id)) {
            return Ok(Arc::clone(pages));
        }

        let pages = Arc::new(read_page_info(
            self.page_index_path(collection_id, key_id),
        )?);
        cache.insert((collection_id, key_id), Arc::clone(&pages));
        Ok(pages)
    }

    /// Drop cached page extents for every column of a collection. Called
    /// after a flush so readers re-derive them from the fresh page index.
    pub fn invalidate_page_info(&self, collection_id: u64) {
        self.page_cache
            .lock()
            .retain(|&(cid, _), _| cid != collection_id);
    }

    /// A closest-match reader over one column, or `None` when the column
    /// has never been flushed.
    pub fn column_reader(
        &self,
        collection_id: u64,
        key_id: u64,
        model: Arc<dyn SimilarityModel>,
        config: &Config,
    ) -> Result<Option<ColumnReader>> {
        let pages = self.page_info(collection_id, key_id)?;
        if pages.is_empty() {
            return Ok(None);
        }

        Ok(Some(ColumnReader::new(
            self.index_path(collection_id, key_id),
            self.vector_path(collection_id),
            pages,
            model,
            config,
        )))
    }

    /// The key id registered for a field name, if any.
    pub fn key_id(&self, collection_id: u64, field: &str) -> Result<Option<u64>> {
        let mut maps = self.key_maps.lock();
        let map = self.load_key_map(&mut maps, collection_id)?;
        Ok(map.by_hash.get(&Self::hash_name(field)).copied())
    }

    /// The key id for a field name, registering it when unseen. New ids are
    /// persisted to the collection's `.kmap` before they are returned.
    pub fn get_or_create_key_id(&self, collection_id: u64, field: &str) -> Result<u64> {
        let hash = Self::hash_name(field);
        let mut maps = self.key_maps.lock();
        let map = self.load_key_map(&mut maps, collection_id)?;

        if let Some(&key_id) = map.by_hash.get(&hash) {
            return Ok(key_id);
        }

        let key_id = map.by_hash.len() as u64;
        let mut file = self.open_append(self.key_map_path(collection_id))?;
        file.seek(SeekFrom::End(0))?;
        file.write_all(&hash.to_le_bytes())?;
        map.by_hash.insert(hash, key_id);

        Ok(key_id)
    }

    fn load_key_map<'a>(
        &self,
        maps: &'a mut AHashMap<u64, KeyMap>,
        collection_id: u64,
    ) -> Result<&'a mut KeyMap> {
        let map = maps.entry(collection_id).or_default();

        if !map.loaded {
            match std::fs::read(self.key_map_path(collection_id)) {
                Ok(bytes) => {
                    for (ordinal, chunk) in bytes.chunks_exact(8).enumerate() {
                        map.by_hash
                            .insert(LittleEndian::read_u64(chunk), ordinal as u64);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            map.loaded = true;
        }

        Ok(map)
    }
}
