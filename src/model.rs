//! The similarity model contract and the bundled text model.
//!
//! A model turns raw values into [`SparseVector`]s, scores vector pairs,
//! exposes the two clustering thresholds, and owns the vector payload
//! encoding. The tree engine never branches on the concrete encoding; it
//! moves opaque byte regions addressed by `(offset, componentCount)`.

use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use unicode_segmentation::UnicodeSegmentation;

use crate::error::{CanopyError, Result};
use crate::vector::SparseVector;

/// Bytes per serialized vector component: `index:u32` + `weight:f32`.
pub const COMPONENT_SIZE: usize = 8;

/// A source of raw vector payload bytes.
///
/// Implemented over both seekable streams (buffered reads) and mapped byte
/// views, so one deserializer serves both physical read modes.
pub trait VectorSource {
    /// Fill `buf` with the bytes at `offset`. Short reads are an error.
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

fn read_from_stream<R: Read + Seek>(stream: &mut R, offset: u64, buf: &mut [u8]) -> Result<()> {
    stream.seek(SeekFrom::Start(offset))?;
    stream.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            CanopyError::corrupt(format!(
                "vector payload at {offset} runs past the end of the vector file"
            ))
        } else {
            e.into()
        }
    })
}

impl VectorSource for std::fs::File {
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        read_from_stream(self, offset, buf)
    }
}

impl<T: AsRef<[u8]>> VectorSource for std::io::Cursor<T> {
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        read_from_stream(self, offset, buf)
    }
}

/// A bounded byte view over a mapped vector file.
pub struct SliceVectorSource<'a> {
    bytes: &'a [u8],
}

impl<'a> SliceVectorSource<'a> {
    /// Wrap a mapped byte region.
    pub fn new(bytes: &'a [u8]) -> Self {
        SliceVectorSource { bytes }
    }
}

impl VectorSource for SliceVectorSource<'_> {
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| CanopyError::corrupt("vector offset exceeds address space"))?;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| {
                CanopyError::corrupt(format!(
                    "vector payload at {offset} runs past the end of the vector file"
                ))
            })?;

        buf.copy_from_slice(&self.bytes[start..end]);
        Ok(())
    }
}

/// The contract the tree engine consumes.
pub trait SimilarityModel: Send + Sync {
    /// Split a raw value into a finite sequence of vectors, one per token.
    fn tokenize(&self, value: &str) -> Vec<SparseVector>;

    /// Symmetric similarity score; bounded, higher means more similar.
    fn score(&self, a: &SparseVector, b: &SparseVector) -> f32;

    /// Threshold at or above which two vectors merge as the same entity.
    fn identical_angle(&self) -> f32;

    /// Threshold below which two vectors are siblings, not near-duplicates.
    fn fold_angle(&self) -> f32;

    /// Write a vector's payload, returning the number of bytes written.
    /// The caller tracks stream offsets.
    fn serialize_vector(&self, vector: &SparseVector, out: &mut dyn Write) -> Result<u64>;

    /// Read back a vector payload of `component_count` components at
    /// `offset`.
    fn deserialize_vector(
        &self,
        source: &mut dyn VectorSource,
        offset: u64,
        component_count: usize,
    ) -> Result<SparseVector>;
}

/// Bag-of-characters text model.
///
/// Values are segmented into unicode words, lowercased, and each token
/// becomes a sparse vector of character counts. Characters outside the
/// accepted code-point window are ignored.
#[derive(Debug, Clone)]
pub struct TextModel {
    identical_angle: f32,
    fold_angle: f32,
}

impl TextModel {
    /// First accepted code point.
    pub const CODE_POINT_START: u32 = 0x20;

    /// Width of the accepted code-point window.
    pub const VECTOR_WIDTH: u32 = 256;

    /// Create a model with the standard thresholds.
    pub fn new() -> Self {
        TextModel {
            identical_angle: 0.88,
            fold_angle: 0.58,
        }
    }

    /// Create a model with custom thresholds. `identical_angle` must exceed
    /// `fold_angle`.
    pub fn with_angles(identical_angle: f32, fold_angle: f32) -> Result<Self> {
        if identical_angle <= fold_angle {
            return Err(CanopyError::config(format!(
                "identical_angle ({identical_angle}) must exceed fold_angle ({fold_angle})"
            )));
        }

        Ok(TextModel {
            identical_angle,
            fold_angle,
        })
    }

    fn embed(token: &str) -> SparseVector {
        let components = token
            .chars()
            .flat_map(char::to_lowercase)
            .map(|c| c as u32)
            .filter(|&code| {
                code >= Self::CODE_POINT_START && code < Self::CODE_POINT_START + Self::VECTOR_WIDTH
            })
            .map(|code| (code, 1.0))
            .collect();

        SparseVector::new(components).with_label(token.to_lowercase())
    }
}

impl Default for TextModel {
    fn default() -> Self {
        TextModel::new()
    }
}

impl SimilarityModel for TextModel {
    fn tokenize(&self, value: &str) -> Vec<SparseVector> {
        value
            .unicode_words()
            .map(Self::embed)
            .filter(|v| v.component_count() > 0)
            .collect()
    }

    fn score(&self, a: &SparseVector, b: &SparseVector) -> f32 {
        a.cos_angle(b)
    }

    fn identical_angle(&self) -> f32 {
        self.identical_angle
    }

    fn fold_angle(&self) -> f32 {
        self.fold_angle
    }

    fn serialize_vector(&self, vector: &SparseVector, out: &mut dyn Write) -> Result<u64> {
        for &(index, weight) in vector.components() {
            out.write_u32::<LittleEndian>(index)?;
            out.write_f32::<LittleEndian>(weight)?;
        }

        Ok((vector.component_count() * COMPONENT_SIZE) as u64)
    }

    fn deserialize_vector(
        &self,
        source: &mut dyn VectorSource,
        offset: u64,
        component_count: usize,
    ) -> Result<SparseVector> {
        let mut buf = vec![0u8; component_count * COMPONENT_SIZE];
        source.read_exact_at(offset, &mut buf)?;

        let mut cursor = &buf[..];
        let mut components = Vec::with_capacity(component_count);
        for _ in 0..component_count {
            let index = cursor.read_u32::<LittleEndian>()?;
            let weight = cursor.read_f32::<LittleEndian>()?;
            components.push((index, weight));
        }

        Ok(SparseVector::new(components))
    }
}
