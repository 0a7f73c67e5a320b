//! Page index: `(offset, length)` extents of the pages in a column's index
//! file.
//!
//! Each flush appends one page to the index file and one record here, so a
//! reader can touch only the bytes of the pages it scans.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{CanopyError, Result};

/// The extent of one serialized page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    /// Byte offset of the page within the index file.
    pub offset: u64,
    /// Length of the page in bytes.
    pub length: u64,
}

/// Appends `(offset:i64, length:i64)` records to a page index stream.
pub struct PageIndexWriter {
    stream: File,
}

impl PageIndexWriter {
    pub fn new(stream: File) -> Self {
        PageIndexWriter { stream }
    }

    /// Record one page's extent.
    pub fn write(&mut self, offset: u64, length: u64) -> Result<()> {
        self.stream.write_i64::<LittleEndian>(offset as i64)?;
        self.stream.write_i64::<LittleEndian>(length as i64)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.stream.sync_data()?;
        Ok(())
    }
}

/// Read every page record from a page index file. A missing file is an empty
/// column, not an error.
pub fn read_page_info<P: AsRef<Path>>(path: P) -> Result<Vec<PageInfo>> {
    let file = match File::open(path.as_ref()) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let len = file.metadata()?.len();
    if len % 16 != 0 {
        return Err(CanopyError::corrupt(format!(
            "page index {} has a partial record",
            path.as_ref().display()
        )));
    }

    let mut reader = BufReader::new(file);
    let mut pages = Vec::with_capacity((len / 16) as usize);
    let mut record = [0u8; 16];

    while reader.read_exact(&mut record).is_ok() {
        let mut cursor = &record[..];
        let offset = cursor.read_i64::<LittleEndian>()?;
        let length = cursor.read_i64::<LittleEndian>()?;

        if offset < 0 || length < 0 {
            return Err(CanopyError::corrupt(format!(
                "page index {} holds a negative extent",
                path.as_ref().display()
            )));
        }

        pages.push(PageInfo {
            offset: offset as u64,
            length: length as u64,
        });
    }

    Ok(pages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("column.ixtp");

        let file = File::create(&path).unwrap();
        let mut writer = PageIndexWriter::new(file);
        writer.write(0, 250).unwrap();
        writer.write(250, 75).unwrap();
        writer.flush().unwrap();

        let pages = read_page_info(&path).unwrap();
        assert_eq!(
            pages,
            vec![
                PageInfo {
                    offset: 0,
                    length: 250
                },
                PageInfo {
                    offset: 250,
                    length: 75
                },
            ]
        );
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();

        let pages = read_page_info(dir.path().join("absent.ixtp")).unwrap();
        assert!(pages.is_empty());
    }

    #[test]
    fn test_partial_record_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("column.ixtp");
        std::fs::write(&path, [0u8; 20]).unwrap();

        assert!(matches!(
            read_page_info(&path),
            Err(CanopyError::Corrupt(_))
        ));
    }
}
