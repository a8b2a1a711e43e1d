use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::Path;

use crate::image::{ImageError, ImageSource, PageData, PageGeometry, PageRef, alloc_page};
use crate::position::PositionPath;

/// Positional read of `buf.len()` bytes; fails on EOF before the buffer is
/// full.
pub(crate) fn read_exact_at(file: &File, offset: u64, buf: &mut [u8]) -> Result<(), ImageError> {
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = read_at(file, offset + filled as u64, &mut buf[filled..])?;
        if n == 0 {
            return Err(ImageError::ShortRead {
                offset,
                wanted: buf.len(),
                got: filled,
            });
        }
        filled += n;
    }
    Ok(())
}

#[cfg(unix)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

/// A single file or block device read with positional reads. Devices report
/// no length in their metadata; their size is found by seeking to the end.
pub struct RawImage {
    file: File,
    len: u64,
    identifier: String,
    geometry: PageGeometry,
}

impl RawImage {
    pub fn open(path: &Path, geometry: PageGeometry) -> Result<Self, ImageError> {
        let mut file = File::open(path)?;
        let meta = file.metadata()?;
        let len = if meta.is_file() {
            meta.len()
        } else {
            let len = file.seek(SeekFrom::End(0))?;
            if len == 0 {
                return Err(ImageError::UnknownSize(path.display().to_string()));
            }
            len
        };
        Ok(Self {
            file,
            len,
            identifier: path.display().to_string(),
            geometry,
        })
    }
}

impl ImageSource for RawImage {
    fn image_size(&self) -> u64 {
        self.len
    }

    fn image_identifier(&self) -> &str {
        &self.identifier
    }

    fn page_count(&self) -> u64 {
        self.geometry.pages_for(self.len)
    }

    fn page(&self, index: u64) -> Option<PageRef> {
        if index >= self.page_count() {
            return None;
        }
        let offset = index * self.geometry.page_size;
        Some(PageRef {
            index,
            pos: PositionPath::root(offset),
            raw_offset: offset,
        })
    }

    fn read_page(&self, page: &PageRef) -> Result<PageData, ImageError> {
        let (bufsize, pagesize) = self.geometry.extent(page.raw_offset, self.len);
        let mut data = alloc_page(bufsize)?;
        read_exact_at(&self.file, page.raw_offset, &mut data)?;
        Ok(PageData {
            page: page.clone(),
            data,
            pagesize,
        })
    }
}
