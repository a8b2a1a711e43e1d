//! # Image Sources
//!
//! An image is read as a sequence of fixed-size pages. Each page is read
//! together with a trailing margin so that features spanning a page boundary
//! are still seen whole by the page they start in.

pub mod dir;
pub mod raw;

use std::path::Path;

use thiserror::Error;

use crate::position::PositionPath;
use crate::sbuf::Sbuf;

pub use dir::DirectoryImage;
pub use raw::RawImage;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("input not found: {0}")]
    NotFound(String),
    #[error("cannot determine the size of {0}")]
    UnknownSize(String),
    #[error("invalid page geometry: {0}")]
    Geometry(String),
    /// The page buffer could not be allocated. Worth retrying later.
    #[error("could not allocate {bytes} bytes for page")]
    OutOfMemory { bytes: usize },
    #[error("short read at offset {offset}: wanted {wanted} bytes, got {got}")]
    ShortRead { offset: u64, wanted: usize, got: usize },
}

impl ImageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ImageError::OutOfMemory { .. })
    }
}

/// Page size plus margin, shared by every source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageGeometry {
    pub page_size: u64,
    pub margin: u64,
}

impl PageGeometry {
    pub fn new(page_size: u64, margin: u64) -> Result<Self, ImageError> {
        if page_size == 0 {
            return Err(ImageError::Geometry("page size must be positive".to_string()));
        }
        Ok(Self { page_size, margin })
    }

    pub fn pages_for(&self, len: u64) -> u64 {
        len.div_ceil(self.page_size)
    }

    /// `(bufsize, pagesize)` of the page starting at `offset` in a stream of
    /// `len` bytes.
    pub fn extent(&self, offset: u64, len: u64) -> (usize, usize) {
        let remaining = len.saturating_sub(offset);
        let bufsize = remaining.min(self.page_size.saturating_add(self.margin));
        let pagesize = remaining.min(self.page_size);
        (bufsize as usize, pagesize as usize)
    }
}

/// Identity of one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRef {
    pub index: u64,
    pub pos: PositionPath,
    /// Offset of the page in the concatenated input.
    pub raw_offset: u64,
}

/// One page read from the image, margin included.
#[derive(Debug)]
pub struct PageData {
    pub page: PageRef,
    pub data: Vec<u8>,
    pub pagesize: usize,
}

impl PageData {
    pub fn into_sbuf(self) -> Sbuf<'static> {
        let mut sbuf = Sbuf::owned(self.page.pos, self.data, self.pagesize);
        sbuf.page_number = self.page.index;
        sbuf
    }
}

pub trait ImageSource: Send + Sync {
    fn image_size(&self) -> u64;

    fn image_identifier(&self) -> &str;

    fn page_count(&self) -> u64;

    /// Page at `index`, or `None` past the end.
    fn page(&self, index: u64) -> Option<PageRef>;

    /// All pages in order.
    fn pages(&self) -> Box<dyn Iterator<Item = PageRef> + '_> {
        Box::new((0..self.page_count()).filter_map(move |i| self.page(i)))
    }

    fn read_page(&self, page: &PageRef) -> Result<PageData, ImageError>;
}

/// Allocate a zeroed page buffer without aborting on allocation failure.
pub(crate) fn alloc_page(len: usize) -> Result<Vec<u8>, ImageError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| ImageError::OutOfMemory { bytes: len })?;
    buf.resize(len, 0);
    Ok(buf)
}

/// Open `path` as a directory image or a raw image.
pub fn open_image(path: &Path, geometry: PageGeometry) -> Result<Box<dyn ImageSource>, ImageError> {
    if !path.exists() {
        return Err(ImageError::NotFound(path.display().to_string()));
    }
    if path.is_dir() {
        Ok(Box::new(DirectoryImage::open(path, geometry)?))
    } else {
        Ok(Box::new(RawImage::open(path, geometry)?))
    }
}
