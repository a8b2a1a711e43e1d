use std::fs::File;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::image::raw::read_exact_at;
use crate::image::{ImageError, ImageSource, PageData, PageGeometry, PageRef, alloc_page};
use crate::position::PositionPath;

#[derive(Debug)]
struct Member {
    path: PathBuf,
    /// Path relative to the image root, with `/` separators.
    name: String,
    len: u64,
    first_page: u64,
    raw_start: u64,
}

/// Every regular file under a directory, in sorted order. Each file is paged
/// on its own; margins never cross into the next file.
#[derive(Debug)]
pub struct DirectoryImage {
    members: Vec<Member>,
    identifier: String,
    geometry: PageGeometry,
    total_len: u64,
    total_pages: u64,
}

impl DirectoryImage {
    pub fn open(root: &Path, geometry: PageGeometry) -> Result<Self, ImageError> {
        let walker = jwalk::WalkDir::new(root)
            .skip_hidden(false)
            .follow_links(false)
            .sort(true);

        let mut found: Vec<(String, PathBuf, u64)> = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("skipping unreadable entry: {err}");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let len = match entry.metadata() {
                Ok(meta) => meta.len(),
                Err(err) => {
                    warn!(path = %path.display(), "skipping file without metadata: {err}");
                    continue;
                }
            };
            let name = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            found.push((name, path, len));
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));

        let mut members = Vec::with_capacity(found.len());
        let mut total_len = 0u64;
        let mut total_pages = 0u64;
        for (name, path, len) in found {
            let pages = geometry.pages_for(len);
            members.push(Member {
                path,
                name,
                len,
                first_page: total_pages,
                raw_start: total_len,
            });
            total_pages += pages;
            total_len += len;
        }
        debug!(files = members.len(), pages = total_pages, "directory image opened");

        Ok(Self {
            members,
            identifier: root.display().to_string(),
            geometry,
            total_len,
            total_pages,
        })
    }

    pub fn file_count(&self) -> usize {
        self.members.len()
    }

    fn member_for_page(&self, index: u64) -> Option<&Member> {
        if index >= self.total_pages {
            return None;
        }
        // last member whose first page is <= index and that has pages
        let at = self.members.partition_point(|m| m.first_page <= index);
        self.members[..at]
            .iter()
            .rev()
            .find(|m| m.len > 0)
    }
}

impl ImageSource for DirectoryImage {
    fn image_size(&self) -> u64 {
        self.total_len
    }

    fn image_identifier(&self) -> &str {
        &self.identifier
    }

    fn page_count(&self) -> u64 {
        self.total_pages
    }

    fn page(&self, index: u64) -> Option<PageRef> {
        let member = self.member_for_page(index)?;
        let offset = (index - member.first_page) * self.geometry.page_size;
        Some(PageRef {
            index,
            pos: PositionPath::in_file(&member.name, offset),
            raw_offset: member.raw_start + offset,
        })
    }

    fn read_page(&self, page: &PageRef) -> Result<PageData, ImageError> {
        let member = self
            .member_for_page(page.index)
            .ok_or_else(|| ImageError::NotFound(page.pos.to_string()))?;
        let offset = page.raw_offset - member.raw_start;
        let (bufsize, pagesize) = self.geometry.extent(offset, member.len);
        let mut data = alloc_page(bufsize)?;
        let file = File::open(&member.path)?;
        read_exact_at(&file, offset, &mut data)?;
        Ok(PageData {
            page: page.clone(),
            data,
            pagesize,
        })
    }
}
