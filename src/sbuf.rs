//! # Scan Buffers
//!
//! `Sbuf` is the read-only byte range handed to scanners. Top-level pages and
//! decompressed children own their bytes; sub-views and stored children
//! borrow them from the parent. `bufsize` is everything readable (page plus
//! margin); `pagesize` is the part this buffer is authoritative for.

use std::borrow::Cow;
use std::io::Write;

use memchr::memmem;
use thiserror::Error;

use crate::position::PositionPath;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SbufError {
    #[error("read of {len} bytes at offset {offset} is outside buffer of {size} bytes")]
    OutOfRange { offset: usize, len: usize, size: usize },
}

#[derive(Debug, Clone)]
pub struct Sbuf<'a> {
    pub pos0: PositionPath,
    pub page_number: u64,
    data: Cow<'a, [u8]>,
    pagesize: usize,
}

impl Sbuf<'static> {
    /// Buffer that owns `data`. `pagesize` is clamped to the data length.
    pub fn owned(pos0: PositionPath, data: Vec<u8>, pagesize: usize) -> Self {
        let pagesize = pagesize.min(data.len());
        Self {
            pos0,
            page_number: 0,
            data: Cow::Owned(data),
            pagesize,
        }
    }
}

impl<'a> Sbuf<'a> {
    /// Buffer over bytes owned by someone else.
    pub fn borrowed(pos0: PositionPath, data: &'a [u8], pagesize: usize) -> Self {
        Self {
            pos0,
            page_number: 0,
            data: Cow::Borrowed(data),
            pagesize: pagesize.min(data.len()),
        }
    }

    pub fn bufsize(&self) -> usize {
        self.data.len()
    }

    pub fn pagesize(&self) -> usize {
        self.pagesize
    }

    pub fn depth(&self) -> u32 {
        self.pos0.depth()
    }

    pub fn is_owned(&self) -> bool {
        matches!(self.data, Cow::Owned(_))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// The authoritative part of the buffer (no margin).
    pub fn page(&self) -> &[u8] {
        &self.data[..self.pagesize]
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), SbufError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(()),
            _ => Err(SbufError::OutOfRange {
                offset,
                len,
                size: self.data.len(),
            }),
        }
    }

    fn array<const N: usize>(&self, offset: usize) -> Result<[u8; N], SbufError> {
        self.check(offset, N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[offset..offset + N]);
        Ok(out)
    }

    pub fn get8(&self, offset: usize) -> Result<u8, SbufError> {
        self.check(offset, 1)?;
        Ok(self.data[offset])
    }

    pub fn get16_le(&self, offset: usize) -> Result<u16, SbufError> {
        Ok(u16::from_le_bytes(self.array(offset)?))
    }

    pub fn get16_be(&self, offset: usize) -> Result<u16, SbufError> {
        Ok(u16::from_be_bytes(self.array(offset)?))
    }

    pub fn get32_le(&self, offset: usize) -> Result<u32, SbufError> {
        Ok(u32::from_le_bytes(self.array(offset)?))
    }

    pub fn get32_be(&self, offset: usize) -> Result<u32, SbufError> {
        Ok(u32::from_be_bytes(self.array(offset)?))
    }

    pub fn get64_le(&self, offset: usize) -> Result<u64, SbufError> {
        Ok(u64::from_le_bytes(self.array(offset)?))
    }

    pub fn get64_be(&self, offset: usize) -> Result<u64, SbufError> {
        Ok(u64::from_be_bytes(self.array(offset)?))
    }

    pub fn slice_bytes(&self, offset: usize, len: usize) -> Result<&[u8], SbufError> {
        self.check(offset, len)?;
        Ok(&self.data[offset..offset + len])
    }

    /// Bytes at `offset..offset+len` as text; invalid UTF-8 is replaced.
    pub fn substr(&self, offset: usize, len: usize) -> Result<String, SbufError> {
        Ok(String::from_utf8_lossy(self.slice_bytes(offset, len)?).into_owned())
    }

    /// First occurrence of `needle` at or after `start`.
    pub fn find(&self, needle: &[u8], start: usize) -> Option<usize> {
        if start >= self.data.len() {
            return None;
        }
        memmem::find(&self.data[start..], needle).map(|i| i + start)
    }

    /// Zero-copy view from `offset` to the end of this buffer.
    pub fn slice_from(&self, offset: usize) -> Result<Sbuf<'_>, SbufError> {
        let len = self.data.len().checked_sub(offset).ok_or(SbufError::OutOfRange {
            offset,
            len: 0,
            size: self.data.len(),
        })?;
        self.range(offset, len)
    }

    /// Zero-copy view of `len` bytes at `offset`. The page boundary carries
    /// over so a sub-view never claims margin bytes as its own.
    pub fn range(&self, offset: usize, len: usize) -> Result<Sbuf<'_>, SbufError> {
        self.check(offset, len)?;
        let pagesize = self.pagesize.saturating_sub(offset).min(len);
        Ok(Sbuf {
            pos0: self.pos0.shift(offset as u64),
            page_number: self.page_number,
            data: Cow::Borrowed(&self.data[offset..offset + len]),
            pagesize,
        })
    }

    /// Recursion child over freshly produced bytes (e.g. decompressed output).
    pub fn child_owned(&self, tag: &str, pos: usize, data: Vec<u8>) -> Sbuf<'static> {
        let len = data.len();
        let mut child = Sbuf::owned(self.pos0.shift(pos as u64).child(tag), data, len);
        child.page_number = self.page_number;
        child
    }

    /// Recursion child over bytes that stay inside this buffer (e.g. a stored
    /// archive member).
    pub fn child_borrowed<'b>(&self, tag: &str, pos: usize, data: &'b [u8]) -> Sbuf<'b> {
        let mut child = Sbuf::borrowed(self.pos0.shift(pos as u64).child(tag), data, data.len());
        child.page_number = self.page_number;
        child
    }

    /// Classic 16-bytes-per-line dump; clamps to the buffer.
    pub fn hex_dump<W: Write>(&self, out: &mut W, start: usize, len: usize) -> std::io::Result<()> {
        let start = start.min(self.data.len());
        let end = start.saturating_add(len).min(self.data.len());
        for (line_no, line) in self.data[start..end].chunks(16).enumerate() {
            write!(out, "{:08x}: ", start + line_no * 16)?;
            for i in 0..16 {
                match line.get(i) {
                    Some(b) => write!(out, "{b:02x}")?,
                    None => write!(out, "  ")?,
                }
                if i % 2 == 1 {
                    write!(out, " ")?;
                }
            }
            for &b in line {
                let ch = if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' };
                write!(out, "{ch}")?;
            }
            writeln!(out)?;
        }
        Ok(())
    }

    pub fn raw_dump<W: Write>(&self, out: &mut W, start: usize, len: usize) -> std::io::Result<()> {
        let start = start.min(self.data.len());
        let end = start.saturating_add(len).min(self.data.len());
        out.write_all(&self.data[start..end])
    }
}
