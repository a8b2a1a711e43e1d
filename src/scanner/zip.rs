//! ZIP local-file-header scanner.
//!
//! `PK\x03\x04` headers inside the page with version 20 and a plausible
//! uncompressed size are recorded to the `zip` sink with their header fields
//! as `<zipinfo>` markup, as are headers whose data starts past the buffer. Deflated members are inflated
//! and the output is dispatched as a `ZIP` child buffer; stored members are
//! dispatched in place.

use flate2::{Decompress, FlushDecompress};
use tracing::debug;

use crate::recorder::{FeatureRecorder, SinkSpec, xml_escape};
use crate::sbuf::Sbuf;
use crate::scanner::{Admission, ScanContext, Scanner, ScannerConfig, ScannerError, ScannerInfo};

pub const FEATURE_NAME: &str = "zip";
pub const TAG: &str = "ZIP";

const ZIP_HEADER: &[u8] = b"PK\x03\x04";
const LOCAL_HEADER_LEN: usize = 30;
/// Local header plus a short file name.
const MIN_ZIP_SIZE: usize = 38;
const SUPPORTED_VERSION: u16 = 20;
const METHOD_STORED: u16 = 0;

pub const DEFAULT_MAX_UNCOMPR_SIZE: u64 = 256 * 1024 * 1024;
pub const DEFAULT_MIN_UNCOMPR_SIZE: u64 = 6;
pub const DEFAULT_NAME_LEN_MAX: usize = 1024;

#[derive(Debug, Clone)]
pub struct ZipScanner {
    max_uncompr_size: u64,
    min_uncompr_size: u64,
    name_len_max: usize,
}

impl Default for ZipScanner {
    fn default() -> Self {
        Self {
            max_uncompr_size: DEFAULT_MAX_UNCOMPR_SIZE,
            min_uncompr_size: DEFAULT_MIN_UNCOMPR_SIZE,
            name_len_max: DEFAULT_NAME_LEN_MAX,
        }
    }
}

#[derive(Debug, Clone)]
struct LocalHeader {
    version: u16,
    method: u16,
    mod_time: u16,
    mod_date: u16,
    crc32: u32,
    compr_size: u64,
    uncompr_size: u64,
    name_len: usize,
    extra_len: usize,
}

impl LocalHeader {
    fn parse(sbuf: &Sbuf<'_>, pos: usize) -> Option<Self> {
        Some(Self {
            version: sbuf.get16_le(pos + 4).ok()?,
            method: sbuf.get16_le(pos + 8).ok()?,
            mod_time: sbuf.get16_le(pos + 10).ok()?,
            mod_date: sbuf.get16_le(pos + 12).ok()?,
            crc32: sbuf.get32_le(pos + 14).ok()?,
            compr_size: sbuf.get32_le(pos + 18).ok()? as u64,
            uncompr_size: sbuf.get32_le(pos + 22).ok()? as u64,
            name_len: sbuf.get16_le(pos + 26).ok()? as usize,
            extra_len: sbuf.get16_le(pos + 28).ok()? as usize,
        })
    }

    fn zipinfo(&self, name: &str) -> String {
        format!(
            "<zipinfo><name>{}</name><version>{}</version>\
             <compression_method>{}</compression_method>\
             <uncompr_size>{}</uncompr_size><compr_size>{}</compr_size>\
             <lastmodtime>{}</lastmodtime><lastmoddate>{}</lastmoddate>\
             <crc32>{}</crc32><extra_field_len>{}</extra_field_len>",
            xml_escape(name),
            self.version,
            self.method,
            self.uncompr_size,
            self.compr_size,
            self.mod_time,
            self.mod_date,
            self.crc32,
            self.extra_len
        )
    }
}

fn record(
    recorder: &FeatureRecorder,
    sbuf: &Sbuf<'_>,
    pos: usize,
    name: &str,
    mut info: String,
    disposition: Option<&str>,
) -> Result<(), ScannerError> {
    if let Some(disposition) = disposition {
        info.push_str(disposition);
    }
    info.push_str("</zipinfo>");
    recorder.write(&sbuf.pos0.shift(pos as u64), name, &info)?;
    Ok(())
}

impl ZipScanner {
    fn read_name(&self, sbuf: &Sbuf<'_>, pos: usize, name_len: usize) -> Option<String> {
        if name_len == 0 || name_len > self.name_len_max {
            return None;
        }
        let bytes = sbuf.slice_bytes(pos + LOCAL_HEADER_LEN, name_len).ok()?;
        let name = std::str::from_utf8(bytes).ok()?;
        if name.chars().any(|c| (c as u32) < 0x20) {
            return None;
        }
        Some(name.to_string())
    }

    fn scan_component(
        &self,
        sbuf: &Sbuf<'_>,
        pos: usize,
        recorder: &FeatureRecorder,
        ctx: &mut ScanContext<'_>,
    ) -> Result<(), ScannerError> {
        let Some(mut header) = LocalHeader::parse(sbuf, pos) else {
            return Ok(());
        };
        let Some(name) = self.read_name(sbuf, pos, header.name_len) else {
            return Ok(());
        };
        let name = if name.is_empty() {
            "<NONAME>".to_string()
        } else {
            name
        };
        let info = header.zipinfo(&name);

        let data_start = pos + LOCAL_HEADER_LEN + header.name_len + header.extra_len;
        if data_start > sbuf.bufsize() {
            return record(
                recorder,
                sbuf,
                pos,
                &name,
                info,
                Some("<disposition>end-of-buffer</disposition>"),
            );
        }

        // Streamed entries carry zero sizes in the local header.
        if header.compr_size == 0 && header.uncompr_size == 0 {
            header.compr_size = self.max_uncompr_size;
            header.uncompr_size = self.max_uncompr_size;
        }

        // Unsupported or implausibly small members are not recorded at all.
        if header.version != SUPPORTED_VERSION || header.uncompr_size < self.min_uncompr_size {
            return Ok(());
        }

        let uncompr_size = header.uncompr_size.min(self.max_uncompr_size) as usize;
        let remaining = sbuf.bufsize() - data_start;
        let compr_size = (header.compr_size as usize).min(remaining);
        let payload = sbuf.slice_bytes(data_start, compr_size)?;
        let here = sbuf.pos0.shift(pos as u64);

        match ctx.admit(&here, payload) {
            Admission::MaxDepth => {
                return record(
                    recorder,
                    sbuf,
                    pos,
                    &name,
                    info,
                    Some("<disposition>max-depth</disposition>"),
                );
            }
            Admission::PreviouslyProcessed => {
                return record(
                    recorder,
                    sbuf,
                    pos,
                    &name,
                    info,
                    Some("<disposition>previously-processed</disposition>"),
                );
            }
            Admission::Proceed => {}
        }

        if header.method == METHOD_STORED {
            let len = compr_size.min(uncompr_size);
            record(
                recorder,
                sbuf,
                pos,
                &name,
                info,
                Some("<disposition>stored</disposition>"),
            )?;
            if len > 0 {
                let child = sbuf.child_borrowed(TAG, pos, &payload[..len]);
                ctx.recurse(&child);
            }
            return Ok(());
        }

        let mut out: Vec<u8> = Vec::new();
        if out.try_reserve_exact(uncompr_size).is_err() {
            return record(
                recorder,
                sbuf,
                pos,
                &name,
                info,
                Some("<disposition>calloc-failed</disposition>"),
            );
        }

        let mut inflater = Decompress::new(false);
        let status = inflater.decompress_vec(payload, &mut out, FlushDecompress::Sync);
        if let Err(err) = &status {
            debug!(pos = %here, "inflate stopped: {err}");
            if out.is_empty() {
                return record(
                    recorder,
                    sbuf,
                    pos,
                    &name,
                    info,
                    Some("<disposition>decompress-failed</disposition>"),
                );
            }
        }

        let disposition = format!(
            "<disposition bytes='{}'>decompressed</disposition>",
            out.len()
        );
        record(recorder, sbuf, pos, &name, info, Some(&disposition))?;

        if !out.is_empty() {
            let child = sbuf.child_owned(TAG, pos, out);
            ctx.recurse(&child);
        }
        Ok(())
    }
}

impl Scanner for ZipScanner {
    fn startup(&mut self, config: &ScannerConfig) -> ScannerInfo {
        self.min_uncompr_size = config.get_size("zip_min_uncompr_size", self.min_uncompr_size);
        self.max_uncompr_size = config.get_size("zip_max_uncompr_size", self.max_uncompr_size);
        self.name_len_max = config.get("zip_name_len_max", self.name_len_max);

        let mut info = ScannerInfo::new("zip");
        info.description = "ZIP local file headers; inflates members and rescans them".to_string();
        info.sinks.push(SinkSpec::xml(FEATURE_NAME));
        info.flags.recurse = true;
        info.flags.recurse_expand = true;
        info
    }

    fn scan(&self, sbuf: &Sbuf<'_>, ctx: &mut ScanContext<'_>) -> Result<(), ScannerError> {
        if sbuf.bufsize() < MIN_ZIP_SIZE {
            return Ok(());
        }
        let recorder = ctx.recorder(FEATURE_NAME)?;
        let limit = sbuf.pagesize().min(sbuf.bufsize() - MIN_ZIP_SIZE);

        let mut start = 0usize;
        while let Some(pos) = sbuf.find(ZIP_HEADER, start) {
            if pos >= limit {
                break;
            }
            self.scan_component(sbuf, pos, recorder, ctx)?;
            start = pos + 1;
        }
        Ok(())
    }
}
