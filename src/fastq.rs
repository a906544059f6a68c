//! Structural FASTQ validation and best-effort repair.
//!
//! Validation only looks at record framing: line 1 of every record must start
//! with `@`, line 3 with `+`, and the sampled line count must be a multiple of
//! four. Sequence and quality content is never interpreted.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::KiraError;
use crate::fs_util::{TEMP_PREFIX, fs_err};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FastqCheck {
    Valid { records: usize },
    Invalid { line: usize, reason: String },
}

impl FastqCheck {
    pub fn is_valid(&self) -> bool {
        matches!(self, FastqCheck::Valid { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RepairOptions {
    pub max_bytes: u64,
    pub validation_records: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairOutcome {
    pub records: usize,
    pub headers_fixed: usize,
    pub separators_fixed: usize,
}

fn is_gzip(path: &Path) -> Result<bool, KiraError> {
    let mut magic = [0u8; 2];
    let mut file = File::open(path).map_err(fs_err)?;
    let mut read = 0;
    while read < magic.len() {
        let n = file.read(&mut magic[read..]).map_err(fs_err)?;
        if n == 0 {
            return Ok(false);
        }
        read += n;
    }
    Ok(magic == GZIP_MAGIC)
}

fn open_reader(path: &Path) -> Result<Box<dyn BufRead>, KiraError> {
    let gz = is_gzip(path)?;
    let file = File::open(path).map_err(fs_err)?;
    if gz {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Check the framing of the first `sample_records` records of `path`.
///
/// A broken compressed stream inside the sampled prefix is reported as
/// invalid rather than as an error; only failing to open the file errors.
pub fn validate(path: &Path, sample_records: usize) -> Result<FastqCheck, KiraError> {
    let mut reader = open_reader(path)?;
    let max_lines = sample_records.saturating_mul(4);
    let mut buf = Vec::with_capacity(256);
    let mut lines = 0usize;

    let check = loop {
        if lines >= max_lines {
            break FastqCheck::Valid { records: lines / 4 };
        }
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => {
                break if lines == 0 {
                    FastqCheck::Invalid {
                        line: 0,
                        reason: "no records".to_string(),
                    }
                } else if lines % 4 != 0 {
                    FastqCheck::Invalid {
                        line: lines,
                        reason: format!("{lines} lines is not a multiple of 4"),
                    }
                } else {
                    FastqCheck::Valid { records: lines / 4 }
                };
            }
            Ok(_) => {}
            Err(err) => {
                break FastqCheck::Invalid {
                    line: lines + 1,
                    reason: format!("read failed: {err}"),
                };
            }
        }
        lines += 1;
        match lines % 4 {
            1 if !buf.starts_with(b"@") => {
                break FastqCheck::Invalid {
                    line: lines,
                    reason: "record header does not start with '@'".to_string(),
                };
            }
            3 if !buf.starts_with(b"+") => {
                break FastqCheck::Invalid {
                    line: lines,
                    reason: "separator does not start with '+'".to_string(),
                };
            }
            _ => {}
        }
    };

    if let FastqCheck::Invalid { line, reason } = &check {
        warn!(path = %path.display(), line, %reason, "FASTQ validation failed");
    }
    Ok(check)
}

/// Decompress the whole file to prove the compressed stream is intact.
/// Plain files pass trivially. Returns the decompressed size.
pub fn check_stream(path: &Path) -> Result<u64, KiraError> {
    if !is_gzip(path)? {
        return std::fs::metadata(path).map(|meta| meta.len()).map_err(fs_err);
    }
    let file = File::open(path).map_err(fs_err)?;
    let mut decoder = MultiGzDecoder::new(file);
    io::copy(&mut decoder, &mut io::sink()).map_err(|err| KiraError::CorruptArchive {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

/// Gzip a plain FASTQ next to itself as `<name>.gz` and remove the original.
/// Already-compressed files are returned unchanged.
pub fn compress_in_place(path: &Path) -> Result<PathBuf, KiraError> {
    if is_gzip(path)? {
        return Ok(path.to_path_buf());
    }
    let parent = path
        .parent()
        .ok_or_else(|| KiraError::Filesystem("file has no parent directory".to_string()))?;
    let mut target = path.as_os_str().to_owned();
    target.push(".gz");
    let target = PathBuf::from(target);

    let temp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(parent)
        .map_err(fs_err)?;
    {
        let mut input = File::open(path).map_err(fs_err)?;
        let mut encoder = GzEncoder::new(BufWriter::new(temp.as_file()), Compression::default());
        io::copy(&mut input, &mut encoder).map_err(fs_err)?;
        encoder
            .finish()
            .and_then(|mut writer| writer.flush())
            .map_err(fs_err)?;
    }
    copy_permissions(path, temp.path())?;
    temp.persist(&target)
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    std::fs::remove_file(path).map_err(fs_err)?;
    Ok(target)
}

/// Temp files are created owner-only; rewritten reads keep the mode of the
/// file they replace.
fn copy_permissions(original: &Path, temp: &Path) -> Result<(), KiraError> {
    let permissions = std::fs::metadata(original).map_err(fs_err)?.permissions();
    std::fs::set_permissions(temp, permissions).map_err(fs_err)
}

struct LineCounts {
    total: usize,
    headers: usize,
    separators: usize,
}

fn count_lines(path: &Path) -> Result<LineCounts, KiraError> {
    let mut reader = open_reader(path)?;
    let mut buf = Vec::with_capacity(256);
    let mut counts = LineCounts {
        total: 0,
        headers: 0,
        separators: 0,
    };
    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .map_err(|err| KiraError::CorruptArchive {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
        if n == 0 {
            break;
        }
        counts.total += 1;
        if buf.starts_with(b"@") {
            counts.headers += 1;
        } else if buf.starts_with(b"+") {
            counts.separators += 1;
        }
    }
    Ok(counts)
}

fn rewrite<W: Write>(path: &Path, out: &mut W) -> Result<(usize, usize), KiraError> {
    let mut reader = open_reader(path)?;
    let mut buf = Vec::with_capacity(256);
    let mut lines = 0usize;
    let mut headers_fixed = 0;
    let mut separators_fixed = 0;
    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf).map_err(fs_err)?;
        if n == 0 {
            break;
        }
        lines += 1;
        if !buf.ends_with(b"\n") {
            buf.push(b'\n');
        }
        match lines % 4 {
            1 if !buf.starts_with(b"@") => {
                out.write_all(b"@").map_err(fs_err)?;
                out.write_all(&buf).map_err(fs_err)?;
                headers_fixed += 1;
            }
            3 if !buf.starts_with(b"+") => {
                out.write_all(b"+\n").map_err(fs_err)?;
                separators_fixed += 1;
            }
            _ => out.write_all(&buf).map_err(fs_err)?,
        }
    }
    Ok((headers_fixed, separators_fixed))
}

/// Rewrite record headers and separators in place.
///
/// Refused, with the original untouched, when the file exceeds
/// `max_bytes`, when `@`-lines and `+`-lines disagree in number, or when the
/// repaired copy does not validate on `validation_records` records.
pub fn repair(path: &Path, options: RepairOptions) -> Result<RepairOutcome, KiraError> {
    let refuse = |reason: String| KiraError::RepairRefused {
        path: path.to_path_buf(),
        reason,
    };

    let size = std::fs::metadata(path).map_err(fs_err)?.len();
    if size > options.max_bytes {
        return Err(refuse(format!(
            "file is {size} bytes, above the {} byte repair ceiling",
            options.max_bytes
        )));
    }

    let counts = count_lines(path)?;
    if counts.total == 0 {
        return Err(refuse("file holds no lines".to_string()));
    }
    if counts.headers != counts.separators {
        return Err(refuse(format!(
            "{} header lines vs {} separator lines",
            counts.headers, counts.separators
        )));
    }
    if counts.total % 4 != 0 {
        return Err(refuse(format!(
            "{} lines is not a multiple of 4",
            counts.total
        )));
    }

    let parent = path
        .parent()
        .ok_or_else(|| KiraError::Filesystem("file has no parent directory".to_string()))?;
    let temp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(parent)
        .map_err(fs_err)?;

    let (headers_fixed, separators_fixed) = if is_gzip(path)? {
        let mut encoder = GzEncoder::new(BufWriter::new(temp.as_file()), Compression::default());
        let fixed = rewrite(path, &mut encoder)?;
        encoder
            .finish()
            .and_then(|mut writer| writer.flush())
            .map_err(fs_err)?;
        fixed
    } else {
        let mut writer = BufWriter::new(temp.as_file());
        let fixed = rewrite(path, &mut writer)?;
        writer.flush().map_err(fs_err)?;
        fixed
    };

    let check = validate(temp.path(), options.validation_records)?;
    if !check.is_valid() {
        return Err(refuse(format!(
            "repaired copy still invalid: {check:?}"
        )));
    }

    copy_permissions(path, temp.path())?;
    temp.persist(path)
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    info!(
        path = %path.display(),
        headers_fixed,
        separators_fixed,
        "FASTQ repaired"
    );
    Ok(RepairOutcome {
        records: counts.total / 4,
        headers_fixed,
        separators_fixed,
    })
}
