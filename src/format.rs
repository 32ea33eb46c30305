//! Binary vector file and labels sidecar primitives.
//!
//! All bulk files share one layout: a `[i32 N][i32 d]` little-endian header
//! followed by `N × d` raw elements, row-major. The labels sidecar is
//! line-oriented text, line `i` holding the external label of row `i`; it is
//! the authoritative row → label mapping and is rewritten on every merge.

use crate::error::{IndexError, Result};
use crate::Label;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

mod sealed {
    pub trait Sealed {}
    impl Sealed for f32 {}
    impl Sealed for i8 {}
    impl Sealed for u8 {}
}

/// Storage element of a vector file: `f32`, `i8`, or `u8`.
///
/// Distance math promotes elements to `f32`; files store them raw.
pub trait Element: sealed::Sealed + Copy + Send + Sync + 'static {
    /// Encoded size in bytes.
    const SIZE: usize;
    /// Type tag written into disk-index metadata.
    const DATA_TYPE: &'static str;

    fn to_f32(self) -> f32;
    fn write_le(self, out: &mut Vec<u8>);
    fn read_le(bytes: &[u8]) -> Self;
}

impl Element for f32 {
    const SIZE: usize = 4;
    const DATA_TYPE: &'static str = "float";

    fn to_f32(self) -> f32 {
        self
    }

    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn read_le(bytes: &[u8]) -> Self {
        f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

impl Element for i8 {
    const SIZE: usize = 1;
    const DATA_TYPE: &'static str = "int8";

    fn to_f32(self) -> f32 {
        self as f32
    }

    fn write_le(self, out: &mut Vec<u8>) {
        out.push(self as u8);
    }

    fn read_le(bytes: &[u8]) -> Self {
        bytes[0] as i8
    }
}

impl Element for u8 {
    const SIZE: usize = 1;
    const DATA_TYPE: &'static str = "uint8";

    fn to_f32(self) -> f32 {
        self as f32
    }

    fn write_le(self, out: &mut Vec<u8>) {
        out.push(self);
    }

    fn read_le(bytes: &[u8]) -> Self {
        bytes[0]
    }
}

/// Encode a slice of elements to little-endian bytes.
pub fn encode_rows<T: Element>(rows: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rows.len() * T::SIZE);
    for &v in rows {
        v.write_le(&mut out);
    }
    out
}

/// Decode little-endian bytes into elements.
pub fn decode_rows<T: Element>(bytes: &[u8]) -> Vec<T> {
    bytes.chunks_exact(T::SIZE).map(T::read_le).collect()
}

/// Read the `{N, d}` header of a binary vector file.
pub fn read_bin_header(path: &Path) -> Result<(usize, usize)> {
    let mut file = File::open(path)?;
    read_header_from(&mut file, path)
}

fn read_header_from(file: &mut File, path: &Path) -> Result<(usize, usize)> {
    let mut buf = [0u8; 4];
    file.read_exact(&mut buf)
        .map_err(|_| IndexError::Format(format!("{}: truncated header", path.display())))?;
    let n = i32::from_le_bytes(buf);
    file.read_exact(&mut buf)
        .map_err(|_| IndexError::Format(format!("{}: truncated header", path.display())))?;
    let d = i32::from_le_bytes(buf);
    if n < 0 || d < 0 {
        return Err(IndexError::Format(format!(
            "{}: negative header field ({}, {})",
            path.display(),
            n,
            d
        )));
    }
    Ok((n as usize, d as usize))
}

/// Read the header, creating the file with a `{0, dim}` header when it is
/// absent or shorter than a header. Returns the (possibly fresh) `{N, d}`.
pub fn read_or_init_bin_header(path: &Path, dim: usize) -> Result<(usize, usize)> {
    let len = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    if len < 8 {
        let mut file = File::create(path)?;
        write_header_to(&mut file, 0, dim)?;
        return Ok((0, dim));
    }
    read_bin_header(path)
}

fn write_header_to<W: Write>(out: &mut W, n: usize, d: usize) -> Result<()> {
    out.write_all(&(n as i32).to_le_bytes())?;
    out.write_all(&(d as i32).to_le_bytes())?;
    Ok(())
}

/// Write a complete binary vector file: `{n, d}` header plus `data` rows.
pub fn write_bin_file<T: Element>(path: &Path, data: &[T], n: usize, d: usize) -> Result<()> {
    debug_assert_eq!(data.len(), n * d);
    let mut out = BufWriter::new(File::create(path)?);
    write_header_to(&mut out, n, d)?;
    out.write_all(&encode_rows(data))?;
    out.flush()?;
    Ok(())
}

/// Read a complete binary vector file. Returns `(data, n, d)`.
pub fn read_bin_file<T: Element>(path: &Path) -> Result<(Vec<T>, usize, usize)> {
    let mut file = File::open(path)?;
    let (n, d) = read_header_from(&mut file, path)?;
    let mut bytes = vec![0u8; n * d * T::SIZE];
    file.read_exact(&mut bytes)
        .map_err(|_| IndexError::Format(format!("{}: truncated payload", path.display())))?;
    Ok((decode_rows(&bytes), n, d))
}

/// Append `n_new` rows of dimension `dim` to an existing vector file and
/// rewrite its header to `{N + n_new, dim}`.
///
/// The pre-append length is recorded and the file truncated back to it on
/// any failure before the header rewrite, so a failed append never leaves a
/// header overstating the payload.
pub fn append_bin_rows<T: Element>(path: &Path, rows: &[T], n_new: usize, dim: usize) -> Result<()> {
    debug_assert_eq!(rows.len(), n_new * dim);
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let (n_file, d_file) = read_header_from(&mut file, path)?;
    if d_file != 0 && d_file != dim {
        return Err(IndexError::DimensionMismatch {
            base_dim: d_file,
            delta_dim: dim,
        });
    }
    let old_len = file.seek(SeekFrom::End(0))?;

    let appended = (|| -> Result<()> {
        file.write_all(&encode_rows(rows))?;
        Ok(())
    })();
    if let Err(e) = appended {
        let _ = file.set_len(old_len);
        return Err(e);
    }

    file.seek(SeekFrom::Start(0))?;
    write_header_to(&mut file, n_file + n_new, dim)?;
    file.flush()?;
    Ok(())
}

/// Write a tags file: `{N, 1}` header plus one `u32` label per row.
pub fn write_tags_file(path: &Path, labels: &[Label]) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    write_header_to(&mut out, labels.len(), 1)?;
    for &label in labels {
        out.write_all(&label.to_le_bytes())?;
    }
    out.flush()?;
    Ok(())
}

/// Read a tags file written by [`write_tags_file`].
pub fn read_tags_file(path: &Path) -> Result<Vec<Label>> {
    let mut file = File::open(path)?;
    let (n, d) = read_header_from(&mut file, path)?;
    if d != 1 {
        return Err(IndexError::Format(format!(
            "{}: tags file must have width 1, got {}",
            path.display(),
            d
        )));
    }
    let mut bytes = vec![0u8; n * 4];
    file.read_exact(&mut bytes)
        .map_err(|_| IndexError::Format(format!("{}: truncated tags", path.display())))?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Read the labels sidecar: one unsigned decimal per line, line `i` holding
/// the label of row `i`. Returns an empty vector for an absent file.
pub fn read_labels_text(path: &Path) -> Result<Vec<Label>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut labels = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let label: Label = trimmed.parse().map_err(|_| {
            IndexError::Format(format!(
                "{}:{}: not an unsigned integer: {:?}",
                path.display(),
                lineno + 1,
                trimmed
            ))
        })?;
        labels.push(label);
    }
    Ok(labels)
}

/// Rewrite the labels sidecar with one label per line.
pub fn write_labels_text(path: &Path, labels: &[Label]) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for &label in labels {
        writeln!(out, "{}", label)?;
    }
    out.flush()?;
    Ok(())
}
