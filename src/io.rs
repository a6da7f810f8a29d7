//src/io.rs
//
// Shared plumbing for the binary table, tagset, stoptags and partition-map
// files: transparent gzip by extension plus the common header.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{ReadBytesExt, WriteBytesExt};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{Error, Result};

/// File type code shared by every persisted structure.
pub const FILE_MAGIC: &[u8; 4] = b"KHMR";

/// Current on-disk format version.
pub const FORMAT_VERSION: u8 = 1;

/// Which structure a file holds. Stored right after the version byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Counting = 1,
    Presence = 2,
    Tagset = 3,
    Stoptags = 4,
    PartitionMap = 5,
}

impl FileKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(FileKind::Counting),
            2 => Some(FileKind::Presence),
            3 => Some(FileKind::Tagset),
            4 => Some(FileKind::Stoptags),
            5 => Some(FileKind::PartitionMap),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FileKind::Counting => "counting table",
            FileKind::Presence => "presence table",
            FileKind::Tagset => "tagset",
            FileKind::Stoptags => "stoptags",
            FileKind::PartitionMap => "partition map",
        }
    }
}

fn is_gz(path: &Path) -> bool {
    path.extension().map(|ext| ext == "gz").unwrap_or(false)
}

/// Output file, gzip-compressed when the path ends in `.gz`.
pub enum FileWriter {
    Plain(BufWriter<File>),
    Gz(GzEncoder<BufWriter<File>>),
}

impl FileWriter {
    pub fn create(path: &Path) -> io::Result<Self> {
        let f = BufWriter::new(File::create(path)?);
        if is_gz(path) {
            Ok(FileWriter::Gz(GzEncoder::new(f, Compression::default())))
        } else {
            Ok(FileWriter::Plain(f))
        }
    }

    /// Flush everything, writing the gzip trailer if needed.
    pub fn finish(self) -> io::Result<()> {
        match self {
            FileWriter::Plain(mut w) => w.flush(),
            FileWriter::Gz(gz) => gz.finish()?.flush(),
        }
    }
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            FileWriter::Plain(w) => w.write(buf),
            FileWriter::Gz(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            FileWriter::Plain(w) => w.flush(),
            FileWriter::Gz(w) => w.flush(),
        }
    }
}

/// Open a file for reading, decompressing `.gz` on the fly.
pub fn open_reader(path: &Path) -> io::Result<Box<dyn BufRead>> {
    let f = File::open(path)?;
    if is_gz(path) {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(f))))
    } else {
        Ok(Box::new(BufReader::new(f)))
    }
}

/// Create `path`, let `body` fill it and finish the stream.
pub fn write_file<F>(path: &Path, body: F) -> Result<()>
where
    F: FnOnce(&mut FileWriter) -> Result<()>,
{
    let mut w = FileWriter::create(path)?;
    body(&mut w)?;
    w.finish()?;
    Ok(())
}

/// Open `path` and let `body` parse it. Running out of bytes is reported as
/// a format error for that file rather than a bare I/O error.
pub fn read_file<T, F>(path: &Path, body: F) -> Result<T>
where
    F: FnOnce(&mut dyn BufRead) -> Result<T>,
{
    let mut r = open_reader(path)?;
    body(&mut *r).map_err(|e| match e {
        Error::Io(io_err) if io_err.kind() == ErrorKind::UnexpectedEof => {
            Error::format(path, "file truncated")
        }
        Error::Io(io_err) if io_err.kind() == ErrorKind::InvalidData => {
            Error::format(path, format!("corrupt data: {io_err}"))
        }
        other => other,
    })
}

/// Outcome of loading several files where a corrupt one shouldn't sink
/// the whole batch.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub loaded: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, Error)>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Write magic, version, kind and k.
pub fn write_header<W: Write + ?Sized>(w: &mut W, kind: FileKind, ksize: u8) -> io::Result<()> {
    w.write_all(FILE_MAGIC)?;
    w.write_u8(FORMAT_VERSION)?;
    w.write_u8(kind as u8)?;
    w.write_u8(ksize)?;
    Ok(())
}

/// Read and validate the common header, returning the stored k.
pub fn read_header<R: Read + ?Sized>(r: &mut R, path: &Path, expected: FileKind) -> Result<u8> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if &magic != FILE_MAGIC {
        return Err(Error::format(path, "bad magic; not a khmer-rs file"));
    }
    let version = r.read_u8()?;
    if version != FORMAT_VERSION {
        return Err(Error::format(
            path,
            format!("unsupported format version {version}, expected {FORMAT_VERSION}"),
        ));
    }
    let kind_byte = r.read_u8()?;
    match FileKind::from_u8(kind_byte) {
        Some(kind) if kind == expected => {}
        Some(kind) => {
            return Err(Error::format(
                path,
                format!("expected a {} file, found a {}", expected.name(), kind.name()),
            ))
        }
        None => return Err(Error::format(path, format!("unknown file kind {kind_byte}"))),
    }
    Ok(r.read_u8()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::LittleEndian as LE;

    #[test]
    fn test_header_round_trip_plain_and_gz() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["h.bin", "h.bin.gz"] {
            let path = dir.path().join(name);
            write_file(&path, |w| {
                write_header(w, FileKind::Tagset, 21)?;
                w.write_u64::<LE>(42)?;
                Ok(())
            })
            .unwrap();
            let (k, v) = read_file(&path, |r| {
                let k = read_header(r, &path, FileKind::Tagset)?;
                Ok((k, r.read_u64::<LE>()?))
            })
            .unwrap();
            assert_eq!((k, v), (21, 42));
        }
    }

    #[test]
    fn test_wrong_kind_and_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.bin");
        write_file(&path, |w| Ok(write_header(w, FileKind::Stoptags, 20)?)).unwrap();
        let err = read_file(&path, |r| read_header(r, &path, FileKind::Tagset)).unwrap_err();
        assert!(matches!(err, Error::Format { .. }));

        std::fs::write(&path, b"NOPE\x01\x03\x14").unwrap();
        let err = read_file(&path, |r| read_header(r, &path, FileKind::Tagset)).unwrap_err();
        assert!(matches!(err, Error::Format { .. }));
    }

    #[test]
    fn test_truncated_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, b"KH").unwrap();
        let err = read_file(&path, |r| read_header(r, &path, FileKind::Counting)).unwrap_err();
        assert!(matches!(err, Error::Format { .. }));
    }
}
