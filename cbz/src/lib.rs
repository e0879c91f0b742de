#![deny(clippy::all)]
#![deny(clippy::pedantic)]

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{
    fs,
    io::{self, BufWriter, Cursor, Read, Seek, Write},
};

use bytes::Bytes;
use camino::Utf8Path;
use tempfile::NamedTempFile;
use tracing::{debug, info};
use zip::{
    read::ZipFile, result::ZipError, write::FileOptions, CompressionMethod, ZipArchive, ZipWriter,
};

pub use crate::errors::{Error, Result};

pub mod errors;
pub mod image;

/// We artificially limit the amount of accepted files to 65535 files per Cbz
/// First as it'd be rather impractical for the user to read such enormous Cbz
/// Also, this size has been chosen as it was the limit of the very first zip spec
pub static MAX_FILE_NUMBER: usize = u16::MAX as usize;

/// Comment attached to every archive we produce
pub static COMMENT: &str = "Created by cbz-avif";

/// Zip has no header for it, this is what a Cbz should be served as
pub static MIME_TYPE: &str = "application/vnd.comicbook+zip";

/// Permissions given to every inserted page, which also tags entries as created on Unix
pub static UNIX_PERMISSIONS: u32 = 0o644;

/// Mode requested for a new archive on disk, the process umask still applies
#[cfg(unix)]
pub static NEW_FILE_MODE: u32 = 0o666;

pub trait Cbz {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct CbzFile<'a>(ZipFile<'a>);

impl<'a> CbzFile<'a> {
    #[must_use]
    pub fn name(&self) -> &str {
        self.0.name()
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.0.size()
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.0.is_dir()
    }

    /// Convert the file convent to  `Bytes`
    ///
    /// ## Errors
    ///
    /// Fails if file size is too large to fit a `usize` on host machine
    /// or if the content can't be read
    pub fn to_bytes(&mut self) -> Result<Bytes> {
        let mut buf = Vec::with_capacity(
            self.size()
                .try_into()
                .map_err(|_| Error::CbzFileSizeConversion)?,
        );

        self.read_to_end(&mut buf)?;

        Ok(buf.into())
    }
}

impl<'a> Read for CbzFile<'a> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl<'a> From<ZipFile<'a>> for CbzFile<'a> {
    fn from(zip_file: ZipFile<'a>) -> Self {
        Self(zip_file)
    }
}

/// A page extracted from a Cbz, its content can be consumed once through `into_reader`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CbzEntry {
    name: String,
    bytes: Bytes,
}

impl CbzEntry {
    #[must_use]
    pub fn new(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn into_reader(self) -> Cursor<Bytes> {
        Cursor::new(self.bytes)
    }

    #[must_use]
    pub fn into_parts(self) -> (String, Bytes) {
        (self.name, self.bytes)
    }
}

#[derive(Debug)]
pub struct CbzReader<R> {
    archive: ZipArchive<R>,
}

impl<R> CbzReader<R> {
    #[must_use]
    pub fn new(archive: ZipArchive<R>) -> Self {
        Self { archive }
    }
}

impl<R> CbzReader<R>
where
    R: Read + Seek,
{
    /// Creates `CbzReader` from a `Read`
    ///
    /// ## Errors
    ///
    /// Fails if the underlying `ZipArchive` can't be created
    pub fn from_reader(reader: R) -> Result<Self> {
        let archive = ZipArchive::new(reader)?;

        Ok(Self::new(archive))
    }

    /// Lookup the file at `index` in the central directory
    ///
    /// ## Errors
    ///
    /// Fails if the index is out of bound or the entry can't be read
    pub fn read_by_index(&mut self, index: usize) -> Result<CbzFile<'_>> {
        let archive_file = self.archive.by_index(index)?;

        Ok(archive_file.into())
    }

    /// Extracts every file, in the order they are stored in the archive.
    /// Directories are skipped.
    ///
    /// ## Errors
    ///
    /// Fails if any of the files can't be decompressed
    pub fn entries(&mut self) -> Result<Vec<CbzEntry>> {
        let mut entries = Vec::with_capacity(self.archive.len());

        for index in 0..self.archive.len() {
            let mut file = self.read_by_index(index)?;
            if file.is_dir() {
                debug!("skipping directory {}", file.name());
                continue;
            }
            let bytes = file.to_bytes()?;
            entries.push(CbzEntry::new(file.name(), bytes));
        }

        Ok(entries)
    }

    #[must_use]
    pub fn comment(&self) -> &[u8] {
        self.archive.comment()
    }
}

impl CbzReader<Cursor<Bytes>> {
    /// Creates `CbzReader` from bytes
    ///
    /// ## Errors
    ///
    /// Fails if the underlying `ZipArchive` can't be created
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self> {
        let cursor = Cursor::new(bytes.into());

        Self::from_reader(cursor)
    }

    /// Loads the whole file located at `path` in memory and parses it
    ///
    /// ## Errors
    ///
    /// Fails with `Error::NotFound` if there is no file at `path`,
    /// or if the file can't be read or isn't a valid zip
    pub fn from_path(path: impl AsRef<Utf8Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("opening archive {path}");

        if !path.is_file() {
            return Err(Error::NotFound(path.to_path_buf()));
        }

        let bytes = fs::read(path)?;

        Self::from_bytes(bytes)
    }
}

impl<R> Cbz for CbzReader<R>
where
    R: Read + Seek,
{
    fn len(&self) -> usize {
        self.archive.len()
    }
}

pub struct CbzWriter<W: Write + Seek> {
    archive: ZipWriter<W>,
    file_options: FileOptions,
    size: usize,
}

impl<W> CbzWriter<W>
where
    W: Write + Seek,
{
    /// Creates a `CbzWriter` from a `Write`, pages are stored uncompressed
    #[must_use]
    pub fn from_writer(writer: W) -> Self {
        let mut archive = ZipWriter::new(writer);
        archive.set_comment(COMMENT);

        Self {
            archive,
            file_options: FileOptions::default()
                .compression_method(CompressionMethod::Stored)
                .unix_permissions(UNIX_PERMISSIONS),
            size: 0,
        }
    }

    /// Appends a file named `name` to the archive
    ///
    /// ## Errors
    ///
    /// This fails if the Cbz writer can't be written or if it's full (i.e. its size equals `MAX_FILE_NUMBER`)
    pub fn insert(&mut self, name: impl Into<String>, bytes: &[u8]) -> Result<()> {
        if self.size >= MAX_FILE_NUMBER {
            return Err(Error::CbzTooLarge(MAX_FILE_NUMBER));
        }

        self.archive.start_file(name, self.file_options)?;

        self.archive.write_all(bytes)?;

        self.size += 1;

        Ok(())
    }

    /// Terminates the Cbz archiving, called on drop anyway but error can't be handled
    ///
    /// ## Errors
    ///
    /// Same errors as the underlying `ZipWriter::finish` method
    pub fn finish(&mut self) -> Result<CbzWriterFinished<W>> {
        let writer = self.archive.finish()?;

        Ok(CbzWriterFinished::new(writer))
    }
}

impl Default for CbzWriter<Cursor<Vec<u8>>> {
    fn default() -> Self {
        Self::from_writer(Cursor::new(Vec::new()))
    }
}

impl CbzWriter<BufWriter<NamedTempFile>> {
    /// Creates a `CbzWriter` streaming to a temporary file located next to `path`.
    /// Nothing appears at `path` until `CbzWriterFinished::persist` is called,
    /// and the temporary file is removed if the writer is dropped before.
    ///
    /// On Unix the temporary file gets the mode a plain `fs::write` would give it,
    /// instead of the owner-only mode temporary files are created with.
    ///
    /// ## Errors
    ///
    /// Fails if the temporary file can't be created
    pub fn create_for(path: impl AsRef<Utf8Path>) -> Result<Self> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent,
            _ => Utf8Path::new("."),
        };
        let mut builder = tempfile::Builder::new();
        builder.prefix(".cbz-avif-").suffix(".tmp");
        #[cfg(unix)]
        builder.permissions(fs::Permissions::from_mode(NEW_FILE_MODE));
        let file = builder
            .tempfile_in(dir)
            .map_err(|source| Error::Write {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(Self::from_writer(BufWriter::new(file)))
    }
}

impl<W> Cbz for CbzWriter<W>
where
    W: Write + Seek,
{
    fn len(&self) -> usize {
        self.size
    }
}

pub struct CbzWriterFinished<W> {
    writer: W,
}

impl<W> CbzWriterFinished<W> {
    fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<T: AsRef<[u8]>> AsRef<[u8]> for CbzWriterFinished<Cursor<T>> {
    fn as_ref(&self) -> &[u8] {
        self.writer.get_ref().as_ref()
    }
}

impl CbzWriterFinished<BufWriter<NamedTempFile>> {
    /// Flushes the temporary file and atomically moves it to `path`, replacing any existing file.
    /// On Unix, a replaced file keeps its permissions.
    ///
    /// ## Errors
    ///
    /// Can fail when flushing or renaming the file
    pub fn persist(self, path: impl AsRef<Utf8Path>) -> Result<()> {
        let path = path.as_ref();
        let write_error = |source| Error::Write {
            path: path.to_path_buf(),
            source,
        };

        let file = self
            .writer
            .into_inner()
            .map_err(|err| write_error(err.into_error()))?;
        #[cfg(unix)]
        if let Ok(metadata) = fs::metadata(path) {
            file.as_file()
                .set_permissions(metadata.permissions())
                .map_err(write_error)?;
        }
        file.as_file().sync_all().map_err(write_error)?;
        file.persist(path).map_err(|err| write_error(err.error))?;

        Ok(())
    }
}

/// Streams every `(name, bytes)` pair, in order, into a new Cbz located at `path`.
///
/// The archive is written next to `path` first and only renamed to `path` once complete.
///
/// ## Errors
///
/// Fails with `Error::Write` if the destination can't be created or written to
pub fn write_archive<I, N, B>(entries: I, path: impl AsRef<Utf8Path>) -> Result<()>
where
    I: IntoIterator<Item = (N, B)>,
    N: Into<String>,
    B: AsRef<[u8]>,
{
    let path = path.as_ref();
    debug!("writing to archive {path} ({MIME_TYPE})");

    let into_write_error = |err: Error| match err {
        Error::IO(source) | Error::Zip(ZipError::Io(source)) => Error::Write {
            path: path.to_path_buf(),
            source,
        },
        err => err,
    };

    let mut cbz_writer = CbzWriter::create_for(path)?;
    for (name, bytes) in entries {
        cbz_writer
            .insert(name, bytes.as_ref())
            .map_err(into_write_error)?;
    }
    let len = cbz_writer.len();
    cbz_writer
        .finish()
        .map_err(into_write_error)?
        .persist(path)?;

    info!("finished writing {len} files to archive {path}");

    Ok(())
}

/// Reads the whole archive at `path`
///
/// ## Errors
///
/// See `CbzReader::from_path` and `CbzReader::entries`
pub fn read_archive(path: impl AsRef<Utf8Path>) -> Result<Vec<CbzEntry>> {
    CbzReader::from_path(path)?.entries()
}
