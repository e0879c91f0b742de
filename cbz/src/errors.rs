use std::{io, result};

use camino::Utf8PathBuf;
use zip::result::ZipError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error {0}")]
    IO(#[from] io::Error),

    #[error("Zip error {0}")]
    Zip(#[from] ZipError),

    #[error("File specified does not exist: \"{0}\"")]
    NotFound(Utf8PathBuf),

    #[error("Cbz file size couldn't be converted")]
    CbzFileSizeConversion,

    #[error("Cbz is too large, it can contain a maximum of {0} files")]
    CbzTooLarge(usize),

    #[error("Image couldn't be decoded: {0}")]
    Decode(#[source] image::ImageError),

    #[error("Image couldn't be encoded: {0}")]
    Encode(#[source] image::ImageError),

    #[error("Unsupported codec options: {0}")]
    UnsupportedCodecOptions(String),

    #[error("Cbz couldn't be written to {path}: {source}")]
    Write {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type Result<T, E = Error> = result::Result<T, E>;
