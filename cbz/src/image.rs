use std::{
    fmt::Display,
    io::{Cursor, Read},
};

use bytes::Bytes;
use camino::Utf8Path;
use image::{
    codecs::avif::AvifEncoder, io::Reader as ImageReader, ColorType, DynamicImage, ImageEncoder,
    ImageFormat,
};
use tracing::debug;

use crate::{Error, Result};

/// Extension given to every transcoded page
pub static TARGET_EXTENSION: &str = "avif";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChromaSubsampling {
    #[default]
    Yuv444,
    Yuv420,
}

impl Display for ChromaSubsampling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Yuv444 => "4:4:4",
                Self::Yuv420 => "4:2:0",
            }
        )
    }
}

/// Encoding options shared by every page of a run.
///
/// `effort` goes from 0 (fastest) to 9 (smallest output), `quality` from 1 to 100.
/// When `lossless` is set `quality` is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecOptions {
    pub chroma_subsampling: ChromaSubsampling,
    pub effort: u8,
    pub lossless: bool,
    pub quality: u8,
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self {
            chroma_subsampling: ChromaSubsampling::Yuv444,
            effort: 4,
            lossless: false,
            quality: 70,
        }
    }
}

impl CodecOptions {
    pub const MAX_EFFORT: u8 = 9;

    /// The encoder counts speed the other way around, from 1 (slowest) to 10
    fn encoder_speed(&self) -> u8 {
        10u8.saturating_sub(self.effort).clamp(1, 10)
    }

    fn encoder_quality(&self) -> u8 {
        if self.lossless {
            100
        } else {
            self.quality
        }
    }

    fn validate(&self) -> Result<()> {
        if self.chroma_subsampling != ChromaSubsampling::Yuv444 {
            return Err(Error::UnsupportedCodecOptions(format!(
                "chroma subsampling {} is not supported, only 4:4:4 is",
                self.chroma_subsampling
            )));
        }
        if self.effort > Self::MAX_EFFORT {
            return Err(Error::UnsupportedCodecOptions(format!(
                "effort must be between 0 and {}, got {}",
                Self::MAX_EFFORT,
                self.effort
            )));
        }
        if !(1..=100).contains(&self.quality) {
            return Err(Error::UnsupportedCodecOptions(format!(
                "quality must be between 1 and 100, got {}",
                self.quality
            )));
        }

        Ok(())
    }
}

#[derive(Debug, PartialEq)]
pub struct Image {
    dynamic_image: DynamicImage,
    format: Option<ImageFormat>,
}

impl Image {
    /// ## Errors
    ///
    /// Fails if the image format can't be guessed or the image can't be decoded
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
        let format = reader.format();
        Ok(Self {
            dynamic_image: reader.decode().map_err(Error::Decode)?,
            format,
        })
    }

    #[must_use]
    pub fn format(&self) -> Option<ImageFormat> {
        self.format
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        (self.dynamic_image.width(), self.dynamic_image.height())
    }

    /// Encodes the image as avif
    ///
    /// ## Errors
    ///
    /// Fails if the encoder rejects the image
    pub fn to_avif(&self, options: &CodecOptions) -> Result<Bytes> {
        let mut out = Vec::new();
        let encoder = AvifEncoder::new_with_speed_quality(
            &mut out,
            options.encoder_speed(),
            options.encoder_quality(),
        );

        let res = if self.dynamic_image.color().has_alpha() {
            let rgba = self.dynamic_image.to_rgba8();
            encoder.write_image(rgba.as_raw(), rgba.width(), rgba.height(), ColorType::Rgba8)
        } else {
            let rgb = self.dynamic_image.to_rgb8();
            encoder.write_image(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)
        };
        res.map_err(Error::Encode)?;

        Ok(out.into())
    }
}

/// Decodes any common raster image and re-encodes it as avif.
///
/// Holds no mutable state, a single transcoder can be shared between threads.
#[derive(Debug, Clone)]
pub struct AvifTranscoder {
    options: CodecOptions,
}

impl AvifTranscoder {
    /// ## Errors
    ///
    /// Fails if the options can't be honored by the encoder
    pub fn new(options: CodecOptions) -> Result<Self> {
        options.validate()?;

        Ok(Self { options })
    }

    #[must_use]
    pub fn options(&self) -> &CodecOptions {
        &self.options
    }

    /// Consumes `reader` entirely and returns the avif encoded image
    ///
    /// ## Errors
    ///
    /// Fails if the reader fails, if the content isn't a known image format, or if encoding fails
    pub fn transform(&self, mut reader: impl Read) -> Result<Bytes> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;

        let image = Image::from_bytes(&buf)?;
        let (width, height) = image.dimensions();
        let options = self.options();
        let encoded = image.to_avif(options)?;
        debug!(
            "transcoded {:?} image {width}x{height} ({} bytes) to avif ({} bytes), quality {} effort {}",
            image.format(),
            buf.len(),
            encoded.len(),
            options.encoder_quality(),
            options.effort
        );

        Ok(encoded)
    }
}

/// Replaces the extension of `name` (if any) with the avif one, keeping its parent directories
#[must_use]
pub fn to_target_file_name(name: &str) -> String {
    Utf8Path::new(name)
        .with_extension(TARGET_EXTENSION)
        .into_string()
}
