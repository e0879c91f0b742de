use camino::{Utf8Path, Utf8PathBuf};
use cbz::image::{AvifTranscoder, CodecOptions};
use tokio::{sync::mpsc, task};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, level_filters::LevelFilter};

use crate::{BulkTransform, Error, Event, Result};

/// Suffix appended to the input name to build the default output name
pub static OUTPUT_SUFFIX: &str = "-avif";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Silent,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    /// `silent` wins over `verbose`
    #[must_use]
    pub fn from_flags(silent: bool, verbose: bool) -> Self {
        match (silent, verbose) {
            (true, _) => Self::Silent,
            (false, true) => Self::Debug,
            (false, false) => Self::Info,
        }
    }

    #[must_use]
    pub fn level_filter(self) -> LevelFilter {
        match self {
            Self::Silent => LevelFilter::OFF,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
        }
    }

    /// Only the default level gets a progress bar, the debug one is already busy with logs
    #[must_use]
    pub fn shows_progress(self) -> bool {
        self == Self::Info
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub input: Option<Utf8PathBuf>,
    pub output: Option<Utf8PathBuf>,
    pub log_level: LogLevel,
    pub codec_options: CodecOptions,
    /// Defaults to the available parallelism
    pub max_parallel: Option<usize>,
}

/// `foo/bar.cbz` becomes `foo/bar-avif.cbz`
#[must_use]
pub fn default_output_path(input: &Utf8Path) -> Utf8PathBuf {
    let stem = input.file_stem().unwrap_or_default();
    let file_name = match input.extension() {
        Some(extension) => format!("{stem}{OUTPUT_SUFFIX}.{extension}"),
        None => format!("{stem}{OUTPUT_SUFFIX}"),
    };

    input.with_file_name(file_name)
}

/// Converts every page of a Cbz to avif and writes the result as a new Cbz
#[derive(Debug, Clone)]
pub struct Convert {
    config: Config,
    sender: Option<mpsc::UnboundedSender<Event>>,
    cancellation_token: CancellationToken,
}

impl Convert {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            sender: None,
            cancellation_token: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn set_sender(mut self, sender: mpsc::UnboundedSender<Event>) -> Self {
        self.sender = Some(sender);
        self
    }

    #[must_use]
    pub fn set_cancellation_token(mut self, cancellation_token: CancellationToken) -> Self {
        self.cancellation_token = cancellation_token;
        self
    }

    /// Resolves the output path, from the config or derived from the input
    ///
    /// ## Errors
    ///
    /// Fails if no input has been provided
    pub fn output_path(&self) -> Result<Utf8PathBuf> {
        let input = self.config.input.as_deref().ok_or(Error::MissingInput)?;

        Ok(self
            .config
            .output
            .clone()
            .unwrap_or_else(|| default_output_path(input)))
    }

    /// Runs the whole conversion and returns the path of the written archive.
    /// Nothing is written unless every page has been transcoded.
    ///
    /// ## Errors
    ///
    /// Fails if the input is missing or isn't a readable Cbz, if any page can't be transcoded,
    /// if the conversion is cancelled before the archive is written, or if the archive can't be written.
    pub async fn convert(self) -> Result<Utf8PathBuf> {
        let input = self
            .config
            .input
            .clone()
            .ok_or(Error::MissingInput)?;
        let output = self.output_path()?;
        debug!("converting {input} to {output}");

        let transcoder = AvifTranscoder::new(self.config.codec_options)?;
        debug!("transcoding with {:?}", transcoder.options());
        let mut bulk_transform =
            BulkTransform::new(transcoder).set_cancellation_token(self.cancellation_token.clone());
        if let Some(max_parallel) = self.config.max_parallel {
            bulk_transform = bulk_transform.set_max_parallel(max_parallel);
        }
        if let Some(sender) = self.sender {
            bulk_transform = bulk_transform.set_sender(sender);
        }

        let entries = task::spawn_blocking(move || cbz::read_archive(input)).await??;
        debug!("found {} files in archive", entries.len());

        let transformed = bulk_transform
            .bulk_transform(
                entries.into_iter().map(|entry| {
                    let name = entry.name().to_string();
                    (name, entry.into_reader())
                }),
                true,
            )
            .await?;

        if self.cancellation_token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let output_path = output.clone();
        task::spawn_blocking(move || cbz::write_archive(transformed, output_path)).await??;
        info!("Finished write task to archive: {output}");

        Ok(output)
    }
}
