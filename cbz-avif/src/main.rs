#![deny(clippy::all)]
#![deny(clippy::pedantic)]

use std::{
    future::Future,
    io,
    process::{self, ExitCode},
};

use anyhow::Result;
use camino::Utf8PathBuf;
use cbz::image::CodecOptions;
use cbz_avif::{Config, Convert, Event, LogLevel};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::{signal, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Parser, Debug)]
pub struct ConvertArgs {
    /// Input .cbz file path
    #[clap(short, long)]
    pub input: Option<Utf8PathBuf>,
    /// Output .cbz file path, defaults to the input path with `-avif` appended to its name
    #[clap(short, long)]
    pub output: Option<Utf8PathBuf>,
    /// Silent mode, do not output any logs
    #[clap(short, long, conflicts_with = "verbose")]
    pub silent: bool,
    /// Verbose log mode
    #[clap(short, long)]
    pub verbose: bool,
    /// Avif quality, from 1 to 100
    #[clap(long, default_value_t = CodecOptions::default().quality)]
    pub quality: u8,
    /// Encoding effort, from 0 (fastest) to 9 (smallest)
    #[clap(long, default_value_t = CodecOptions::default().effort)]
    pub effort: u8,
    /// Encode losslessly, `--quality` is then ignored
    #[clap(long, action)]
    pub lossless: bool,
    /// How many images are transcoded at once, defaults to the number of cpus
    #[clap(short, long)]
    pub jobs: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum Subcommands {
    /// Convert a .cbz file to a .cbz file containing avif images
    #[clap(alias = "c")]
    Convert(ConvertArgs),
}

#[derive(Parser, Debug)]
#[clap(about, author, version)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Subcommands,
}

impl From<ConvertArgs> for Config {
    fn from(args: ConvertArgs) -> Self {
        Self {
            input: args.input,
            output: args.output,
            log_level: LogLevel::from_flags(args.silent, args.verbose),
            codec_options: CodecOptions {
                effort: args.effort,
                lossless: args.lossless,
                quality: args.quality,
                ..CodecOptions::default()
            },
            max_parallel: args.jobs,
        }
    }
}

fn spawn_progress_bar(mut rx: mpsc::UnboundedReceiver<Event>) -> Result<JoinHandle<()>> {
    let style = ProgressStyle::default_bar()
        .template("[cbz-avif] {wide_bar:.green} {percent}% ({pos}/{len}) | ETA: {eta}")?;

    Ok(tokio::spawn(async move {
        let mut bar = ProgressBar::hidden();

        while let Some(event) = rx.recv().await {
            match event {
                Event::Init(len) => {
                    bar = ProgressBar::new(u64::try_from(len).unwrap_or(u64::MAX))
                        .with_style(style.clone());
                }
                Event::Transcoded(_) => {
                    bar.inc(1);
                }
                Event::Done => {
                    bar.finish_and_clear();
                }
            }
        }

        if !bar.is_finished() {
            bar.abandon();
        }
    }))
}

/// Exit code of a process killed by SIGINT
const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Cancels `cancellation_token` on the first interrupt.
/// Returns `true` once a second interrupt is received.
async fn wait_for_interrupts<F, Fut>(
    mut next_interrupt: F,
    cancellation_token: CancellationToken,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<()>>,
{
    if next_interrupt().await.is_err() {
        return false;
    }
    warn!("interrupted, cancelling conversion (interrupt again to exit now)");
    cancellation_token.cancel();

    next_interrupt().await.is_ok()
}

fn cancel_on_interrupt(cancellation_token: CancellationToken) {
    tokio::spawn(async move {
        if wait_for_interrupts(signal::ctrl_c, cancellation_token).await {
            warn!("interrupted again, exiting");
            process::exit(INTERRUPTED_EXIT_CODE);
        }
    });
}

async fn convert(config: Config) -> Result<()> {
    let cancellation_token = CancellationToken::new();
    cancel_on_interrupt(cancellation_token.clone());

    let show_progress = config.log_level.shows_progress();
    let mut convert = Convert::new(config).set_cancellation_token(cancellation_token);

    let progress_bar = if show_progress {
        let (tx, rx) = mpsc::unbounded_channel();
        convert = convert.set_sender(tx);
        Some(spawn_progress_bar(rx)?)
    } else {
        None
    };

    // The sender is dropped with `convert`, which closes the progress bar channel
    let res = convert.convert().await;

    if let Some(progress_bar) = progress_bar {
        progress_bar.await?;
    }

    res?;

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let Subcommands::Convert(convert_args) = args.command;
    let config = Config::from(convert_args);
    let log_level = config.log_level;

    tracing_subscriber::fmt()
        .with_max_level(log_level.level_filter())
        .with_writer(io::stderr)
        .init();

    match convert(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if log_level != LogLevel::Silent {
                eprintln!("Error: {err:?}");
            }
            ExitCode::FAILURE
        }
    }
}
