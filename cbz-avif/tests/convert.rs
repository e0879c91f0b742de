use std::{
    fs,
    io::{self, Cursor, Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use camino::{Utf8Path, Utf8PathBuf};
use cbz::{image::CodecOptions, CbzReader, COMMENT};
use cbz_avif::{BulkTransform, Config, Convert, Error, Event, LogLevel};
use image::{DynamicImage, ImageFormat, RgbImage};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use zip::{write::FileOptions, ZipWriter};

const AVIF_SIGNATURE: &[u8] = b"ftypavif";

fn png(width: u32, height: u32, shade: u8) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(RgbImage::from_pixel(
        width,
        height,
        image::Rgb([shade, 255 - shade, 128]),
    ))
    .write_to(&mut out, ImageFormat::Png)
    .unwrap();
    out.into_inner()
}

fn jpeg(width: u32, height: u32) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, image::Rgb([10, 20, 30])))
        .write_to(&mut out, ImageFormat::Jpeg)
        .unwrap();
    out.into_inner()
}

fn write_cbz(path: &Utf8Path, files: &[(&str, Vec<u8>)]) {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, bytes) in files {
        writer.start_file(*name, FileOptions::default()).unwrap();
        writer.write_all(bytes).unwrap();
    }
    fs::write(path, writer.finish().unwrap().into_inner()).unwrap();
}

fn temp_dir() -> (TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    (dir, path)
}

fn dir_entries(dir: &Utf8Path) -> Vec<String> {
    let mut names = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .collect::<Vec<_>>();
    names.sort();
    names
}

fn config(input: &Utf8Path) -> Config {
    Config {
        input: Some(input.to_path_buf()),
        log_level: LogLevel::Silent,
        ..Config::default()
    }
}

fn bulk_transform() -> BulkTransform {
    BulkTransform::new(cbz::image::AvifTranscoder::new(CodecOptions::default()).unwrap())
}

/// Page whose content only becomes readable once `cancellation_token` is cancelled
struct HeldPage {
    page: Cursor<Vec<u8>>,
    read: Arc<AtomicBool>,
    cancellation_token: CancellationToken,
}

impl Read for HeldPage {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(10);
        while !self.cancellation_token.is_cancelled() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        self.page.read(buf)
    }
}

/// Collects every event, cancelling `cancellation_token` on the first transcoded image
fn cancel_on_first_transcoded(
    cancellation_token: CancellationToken,
) -> (
    mpsc::UnboundedSender<Event>,
    tokio::task::JoinHandle<Vec<Event>>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let consumer = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            if matches!(event, Event::Transcoded(_)) {
                cancellation_token.cancel();
            }
            events.push(event);
        }
        events
    });

    (tx, consumer)
}

#[tokio::test]
async fn bulk_transform_renames_in_order() {
    let entries = ["001.png", "002.png", "003.png"]
        .into_iter()
        .enumerate()
        .map(|(i, name)| (name.to_string(), Cursor::new(png(8, 12, i as u8 * 60))));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let transformed = bulk_transform()
        .set_sender(tx)
        .bulk_transform(entries, true)
        .await
        .unwrap();

    let names = transformed
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(names, ["001.avif", "002.avif", "003.avif"]);
    for (_, buffer) in &transformed {
        assert_eq!(&buffer[4..12], AVIF_SIGNATURE);
    }

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    assert_eq!(
        events,
        [
            Event::Init(3),
            Event::Transcoded("001.avif".to_string()),
            Event::Transcoded("002.avif".to_string()),
            Event::Transcoded("003.avif".to_string()),
            Event::Done,
        ]
    );
}

#[tokio::test]
async fn bulk_transform_keeps_order_with_uneven_work() {
    // Bigger pages first so that later ones are likely to finish earlier
    let names = (1..=8).map(|i| format!("{i:03}.png")).collect::<Vec<_>>();
    let entries = names.iter().enumerate().map(|(i, name)| {
        let side = 96 - u32::try_from(i).unwrap() * 10;
        (name.clone(), Cursor::new(png(side, side, 0)))
    });

    let transformed = bulk_transform()
        .set_max_parallel(4)
        .bulk_transform(entries, false)
        .await
        .unwrap();

    let transformed_names = transformed
        .into_iter()
        .map(|(name, _)| name)
        .collect::<Vec<_>>();
    assert_eq!(transformed_names, names);
}

#[tokio::test]
async fn bulk_transform_fails_on_first_invalid_image() {
    let entries = vec![
        ("001.png".to_string(), Cursor::new(png(8, 8, 0))),
        ("002.png".to_string(), Cursor::new(b"not an image".to_vec())),
        ("003.png".to_string(), Cursor::new(png(8, 8, 0))),
    ];

    let res = bulk_transform()
        .set_max_parallel(1)
        .bulk_transform(entries, true)
        .await;

    match res {
        Err(Error::Transcode { name, source }) => {
            assert_eq!(name, "002.png");
            assert!(matches!(source, cbz::Error::Decode(_)));
        }
        other => panic!("expected a transcode error, got {other:?}"),
    }
}

#[tokio::test]
async fn bulk_transform_stops_when_cancelled_midway() {
    let cancellation_token = CancellationToken::new();
    let read = (0..6)
        .map(|_| Arc::new(AtomicBool::new(false)))
        .collect::<Vec<_>>();
    let entries = read
        .iter()
        .enumerate()
        .map(|(i, read)| {
            let page: Box<dyn Read + Send> = if i == 0 {
                Box::new(Cursor::new(png(8, 8, 0)))
            } else {
                Box::new(HeldPage {
                    page: Cursor::new(png(8, 8, 0)),
                    read: Arc::clone(read),
                    cancellation_token: cancellation_token.clone(),
                })
            };
            (format!("{:03}.png", i + 1), page)
        })
        .collect::<Vec<_>>();
    let (tx, consumer) = cancel_on_first_transcoded(cancellation_token.clone());

    let res = bulk_transform()
        .set_max_parallel(2)
        .set_sender(tx)
        .set_cancellation_token(cancellation_token)
        .bulk_transform(entries, true)
        .await;

    assert!(matches!(res, Err(Error::Cancelled)));
    assert_eq!(
        consumer.await.unwrap(),
        [Event::Init(6), Event::Transcoded("001.avif".to_string())]
    );
    // Only pages already submitted before the cancellation have been touched
    for (i, read) in read.iter().enumerate().skip(3) {
        assert!(!read.load(Ordering::SeqCst), "page {} was read", i + 1);
    }
}

#[tokio::test]
async fn convert_to_default_output() {
    let (_dir, path) = temp_dir();
    let input = path.join("comic.cbz");
    write_cbz(
        &input,
        &[
            ("001.png", png(16, 24, 0)),
            ("002.jpg", jpeg(16, 24)),
            ("003.png", png(24, 16, 200)),
        ],
    );

    let output = Convert::new(config(&input)).convert().await.unwrap();

    assert_eq!(output, path.join("comic-avif.cbz"));
    let mut reader = CbzReader::from_path(&output).unwrap();
    assert_eq!(reader.comment(), COMMENT.as_bytes());
    let entries = reader.entries().unwrap();
    let names = entries.iter().map(|entry| entry.name()).collect::<Vec<_>>();
    assert_eq!(names, ["001.avif", "002.avif", "003.avif"]);
    for entry in entries {
        let (_, bytes) = entry.into_parts();
        assert_eq!(&bytes[4..12], AVIF_SIGNATURE);
    }
    assert_eq!(dir_entries(&path), ["comic-avif.cbz", "comic.cbz"]);
}

#[tokio::test]
async fn convert_keeps_nested_pages() {
    let (_dir, path) = temp_dir();
    let input = path.join("volume.cbz");
    let output = path.join("converted.cbz");
    write_cbz(
        &input,
        &[
            ("chapter 1/001.png", png(8, 8, 0)),
            ("chapter 1/002.png", png(8, 8, 50)),
            ("chapter 2/001.png", png(8, 8, 100)),
        ],
    );

    let written = Convert::new(Config {
        output: Some(output.clone()),
        max_parallel: Some(2),
        ..config(&input)
    })
    .convert()
    .await
    .unwrap();

    assert_eq!(written, output);
    let entries = cbz::read_archive(&output).unwrap();
    let names = entries.iter().map(|entry| entry.name()).collect::<Vec<_>>();
    assert_eq!(
        names,
        ["chapter 1/001.avif", "chapter 1/002.avif", "chapter 2/001.avif"]
    );
}

#[tokio::test]
async fn convert_writes_nothing_on_invalid_page() {
    let (_dir, path) = temp_dir();
    let input = path.join("comic.cbz");
    write_cbz(
        &input,
        &[
            ("001.png", png(8, 8, 0)),
            ("002.png", b"corrupted".to_vec()),
            ("003.png", png(8, 8, 0)),
        ],
    );

    let res = Convert::new(config(&input)).convert().await;

    assert!(matches!(res, Err(Error::Transcode { name, .. }) if name == "002.png"));
    assert_eq!(dir_entries(&path), ["comic.cbz"]);
}

#[tokio::test]
async fn convert_leaves_existing_output_untouched_on_failure() {
    let (_dir, path) = temp_dir();
    let input = path.join("comic.cbz");
    let output = path.join("comic-avif.cbz");
    write_cbz(&input, &[("001.png", b"corrupted".to_vec())]);
    fs::write(&output, b"previous").unwrap();

    let res = Convert::new(config(&input)).convert().await;

    assert!(res.is_err());
    assert_eq!(fs::read(&output).unwrap(), b"previous");
}

#[tokio::test]
async fn convert_missing_input_file() {
    let (_dir, path) = temp_dir();
    let input = path.join("missing.cbz");

    let res = Convert::new(config(&input)).convert().await;

    assert!(matches!(res, Err(Error::Cbz(cbz::Error::NotFound(not_found))) if not_found == input));
    assert!(dir_entries(&path).is_empty());
}

#[tokio::test]
async fn convert_cancelled() {
    let (_dir, path) = temp_dir();
    let input = path.join("comic.cbz");
    write_cbz(&input, &[("001.png", png(8, 8, 0))]);
    let cancellation_token = CancellationToken::new();
    cancellation_token.cancel();

    let res = Convert::new(config(&input))
        .set_cancellation_token(cancellation_token)
        .convert()
        .await;

    assert!(matches!(res, Err(Error::Cancelled)));
    assert_eq!(dir_entries(&path), ["comic.cbz"]);
}

#[tokio::test]
async fn convert_cancelled_while_transcoding() {
    let (_dir, path) = temp_dir();
    let input = path.join("comic.cbz");
    let pages = (1..=4)
        .map(|i| (format!("{i:03}.png"), png(64, 64, i * 40)))
        .collect::<Vec<_>>();
    let pages = pages
        .iter()
        .map(|(name, bytes)| (name.as_str(), bytes.clone()))
        .collect::<Vec<_>>();
    write_cbz(&input, &pages);
    let cancellation_token = CancellationToken::new();
    let (tx, consumer) = cancel_on_first_transcoded(cancellation_token.clone());

    let res = Convert::new(Config {
        max_parallel: Some(1),
        ..config(&input)
    })
    .set_sender(tx)
    .set_cancellation_token(cancellation_token)
    .convert()
    .await;

    assert!(matches!(res, Err(Error::Cancelled)));
    let events = consumer.await.unwrap();
    let transcoded = events
        .iter()
        .filter(|event| matches!(event, Event::Transcoded(_)))
        .count();
    assert_eq!(transcoded, 1);
    assert!(!events.contains(&Event::Done));
    assert_eq!(dir_entries(&path), ["comic.cbz"]);
}

#[tokio::test]
async fn convert_rejects_unsupported_options() {
    let (_dir, path) = temp_dir();
    let input = path.join("comic.cbz");
    write_cbz(&input, &[("001.png", png(8, 8, 0))]);

    let res = Convert::new(Config {
        codec_options: CodecOptions {
            quality: 0,
            ..CodecOptions::default()
        },
        ..config(&input)
    })
    .convert()
    .await;

    assert!(matches!(
        res,
        Err(Error::Cbz(cbz::Error::UnsupportedCodecOptions(_)))
    ));
    assert_eq!(dir_entries(&path), ["comic.cbz"]);
}
