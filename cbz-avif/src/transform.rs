use std::{collections::HashSet, io::Read, num::NonZeroUsize, sync::Arc, thread};

use bytes::Bytes;
use cbz::image::{to_target_file_name, AvifTranscoder};
use futures::{stream, StreamExt};
use tokio::{sync::mpsc, task};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Event {
    Init(usize),
    Transcoded(String),
    Done,
}

/// How many images are transcoded at once when nothing else is specified
#[must_use]
pub fn default_max_parallel() -> usize {
    thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

/// Transcodes a batch of images, in order.
///
/// Up to `max_parallel` images are transcoded on the blocking thread pool at the same time,
/// results are still collected, and progress reported, in the input order.
/// The first failure aborts the whole batch.
#[derive(Debug, Clone)]
pub struct BulkTransform {
    transcoder: Arc<AvifTranscoder>,
    max_parallel: usize,
    sender: Option<mpsc::UnboundedSender<Event>>,
    cancellation_token: CancellationToken,
}

impl BulkTransform {
    #[must_use]
    pub fn new(transcoder: AvifTranscoder) -> Self {
        Self {
            transcoder: Arc::new(transcoder),
            max_parallel: default_max_parallel(),
            sender: None,
            cancellation_token: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn set_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
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

    fn notify(&self, event: Event) {
        if let Some(sender) = &self.sender {
            if sender.send(event).is_err() {
                debug!("progress receiver is gone, event dropped");
            }
        }
    }

    /// Transcodes every image of `entries` and returns them in the same order,
    /// renamed with the avif extension if `rename_to_target_ext` is set.
    ///
    /// ## Errors
    ///
    /// Fails on the first image that can't be transcoded, with its name attached,
    /// if two images end up with the same name, or if the cancellation token is cancelled.
    pub async fn bulk_transform<I, S>(
        &self,
        entries: I,
        rename_to_target_ext: bool,
    ) -> Result<Vec<(String, Bytes)>>
    where
        I: IntoIterator<Item = (String, S)>,
        S: Read + Send + 'static,
    {
        let mut names = HashSet::new();
        let entries = entries
            .into_iter()
            .map(|(name, source)| {
                let target_name = if rename_to_target_ext {
                    to_target_file_name(&name)
                } else {
                    name.clone()
                };
                if !names.insert(target_name.clone()) {
                    return Err(Error::DuplicateEntry(target_name));
                }

                Ok((name, target_name, source))
            })
            .collect::<Result<Vec<_>>>()?;
        let len = entries.len();

        info!("Transforming {len} images...");
        self.notify(Event::Init(len));

        let mut results = stream::iter(entries)
            .map(|(name, target_name, source)| {
                let transcoder = Arc::clone(&self.transcoder);
                let cancellation_token = self.cancellation_token.clone();
                async move {
                    if cancellation_token.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    debug!("Transforming image: {name}");

                    match task::spawn_blocking(move || transcoder.transform(source)).await? {
                        Ok(buffer) => Ok((target_name, buffer)),
                        Err(source) => Err(Error::Transcode { name, source }),
                    }
                }
            })
            .buffered(self.max_parallel);

        let mut transformed = Vec::with_capacity(len);
        loop {
            let next = tokio::select! {
                biased;
                () = self.cancellation_token.cancelled() => None,
                next = results.next() => Some(next),
            };
            let Some(next) = next else {
                info!("Cancelled after {} of {len} images", transformed.len());
                return Err(Error::Cancelled);
            };
            let Some(res) = next else {
                break;
            };

            let (name, buffer) = res.map_err(|err| {
                error!("{err}");
                err
            })?;
            self.notify(Event::Transcoded(name.clone()));
            transformed.push((name, buffer));
        }

        self.notify(Event::Done);
        debug!("Finished transforming {} images", transformed.len());

        Ok(transformed)
    }
}
