#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Input must be defined (see help command for more information)")]
    MissingInput,

    #[error("Cbz error: {0}")]
    Cbz(#[from] cbz::Error),

    #[error("Image {name} couldn't be transformed: {source}")]
    Transcode {
        name: String,
        #[source]
        source: cbz::Error,
    },

    #[error("Several images would be named {0} once transformed")]
    DuplicateEntry(String),

    #[error("Conversion cancelled")]
    Cancelled,

    #[error("join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
