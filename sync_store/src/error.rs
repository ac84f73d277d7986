use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("error opening store at {path}")]
    OpenError {
        path: String,
        #[source]
        source: sled::Error,
    },

    #[error("error reading from store")]
    GetError(#[source] sled::Error),

    #[error("error writing to store")]
    PutError(#[source] sled::Error),

    #[error("error flushing store to disk")]
    FlushError(#[source] sled::Error),

    #[error("error encoding a record for storage")]
    EncodeError(#[source] rmp_serde::encode::Error),
}
