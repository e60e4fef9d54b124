use std::path::PathBuf;

/// Errors raised while resolving entity names.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("batch of {size} names exceeds the per-request cap of {max}")]
    InvalidBatchSize { size: usize, max: usize },
    #[error("remote service unavailable after {attempts} attempts: {last_error}")]
    RemoteServiceUnavailable { attempts: u32, last_error: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("ambiguous link for `{name}`: {count} results for a single lookup")]
    AmbiguousLink { name: String, count: usize },
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Errors raised by the durable cache log.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cache log {path} is malformed: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("cache log {path} has unexpected header `{found}`")]
    Header { path: PathBuf, found: String },
    #[error("cache records need a non-empty entity name")]
    EmptyName,
}

/// Failures at the transport layer. Every variant is considered transient.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("http status {0}")]
    Status(u16),
    #[error("network error: {0}")]
    Network(String),
    #[error("undecodable response body: {0}")]
    Decode(String),
}

/// Errors that stop a dispatch run (as opposed to a single chunk).
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to write output: {0}")]
    Output(#[from] std::io::Error),
    #[error("failed to write linked output: {0}")]
    Csv(#[from] csv::Error),
    #[error("worker {worker} could not build its linker: {source}")]
    Linker {
        worker: usize,
        #[source]
        source: LinkError,
    },
    #[error("worker {0} panicked")]
    WorkerPanicked(usize),
    #[error("invalid dispatcher options: {0}")]
    Options(String),
}

pub type Result<T, E = LinkError> = std::result::Result<T, E>;
