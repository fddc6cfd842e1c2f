use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ChartError {
    #[error("chart source is not valid: {0}")]
    SourceInvalid(String),

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("tile container error: {0}")]
    Database(String),

    #[error("chart not found: {0}")]
    ChartNotFound(String),

    #[error("download job not found: {0}")]
    JobNotFound(String),

    #[error("invalid download url: {0}")]
    InvalidUrl(String),

    #[error("download request failed: {0}")]
    Http(String),

    #[error("server returned status {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("too many redirects while fetching {0}")]
    TooManyRedirects(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("no matching files found")]
    NoMatchingFiles,

    #[error("failed to write {0}")]
    WriteFailure(String),

    #[error("cancelled")]
    Cancelled,

    #[error("async runtime unavailable: {0}")]
    Runtime(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),
}
