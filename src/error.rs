use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum AbiError {
    #[error("catalog request failed: {0}")]
    CatalogHttp(String),

    #[error("catalog returned status {status}: {message}")]
    CatalogStatus { status: u16, message: String },

    #[error("catalog pagination stalled at row {start_row} of {total_rows}")]
    CatalogStalled { start_row: u64, total_rows: u64 },

    #[error("download request failed: {0}")]
    DownloadHttp(String),

    #[error("download returned status {status}: {message}")]
    DownloadStatus { status: u16, message: String },

    #[error("download gave up after {attempts} attempts: {url}")]
    DownloadExhausted { url: String, attempts: usize },

    #[error("malformed experiment metadata: {0}")]
    MalformedMetadata(String),

    #[error("invalid volume header: {0}")]
    HeaderParse(String),

    #[error("registration failed: {0}")]
    Registration(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("archive write failed: {0}")]
    Archive(String),

    #[error("invalid resolution tier: {0}")]
    InvalidResolution(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
