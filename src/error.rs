use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::domain::TaskId;

#[derive(Debug, Error, Diagnostic)]
pub enum PatpatError {
    #[error("invalid protein identifier: {0}")]
    #[diagnostic(help("expected a UniProt accession such as P23950"))]
    InvalidIdentifier(String),

    #[error("invalid proteome accession: {0}")]
    InvalidProteomeAccession(String),

    #[error("invalid taxonomy id: {0}")]
    InvalidTaxonId(String),

    #[error("invalid task id: {0}")]
    InvalidTaskId(String),

    #[error("proteome catalog unavailable: {0}")]
    #[diagnostic(help("run `patpat catalog refresh` once network access is available"))]
    CatalogUnavailable(String),

    #[error("no organism or reference proteome known for: {0}")]
    UnknownIdentifier(String),

    #[error("{identifier} has no entry in proteome {proteome}")]
    SequenceNotFound { identifier: String, proteome: String },

    #[error("download of proteome {0} was declined")]
    Declined(String),

    #[error("proteome download failed for {accession}: {message}")]
    DownloadError { accession: String, message: String },

    #[error("every source failed for task {task}")]
    AllSourcesFailed { task: TaskId },

    #[error("task {0} is already in use by another run")]
    #[diagnostic(help("remove result/<task>/.lock if no other run is active"))]
    TaskInUse(TaskId),

    #[error("task {task} was cancelled")]
    Cancelled { task: TaskId },

    #[error("invalid hub state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("no mapper configured")]
    NoMappers,

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),

    #[error("unknown mapper: {0}")]
    UnknownMapper(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
