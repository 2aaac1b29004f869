//! Pipeline error taxonomy.
//!
//! Stage-fatal and configuration failures travel as [`PipelineError`] and end
//! the job with a terminal `FAILURE`. Per-item problems (a page file without
//! identifiers, a tag without text) never become a `PipelineError`; stages
//! log and count them instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Missing acting user, archive reference not set, invalid project settings.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A project, tag or entry the request names does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The export archive could not be opened or read.
    #[error("archive error: {0}")]
    Archive(String),

    /// The archive opened but contained no page-description files.
    #[error("archive contains no page files: {0}")]
    EmptyArchive(String),

    /// The structural parser failed on a page file.
    #[error("parser failed on {path}: {message}")]
    Parser { path: String, message: String },

    #[error("parser timed out after {secs}s on {path}")]
    ParserTimeout { path: String, secs: u64 },

    /// Another job already holds the project lease.
    #[error("project {project_id} is locked by running job {job_id}")]
    Conflict { project_id: i64, job_id: String },

    #[error("job {0} was cancelled")]
    Cancelled(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    /// Short machine-readable code used in job records and HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Configuration(_) => "configuration",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::Archive(_) | PipelineError::EmptyArchive(_) => "archive",
            PipelineError::Parser { .. } => "parser",
            PipelineError::ParserTimeout { .. } => "timeout",
            PipelineError::Conflict { .. } => "conflict",
            PipelineError::Cancelled(_) => "cancelled",
            PipelineError::Io(_) => "io",
            PipelineError::Database(_) => "database",
            PipelineError::Other(_) => "internal",
        }
    }
}
