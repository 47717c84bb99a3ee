use std::process::ExitCode;

use thiserror::Error;

/// Errors that terminate a job invocation.
///
/// Every variant is fatal to the current run; recovery is the next scheduled
/// invocation. The snapshot reconciler is the one caller that isolates
/// failures, per file.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("configuration: {0}")]
    Config(String),

    #[error("fetching {what}: {source}")]
    Fetch {
        what: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("unsupported resolution token {token:?}")]
    UnsupportedResolution { token: String },

    #[error("parsing {what}: {message}")]
    Parse { what: &'static str, message: String },

    #[error("no data available for {what}")]
    NoDataAvailable { what: &'static str },

    #[error("persisting to {table}: {source}")]
    Persist {
        table: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Convenience alias for results carrying an [`IngestError`].
pub type IngestResult<T> = std::result::Result<T, IngestError>;

impl IngestError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn fetch(what: &'static str, source: impl Into<anyhow::Error>) -> Self {
        Self::Fetch {
            what,
            source: source.into(),
        }
    }

    pub fn parse(what: &'static str, message: impl Into<String>) -> Self {
        Self::Parse {
            what,
            message: message.into(),
        }
    }

    pub fn persist(table: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Persist {
            table: table.into(),
            source: source.into(),
        }
    }

    /// Whether this error belongs to the parse family (malformed payloads and
    /// unsupported resolution tokens).
    pub fn is_parse(&self) -> bool {
        matches!(self, Self::Parse { .. } | Self::UnsupportedResolution { .. })
    }

    /// Process exit code for this error class.
    pub fn exit_code(&self) -> ExitCode {
        let code = match self {
            Self::Config(_) => 2,
            Self::Fetch { .. } => 3,
            Self::Parse { .. } | Self::UnsupportedResolution { .. } => 4,
            Self::NoDataAvailable { .. } => 5,
            Self::Persist { .. } => 6,
        };
        ExitCode::from(code)
    }
}
