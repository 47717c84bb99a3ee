use chrono::Duration;

use crate::error::{IngestError, IngestResult};

/// Source-reported sampling interval, decoded from its ISO 8601 token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    Minutes15,
    Minutes30,
    Minutes60,
}

impl Resolution {
    /// All supported resolutions.
    pub const ALL: [Resolution; 3] = [
        Resolution::Minutes15,
        Resolution::Minutes30,
        Resolution::Minutes60,
    ];

    /// Decode a resolution token. Anything outside the fixed vocabulary is
    /// rejected; there is no partial interpretation.
    pub fn decode(token: &str) -> IngestResult<Self> {
        match token.trim() {
            "PT15M" => Ok(Self::Minutes15),
            "PT30M" => Ok(Self::Minutes30),
            "PT60M" => Ok(Self::Minutes60),
            other => Err(IngestError::UnsupportedResolution {
                token: other.to_string(),
            }),
        }
    }

    /// Returns the wire token.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minutes15 => "PT15M",
            Self::Minutes30 => "PT30M",
            Self::Minutes60 => "PT60M",
        }
    }

    /// Returns the sampling interval.
    pub fn duration(self) -> Duration {
        match self {
            Self::Minutes15 => Duration::minutes(15),
            Self::Minutes30 => Duration::minutes(30),
            Self::Minutes60 => Duration::minutes(60),
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
