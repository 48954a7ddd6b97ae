use thiserror::Error;

use crate::storage::ObjectLocation;

/// Cause of a single failed attempt against the weather API.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("undecodable body: {0}")]
    Decode(#[from] serde_json::Error),
}

/// City-level failure. The pipeline contains these; they never abort a best-effort run.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetching weather for {city} failed after {attempts} attempt(s): {source}")]
    FetchFailed {
        city: String,
        attempts: u32,
        #[source]
        source: AttemptError,
    },

    #[error("malformed response for {city}: {reason}")]
    MalformedResponse { city: String, reason: String },
}

impl FetchError {
    pub fn city(&self) -> &str {
        match self {
            FetchError::FetchFailed { city, .. }
            | FetchError::MalformedResponse { city, .. } => city,
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("could not resolve storage credentials: {0}")]
    CredentialResolutionFailed(String),

    #[error("storage rejected credentials (status {status}): {message}")]
    Unauthorized { status: u16, message: String },

    #[error("transient storage failure: {0}")]
    Transient(String),

    #[error("storage rejected upload (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize dataset: {0}")]
    Serialize(String),

    #[error("upload to {location} failed after {attempts} attempt(s): {source}")]
    UploadFailed {
        location: ObjectLocation,
        attempts: u32,
        #[source]
        source: Box<StorageError>,
    },
}

impl StorageError {
    /// Whether retrying the same upload may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }

    pub fn from_status(status: reqwest::StatusCode, message: String) -> Self {
        let code = status.as_u16();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            StorageError::Unauthorized {
                status: code,
                message,
            }
        } else if status.is_server_error()
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            StorageError::Transient(format!("status {code}: {message}"))
        } else {
            StorageError::Rejected {
                status: code,
                message,
            }
        }
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(e: reqwest::Error) -> Self {
        StorageError::Transient(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("aborting run: {0}")]
    City(#[source] FetchError),

    #[error("all {failed} cities failed to fetch; nothing was uploaded")]
    AllCitiesFailed { failed: usize },

    #[error("no cities configured")]
    NoCities,
}

pub(crate) fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    if body.len() > MAX {
        let mut cut = MAX;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &body[..cut])
    } else {
        body.to_string()
    }
}
