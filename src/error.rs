//! Error types for the delegation boundary.

use http::StatusCode;

/// A delegation request body which was rejected before anything ran.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("Expected JSON body: {0}")]
    InvalidJson(String),
    #[error("Expected a JSON object")]
    NotAnObject,
    #[error("Missing required field 'args'")]
    MissingArgs,
    #[error("args must be a list of strings")]
    ArgsNotAList,
    #[error("args must be a list of strings (element {index} is not a string)")]
    ArgNotAString { index: usize },
    #[error("Request body exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

impl RequestError {
    pub fn status(&self) -> StatusCode {
        match self {
            RequestError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// A failure to complete a delegated call.
///
/// A delegated tool which ran and failed is not a `ClientError`: its exit status comes back in
/// the response like any other.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The agent could not be reached.
    #[error("Error connecting to server: {0}")]
    Transport(#[source] reqwest::Error),
    /// The agent answered, but refused the request.
    #[error("Server rejected request ({status}): {message}")]
    Rejected { status: StatusCode, message: String },
    /// The agent answered with something that is not a response.
    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),
}

/// Why loop device setup produced no device.
#[derive(Debug, thiserror::Error)]
pub enum LoopSetupError {
    #[error("losetup failed: {}", stderr.trim())]
    Failed { returncode: i32, stderr: String },
    #[error("losetup succeeded but printed no device")]
    NoDevice,
    #[error(transparent)]
    Spawn(#[from] std::io::Error),
}
