//! Wire format of the delegation endpoint.
//!
//! There are exactly two message shapes: the request carries the losetup argument vector and the
//! response carries the outcome of running it.  Requests are validated field by field so that a
//! malformed body can be rejected with a precise message before any process is spawned.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{command::CommandOutput, error::RequestError};

/// Path of the delegation endpoint.
pub const LOSETUP_PATH: &str = "/losetup";

/// Port the agent listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 12345;

/// A delegated losetup invocation.
///
/// Paths in `args` are relative to the container's root; the agent decides which executable runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LosetupRequest {
    pub args: Vec<String>,
}

impl LosetupRequest {
    /// Parses and validates a request body.
    pub fn from_slice(body: &[u8]) -> Result<Self, RequestError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|err| RequestError::InvalidJson(err.to_string()))?;

        let Value::Object(mut object) = value else {
            return Err(RequestError::NotAnObject);
        };
        let Value::Array(items) = object.remove("args").ok_or(RequestError::MissingArgs)? else {
            return Err(RequestError::ArgsNotAList);
        };

        let args = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| match item {
                Value::String(arg) => Ok(arg),
                _ => Err(RequestError::ArgNotAString { index }),
            })
            .collect::<Result<_, _>>()?;

        Ok(LosetupRequest { args })
    }

    /// True if the caller asked losetup to print the device it set up.
    pub fn wants_device(&self) -> bool {
        self.args.iter().any(|arg| arg == crate::losetup::SHOW_FLAG)
    }
}

/// The outcome of a delegated invocation.  All three fields are always present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LosetupResponse {
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
}

impl From<CommandOutput> for LosetupResponse {
    fn from(output: CommandOutput) -> Self {
        LosetupResponse {
            returncode: output.returncode,
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }
}

impl From<LosetupResponse> for CommandOutput {
    fn from(response: LosetupResponse) -> Self {
        CommandOutput {
            returncode: response.returncode,
            stdout: response.stdout,
            stderr: response.stderr,
        }
    }
}

/// Body of every non-2xx answer from the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
