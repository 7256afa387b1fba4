//! stencil-plugin-api: Shared types for the stencil plugin system
//!
//! This crate defines the protocol between the host and a guest (wasm plugin).
//! Requests and responses are JSON documents exchanged over the guest's
//! standard input/output streams, each message terminated by a single
//! delimiter byte. Diagnostics go to the guest's standard error stream.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Name of the handler function every plugin must export.
///
/// The function takes no parameters and returns a single `i64` exit code.
pub const HANDLE_REQUEST_FN: &str = "handle_request";

/// Byte terminating every framed message on stdin/stdout.
pub const MESSAGE_DELIMITER: u8 = b'\r';

/// Fixed path the project directory is mounted at inside the guest,
/// when the read-only CWD capability has been granted.
pub const GUEST_PROJECT_PATH: &str = "/project";

/// Environment variable holding the guest-visible project path.
pub const ENV_PROJECT_PATH: &str = "STENCIL_PROJECT_PATH";

/// Environment variable holding the host working directory the mount
/// was created from. Empty when no filesystem access was granted.
pub const ENV_HOST_PROJECT_PATH: &str = "STENCIL_HOST_PROJECT_PATH";

/// Environment variable holding the message delimiter byte.
pub const ENV_MESSAGE_DELIMITER: &str = "STENCIL_MESSAGE_DELIMITER";

/// A request sent from the host to the plugin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    /// Context about the file being generated.
    pub metadata: RequestMetadata,

    /// User-supplied package data, keyed by field name.
    #[serde(default)]
    pub data: Map<String, Value>,

    /// The operation payload. Present on every request today.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_file: Option<WriteFileRequest>,
}

/// Metadata identifying the file a request is generating.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestMetadata {
    /// Name of the enclosing package.
    pub package: String,

    /// The rendered on-disk destination path.
    pub target: String,

    /// The source-relative path of the file inside the package.
    pub path: String,
}

/// Payload asking the plugin to produce the contents of one file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteFileRequest {}

/// A response read back from the plugin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_file: Option<WriteFileResponse>,

    /// Issues raised while handling the request. Warnings are surfaced to
    /// the user; any error-level issue aborts generation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<Issue>,
}

/// The produced file contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteFileResponse {
    #[serde(default)]
    pub contents: Vec<u8>,
}

/// A diagnostic reported by the plugin alongside its response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub level: IssueLevel,
    pub message: String,
}

impl Issue {
    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            level: IssueLevel::Warn,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: IssueLevel::Error,
            message: message.into(),
        }
    }
}

/// Severity of an [`Issue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueLevel {
    #[default]
    Unspecified,
    Warn,
    Error,
}

/// Status code returned by the guest's handler function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(pub u64);

impl ExitCode {
    pub const OK: ExitCode = ExitCode(0);
    pub const INTERNAL: ExitCode = ExitCode(1);
    pub const MALFORMED_REQUEST: ExitCode = ExitCode(2);

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::OK => write!(f, "ok"),
            Self::INTERNAL => write!(f, "plugin reported an internal error"),
            Self::MALFORMED_REQUEST => write!(f, "plugin could not parse the request"),
            Self(code) => write!(f, "plugin exited with unknown code {code}"),
        }
    }
}
