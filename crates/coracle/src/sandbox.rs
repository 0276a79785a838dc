//! Bundle-and-execute protocol for the sandbox child process.
//!
//! The host session serializes the workspace and spawns `coracle-sandbox`,
//! which reads exactly one [`ExecRequest`] as JSON from stdin, materializes
//! the workspace, bundles the entry module, runs it, and writes exactly one
//! [`ExecResponse`] to stdout. Stderr is for diagnostics only. Process
//! isolation is the sandbox boundary: the child shares no memory with the
//! host and a killed child leaves the host workspace untouched.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bundle;
use crate::exec::{ExecError, Executor, ResourceLimits};
use crate::workspace::Workspace;

/// Entry module used when the request does not name one.
pub const DEFAULT_ENTRY: &str = "~/main.ts";
/// Script timeout used when the request does not carry one.
pub const DEFAULT_TIMEOUT_MS: u64 = 1500;

/// Exit code for a generic failure.
pub const EXIT_FAILURE: i32 = 1;
/// Exit code reported when the script ran out of wall-clock time.
pub const EXIT_TIMEOUT: i32 = 124;

fn default_entry() -> String {
    DEFAULT_ENTRY.to_string()
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

/// Request read from the child's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecRequest {
    pub zip_base64: String,
    #[serde(default = "default_entry")]
    pub entry_path: String,
    #[serde(default)]
    pub argv: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// Response written to the child's stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExecResponse {
    #[serde(rename_all = "camelCase")]
    Success {
        ok: bool,
        stdout: String,
        stderr: String,
        exit_code: i32,
        zip_base64: String,
    },
    #[serde(rename_all = "camelCase")]
    Failure {
        ok: bool,
        error: String,
        stack: String,
        exit_code: i32,
    },
}

impl ExecResponse {
    pub fn success(stdout: String, stderr: String, exit_code: i32, zip_base64: String) -> Self {
        Self::Success {
            ok: true,
            stdout,
            stderr,
            exit_code,
            zip_base64,
        }
    }

    pub fn failure(error: impl Into<String>, stack: impl Into<String>, exit_code: i32) -> Self {
        Self::Failure {
            ok: false,
            error: error.into(),
            stack: stack.into(),
            exit_code,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Success { exit_code, .. } | Self::Failure { exit_code, .. } => *exit_code,
        }
    }
}

/// Serve one request: import, bundle, execute, export.
///
/// Every failure mode becomes a structured [`ExecResponse::Failure`]; this
/// function never panics on bad input.
pub fn run_request(request: &ExecRequest) -> ExecResponse {
    let zip = match BASE64.decode(&request.zip_base64) {
        Ok(bytes) => bytes,
        Err(e) => {
            return ExecResponse::failure(
                format!("invalid zipBase64: {e}"),
                String::new(),
                EXIT_FAILURE,
            )
        }
    };

    let mut ws = Workspace::new();
    if let Err(e) = ws.import_zip(&zip) {
        return ExecResponse::failure(e.to_string(), String::new(), EXIT_FAILURE);
    }

    let bundle = match bundle::bundle(&ws, &request.entry_path) {
        Ok(bundle) => bundle,
        Err(e) => return ExecResponse::failure(e.to_string(), String::new(), EXIT_FAILURE),
    };
    debug!(entry = %bundle.entry, bytes = bundle.code.len(), "bundled guest program");

    let limits = ResourceLimits {
        timeout_ms: request.timeout_ms,
        ..ResourceLimits::default()
    };
    let ws = Rc::new(RefCell::new(ws));
    let outcome = Executor::new(limits).run(
        ws.clone(),
        &bundle.code,
        &bundle.entry,
        &request.argv,
        &request.env,
    );

    match outcome {
        Ok(outcome) => {
            let exported = match ws.borrow().export_zip_buffer() {
                Ok(buf) => buf,
                Err(e) => {
                    return ExecResponse::failure(e.to_string(), String::new(), EXIT_FAILURE)
                }
            };
            ExecResponse::success(
                outcome.stdout,
                outcome.stderr,
                outcome.exit_code,
                BASE64.encode(exported),
            )
        }
        Err(ExecError::Timeout) => {
            ExecResponse::failure("script timed out", String::new(), EXIT_TIMEOUT)
        }
        Err(ExecError::Guest { message, stack }) => {
            ExecResponse::failure(message, stack.unwrap_or_default(), EXIT_FAILURE)
        }
        Err(e) => ExecResponse::failure(e.to_string(), String::new(), EXIT_FAILURE),
    }
}
