//! Execution Backends
//!
//! Server-mode dispatch lands on one of two backends behind a common trait:
//! the remote execution engine (HTTP) or a local interpreter subprocess.
//! Which one is in play is decided once, at construction, from deployment
//! configuration; a remote failure at call time is surfaced, never silently
//! retried locally.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use wisp_common::{ModuleId, PrimitiveRef};

/// Payload handed to either backend. Same wire shape over HTTP and stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnginePayload {
    pub module_id: ModuleId,
    pub primitives: Vec<PrimitiveRef>,
    pub input: serde_json::Map<String, serde_json::Value>,
}

/// Structured verdict from a backend, passed through to the caller unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineResponse {
    pub success: bool,
    #[serde(default)]
    pub output: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Backend transport failures. The module itself reporting `success: false`
/// is not a backend error; that verdict travels inside [`EngineResponse`].
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("engine unreachable: {0}")]
    Unreachable(String),
    #[error("backend timed out after {0:?}")]
    Timeout(Duration),
    #[error("interpreter exited with status {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },
    #[error("malformed backend response: {0}")]
    MalformedResponse(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// One way of running a module's primitive pipeline server-side.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Run the pipeline to completion and return the engine's verdict.
    async fn run(&self, payload: &EnginePayload) -> Result<EngineResponse, BackendError>;
    /// Stable backend name for logs.
    fn name(&self) -> &str;
}

/// Remote execution engine client.
pub struct RemoteEngine {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl RemoteEngine {
    /// Client for the engine at `base_url`, with a per-request timeout.
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl ExecutionBackend for RemoteEngine {
    async fn run(&self, payload: &EnginePayload) -> Result<EngineResponse, BackendError> {
        let url = format!("{}/execute", self.base_url);

        let resp = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout(self.timeout)
                } else {
                    BackendError::Unreachable(e.to_string())
                }
            })?;

        resp.json::<EngineResponse>()
            .await
            .map_err(|e| BackendError::MalformedResponse(e.to_string()))
    }

    fn name(&self) -> &str {
        "remote-engine"
    }
}

/// Local interpreter subprocess backend.
///
/// Spawns `<interpreter> <script>`, writes the payload JSON to stdin, and
/// parses stdout as an [`EngineResponse`]. The process is killed if it
/// outlives the timeout.
pub struct LocalInterpreter {
    interpreter: String,
    script: String,
    timeout: Duration,
}

impl LocalInterpreter {
    /// Backend running `script` under `interpreter`.
    pub fn new(interpreter: &str, script: &str, timeout: Duration) -> Self {
        Self {
            interpreter: interpreter.to_string(),
            script: script.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl ExecutionBackend for LocalInterpreter {
    async fn run(&self, payload: &EnginePayload) -> Result<EngineResponse, BackendError> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| BackendError::MalformedResponse(e.to_string()))?;

        let mut child = Command::new(&self.interpreter)
            .arg(&self.script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&body).await?;
            // Close stdin so the interpreter sees EOF.
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => return Err(BackendError::Timeout(self.timeout)),
        };

        if !output.status.success() {
            return Err(BackendError::NonZeroExit {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| BackendError::MalformedResponse(e.to_string()))
    }

    fn name(&self) -> &str {
        "local-interpreter"
    }
}
