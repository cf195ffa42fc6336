//! Execution Dispatcher
//!
//! The single entry point every trigger converges on: direct user requests,
//! scheduler ticks, and webhook slugs all become an [`ExecutionRequest`]
//! handed to [`Dispatcher::execute`]. This is the only place entitlement is
//! checked, quota is spent, and audit rows are written.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use wisp_common::{ExecutionMode, Module, ModuleRegistry, PrimitiveRef, UserId};

use crate::audit::{ExecutionLog, ExecutionLogStore, ExecutionStatus};
use crate::backend::{EnginePayload, ExecutionBackend};
use crate::config::ModulesConfig;
use crate::licensing::{Access, DenialReason, LicenseStore};

/// A request to run a module on behalf of a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub user_id: UserId,
    pub module_id: String,
    /// Explicit mode; `None` falls back to the module's declared default.
    #[serde(default)]
    pub execution_mode: Option<ExecutionMode>,
    #[serde(default)]
    pub input: serde_json::Map<String, serde_json::Value>,
}

/// What one dispatch actually did. Denial, a backend verdict, a
/// client-side bundle, and a transport fault are distinct outcomes; none of
/// them is an `Err` from [`Dispatcher::execute`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Authorization refused; nothing ran, nothing was charged.
    Denied { reason: DenialReason },
    /// A backend ran the module and returned its structured verdict.
    Completed {
        success: bool,
        output: serde_json::Map<String, serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Browser mode: the caller executes client-side with this bundle.
    ClientBundle {
        primitives: Vec<PrimitiveRef>,
        #[serde(skip_serializing_if = "Option::is_none")]
        ui_template: Option<String>,
    },
    /// The backend could not be reached or gave a garbled reply.
    TransportFailed { detail: String },
}

impl DispatchOutcome {
    /// True when the caller got what they asked for.
    pub fn success(&self) -> bool {
        match self {
            Self::Completed { success, .. } => *success,
            Self::ClientBundle { .. } => true,
            Self::Denied { .. } | Self::TransportFailed { .. } => false,
        }
    }
}

/// Result of one `execute` call.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub outcome: DispatchOutcome,
    pub duration_ms: u64,
    /// License charged for the run; `None` when authorization refused.
    pub license_id: Option<Uuid>,
}

/// Hard dispatch faults. Authorization denials and backend failures are not
/// errors; they travel inside [`DispatchOutcome`].
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown module: {0}")]
    UnknownModule(String),
    #[error("missing capability: {0}")]
    MissingCapability(String),
}

/// Validates entitlement, routes to a backend, meters and logs the attempt.
pub struct Dispatcher {
    registry: Arc<dyn ModuleRegistry>,
    licenses: Arc<LicenseStore>,
    logs: Arc<ExecutionLogStore>,
    backend: Arc<dyn ExecutionBackend>,
    probe_client: reqwest::Client,
    hal_status_url: String,
}

impl Dispatcher {
    /// Dispatcher over the given stores and backend.
    pub fn new(
        registry: Arc<dyn ModuleRegistry>,
        licenses: Arc<LicenseStore>,
        logs: Arc<ExecutionLogStore>,
        backend: Arc<dyn ExecutionBackend>,
        config: &ModulesConfig,
    ) -> Self {
        Self {
            registry,
            licenses,
            logs,
            backend,
            probe_client: reqwest::Client::new(),
            hal_status_url: config.hal_status_url.clone(),
        }
    }

    /// Run a module for a user.
    ///
    /// Calls that pass authorization and reach dispatch produce exactly one
    /// audit row and one quota increment, whether or not the run succeeded.
    /// Denied calls produce neither.
    pub async fn execute(&self, req: &ExecutionRequest) -> Result<ExecutionReport, DispatchError> {
        let started = Instant::now();

        let license_id = match self.licenses.authorize(req.user_id, &req.module_id) {
            Access::Granted { license_id } => license_id,
            Access::Denied { reason } => {
                debug!(user = %req.user_id, module = %req.module_id, %reason, "dispatch denied");
                return Ok(ExecutionReport {
                    outcome: DispatchOutcome::Denied { reason },
                    duration_ms: 0,
                    license_id: None,
                });
            }
        };

        let module = self
            .registry
            .get(&req.module_id)
            .ok_or_else(|| DispatchError::UnknownModule(req.module_id.clone()))?;

        // Capability prerequisites short-circuit before any backend work:
        // no wasted remote call, no misleading "execution failed" audit row.
        self.validate_requirements(&module).await?;

        let mode = effective_mode(req.execution_mode, module.execution_mode);

        let outcome = match mode {
            ExecutionMode::Browser => DispatchOutcome::ClientBundle {
                primitives: module.primitives.clone(),
                ui_template: module.ui_template.clone(),
            },
            _ => {
                let payload = EnginePayload {
                    module_id: module.id.clone(),
                    primitives: module.primitives.clone(),
                    input: req.input.clone(),
                };
                match self.backend.run(&payload).await {
                    Ok(resp) => DispatchOutcome::Completed {
                        success: resp.success,
                        output: resp.output,
                        error: resp.error,
                    },
                    Err(e) => {
                        warn!(
                            module = %module.id,
                            backend = self.backend.name(),
                            error = %e,
                            "backend dispatch failed"
                        );
                        DispatchOutcome::TransportFailed {
                            detail: e.to_string(),
                        }
                    }
                }
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        self.log_attempt(req, license_id, mode, &outcome, duration_ms);

        // A failed run still consumed the entitlement: the license was
        // validly exercised either way.
        if let Err(e) = self.licenses.record_execution(license_id) {
            warn!(license = %license_id, error = %e, "quota increment refused");
        }

        Ok(ExecutionReport {
            outcome,
            duration_ms,
            license_id: Some(license_id),
        })
    }

    /// Fail fast when a module needs a capability this deployment lacks.
    pub async fn validate_requirements(&self, module: &Module) -> Result<(), DispatchError> {
        if module.requires_hal {
            let reachable = self
                .probe_client
                .get(&self.hal_status_url)
                .timeout(Duration::from_secs(5))
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false);
            if !reachable {
                return Err(DispatchError::MissingCapability(
                    "HAL (NFC/biometrics) service is not available".into(),
                ));
            }
        }

        if module.requires_gpu {
            let available = tokio::process::Command::new("nvidia-smi")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
                .map(|s| s.success())
                .unwrap_or(false);
            if !available {
                return Err(DispatchError::MissingCapability(
                    "GPU (CUDA) is not available".into(),
                ));
            }
        }

        Ok(())
    }

    fn log_attempt(
        &self,
        req: &ExecutionRequest,
        license_id: Uuid,
        mode: ExecutionMode,
        outcome: &DispatchOutcome,
        duration_ms: u64,
    ) {
        let status = if outcome.success() {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failed
        };
        let error = match outcome {
            DispatchOutcome::Completed { error, .. } => error.clone(),
            DispatchOutcome::TransportFailed { detail } => Some(detail.clone()),
            _ => None,
        };
        let output_size = match outcome {
            DispatchOutcome::Completed { output, .. } => json_size(output),
            DispatchOutcome::ClientBundle { primitives, .. } => serde_json::to_vec(primitives)
                .map(|b| b.len() as u64)
                .unwrap_or(0),
            _ => 0,
        };

        self.logs.append(ExecutionLog {
            id: Uuid::new_v4(),
            user_id: req.user_id,
            module_id: req.module_id.clone(),
            license_id,
            execution_mode: mode,
            status,
            input_size: json_size(&req.input),
            output_size,
            duration_ms,
            error,
            created_at: chrono::Utc::now(),
        });
    }
}

/// Explicit request mode wins; the module default covers the rest. Hybrid
/// and unspecified both land on the server path.
fn effective_mode(requested: Option<ExecutionMode>, declared: ExecutionMode) -> ExecutionMode {
    match requested.unwrap_or(declared) {
        ExecutionMode::Browser => ExecutionMode::Browser,
        ExecutionMode::Server | ExecutionMode::Hybrid => ExecutionMode::Server,
    }
}

fn json_size(map: &serde_json::Map<String, serde_json::Value>) -> u64 {
    serde_json::to_vec(map).map(|b| b.len() as u64).unwrap_or(0)
}
