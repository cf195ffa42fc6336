//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Deployment-time configuration for the module engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModulesConfig {
    /// Remote execution engine base URL. `None` selects the local
    /// interpreter fallback at construction time.
    pub engine_url: Option<String>,
    /// Interpreter command for the local fallback.
    pub interpreter: String,
    /// Executor script handed to the interpreter.
    pub executor_script: String,
    /// Timeout applied to both the remote call and the subprocess, seconds.
    pub backend_timeout_secs: u64,
    /// Scheduler polling cadence, seconds.
    pub poll_interval_secs: u64,
    /// Ceiling on concurrently running scheduled dispatches.
    pub max_inflight_jobs: usize,
    /// HAL service status endpoint probed for modules that need it.
    pub hal_status_url: String,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            engine_url: None,
            interpreter: default_interpreter(),
            executor_script: "modules-engine/executor.py".to_string(),
            backend_timeout_secs: 120,
            poll_interval_secs: 60,
            max_inflight_jobs: 8,
            hal_status_url: "http://localhost:8080/api/v1/hal/status".to_string(),
        }
    }
}

impl ModulesConfig {
    /// Configuration from the process environment, defaults elsewhere.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("MODULES_ENGINE_URL") {
            if !url.is_empty() {
                config.engine_url = Some(url);
            }
        }
        if let Ok(dir) = std::env::var("MODULES_DIR") {
            if !dir.is_empty() {
                config.executor_script = format!("{}/executor.py", dir.trim_end_matches('/'));
            }
        }
        config
    }

    /// Backend timeout as a [`Duration`].
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_secs)
    }

    /// Scheduler poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn default_interpreter() -> String {
    if cfg!(windows) { "python" } else { "python3" }.to_string()
}
