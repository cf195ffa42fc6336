//! WISP Platform Module Marketplace Engine
//!
//! Decides whether a user may run a purchasable module, dispatches the run
//! to an execution backend, and re-triggers runs on a schedule or from a
//! public webhook slug.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        MODULE ENGINE                                 │
//! │                                                                      │
//! │   direct request ──┐                                                 │
//! │   scheduler tick ──┼──► DISPATCHER ──► authorize ──► backend ──► log │
//! │   webhook slug  ───┘        │                                        │
//! │                             ▼                                        │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐                │
//! │  │  Entitlement │  │  Remote      │  │  Local       │                │
//! │  │  Store       │  │  Engine      │  │  Interpreter │                │
//! │  └──────────────┘  └──────────────┘  └──────────────┘                │
//! │                                                                      │
//! │  every dispatch: one audit row, one quota increment                  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![allow(dead_code)]

pub mod audit;
pub mod backend;
pub mod config;
pub mod dispatch;
pub mod licensing;
pub mod scheduler;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testutil;

use std::sync::Arc;

use wisp_common::{Clock, ModuleRegistry, SystemClock};

pub use audit::{ExecutionLog, ExecutionLogStore, ExecutionStatus, UsageStats};
pub use backend::{
    BackendError, EnginePayload, EngineResponse, ExecutionBackend, LocalInterpreter, RemoteEngine,
};
pub use config::ModulesConfig;
pub use dispatch::{
    DispatchError, DispatchOutcome, Dispatcher, ExecutionReport, ExecutionRequest,
};
pub use licensing::{Access, DenialReason, License, LicenseError, LicenseKind, LicenseStore};
pub use scheduler::{JobStore, ScheduledJob, Scheduler, SchedulerError};
pub use webhook::{ModuleWebhook, WebhookError, WebhookStore, WebhookTrigger};

/// Fully wired engine: stores, dispatcher, scheduler, webhook trigger.
pub struct ModulePlatform {
    /// Deployment configuration the engine was built from.
    pub config: ModulesConfig,
    /// Entitlement store.
    pub licenses: Arc<LicenseStore>,
    /// Append-only dispatch audit log.
    pub logs: Arc<ExecutionLogStore>,
    /// Scheduled job store.
    pub jobs: Arc<JobStore>,
    /// Webhook registrations.
    pub webhooks: Arc<WebhookStore>,
    /// The single execution entry point.
    pub dispatcher: Arc<Dispatcher>,
    /// Recurring job scheduler.
    pub scheduler: Arc<Scheduler>,
    /// Public slug trigger.
    pub webhook_trigger: Arc<WebhookTrigger>,
}

impl ModulePlatform {
    /// Wire an engine on the system clock.
    pub fn new(config: ModulesConfig, registry: Arc<dyn ModuleRegistry>) -> Self {
        Self::with_clock(config, registry, Arc::new(SystemClock))
    }

    /// Wire an engine with an injected clock.
    ///
    /// The execution backend is a deployment-time choice: a configured
    /// engine URL selects the remote engine, otherwise runs fall back to
    /// the local interpreter subprocess.
    pub fn with_clock(
        config: ModulesConfig,
        registry: Arc<dyn ModuleRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let backend: Arc<dyn ExecutionBackend> = match &config.engine_url {
            Some(url) => Arc::new(RemoteEngine::new(url, config.backend_timeout())),
            None => Arc::new(LocalInterpreter::new(
                &config.interpreter,
                &config.executor_script,
                config.backend_timeout(),
            )),
        };

        let licenses = Arc::new(LicenseStore::with_clock(clock.clone()));
        let logs = Arc::new(ExecutionLogStore::new());
        let jobs = Arc::new(JobStore::with_clock(clock.clone()));
        let webhooks = Arc::new(WebhookStore::new());
        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            licenses.clone(),
            logs.clone(),
            backend,
            &config,
        ));
        let scheduler = Arc::new(Scheduler::new(
            jobs.clone(),
            dispatcher.clone(),
            clock,
            &config,
        ));
        let webhook_trigger = Arc::new(WebhookTrigger::new(webhooks.clone(), dispatcher.clone()));

        Self {
            config,
            licenses,
            logs,
            jobs,
            webhooks,
            dispatcher,
            scheduler,
            webhook_trigger,
        }
    }

    /// Spawn the scheduler's polling loop.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let scheduler = self.scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    }

    /// Stop the scheduler loop. In-flight dispatches finish.
    pub fn stop(&self) {
        self.scheduler.stop();
    }
}
