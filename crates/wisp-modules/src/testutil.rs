//! Shared fixtures for the crate's unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::TimeZone;
use parking_lot::Mutex;
use uuid::Uuid;

use wisp_common::{ExecutionMode, ManualClock, Module, PrimitiveRef, StaticRegistry, UserId};

use crate::audit::ExecutionLogStore;
use crate::backend::{BackendError, EnginePayload, EngineResponse, ExecutionBackend};
use crate::config::ModulesConfig;
use crate::dispatch::Dispatcher;
use crate::licensing::LicenseStore;

/// Backend double: replays a script of results, then defaults to success.
pub(crate) struct MockBackend {
    calls: AtomicUsize,
    script: Mutex<Vec<Result<EngineResponse, BackendError>>>,
}

impl MockBackend {
    pub(crate) fn succeeding() -> Self {
        Self::with_script(Vec::new())
    }

    pub(crate) fn with_script(script: Vec<Result<EngineResponse, BackendError>>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            script: Mutex::new(script),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionBackend for MockBackend {
    async fn run(&self, _payload: &EnginePayload) -> Result<EngineResponse, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock();
        if script.is_empty() {
            Ok(EngineResponse {
                success: true,
                output: serde_json::Map::new(),
                error: None,
            })
        } else {
            script.remove(0)
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

fn module(id: &str, mode: ExecutionMode, ui_template: Option<&str>) -> Module {
    Module {
        id: id.into(),
        name: id.into(),
        execution_mode: mode,
        primitives: vec![PrimitiveRef {
            provider: "NetworkIntelligence".into(),
            method: "scan".into(),
            config: Default::default(),
        }],
        ui_template: ui_template.map(str::to_owned),
        requires_hal: false,
        requires_gpu: false,
    }
}

/// One wired engine instance over a mock backend and a manual clock.
pub(crate) struct Fixture {
    pub user: UserId,
    pub clock: Arc<ManualClock>,
    pub licenses: Arc<LicenseStore>,
    pub logs: Arc<ExecutionLogStore>,
    pub backend: Arc<MockBackend>,
    pub dispatcher: Arc<Dispatcher>,
}

pub(crate) fn platform_fixture(backend: MockBackend) -> Fixture {
    let clock = Arc::new(ManualClock::new(
        chrono::Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
    ));
    let registry = Arc::new(StaticRegistry::new());
    registry.insert(module("network-audit", ExecutionMode::Hybrid, None));
    registry.insert(module("cap-planner", ExecutionMode::Server, None));
    registry.insert(module(
        "doc-viewer",
        ExecutionMode::Browser,
        Some("doc_viewer.html"),
    ));

    let licenses = Arc::new(LicenseStore::with_clock(clock.clone()));
    let logs = Arc::new(ExecutionLogStore::new());
    let backend = Arc::new(backend);
    let dispatcher = Arc::new(Dispatcher::new(
        registry,
        licenses.clone(),
        logs.clone(),
        backend.clone(),
        &ModulesConfig::default(),
    ));

    Fixture {
        user: Uuid::new_v4(),
        clock,
        licenses,
        logs,
        backend,
        dispatcher,
    }
}
