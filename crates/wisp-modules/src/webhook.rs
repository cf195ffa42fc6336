//! Webhook Trigger
//!
//! Maps a public, stable slug to one fixed, pre-authorized execution
//! request. The slug is reachable without authentication, so entitlement is
//! still enforced against the owning user on every fire.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use wisp_common::{ExecutionMode, ModuleId, UserId};

use crate::dispatch::{DispatchError, Dispatcher, ExecutionReport, ExecutionRequest};

/// A slug-keyed single-shot trigger. Read-only to the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleWebhook {
    pub id: Uuid,
    pub user_id: UserId,
    pub module_id: ModuleId,
    /// Unique public identifier, e.g. `"nightly-audit-7f3a"`.
    pub slug: String,
    /// Fixed input payload used for every fire.
    pub input: serde_json::Map<String, serde_json::Value>,
    pub is_enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Webhook faults.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// Unknown or disabled slug; deliberately indistinguishable.
    #[error("webhook not found")]
    NotFound,
    #[error("slug already taken")]
    SlugTaken,
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Slug-indexed webhook store.
#[derive(Default)]
pub struct WebhookStore {
    hooks: RwLock<HashMap<Uuid, ModuleWebhook>>,
    slugs: RwLock<HashMap<String, Uuid>>,
}

impl WebhookStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a webhook under a unique slug.
    pub fn create(
        &self,
        user: UserId,
        module: &str,
        slug: &str,
        input: serde_json::Map<String, serde_json::Value>,
    ) -> Result<ModuleWebhook, WebhookError> {
        let mut slugs = self.slugs.write();
        if slugs.contains_key(slug) {
            return Err(WebhookError::SlugTaken);
        }

        let hook = ModuleWebhook {
            id: Uuid::new_v4(),
            user_id: user,
            module_id: module.to_owned(),
            slug: slug.to_owned(),
            input,
            is_enabled: true,
            created_at: Utc::now(),
        };
        slugs.insert(hook.slug.clone(), hook.id);
        self.hooks.write().insert(hook.id, hook.clone());
        info!(slug, module, "webhook registered");
        Ok(hook)
    }

    /// Look up a webhook by slug, enabled or not.
    pub fn get_by_slug(&self, slug: &str) -> Option<ModuleWebhook> {
        let id = *self.slugs.read().get(slug)?;
        self.hooks.read().get(&id).cloned()
    }

    /// Flip a webhook's enabled flag.
    pub fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<(), WebhookError> {
        let mut hooks = self.hooks.write();
        let hook = hooks.get_mut(&id).ok_or(WebhookError::NotFound)?;
        hook.is_enabled = enabled;
        Ok(())
    }

    /// Delete a webhook and free its slug.
    pub fn remove(&self, id: Uuid) -> Result<(), WebhookError> {
        let hook = self
            .hooks
            .write()
            .remove(&id)
            .ok_or(WebhookError::NotFound)?;
        self.slugs.write().remove(&hook.slug);
        Ok(())
    }
}

/// Fires stored webhook requests through the dispatcher.
pub struct WebhookTrigger {
    store: Arc<WebhookStore>,
    dispatcher: Arc<Dispatcher>,
}

impl WebhookTrigger {
    /// Trigger over the given store and dispatcher.
    pub fn new(store: Arc<WebhookStore>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { store, dispatcher }
    }

    /// Fire the webhook registered under `slug`.
    ///
    /// The stored request goes through the dispatcher exactly as any other
    /// caller's would: a deactivated or expired license blocks the run even
    /// though the slug itself is publicly reachable.
    pub async fn fire(&self, slug: &str) -> Result<ExecutionReport, WebhookError> {
        let hook = self
            .store
            .get_by_slug(slug)
            .filter(|h| h.is_enabled)
            .ok_or(WebhookError::NotFound)?;

        info!(slug, module = %hook.module_id, user = %hook.user_id, "webhook fired");
        let req = ExecutionRequest {
            user_id: hook.user_id,
            module_id: hook.module_id,
            execution_mode: Some(ExecutionMode::Server),
            input: hook.input,
        };
        Ok(self.dispatcher.execute(&req).await?)
    }
}
