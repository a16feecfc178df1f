//! Control channel between the host page and the agent.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::clients::Clients;
use crate::lifecycle::LifecycleController;
use crate::Result;

const REFRESHED_MESSAGE: &str = "Cache has been refreshed successfully";

/// Commands a page can send to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Drop every cache and re-download the static assets.
    #[serde(rename = "FORCE_CACHE_REFRESH")]
    ForceRefresh,
    /// Activate a waiting agent without waiting for old pages to close.
    #[serde(rename = "SKIP_WAITING")]
    SkipWaiting,
}

impl ControlMessage {
    /// Decode a page payload. Anything unrecognized yields `None`.
    pub fn from_value(payload: &Value) -> Option<Self> {
        Self::deserialize(payload).ok()
    }

    /// Decode a raw JSON payload. Malformed JSON yields `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str::<Value>(raw)
            .ok()
            .and_then(|value| Self::from_value(&value))
    }
}

/// Notifications the agent sends to pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    #[serde(rename = "CACHE_REFRESHED")]
    RefreshCompleted { message: String },
}

impl OutboundMessage {
    pub fn refresh_completed() -> Self {
        Self::RefreshCompleted {
            message: REFRESHED_MESSAGE.to_string(),
        }
    }
}

/// Executes control commands against the cache.
pub struct ControlChannel {
    lifecycle: Arc<LifecycleController>,
    clients: Arc<dyn Clients>,
}

impl ControlChannel {
    pub fn new(lifecycle: Arc<LifecycleController>, clients: Arc<dyn Clients>) -> Self {
        Self { lifecycle, clients }
    }

    /// Delete every cache, repopulate the current one, then notify pages.
    ///
    /// Each step waits for the previous one. Nothing is broadcast if
    /// repopulating fails. Returns how many pages were notified.
    pub async fn force_refresh(&self) -> Result<usize> {
        info!("Force cache refresh requested");
        self.lifecycle.repopulate().await?;

        let notified = self
            .clients
            .broadcast(&OutboundMessage::refresh_completed())
            .await;
        debug!(notified, "Refresh notification sent");
        Ok(notified)
    }
}
