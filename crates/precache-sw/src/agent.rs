//! The agent facade: explicit handlers for install, activate, fetch, message
//! and sync events.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use precache_net::{Fetch, Request};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clients::{ClientRegistry, Clients};
use crate::config::{AgentConfig, ConfigError};
use crate::control::{ControlChannel, ControlMessage};
use crate::intercept::{FetchOutcome, RequestInterceptor, ResolutionPolicy};
use crate::lifecycle::{ActivationReport, AgentState, LifecycleController};
use crate::store::{CacheStore, MemoryCacheStore};
use crate::version::VersionRegistry;
use crate::{AgentError, Result};

/// Sync tag that triggers an update check.
pub const UPDATE_CHECK_TAG: &str = "update-check";

/// Unique agent instance identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId(u64);

impl AgentId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent-{}", self.0)
    }
}

/// Builder for [`CacheAgent`].
pub struct CacheAgentBuilder {
    config: AgentConfig,
    network: Option<Arc<dyn Fetch>>,
    store: Option<Arc<dyn CacheStore>>,
    clients: Option<Arc<dyn Clients>>,
}

impl CacheAgentBuilder {
    /// Network used for misses and for populating caches. Required.
    pub fn network(mut self, network: Arc<dyn Fetch>) -> Self {
        self.network = Some(network);
        self
    }

    /// Cache store shared with other instances. Defaults to an in-memory store.
    pub fn store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Pages in scope. Defaults to an empty [`ClientRegistry`].
    pub fn clients(mut self, clients: Arc<dyn Clients>) -> Self {
        self.clients = Some(clients);
        self
    }

    pub fn build(self) -> Result<CacheAgent> {
        self.config.validate()?;

        let network = self
            .network
            .ok_or_else(|| ConfigError::Invalid("a network fetcher is required".into()))?;
        let store: Arc<dyn CacheStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryCacheStore::new(Arc::clone(&network))),
        };
        let clients: Arc<dyn Clients> = match self.clients {
            Some(clients) => clients,
            None => Arc::new(ClientRegistry::new(self.config.scope.clone())),
        };

        let lifecycle = Arc::new(LifecycleController::new(
            &self.config,
            Arc::clone(&store),
            Arc::clone(&clients),
        )?);
        let interceptor = RequestInterceptor::new(
            self.config.policy,
            lifecycle.versions().cache_name(),
            store,
            network,
        );
        let control = match self.config.policy {
            ResolutionPolicy::CacheFirst => {
                Some(ControlChannel::new(Arc::clone(&lifecycle), clients))
            }
            ResolutionPolicy::NetworkFirst => None,
        };
        let (state, _) = watch::channel(AgentState::Parsed);

        Ok(CacheAgent {
            id: AgentId::next(),
            config: self.config,
            lifecycle,
            interceptor,
            control,
            state,
            skip_waiting: AtomicBool::new(false),
        })
    }
}

/// One instance of the caching agent.
///
/// Each handler corresponds to one event the host delivers. The host (usually
/// a [`Registration`](crate::Registration)) decides when to call them.
pub struct CacheAgent {
    id: AgentId,
    config: AgentConfig,
    lifecycle: Arc<LifecycleController>,
    interceptor: RequestInterceptor,
    /// Present only under cache-first resolution.
    control: Option<ControlChannel>,
    state: watch::Sender<AgentState>,
    skip_waiting: AtomicBool,
}

impl CacheAgent {
    pub fn builder(config: AgentConfig) -> CacheAgentBuilder {
        CacheAgentBuilder {
            config,
            network: None,
            store: None,
            clients: None,
        }
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn versions(&self) -> &VersionRegistry {
        self.lifecycle.versions()
    }

    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    pub fn is_redundant(&self) -> bool {
        self.state() == AgentState::Redundant
    }

    /// Ask to be activated without waiting for old pages to close.
    pub fn skip_waiting(&self) {
        if !self.skip_waiting.swap(true, Ordering::SeqCst) {
            debug!(agent = %self.id, "Skip waiting requested");
        }
    }

    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    /// Retire this instance. Any later transition fails.
    pub fn mark_redundant(&self) {
        let changed = self.state.send_if_modified(|state| {
            if *state == AgentState::Redundant {
                return false;
            }
            *state = AgentState::Redundant;
            true
        });
        if changed {
            info!(agent = %self.id, "Agent is redundant");
        }
    }

    /// Install: populate the current cache generation.
    ///
    /// On failure the instance becomes redundant and nothing is kept in the
    /// new generation.
    pub async fn on_install(&self) -> Result<()> {
        self.transition(AgentState::Installing)?;
        info!(
            agent = %self.id,
            cache = %self.versions().cache_name(),
            "Installing"
        );

        if let Err(e) = self.lifecycle.install().await {
            self.mark_redundant();
            return Err(e);
        }

        self.transition(AgentState::Installed)?;
        if self.config.skip_waiting_on_install {
            self.skip_waiting();
        }
        Ok(())
    }

    /// Activate: prune stale generations and take control of open pages.
    pub async fn on_activate(&self) -> Result<ActivationReport> {
        self.transition(AgentState::Activating)?;
        info!(agent = %self.id, "Activating");

        let report = match self.lifecycle.activate().await {
            Ok(report) => report,
            Err(e) => {
                warn!(agent = %self.id, error = %e, "Activation failed");
                self.mark_redundant();
                return Err(e);
            }
        };

        self.transition(AgentState::Activated)?;
        info!(
            agent = %self.id,
            pruned = report.pruned.deleted.len(),
            claimed = report.claimed,
            "Activated"
        );
        Ok(report)
    }

    /// Intercept a request. Only an activated agent answers requests.
    pub async fn on_fetch(&self, request: Request) -> Result<FetchOutcome> {
        if self.state() != AgentState::Activated {
            return Ok(FetchOutcome::PassThrough(request));
        }
        self.interceptor.intercept(request).await
    }

    /// Handle a page message.
    ///
    /// Unrecognized payloads, and every payload under network-first
    /// resolution, are ignored.
    pub async fn on_message(&self, payload: &Value) -> Result<()> {
        let Some(control) = &self.control else {
            debug!(agent = %self.id, "Ignoring message without a control channel");
            return Ok(());
        };

        match ControlMessage::from_value(payload) {
            Some(ControlMessage::ForceRefresh) => {
                control.force_refresh().await?;
            }
            Some(ControlMessage::SkipWaiting) => self.skip_waiting(),
            None => debug!(agent = %self.id, payload = %payload, "Ignoring unknown message"),
        }
        Ok(())
    }

    /// Handle a background sync event.
    pub async fn on_sync(&self, tag: &str) -> Result<()> {
        if self.control.is_none() {
            debug!(agent = %self.id, tag, "Ignoring sync event");
            return Ok(());
        }

        if tag == UPDATE_CHECK_TAG {
            info!(agent = %self.id, version = %self.versions().version(), "Checking for updates");
        } else {
            debug!(agent = %self.id, tag, "Ignoring unknown sync tag");
        }
        Ok(())
    }

    /// Delete this instance's generation after its install was abandoned.
    pub(crate) async fn discard_generation(&self) -> Result<bool> {
        self.lifecycle.discard().await
    }

    /// Wait for background cache writes to finish.
    pub async fn settle(&self) {
        self.interceptor.settle().await;
    }

    fn transition(&self, next: AgentState) -> Result<()> {
        let mut from = AgentState::Parsed;
        let moved = self.state.send_if_modified(|state| {
            from = *state;
            if state.can_transition(next) {
                *state = next;
                true
            } else {
                false
            }
        });

        if moved {
            debug!(agent = %self.id, ?from, to = ?next, "State changed");
            Ok(())
        } else {
            Err(AgentError::StateError(format!(
                "{} cannot move from {:?} to {:?}",
                self.id, from, next
            )))
        }
    }
}
