//! Cache lifecycle: populate on install, prune on activate.

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use url::Url;

use crate::clients::Clients;
use crate::config::AgentConfig;
use crate::store::CacheStore;
use crate::version::VersionRegistry;
use crate::{AgentError, Result};

/// Agent instance state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AgentState {
    /// Created, install not started.
    #[default]
    Parsed,
    /// Installing (populating the cache).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (pruning stale caches, claiming pages).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced, or install failed.
    Redundant,
}

impl AgentState {
    /// Whether moving from `self` to `next` is a legal step.
    pub fn can_transition(self, next: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, next),
            (Parsed, Installing)
                | (Installing, Installed)
                | (Installed, Activating)
                | (Activating, Activated)
                | (Installing | Installed | Activating | Activated, Redundant)
        )
    }
}

/// Outcome of deleting a batch of cache generations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Generations that were deleted.
    pub deleted: Vec<String>,
    /// Generations whose deletion failed.
    pub failed: Vec<String>,
}

/// Outcome of the activate step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
    pub pruned: PruneReport,
    /// Pages claimed.
    pub claimed: usize,
}

/// Creates, populates and deletes cache generations.
pub struct LifecycleController {
    versions: VersionRegistry,
    assets: Vec<Url>,
    store: Arc<dyn CacheStore>,
    clients: Arc<dyn Clients>,
}

impl LifecycleController {
    pub fn new(
        config: &AgentConfig,
        store: Arc<dyn CacheStore>,
        clients: Arc<dyn Clients>,
    ) -> Result<Self> {
        Ok(Self {
            versions: config.versions()?,
            assets: config.resolved_assets()?,
            store,
            clients,
        })
    }

    pub fn versions(&self) -> &VersionRegistry {
        &self.versions
    }

    /// Resolved static asset URLs, in configuration order.
    pub fn assets(&self) -> &[Url] {
        &self.assets
    }

    /// Open the current generation and fill it with every static asset.
    ///
    /// Fails as a whole if any asset can't be fetched. A generation created
    /// by a failed install is deleted again.
    pub async fn install(&self) -> Result<()> {
        let name = self.versions.cache_name();
        info!(cache = %name, assets = self.assets.len(), "Caching static assets");

        let existed = self.store.has(name).await?;
        let populated = async {
            let cache = self.store.open(name).await?;
            cache.add_all(&self.assets).await
        }
        .await;

        match populated {
            Ok(()) => {
                info!(cache = %name, "All assets cached successfully");
                Ok(())
            }
            Err(e) => {
                error!(cache = %name, error = %e, "Error caching assets");
                if !existed {
                    if let Err(e) = self.store.delete(name).await {
                        warn!(cache = %name, error = %e, "Failed to delete partial cache");
                    }
                }
                Err(AgentError::InstallFailed(e.to_string()))
            }
        }
    }

    /// Delete the current generation. Used when an install is abandoned.
    pub async fn discard(&self) -> Result<bool> {
        let name = self.versions.cache_name();
        info!(cache = %name, "Discarding cache");
        self.store.delete(name).await
    }

    /// Delete stale generations, then take control of open pages.
    pub async fn activate(&self) -> Result<ActivationReport> {
        let pruned = self.prune(|name| !self.versions.is_current(name)).await?;

        info!("Claiming clients");
        let claimed = self.clients.claim().await?;

        Ok(ActivationReport { pruned, claimed })
    }

    /// Delete every generation, then rebuild the current one.
    pub async fn repopulate(&self) -> Result<PruneReport> {
        let pruned = self.prune(|_| true).await?;
        info!("Re-caching static assets");
        self.install().await?;
        Ok(pruned)
    }

    /// Delete, concurrently, every generation selected by `doomed`.
    ///
    /// A failed deletion is logged and does not stop the others.
    async fn prune(&self, doomed: impl Fn(&str) -> bool) -> Result<PruneReport> {
        let names = self.store.keys().await?;

        let deletions = names
            .into_iter()
            .filter(|name| doomed(name.as_str()))
            .map(|name| async move {
                info!(cache = %name, "Deleting cache");
                let result = self.store.delete(&name).await;
                (name, result)
            });

        let mut report = PruneReport::default();
        for (name, result) in join_all(deletions).await {
            match result {
                Ok(_) => report.deleted.push(name),
                Err(e) => {
                    warn!(cache = %name, error = %e, "Failed to delete cache");
                    report.failed.push(name);
                }
            }
        }
        Ok(report)
    }
}
