//! Registration: the installing, waiting and active instances for one scope.

use std::sync::Arc;

use precache_net::Request;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::agent::CacheAgent;
use crate::intercept::FetchOutcome;
use crate::lifecycle::ActivationReport;
use crate::{AgentError, Result};

#[derive(Default)]
struct Slots {
    installing: Option<Arc<CacheAgent>>,
    waiting: Option<Arc<CacheAgent>>,
    active: Option<Arc<CacheAgent>>,
}

/// Agent registration for a scope.
pub struct Registration {
    scope: Url,
    slots: RwLock<Slots>,
}

impl Registration {
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            slots: RwLock::new(Slots::default()),
        }
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub async fn installing(&self) -> Option<Arc<CacheAgent>> {
        self.slots.read().await.installing.clone()
    }

    pub async fn waiting(&self) -> Option<Arc<CacheAgent>> {
        self.slots.read().await.waiting.clone()
    }

    pub async fn active(&self) -> Option<Arc<CacheAgent>> {
        self.slots.read().await.active.clone()
    }

    /// Install a new instance.
    ///
    /// Any instance still installing or waiting is superseded and becomes
    /// redundant. Once installed, the instance waits, or activates right away
    /// if it asked to skip waiting.
    pub async fn register(&self, agent: Arc<CacheAgent>) -> Result<()> {
        {
            let mut slots = self.slots.write().await;
            for old in [slots.installing.take(), slots.waiting.take()]
                .into_iter()
                .flatten()
            {
                info!(superseded = %old.id(), by = %agent.id(), "Superseding agent");
                old.mark_redundant();
            }
            slots.installing = Some(Arc::clone(&agent));
        }

        let installed = agent.on_install().await;

        let mut slots = self.slots.write().await;
        let still_current = slots
            .installing
            .as_ref()
            .is_some_and(|current| current.id() == agent.id());

        if !still_current {
            let name = agent.versions().cache_name();
            let shared = [&slots.installing, &slots.waiting, &slots.active]
                .into_iter()
                .flatten()
                .any(|other| other.versions().cache_name() == name);
            drop(slots);

            debug!(agent = %agent.id(), "Discarding install of superseded agent");
            agent.mark_redundant();
            if !shared {
                if let Err(e) = agent.discard_generation().await {
                    warn!(agent = %agent.id(), error = %e, "Failed to discard superseded cache");
                }
            }
            return Err(AgentError::StateError(format!(
                "{} was superseded",
                agent.id()
            )));
        }

        slots.installing = None;
        installed?;
        slots.waiting = Some(Arc::clone(&agent));
        drop(slots);

        if agent.skip_waiting_requested() {
            self.activate_waiting().await?;
        } else {
            info!(agent = %agent.id(), "Agent installed, waiting");
        }
        Ok(())
    }

    /// Promote the waiting instance, if any, and retire the old active one.
    pub async fn activate_waiting(&self) -> Result<Option<ActivationReport>> {
        let (agent, previous) = {
            let mut slots = self.slots.write().await;
            let Some(agent) = slots.waiting.take() else {
                return Ok(None);
            };
            let previous = slots.active.replace(Arc::clone(&agent));
            (agent, previous)
        };

        if let Some(previous) = previous {
            previous.mark_redundant();
        }

        match agent.on_activate().await {
            Ok(report) => Ok(Some(report)),
            Err(e) => {
                let mut slots = self.slots.write().await;
                if slots
                    .active
                    .as_ref()
                    .is_some_and(|active| active.id() == agent.id())
                {
                    slots.active = None;
                }
                Err(e)
            }
        }
    }

    /// Route a request to the active instance.
    pub async fn handle_fetch(&self, request: Request) -> Result<FetchOutcome> {
        match self.active().await {
            Some(agent) => agent.on_fetch(request).await,
            None => Ok(FetchOutcome::PassThrough(request)),
        }
    }

    /// Deliver a page message to the active instance.
    pub async fn post_message(&self, payload: &Value) -> Result<()> {
        match self.active().await {
            Some(agent) => agent.on_message(payload).await,
            None => {
                debug!("No active agent, dropping message");
                Ok(())
            }
        }
    }

    /// Deliver a page message to the waiting instance.
    ///
    /// A `SKIP_WAITING` message activates it immediately.
    pub async fn post_message_to_waiting(&self, payload: &Value) -> Result<()> {
        let Some(agent) = self.waiting().await else {
            debug!("No waiting agent, dropping message");
            return Ok(());
        };

        agent.on_message(payload).await?;
        if agent.skip_waiting_requested() {
            self.activate_waiting().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::AgentState;
    use crate::store::{CacheHandle, CacheStore, MemoryCacheStore};
    use crate::testing::{config, url, FakeNetwork, SCOPE};
    use crate::ResolutionPolicy;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Semaphore;

    fn agent(
        version: &str,
        store: Arc<dyn CacheStore>,
        network: &Arc<FakeNetwork>,
    ) -> Arc<CacheAgent> {
        Arc::new(
            CacheAgent::builder(config(version, ResolutionPolicy::CacheFirst))
                .network(network.clone())
                .store(store)
                .build()
                .unwrap(),
        )
    }

    fn patient_agent(
        version: &str,
        store: Arc<dyn CacheStore>,
        network: &Arc<FakeNetwork>,
    ) -> Arc<CacheAgent> {
        let mut cfg = config(version, ResolutionPolicy::CacheFirst);
        cfg.skip_waiting_on_install = false;
        Arc::new(
            CacheAgent::builder(cfg)
                .network(network.clone())
                .store(store)
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_register_activates_immediately() {
        let network = FakeNetwork::with_app();
        let store = Arc::new(MemoryCacheStore::new(network.clone()));
        let registration = Registration::new(url(SCOPE));
        let v1 = agent("v1", store.clone(), &network);

        registration.register(v1.clone()).await.unwrap();

        assert_eq!(v1.state(), AgentState::Activated);
        assert_eq!(registration.active().await.unwrap().id(), v1.id());
        assert!(registration.installing().await.is_none());
        assert!(registration.waiting().await.is_none());

        let outcome = registration
            .handle_fetch(Request::get(url("https://example.com/index.html")))
            .await
            .unwrap();
        assert!(outcome.response().is_some());
    }

    #[tokio::test]
    async fn test_patient_agent_waits_for_skip_waiting() {
        let network = FakeNetwork::with_app();
        let store = Arc::new(MemoryCacheStore::new(network.clone()));
        let registration = Registration::new(url(SCOPE));
        let v1 = patient_agent("v1", store.clone(), &network);

        registration.register(v1.clone()).await.unwrap();
        assert_eq!(v1.state(), AgentState::Installed);
        assert_eq!(registration.waiting().await.unwrap().id(), v1.id());

        let outcome = registration
            .handle_fetch(Request::get(url("https://example.com/app.js")))
            .await
            .unwrap();
        assert!(matches!(outcome, FetchOutcome::PassThrough(_)));

        registration
            .post_message_to_waiting(&json!({ "type": "SKIP_WAITING" }))
            .await
            .unwrap();
        assert_eq!(v1.state(), AgentState::Activated);
        assert!(registration.waiting().await.is_none());
    }

    #[tokio::test]
    async fn test_activate_waiting_retires_previous_active() {
        let network = FakeNetwork::with_app();
        let store = Arc::new(MemoryCacheStore::new(network.clone()));
        let registration = Registration::new(url(SCOPE));
        let v1 = agent("v1", store.clone(), &network);
        registration.register(v1.clone()).await.unwrap();

        let v2 = patient_agent("v2", store.clone(), &network);
        registration.register(v2.clone()).await.unwrap();
        assert_eq!(v1.state(), AgentState::Activated);

        let report = registration.activate_waiting().await.unwrap().unwrap();

        assert_eq!(report.pruned.deleted, vec!["precache-v1"]);
        assert_eq!(v1.state(), AgentState::Redundant);
        assert_eq!(v2.state(), AgentState::Activated);
        assert_eq!(store.keys().await.unwrap(), vec!["precache-v2"]);
        assert!(registration.activate_waiting().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_install_keeps_previous_active() {
        let network = FakeNetwork::with_app();
        let store = Arc::new(MemoryCacheStore::new(network.clone()));
        let registration = Registration::new(url(SCOPE));
        let v1 = agent("v1", store.clone(), &network);
        registration.register(v1.clone()).await.unwrap();

        network.set_offline(true);
        let v2 = agent("v2", store.clone(), &network);
        let err = registration.register(v2.clone()).await.unwrap_err();

        assert!(matches!(err, AgentError::InstallFailed(_)));
        assert_eq!(v2.state(), AgentState::Redundant);
        assert!(registration.installing().await.is_none());
        assert_eq!(registration.active().await.unwrap().id(), v1.id());
        assert!(!store.has("precache-v2").await.unwrap());
        assert_eq!(store.keys().await.unwrap(), vec!["precache-v1"]);
    }

    #[tokio::test]
    async fn test_registering_supersedes_waiting_agent() {
        let network = FakeNetwork::with_app();
        let store = Arc::new(MemoryCacheStore::new(network.clone()));
        let registration = Registration::new(url(SCOPE));
        let v1 = patient_agent("v1", store.clone(), &network);
        registration.register(v1.clone()).await.unwrap();

        let v2 = agent("v2", store.clone(), &network);
        registration.register(v2.clone()).await.unwrap();

        assert_eq!(v1.state(), AgentState::Redundant);
        assert_eq!(registration.active().await.unwrap().id(), v2.id());
    }

    /// Store whose `open` blocks until the test hands out a permit.
    struct GatedStore {
        inner: Arc<MemoryCacheStore>,
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl CacheStore for GatedStore {
        async fn open(&self, name: &str) -> Result<Arc<dyn CacheHandle>> {
            let _permit = self.gate.acquire().await.unwrap();
            self.inner.open(name).await
        }

        async fn has(&self, name: &str) -> Result<bool> {
            self.inner.has(name).await
        }

        async fn keys(&self) -> Result<Vec<String>> {
            self.inner.keys().await
        }

        async fn delete(&self, name: &str) -> Result<bool> {
            self.inner.delete(name).await
        }
    }

    struct Race {
        store: Arc<MemoryCacheStore>,
        registration: Arc<Registration>,
        slow: Arc<CacheAgent>,
        fast: Arc<CacheAgent>,
        slow_result: Result<()>,
    }

    /// Start installing `slow_version`, register `fast_version` while the
    /// first install is stuck, then let the first install finish.
    async fn supersede_stuck_install(slow_version: &str, fast_version: &str) -> Race {
        let network = FakeNetwork::with_app();
        let store = Arc::new(MemoryCacheStore::new(network.clone()));
        let gate = Arc::new(Semaphore::new(0));
        let registration = Arc::new(Registration::new(url(SCOPE)));

        let slow = agent(
            slow_version,
            Arc::new(GatedStore {
                inner: store.clone(),
                gate: gate.clone(),
            }),
            &network,
        );
        let pending = tokio::spawn({
            let registration = registration.clone();
            let slow = slow.clone();
            async move { registration.register(slow).await }
        });

        slow.subscribe()
            .wait_for(|state| *state == AgentState::Installing)
            .await
            .unwrap();

        let fast = agent(fast_version, store.clone(), &network);
        registration.register(fast.clone()).await.unwrap();
        assert_eq!(slow.state(), AgentState::Redundant);

        gate.add_permits(1);
        let slow_result = pending.await.unwrap();

        Race {
            store,
            registration,
            slow,
            fast,
            slow_result,
        }
    }

    #[tokio::test]
    async fn test_superseded_install_never_activates() {
        let race = supersede_stuck_install("v1", "v2").await;

        assert!(matches!(race.slow_result, Err(AgentError::StateError(_))));
        assert_eq!(race.slow.state(), AgentState::Redundant);
        assert_eq!(race.fast.state(), AgentState::Activated);
        assert_eq!(race.registration.active().await.unwrap().id(), race.fast.id());
        assert!(race.registration.installing().await.is_none());
        assert!(race.registration.waiting().await.is_none());
    }

    #[tokio::test]
    async fn test_superseded_install_leaves_only_current_generation() {
        let race = supersede_stuck_install("v1", "v2").await;

        assert!(race.slow_result.is_err());
        assert_eq!(race.store.keys().await.unwrap(), vec!["precache-v2"]);
    }

    #[tokio::test]
    async fn test_superseded_install_keeps_shared_generation() {
        let race = supersede_stuck_install("v1", "v1").await;

        assert!(race.slow_result.is_err());
        assert_eq!(race.fast.state(), AgentState::Activated);
        assert_eq!(race.store.keys().await.unwrap(), vec!["precache-v1"]);
        let cache = race.store.open("precache-v1").await.unwrap();
        assert_eq!(cache.keys().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_messages_without_agents_are_dropped() {
        let registration = Registration::new(url(SCOPE));
        let refresh = json!({ "type": "FORCE_CACHE_REFRESH" });

        registration.post_message(&refresh).await.unwrap();
        registration.post_message_to_waiting(&refresh).await.unwrap();
    }

    #[tokio::test]
    async fn test_post_message_reaches_active_agent() {
        let network = FakeNetwork::with_app();
        let store = Arc::new(MemoryCacheStore::new(network.clone()));
        let registration = Registration::new(url(SCOPE));
        registration
            .register(agent("v1", store.clone(), &network))
            .await
            .unwrap();
        let hits = network.total_hits();

        registration
            .post_message(&json!({ "type": "FORCE_CACHE_REFRESH" }))
            .await
            .unwrap();

        assert_eq!(network.total_hits(), hits + 3);
    }
}
