//! # Precache Service Worker
//!
//! An offline-caching agent that sits between a page and the network and
//! serves a fixed set of static assets from a versioned cache.
//!
//! ## Features
//!
//! - **Lifecycle**: install, activate, skip-waiting, supersession
//! - **Versioned caches**: one cache generation per deploy, stale ones pruned
//! - **Fetch interception**: cache-first or network-first resolution
//! - **Control channel**: `FORCE_CACHE_REFRESH` and `SKIP_WAITING` messages
//!
//! ## Architecture
//!
//! ```text
//! Registration (scope)
//!     ├── installing (CacheAgent)
//!     ├── waiting    (CacheAgent)
//!     └── active     (CacheAgent)
//!             ├── VersionRegistry
//!             ├── LifecycleController ──┐
//!             ├── RequestInterceptor ───┼── CacheStore ── CacheHandle
//!             └── ControlChannel ───────┘       └── RequestKey → CacheEntry
//! ```
//!
//! The cache store, the network and the set of open pages are injected
//! through the [`CacheStore`], [`Fetch`](precache_net::Fetch) and
//! [`Clients`] traits.

use precache_net::NetError;
use thiserror::Error;

pub mod agent;
pub mod clients;
pub mod config;
pub mod control;
pub mod intercept;
pub mod lifecycle;
pub mod registration;
pub mod store;
pub mod version;

#[cfg(test)]
pub(crate) mod testing;

pub use agent::{AgentId, CacheAgent, CacheAgentBuilder};
pub use clients::{Client, ClientId, ClientRegistry, Clients};
pub use config::{AgentConfig, ConfigError};
pub use control::{ControlChannel, ControlMessage, OutboundMessage};
pub use intercept::{FetchOutcome, RequestInterceptor, ResolutionPolicy, ResponseSource};
pub use lifecycle::{ActivationReport, AgentState, LifecycleController, PruneReport};
pub use registration::Registration;
pub use store::{CacheEntry, CacheHandle, CacheStore, MemoryCacheStore, RequestKey};
pub use version::VersionRegistry;

/// Errors that can occur in agent operations.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Bad response for {url}: status {status}")]
    BadResponse { url: String, status: u16 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Client error: {0}")]
    ClientError(String),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;
