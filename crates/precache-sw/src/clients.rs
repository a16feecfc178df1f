//! Clients API: the pages an agent can control and message.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use url::Url;

use crate::control::OutboundMessage;
use crate::{AgentError, Result};

/// Identifier of an open page.
pub type ClientId = String;

/// A client (open page).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    /// Client ID.
    pub id: ClientId,

    /// Page URL.
    pub url: Url,

    /// Whether an agent currently controls this page.
    pub controlled: bool,
}

/// Access to the pages in the agent's scope.
#[async_trait]
pub trait Clients: Send + Sync {
    /// Take control of every open in-scope page. Returns how many were claimed.
    async fn claim(&self) -> Result<usize>;

    /// Controlled in-scope pages.
    async fn match_all(&self) -> Vec<Client>;

    /// Deliver a message to one page.
    async fn post_message(&self, id: &str, message: &OutboundMessage) -> Result<()>;

    /// Deliver a message to every controlled page.
    ///
    /// Delivery failures are logged and skipped. Returns how many pages
    /// received the message.
    async fn broadcast(&self, message: &OutboundMessage) -> usize {
        let mut delivered = 0;
        for client in self.match_all().await {
            match self.post_message(&client.id, message).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(client = %client.id, error = %e, "Failed to notify client"),
            }
        }
        delivered
    }
}

struct ClientSlot {
    client: Client,
    sender: mpsc::UnboundedSender<OutboundMessage>,
}

/// In-process client registry backed by per-page channels.
pub struct ClientRegistry {
    scope: Url,
    clients: RwLock<HashMap<ClientId, ClientSlot>>,
    controller_active: AtomicBool,
}

impl ClientRegistry {
    /// Create a registry for pages under `scope`.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            clients: RwLock::new(HashMap::new()),
            controller_active: AtomicBool::new(false),
        }
    }

    /// Whether `url` falls under this registry's scope.
    pub fn in_scope(&self, url: &Url) -> bool {
        url.as_str().starts_with(self.scope.as_str())
    }

    /// Open a page.
    ///
    /// In-scope pages opened after a claim start out controlled.
    pub async fn open_window(
        &self,
        url: Url,
    ) -> (Client, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let client = Client {
            id: next_client_id(),
            controlled: self.controller_active.load(Ordering::SeqCst) && self.in_scope(&url),
            url,
        };
        debug!(client = %client.id, url = %client.url, "Client opened");

        self.clients.write().await.insert(
            client.id.clone(),
            ClientSlot {
                client: client.clone(),
                sender,
            },
        );
        (client, receiver)
    }

    /// Close a page.
    pub async fn close(&self, id: &str) -> Option<Client> {
        self.clients.write().await.remove(id).map(|slot| slot.client)
    }

    /// Get a client by ID.
    pub async fn get(&self, id: &str) -> Option<Client> {
        self.clients.read().await.get(id).map(|slot| slot.client.clone())
    }

    /// Number of open pages, controlled or not.
    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl Clients for ClientRegistry {
    async fn claim(&self) -> Result<usize> {
        self.controller_active.store(true, Ordering::SeqCst);

        let mut clients = self.clients.write().await;
        let mut claimed = 0;
        for slot in clients.values_mut() {
            if self.in_scope(&slot.client.url) {
                slot.client.controlled = true;
                claimed += 1;
            }
        }
        Ok(claimed)
    }

    async fn match_all(&self) -> Vec<Client> {
        let mut matched: Vec<Client> = self
            .clients
            .read()
            .await
            .values()
            .filter(|slot| slot.client.controlled)
            .map(|slot| slot.client.clone())
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched
    }

    async fn post_message(&self, id: &str, message: &OutboundMessage) -> Result<()> {
        let clients = self.clients.read().await;
        let slot = clients
            .get(id)
            .ok_or_else(|| AgentError::ClientError(format!("unknown client {id}")))?;
        slot.sender
            .send(message.clone())
            .map_err(|_| AgentError::ClientError(format!("client {id} is gone")))
    }
}

fn next_client_id() -> ClientId {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("client-{:06}", COUNTER.fetch_add(1, Ordering::Relaxed))
}
