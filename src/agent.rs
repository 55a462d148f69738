use crate::{
    config::AppConfig,
    coordinator::TaskCoordinator,
    discovery::PeerDirectory,
    error::{HyphaError, Result},
    identity::{Identity, NodeId},
    model::{Listing, TaskRole, TaskStatus},
    protocol::TaskRequest,
    settlement::{EscrowService, PaymentSettlement},
    transport::Transport,
    validation,
};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub overall: HealthStatus,
    pub node_id: String,
    pub wallet_address: String,
    pub discovery: ComponentHealth,
    pub messaging: ComponentHealth,
    pub total_tasks: usize,
    pub timestamp: i64,
}

/// One agent: identity, directory, transport and task coordinator wired together.
pub struct Agent {
    config: AppConfig,
    identity: Identity,
    directory: PeerDirectory,
    transport: Arc<Transport>,
    coordinator: Arc<TaskCoordinator>,
    peers: RwLock<HashMap<String, Listing>>,
    escrow: Option<Arc<dyn EscrowService>>,
    settlement: Option<Arc<dyn PaymentSettlement>>,
    reannounce: Mutex<Option<JoinHandle<()>>>,
}

impl Agent {
    pub fn new(config: AppConfig) -> Result<Self> {
        let seed = config.identity.master_seed()?;
        let identity = Identity::from_seed(&seed)?;
        Ok(Self::with_identity(config, identity))
    }

    pub fn with_identity(config: AppConfig, identity: Identity) -> Self {
        let directory = PeerDirectory::new(config.discovery.clone(), identity.node_id());
        let transport = Arc::new(Transport::new(&identity, config.transport.clone()));
        let coordinator = TaskCoordinator::new(Arc::clone(&transport));
        coordinator.install();

        info!(
            "Agent {} ready (wallet {})",
            identity.node_id().short(),
            identity.wallet_address()
        );

        Self {
            config,
            identity,
            directory,
            transport,
            coordinator,
            peers: RwLock::new(HashMap::new()),
            escrow: None,
            settlement: None,
            reannounce: Mutex::new(None),
        }
    }

    pub fn with_escrow(mut self, escrow: Arc<dyn EscrowService>) -> Self {
        self.escrow = Some(escrow);
        self
    }

    pub fn with_settlement(mut self, settlement: Arc<dyn PaymentSettlement>) -> Self {
        self.settlement = Some(settlement);
        self
    }

    pub fn node_id(&self) -> NodeId {
        self.identity.node_id()
    }

    pub fn wallet_address(&self) -> &str {
        self.identity.wallet_address()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn coordinator(&self) -> &Arc<TaskCoordinator> {
        &self.coordinator
    }

    /// Join the overlay and start accepting messages. Returns the messaging address.
    pub async fn start(&self) -> Result<SocketAddr> {
        self.directory.start().await?;
        let addr = self
            .transport
            .listen(&self.config.transport.host, self.config.transport.port)
            .await?;
        info!("Agent {} listening on {}", self.node_id().short(), addr);
        Ok(addr)
    }

    /// What we publish about ourselves.
    pub fn listing(&self) -> Listing {
        let port = self
            .transport
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(self.config.transport.port);
        Listing::new(self.node_id().to_hex(), self.wallet_address())
            .with_endpoint(self.config.transport.advertised_host(), port)
            .with_capabilities(self.config.discovery.capabilities.iter().cloned())
    }

    pub async fn announce(&self, topic: Option<&str>) -> Result<()> {
        let topic = topic.unwrap_or(self.config.discovery.default_topic.as_str());
        self.directory.announce(topic, &self.listing()).await
    }

    /// Listings on `topic` other than our own. Their keys and endpoints are learned
    /// by the transport.
    pub async fn discover(&self, topic: Option<&str>) -> Result<Vec<Listing>> {
        let topic = topic.unwrap_or(self.config.discovery.default_topic.as_str());
        let own_id = self.node_id().to_hex();
        let listings: Vec<Listing> = self
            .directory
            .discover(topic)
            .await?
            .into_iter()
            .filter(|l| l.node_id != own_id)
            .collect();

        let mut peers = self.peers.write();
        for listing in &listings {
            if let Err(e) = self.transport.learn_peer(listing) {
                warn!("Ignoring unusable listing {}: {}", listing.node_id, e);
                continue;
            }
            peers.insert(listing.node_id.to_ascii_lowercase(), listing.clone());
        }
        debug!("Discovered {} peer(s) on '{}'", listings.len(), topic);
        Ok(listings)
    }

    pub fn known_listing(&self, node_id: &str) -> Option<Listing> {
        self.peers.read().get(&node_id.to_ascii_lowercase()).cloned()
    }

    /// Re-publish our listing on `topic` every `interval` until shutdown.
    /// Replaces any loop started earlier.
    pub fn spawn_reannounce(self: &Arc<Self>, topic: String, interval: Duration) {
        let agent: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(agent) = agent.upgrade() else {
                    break;
                };
                match agent.announce(Some(topic.as_str())).await {
                    Ok(()) => debug!("Re-announced on '{}'", topic),
                    Err(e) => warn!("Re-announce on '{}' failed: {}", topic, e),
                }
            }
        });

        if let Some(previous) = self.reannounce.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Lock funds in escrow for `provider` and send the task request.
    /// Returns the escrow id.
    pub async fn hire(&self, provider: &Listing, task: &str, amount: f64, deadline_hours: u32) -> Result<String> {
        let escrow = self
            .escrow
            .as_ref()
            .ok_or_else(|| HyphaError::Settlement("no escrow service configured".to_string()))?;
        let provider_address = validation::validate_ethereum_address(&provider.wallet_address, "provider")?;
        let amount = validation::validate_amount(amount, "amount")?;
        let task = validation::validate_task_description(task, "task")?;
        let hours = validation::validate_deadline_hours(deadline_hours, "deadline_hours")?;
        let deadline = Utc::now().timestamp() + i64::from(hours) * 3600;

        info!("Creating escrow for {} USDT with {}", amount, provider_address);
        let escrow_id = escrow
            .create_escrow(&provider_address, amount, task, deadline)
            .await?;

        self.peers
            .write()
            .insert(provider.node_id.to_ascii_lowercase(), provider.clone());

        let request = TaskRequest {
            escrow_id: escrow_id.clone(),
            task_description: task.to_string(),
            amount,
            deadline,
            requirements: None,
            reply_to: None,
        };
        self.coordinator.request_task(provider, request).await?;
        Ok(escrow_id)
    }

    /// Settle a completed task we requested and tell the provider.
    /// Returns the settlement transaction hash.
    pub async fn pay(&self, escrow_id: &str) -> Result<String> {
        let record = self
            .coordinator
            .get_task(escrow_id)
            .await
            .ok_or_else(|| HyphaError::TaskNotFound(escrow_id.to_string()))?;
        if record.role != TaskRole::Requester {
            return Err(HyphaError::Validation(format!("{} is not a task we requested", escrow_id)));
        }
        if record.status != TaskStatus::Completed {
            return Err(HyphaError::Validation(format!(
                "{} is {:?}, only completed tasks can be paid",
                escrow_id, record.status
            )));
        }
        let amount = record.amount.unwrap_or_default();
        let to_address = self
            .known_listing(&record.counterparty_id)
            .map(|l| l.wallet_address)
            .ok_or_else(|| HyphaError::UnknownPeer(record.counterparty_id.clone()))?;

        let tx_hash = match (&self.escrow, &self.settlement) {
            (Some(escrow), _) => escrow.complete_escrow(escrow_id).await?,
            (None, Some(settlement)) => settlement.transfer(&to_address, amount).await?,
            (None, None) => {
                return Err(HyphaError::Settlement("no settlement backend configured".to_string()))
            }
        };

        self.coordinator
            .notify_payment(escrow_id, amount, &tx_hash, self.wallet_address(), &to_address)
            .await?;
        info!("Paid {} for {} ({})", amount, escrow_id, tx_hash);
        Ok(tx_hash)
    }

    pub async fn health(&self) -> HealthReport {
        let discovery = if !self.directory.is_running() {
            ComponentHealth {
                status: HealthStatus::Unhealthy,
                detail: "peer directory not started".to_string(),
            }
        } else if !self.config.discovery.bootstrap.is_empty() && self.directory.contact_count() == 0 {
            ComponentHealth {
                status: HealthStatus::Degraded,
                detail: "no overlay contacts".to_string(),
            }
        } else {
            ComponentHealth {
                status: HealthStatus::Healthy,
                detail: format!("{} overlay contact(s)", self.directory.contact_count()),
            }
        };

        let messaging = match self.transport.local_addr() {
            Some(addr) => ComponentHealth {
                status: HealthStatus::Healthy,
                detail: format!("listening on {}", addr),
            },
            None => ComponentHealth {
                status: HealthStatus::Unhealthy,
                detail: "not listening".to_string(),
            },
        };

        let statuses = [discovery.status, messaging.status];
        let overall = if statuses.iter().all(|s| *s == HealthStatus::Healthy) {
            HealthStatus::Healthy
        } else if statuses.contains(&HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };

        HealthReport {
            overall,
            node_id: self.node_id().to_hex(),
            wallet_address: self.wallet_address().to_string(),
            discovery,
            messaging,
            total_tasks: self.coordinator.task_count(),
            timestamp: Utc::now().timestamp(),
        }
    }

    pub async fn shutdown(&self) {
        if let Some(handle) = self.reannounce.lock().take() {
            handle.abort();
        }
        self.transport.stop();
        self.directory.stop().await;
        info!("Agent {} shut down", self.node_id().short());
    }
}
