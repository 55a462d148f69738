use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::net::SocketAddr;

/// An agent's advertisement under a discovery topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    /// Full hex Ed25519 public key of the advertising agent.
    pub node_id: String,
    pub wallet_address: String,
    /// Externally reachable messaging address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    /// Unix seconds at which the listing was produced.
    pub timestamp: i64,
    /// Free-form fields (service menus, display names) kept as-is.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Listing {
    pub fn new(node_id: impl Into<String>, wallet_address: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            wallet_address: wallet_address.into(),
            host: None,
            port: None,
            capabilities: vec![],
            timestamp: Utc::now().timestamp(),
            extra: Map::new(),
        }
    }

    pub fn with_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = Some(host.into());
        self.port = Some(port);
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// `host:port` if the listing advertises one.
    pub fn endpoint(&self) -> Option<String> {
        match (&self.host, self.port) {
            (Some(host), Some(port)) => Some(format!("{}:{}", host, port)),
            _ => None,
        }
    }

    /// The endpoint parsed as a socket address; `None` for hostnames.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.endpoint().and_then(|e| e.parse().ok())
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Accepted,
    Rejected,
    Completed,
    Paid,
}

impl TaskStatus {
    /// Position in the lifecycle. Status only ever moves to a higher rank.
    fn rank(self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Accepted | TaskStatus::Rejected => 1,
            TaskStatus::Completed => 2,
            TaskStatus::Paid => 3,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Accepted)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Rejected | TaskStatus::Paid)
    }
}

/// Which side of the task this agent is on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskRole {
    /// We asked for the work and pay for it.
    Requester,
    /// We do the work and get paid.
    Provider,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub escrow_id: String,
    pub counterparty_id: String,
    pub role: TaskRole,
    pub description: Option<String>,
    pub amount: Option<f64>,
    pub deadline: Option<i64>,
    pub status: TaskStatus,
    pub estimated_completion: Option<i64>,
    pub result: Option<Value>,
    pub completion_proof: Option<String>,
    pub tx_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(escrow_id: impl Into<String>, counterparty_id: impl Into<String>, role: TaskRole) -> Self {
        let now = Utc::now();
        Self {
            escrow_id: escrow_id.into(),
            counterparty_id: counterparty_id.into(),
            role,
            description: None,
            amount: None,
            deadline: None,
            status: TaskStatus::Pending,
            estimated_completion: None,
            result: None,
            completion_proof: None,
            tx_hash: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `status` unless the record has already progressed past it.
    /// Returns whether the status changed.
    pub fn advance(&mut self, status: TaskStatus) -> bool {
        self.updated_at = Utc::now();
        if status.rank() > self.status.rank() {
            self.status = status;
            true
        } else {
            false
        }
    }

    pub fn fill_request(&mut self, description: &str, amount: f64, deadline: i64) {
        self.description = Some(description.to_string());
        self.amount = Some(amount);
        self.deadline = Some(deadline);
        self.updated_at = Utc::now();
    }
}
