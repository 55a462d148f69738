//! # HYPHA - agent identity, peer discovery and signed task messaging
//!
//! Autonomous agents find each other on an open network and coordinate paid work.
//!
//! ## Architecture
//!
//! - **Identity**: one 32-byte master seed derives an Ed25519 node identity and a
//!   secp256k1 payment wallet
//! - **Discovery**: Kademlia-style DHT over UDP holding topic listings
//! - **Protocol**: JSON envelopes with typed task payloads
//! - **Transport**: one signed envelope per TCP connection, dispatched by type
//! - **Coordinator**: per-escrow task lifecycle (request, response, completion, payment)
//! - **Settlement**: escrow and transfer traits implemented outside the core

pub mod agent;
pub mod config;
pub mod coordinator;
pub mod dht;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod model;
pub mod protocol;
pub mod settlement;
pub mod transport;
pub mod validation;

pub use agent::{Agent, HealthReport, HealthStatus};
pub use config::AppConfig;
pub use coordinator::TaskCoordinator;
pub use discovery::PeerDirectory;
pub use error::{HyphaError, Result};
pub use identity::{Identity, MasterSeed, NodeId};
pub use model::{Listing, TaskRecord, TaskRole, TaskStatus};
pub use protocol::{Message, MessageType, Payload};
pub use settlement::{EscrowService, LocalLedger, PaymentSettlement};
pub use transport::{handler_fn, MessageHandler, Transport, VerificationPolicy};
