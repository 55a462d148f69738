//! Overlay RPC datagrams.
//!
//! Every datagram is a single JSON object: a correlation id, the sender's overlay id
//! and one [`Rpc`] body. Responses reuse the id of the request they answer.

use super::routing::{Contact, DhtId};
use serde::{Deserialize, Serialize};

/// Largest payload a UDP datagram can carry over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Datagram {
    pub id: String,
    pub sender: DhtId,
    pub rpc: Rpc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Rpc {
    // requests
    Ping,
    Store { key: DhtId, value: String },
    FindNode { target: DhtId },
    FindValue { key: DhtId },
    // responses
    Pong,
    Stored,
    Nodes { contacts: Vec<Contact> },
    Value { value: String },
}

impl Rpc {
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Rpc::Pong | Rpc::Stored | Rpc::Nodes { .. } | Rpc::Value { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Rpc::Ping => "ping",
            Rpc::Store { .. } => "store",
            Rpc::FindNode { .. } => "find_node",
            Rpc::FindValue { .. } => "find_value",
            Rpc::Pong => "pong",
            Rpc::Stored => "stored",
            Rpc::Nodes { .. } => "nodes",
            Rpc::Value { .. } => "value",
        }
    }
}

pub fn encode(datagram: &Datagram) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(datagram)
}

pub fn decode(bytes: &[u8]) -> Result<Datagram, serde_json::Error> {
    serde_json::from_slice(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_datagram_shape() {
        let key = DhtId::random();
        let datagram = Datagram {
            id: "rpc-1".to_string(),
            sender: DhtId::random(),
            rpc: Rpc::Store {
                key,
                value: "[]".to_string(),
            },
        };
        let bytes = encode(&datagram).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["rpc"]["op"], "store");
        assert_eq!(value["rpc"]["key"], key.to_hex());

        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.id, "rpc-1");
        assert!(!decoded.rpc.is_response());
    }

    #[test]
    fn test_nodes_response() {
        let contact = Contact {
            id: DhtId::random(),
            addr: "10.0.0.5:8468".parse().unwrap(),
        };
        let datagram = Datagram {
            id: "rpc-2".to_string(),
            sender: DhtId::random(),
            rpc: Rpc::Nodes {
                contacts: vec![contact],
            },
        };
        let decoded = decode(&encode(&datagram).unwrap()).unwrap();
        assert!(decoded.rpc.is_response());
        match decoded.rpc {
            Rpc::Nodes { contacts } => assert_eq!(contacts, vec![contact]),
            other => panic!("Expected Nodes, got {other:?}"),
        }
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(decode(b"{\"id\":\"x\"}").is_err());
        assert!(decode(b"\x00\x01").is_err());
    }
}
