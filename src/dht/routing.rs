//! XOR-metric routing table.

use crate::identity::DHT_ID_LEN;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;

const ID_BITS: usize = DHT_ID_LEN * 8;

/// 160-bit identifier for nodes and keys in the overlay.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DhtId([u8; DHT_ID_LEN]);

impl DhtId {
    pub fn from_bytes(bytes: [u8; DHT_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; DHT_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DHT_ID_LEN] {
        &self.0
    }

    pub fn distance(&self, other: &DhtId) -> [u8; DHT_ID_LEN] {
        let mut out = [0u8; DHT_ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Bucket that `other` falls into from our point of view, `None` for ourselves.
    /// Bucket 0 holds the farthest half of the id space.
    pub fn bucket_index(&self, other: &DhtId) -> Option<usize> {
        let distance = self.distance(other);
        let mut leading = 0usize;
        for byte in distance {
            if byte == 0 {
                leading += 8;
            } else {
                leading += byte.leading_zeros() as usize;
                return Some(leading);
            }
        }
        None
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl TryFrom<String> for DhtId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let bytes = hex::decode(&value).map_err(|e| e.to_string())?;
        let id: [u8; DHT_ID_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| format!("dht id must be {} bytes", DHT_ID_LEN))?;
        Ok(Self(id))
    }
}

impl From<DhtId> for String {
    fn from(id: DhtId) -> Self {
        id.to_hex()
    }
}

impl fmt::Debug for DhtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DhtId({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for DhtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A reachable overlay node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: DhtId,
    pub addr: SocketAddr,
}

/// Result of offering a contact to the table.
#[derive(Debug, PartialEq, Eq)]
pub enum Insertion {
    Added,
    Refreshed,
    /// Bucket is full; the least recently seen contact should be pinged and
    /// evicted only if it does not answer.
    BucketFull { oldest: Contact },
    /// The contact is this node.
    Ignored,
}

#[derive(Debug, Default)]
struct KBucket {
    /// Front is least recently seen.
    contacts: VecDeque<Contact>,
}

#[derive(Debug)]
pub struct RoutingTable {
    local: DhtId,
    ksize: usize,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(local: DhtId, ksize: usize) -> Self {
        let buckets = (0..ID_BITS).map(|_| KBucket::default()).collect();
        Self { local, ksize, buckets }
    }

    pub fn local_id(&self) -> DhtId {
        self.local
    }

    pub fn insert(&mut self, contact: Contact) -> Insertion {
        let Some(index) = self.local.bucket_index(&contact.id) else {
            return Insertion::Ignored;
        };
        let bucket = &mut self.buckets[index];

        if let Some(pos) = bucket.contacts.iter().position(|c| c.id == contact.id) {
            bucket.contacts.remove(pos);
            bucket.contacts.push_back(contact);
            return Insertion::Refreshed;
        }

        if bucket.contacts.len() < self.ksize {
            bucket.contacts.push_back(contact);
            return Insertion::Added;
        }

        match bucket.contacts.front() {
            Some(oldest) => Insertion::BucketFull { oldest: *oldest },
            None => Insertion::Ignored,
        }
    }

    /// Replace `stale` with `fresh` after `stale` failed to answer a ping.
    pub fn evict_and_insert(&mut self, stale: &DhtId, fresh: Contact) {
        self.remove(stale);
        self.insert(fresh);
    }

    pub fn remove(&mut self, id: &DhtId) -> Option<Contact> {
        let index = self.local.bucket_index(id)?;
        let bucket = &mut self.buckets[index];
        let pos = bucket.contacts.iter().position(|c| c.id == *id)?;
        bucket.contacts.remove(pos)
    }

    pub fn contains(&self, id: &DhtId) -> bool {
        self.local
            .bucket_index(id)
            .map(|i| self.buckets[i].contacts.iter().any(|c| c.id == *id))
            .unwrap_or(false)
    }

    /// Up to `count` known contacts ordered by XOR distance to `target`.
    pub fn closest(&self, target: &DhtId, count: usize) -> Vec<Contact> {
        let mut all: Vec<Contact> = self
            .buckets
            .iter()
            .flat_map(|b| b.contacts.iter().copied())
            .collect();
        all.sort_by_key(|c| c.id.distance(target));
        all.truncate(count);
        all
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_with_first_byte(b: u8) -> DhtId {
        let mut bytes = [0u8; DHT_ID_LEN];
        bytes[0] = b;
        DhtId::from_bytes(bytes)
    }

    fn contact(b: u8, port: u16) -> Contact {
        Contact {
            id: id_with_first_byte(b),
            addr: format!("127.0.0.1:{}", port).parse().unwrap(),
        }
    }

    #[test]
    fn test_bucket_index() {
        let zero = DhtId::from_bytes([0u8; DHT_ID_LEN]);
        assert_eq!(zero.bucket_index(&zero), None);
        assert_eq!(zero.bucket_index(&id_with_first_byte(0x80)), Some(0));
        assert_eq!(zero.bucket_index(&id_with_first_byte(0x01)), Some(7));
        let mut last = [0u8; DHT_ID_LEN];
        last[DHT_ID_LEN - 1] = 1;
        assert_eq!(zero.bucket_index(&DhtId::from_bytes(last)), Some(ID_BITS - 1));
    }

    #[test]
    fn test_insert_refresh_and_ignore_self() {
        let local = DhtId::from_bytes([0u8; DHT_ID_LEN]);
        let mut table = RoutingTable::new(local, 2);
        assert_eq!(table.insert(contact(0x80, 1)), Insertion::Added);
        assert_eq!(table.insert(contact(0x80, 1)), Insertion::Refreshed);
        assert_eq!(
            table.insert(Contact { id: local, addr: "127.0.0.1:9".parse().unwrap() }),
            Insertion::Ignored
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_full_bucket_reports_oldest() {
        let local = DhtId::from_bytes([0u8; DHT_ID_LEN]);
        let mut table = RoutingTable::new(local, 2);
        // 0x80..0xff all land in bucket 0
        table.insert(contact(0x81, 1));
        table.insert(contact(0x82, 2));
        assert_eq!(
            table.insert(contact(0x83, 3)),
            Insertion::BucketFull { oldest: contact(0x81, 1) }
        );
        table.evict_and_insert(&id_with_first_byte(0x81), contact(0x83, 3));
        assert!(!table.contains(&id_with_first_byte(0x81)));
        assert!(table.contains(&id_with_first_byte(0x83)));
    }

    #[test]
    fn test_closest_orders_by_xor() {
        let local = DhtId::from_bytes([0u8; DHT_ID_LEN]);
        let mut table = RoutingTable::new(local, 20);
        for b in [0x10u8, 0x20, 0x40, 0x80] {
            table.insert(contact(b, b as u16));
        }
        let closest = table.closest(&id_with_first_byte(0x21), 2);
        assert_eq!(closest[0].id, id_with_first_byte(0x20));
        assert_eq!(closest[1].id, id_with_first_byte(0x10));
    }

    #[test]
    fn test_id_serde_hex() {
        let id = DhtId::random();
        let json = serde_json::to_string(&id).unwrap();
        let back: DhtId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<DhtId>("\"abcd\"").is_err());
    }
}
