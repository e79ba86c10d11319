//! The peer registry and unique-address handling.

use std::{collections::BTreeMap, sync::Arc};

use crate::{
    connection::Connection,
    peer::{Peer, PeerCredentials},
    policy::PolicySnapshot,
};

/// Render a peer id as its bus address.
pub fn unique_address(id: u64) -> String {
    format!(":1.{id}")
}

/// Parse a `:1.<id>` address back into a peer id.
pub fn unique_address_id(address: &str) -> Option<u64> {
    address.strip_prefix(":1.")?.parse().ok()
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: BTreeMap<u64, Peer>,
    next_id: u64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection. Ids are assigned monotonically and never
    /// reused, so an address observed once refers to that connection
    /// forever.
    pub(crate) fn add(
        &mut self,
        conn: Connection,
        creds: PeerCredentials,
        policy: Arc<PolicySnapshot>,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.peers.insert(id, Peer::new(id, conn, creds, policy));

        id
    }

    pub(crate) fn remove(&mut self, id: u64) -> Option<Peer> {
        self.peers.remove(&id)
    }

    pub fn get(&self, id: u64) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: u64) -> Option<&mut Peer> {
        self.peers.get_mut(&id)
    }

    /// Iterate peers in id order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &Peer)> {
        self.peers.iter().map(|(id, peer)| (*id, peer))
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Snapshot of a sender's identity, complete enough to policy-check and
/// deliver a message after the sender is gone (activation replay).
#[derive(Debug, Clone)]
pub(crate) struct SendSource {
    pub id: u64,
    pub names: Vec<String>,
    pub policy: Arc<PolicySnapshot>,
}

impl SendSource {
    pub(crate) fn capture(peers: &PeerRegistry, id: u64) -> Option<Self> {
        peers.get(id).map(|peer| Self {
            id,
            names: peer.owned_names_vec(),
            policy: peer.policy().clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{unique_address, unique_address_id};

    #[test]
    fn address_round_trip() {
        assert_eq!(unique_address(42), ":1.42");
        assert_eq!(unique_address_id(":1.42"), Some(42));
        assert_eq!(unique_address_id("org.example.Name"), None);
        assert_eq!(unique_address_id(":2.42"), None);
    }
}
