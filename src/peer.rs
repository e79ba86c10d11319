//! A single connected client.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use nix::unistd::Uid;
use zbus::names::OwnedUniqueName;

use crate::{
    connection::Connection, match_rules::MatchRules, peers, policy::PolicySnapshot,
    replies::ReplySlot,
};

/// Per-peer resource bounds.
pub(crate) const MAX_MATCH_RULES: usize = 512;
pub(crate) const MAX_OWNED_NAMES: usize = 512;
pub(crate) const MAX_PENDING_REPLIES: usize = 128;

/// Lifecycle of a peer. `Hello` moves it to `Registered`; `BecomeMonitor`
/// to `Monitor`. Monitors neither send nor appear as destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Unregistered,
    Registered,
    Monitor,
}

/// Credentials captured when the connection authenticated.
#[derive(Debug, Clone)]
pub struct PeerCredentials {
    pub uid: Uid,
    pub pid: u32,
    pub seclabel: Option<Vec<u8>>,
}

#[derive(Debug)]
pub struct Peer {
    id: u64,
    unique_name: OwnedUniqueName,
    conn: Connection,
    state: PeerState,
    creds: PeerCredentials,
    policy: Arc<PolicySnapshot>,
    pub(crate) matches: MatchRules,
    pub(crate) owned_names: BTreeSet<String>,
    /// Replies this peer is waiting for, as `(replier, serial)`.
    pub(crate) owned_replies: BTreeSet<(u64, u32)>,
    /// Replies other peers wait for from this peer, keyed `(waiter, serial)`.
    pub(crate) replies: BTreeMap<(u64, u32), ReplySlot>,
}

impl Peer {
    pub(crate) fn new(
        id: u64,
        conn: Connection,
        creds: PeerCredentials,
        policy: Arc<PolicySnapshot>,
    ) -> Self {
        let unique_name = OwnedUniqueName::try_from(peers::unique_address(id))
            .expect("assigned addresses are valid unique names");

        Self {
            id,
            unique_name,
            conn,
            state: PeerState::Unregistered,
            creds,
            policy,
            matches: MatchRules::new(),
            owned_names: BTreeSet::new(),
            owned_replies: BTreeSet::new(),
            replies: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unique_name(&self) -> &OwnedUniqueName {
        &self.unique_name
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn is_registered(&self) -> bool {
        self.state == PeerState::Registered
    }

    pub fn is_monitor(&self) -> bool {
        self.state == PeerState::Monitor
    }

    pub fn credentials(&self) -> &PeerCredentials {
        &self.creds
    }

    pub fn policy(&self) -> &Arc<PolicySnapshot> {
        &self.policy
    }

    /// Owned well-known names, for policy contexts and audit records.
    pub(crate) fn owned_names_vec(&self) -> Vec<String> {
        self.owned_names.iter().cloned().collect()
    }

    pub(crate) fn register(&mut self) {
        self.state = PeerState::Registered;
    }

    pub(crate) fn unregister(&mut self) {
        self.state = PeerState::Unregistered;
    }

    pub(crate) fn become_monitor(&mut self, matches: MatchRules) {
        self.state = PeerState::Monitor;
        self.matches = matches;
    }

    pub(crate) fn stop_monitor(&mut self) {
        self.state = PeerState::Unregistered;
        self.matches.clear();
    }
}
