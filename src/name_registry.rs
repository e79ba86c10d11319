//! Well-known-name ownership.
//!
//! Every name holds its owners in request order: the front entry is the
//! primary owner, the rest wait in the queue. The registry keeps the
//! per-peer `owned_names` sets in sync so teardown can walk a peer's names
//! without scanning the tree.

use std::collections::{BTreeMap, VecDeque};

use anyhow::anyhow;
use enumflags2::BitFlags;
use zbus::fdo::{ReleaseNameReply, RequestNameFlags, RequestNameReply};

use crate::{activation::Activation, error::DriverError, peer, peers::PeerRegistry};

/// One ownership transition, ready to be turned into the
/// `NameLost`/`NameOwnerChanged`/`NameAcquired` triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameChange {
    pub name: String,
    pub old: Option<u64>,
    pub new: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct NameOwnership {
    pub peer_id: u64,
    /// The owner consents to being replaced by a `REPLACE_EXISTING` request.
    pub allow_replacement: bool,
    /// Leave the bus entirely when preempted instead of staying queued.
    pub do_not_queue: bool,
}

#[derive(Debug, Default)]
pub struct Name {
    owners: VecDeque<NameOwnership>,
    pub(crate) activation: Option<Activation>,
}

impl Name {
    pub fn primary(&self) -> Option<&NameOwnership> {
        self.owners.front()
    }

    pub fn owners(&self) -> impl Iterator<Item = &NameOwnership> {
        self.owners.iter()
    }

    pub fn activation(&self) -> Option<&Activation> {
        self.activation.as_ref()
    }
}

#[derive(Debug, Default)]
pub struct NameRegistry {
    names: BTreeMap<String, Name>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unique id of the primary owner, if the name is currently owned.
    pub fn lookup(&self, name: &str) -> Option<u64> {
        self.names
            .get(name)
            .and_then(|n| n.primary().map(|o| o.peer_id))
    }

    pub fn get(&self, name: &str) -> Option<&Name> {
        self.names.get(name)
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut Name> {
        self.names.get_mut(name)
    }

    /// Iterate all names in key (tree) order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Name)> {
        self.names.iter()
    }

    /// Attach an activation record, making the name activatable.
    pub fn make_activatable(&mut self, name: &str) {
        self.names
            .entry(name.to_string())
            .or_default()
            .activation
            .get_or_insert_with(Activation::new);
    }

    pub(crate) fn request_name(
        &mut self,
        peers: &mut PeerRegistry,
        name: &str,
        requester: u64,
        flags: BitFlags<RequestNameFlags>,
    ) -> Result<(RequestNameReply, Option<NameChange>), DriverError> {
        let ownership = NameOwnership {
            peer_id: requester,
            allow_replacement: flags.contains(RequestNameFlags::AllowReplacement),
            do_not_queue: flags.contains(RequestNameFlags::DoNotQueue),
        };

        {
            let peer = peers
                .get(requester)
                .ok_or_else(|| anyhow!("unknown peer {requester}"))?;
            if !peer.owned_names.contains(name)
                && peer.owned_names.len() >= peer::MAX_OWNED_NAMES
            {
                return Err(DriverError::Quota);
            }
        }

        let entry = self.names.entry(name.to_string()).or_default();

        if entry.owners.is_empty() {
            entry.owners.push_back(ownership);
            track_owned(peers, requester, name, true);

            return Ok((
                RequestNameReply::PrimaryOwner,
                Some(NameChange {
                    name: name.to_string(),
                    old: None,
                    new: Some(requester),
                }),
            ));
        }

        if entry.owners[0].peer_id == requester {
            // Only the recorded flags change.
            entry.owners[0] = ownership;

            return Ok((RequestNameReply::AlreadyOwner, None));
        }

        if flags.contains(RequestNameFlags::ReplaceExisting) && entry.owners[0].allow_replacement {
            let displaced = entry.owners.pop_front().expect("primary owner checked");
            if let Some(pos) = entry.owners.iter().position(|o| o.peer_id == requester) {
                entry.owners.remove(pos);
            }
            entry.owners.push_front(ownership);
            if displaced.do_not_queue {
                track_owned(peers, displaced.peer_id, name, false);
            } else {
                entry.owners.insert(1, displaced.clone());
            }
            track_owned(peers, requester, name, true);

            return Ok((
                RequestNameReply::PrimaryOwner,
                Some(NameChange {
                    name: name.to_string(),
                    old: Some(displaced.peer_id),
                    new: Some(requester),
                }),
            ));
        }

        if flags.contains(RequestNameFlags::DoNotQueue) {
            if let Some(pos) = entry.owners.iter().position(|o| o.peer_id == requester) {
                entry.owners.remove(pos);
                track_owned(peers, requester, name, false);
            }

            return Ok((RequestNameReply::Exists, None));
        }

        match entry.owners.iter_mut().find(|o| o.peer_id == requester) {
            Some(queued) => *queued = ownership,
            None => {
                entry.owners.push_back(ownership);
                track_owned(peers, requester, name, true);
            }
        }

        Ok((RequestNameReply::InQueue, None))
    }

    pub(crate) fn release_name(
        &mut self,
        peers: &mut PeerRegistry,
        name: &str,
        releaser: u64,
    ) -> (ReleaseNameReply, Option<NameChange>) {
        let Some(entry) = self.names.get_mut(name) else {
            return (ReleaseNameReply::NonExistent, None);
        };
        if entry.owners.is_empty() {
            // Activatable but not running.
            return (ReleaseNameReply::NonExistent, None);
        }

        match entry.owners.iter().position(|o| o.peer_id == releaser) {
            None => (ReleaseNameReply::NotOwner, None),
            Some(0) => {
                entry.owners.pop_front();
                track_owned(peers, releaser, name, false);
                let new = entry.primary().map(|o| o.peer_id);
                if entry.owners.is_empty() && entry.activation.is_none() {
                    self.names.remove(name);
                }

                (
                    ReleaseNameReply::Released,
                    Some(NameChange {
                        name: name.to_string(),
                        old: Some(releaser),
                        new,
                    }),
                )
            }
            Some(pos) => {
                // Dropping out of the queue changes no ownership.
                entry.owners.remove(pos);
                track_owned(peers, releaser, name, false);

                (ReleaseNameReply::Released, None)
            }
        }
    }

    /// Release every name the peer owns or waits for, in name order.
    /// Returns the ownership transitions this caused.
    pub(crate) fn release_peer(&mut self, peers: &mut PeerRegistry, peer_id: u64) -> Vec<NameChange> {
        let owned: Vec<String> = match peers.get(peer_id) {
            Some(peer) => peer.owned_names.iter().cloned().collect(),
            None => return Vec::new(),
        };

        let mut changes = Vec::new();
        for name in owned {
            let (_, change) = self.release_name(peers, &name, peer_id);
            changes.extend(change);
        }

        changes
    }
}

fn track_owned(peers: &mut PeerRegistry, peer_id: u64, name: &str, owned: bool) {
    if let Some(peer) = peers.get_mut(peer_id) {
        if owned {
            peer.owned_names.insert(name.to_string());
        } else {
            peer.owned_names.remove(name);
        }
    }
}
