//! The bus: process-wide state shared by every dispatch.

use std::sync::Arc;

use anyhow::Result;
use nix::unistd::Uid;
use thiserror::Error;
use zbus::{Guid, Message};

use crate::{
    connection::Connection,
    driver,
    name_registry::NameRegistry,
    peer::{Peer, PeerCredentials},
    peers::{unique_address_id, PeerRegistry},
    policy::PolicySnapshot,
};

/// The parent process rejected or could not take the request.
#[derive(Debug, Error)]
#[error("request could not be forwarded to the parent process")]
pub struct ForwardError;

/// Requests the driver forwards out of process.
///
/// `reload_config` completes asynchronously: the embedding broker calls
/// [`driver::reload_config_completed`] or [`driver::reload_config_invalid`]
/// once the new configuration was applied (or refused), and only then is
/// the caller answered.
pub trait BrokerParent: std::fmt::Debug + Send {
    fn update_environment(&self, env: &[(String, String)]) -> Result<(), ForwardError>;
    fn reload_config(&self, sender_id: u64, serial: u32) -> Result<(), ForwardError>;
}

/// Starts service programs on demand.
///
/// Launching is fire-and-forget: success manifests as the service
/// connecting and requesting its name, failure comes back through
/// [`driver::name_activation_failed`].
pub trait ActivationLauncher: std::fmt::Debug + Send {
    fn launch(&self, name: &str);
}

/// A `ReloadConfig` call waiting for the parent to finish.
#[derive(Debug)]
pub(crate) struct PendingReload {
    pub sender_id: u64,
    pub serial: u32,
    pub call: Arc<Message>,
}

#[derive(Debug)]
pub struct Bus {
    pub(crate) peers: PeerRegistry,
    pub(crate) names: NameRegistry,
    guid: Guid,
    machine_id: String,
    uid: Uid,
    pid: u32,
    seclabel: Option<Vec<u8>>,
    selinux_enabled: bool,
    pub(crate) n_monitors: usize,
    parent: Box<dyn BrokerParent>,
    launcher: Box<dyn ActivationLauncher>,
    pub(crate) pending_reloads: Vec<PendingReload>,
}

impl Bus {
    pub fn new(
        machine_id: impl Into<String>,
        parent: Box<dyn BrokerParent>,
        launcher: Box<dyn ActivationLauncher>,
    ) -> Self {
        Self {
            peers: PeerRegistry::new(),
            names: NameRegistry::new(),
            guid: Guid::generate(),
            machine_id: machine_id.into(),
            uid: Uid::effective(),
            pid: std::process::id(),
            seclabel: None,
            selinux_enabled: false,
            n_monitors: 0,
            parent,
            launcher,
            pending_reloads: Vec::new(),
        }
    }

    pub fn guid(&self) -> &Guid {
        &self.guid
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn set_seclabel(&mut self, seclabel: Vec<u8>) {
        self.seclabel = Some(seclabel);
    }

    pub fn seclabel(&self) -> Option<&[u8]> {
        self.seclabel.as_deref()
    }

    pub fn set_selinux_enabled(&mut self, enabled: bool) {
        self.selinux_enabled = enabled;
    }

    pub fn selinux_enabled(&self) -> bool {
        self.selinux_enabled
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn names(&self) -> &NameRegistry {
        &self.names
    }

    pub fn n_monitors(&self) -> usize {
        self.n_monitors
    }

    /// Split borrow for operations that walk both registries at once.
    pub(crate) fn registries_mut(&mut self) -> (&mut PeerRegistry, &mut NameRegistry) {
        (&mut self.peers, &mut self.names)
    }

    pub(crate) fn parent(&self) -> &dyn BrokerParent {
        &*self.parent
    }

    pub(crate) fn launcher(&self) -> &dyn ActivationLauncher {
        &*self.launcher
    }

    /// Accept an authenticated connection; returns its assigned id. The
    /// peer stays invisible to the bus until it says `Hello`.
    pub fn add_peer(
        &mut self,
        conn: Connection,
        creds: PeerCredentials,
        policy: PolicySnapshot,
    ) -> u64 {
        self.peers.add(conn, creds, Arc::new(policy))
    }

    /// Disconnect a peer: tear its state down with the usual disappearance
    /// signalling, then drop it from the registry.
    pub fn remove_peer(&mut self, id: u64) -> Result<()> {
        driver::goodbye(self, id, false)?;
        self.peers.remove(id);

        Ok(())
    }

    /// Declare a name as activatable.
    pub fn add_activatable_name(&mut self, name: &str) {
        self.names.make_activatable(name);
    }

    /// Resolve a destination string (unique address or well-known name) to
    /// a registered peer.
    pub fn find_peer_by_name(&self, name: &str) -> Option<u64> {
        let id = match unique_address_id(name) {
            Some(id) => id,
            None => self.names.lookup(name)?,
        };

        self.peers
            .get(id)
            .filter(|peer| peer.is_registered())
            .map(Peer::id)
    }

    /// A peer is privileged when it runs as the bus user or as root.
    pub(crate) fn is_privileged(&self, peer: &Peer) -> bool {
        let uid = peer.credentials().uid;

        uid == self.uid || uid.is_root()
    }

    pub(crate) fn take_pending_reload(
        &mut self,
        sender_id: u64,
        serial: u32,
    ) -> Option<PendingReload> {
        let pos = self
            .pending_reloads
            .iter()
            .position(|p| p.sender_id == sender_id && p.serial == serial)?;

        Some(self.pending_reloads.remove(pos))
    }
}
