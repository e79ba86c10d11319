//! Handlers for the `org.freedesktop.DBus` interface proper.

use std::collections::HashMap;

use anyhow::anyhow;
use enumflags2::BitFlags;
use tracing::warn;
use zbus::{
    fdo::RequestNameFlags,
    names::WellKnownName,
    zvariant::{DeserializeDict, SerializeDict, Type},
};

use super::{MethodCall, BUS_NAME, START_REPLY_ALREADY_RUNNING};
use crate::{
    bus::{Bus, PendingReload},
    driver,
    error::DriverError,
    match_rules::MatchError,
    peer,
    peers,
};

/// The `GetConnectionCredentials` reply dictionary. Absent credentials are
/// left out of the dict entirely.
#[derive(Debug, Default, Clone, PartialEq, Eq, SerializeDict, DeserializeDict, Type)]
#[zvariant(signature = "a{sv}")]
pub struct ConnectionCredentials {
    #[zvariant(rename = "UnixUserID")]
    pub unix_user_id: Option<u32>,
    #[zvariant(rename = "ProcessID")]
    pub process_id: Option<u32>,
    #[zvariant(rename = "LinuxSecurityLabel")]
    pub linux_security_label: Option<Vec<u8>>,
}

struct ResolvedCredentials {
    uid: u32,
    pid: u32,
    seclabel: Option<Vec<u8>>,
}

/// Credentials of whatever `name` resolves to; the bus's own when asked
/// about `org.freedesktop.DBus`.
fn resolve_credentials(bus: &Bus, name: &str) -> Result<ResolvedCredentials, DriverError> {
    if name == BUS_NAME {
        return Ok(ResolvedCredentials {
            uid: bus.uid().as_raw(),
            pid: bus.pid(),
            seclabel: bus.seclabel().map(<[u8]>::to_vec),
        });
    }

    let id = bus.find_peer_by_name(name).ok_or(DriverError::PeerNotFound)?;
    let peer = bus.peers().get(id).ok_or(DriverError::PeerNotFound)?;
    let creds = peer.credentials();

    Ok(ResolvedCredentials {
        uid: creds.uid.as_raw(),
        pid: creds.pid,
        seclabel: creds.seclabel.clone(),
    })
}

pub(super) fn hello(bus: &mut Bus, peer_id: u64, call: &MethodCall<'_>) -> Result<(), DriverError> {
    {
        let peer = bus
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| anyhow!("unknown peer :1.{peer_id}"))?;
        if peer.is_registered() {
            return Err(DriverError::PeerAlreadyRegistered);
        }
        peer.register();
    }

    let unique_name = peers::unique_address(peer_id);
    driver::send_reply(bus, peer_id, call, &(unique_name.as_str(),))?;
    driver::name_owner_changed(bus, None, None, Some(peer_id))?;

    Ok(())
}

pub(super) fn request_name(
    bus: &mut Bus,
    peer_id: u64,
    call: &MethodCall<'_>,
) -> Result<(), DriverError> {
    let (name, flags): (String, u32) = call.read()?;

    if name == BUS_NAME {
        return Err(DriverError::NameReserved);
    }
    if name.starts_with(':') {
        return Err(DriverError::NameUnique);
    }
    if WellKnownName::try_from(name.as_str()).is_err() {
        return Err(DriverError::NameInvalid);
    }

    {
        let peer = bus
            .peers
            .get(peer_id)
            .ok_or_else(|| anyhow!("unknown peer :1.{peer_id}"))?;
        if peer.policy().check_own(&name).is_err() {
            warn!(
                sender = peer_id,
                name = %name,
                "A security policy denied {} to own the name.",
                peer.unique_name()
            );
            return Err(DriverError::NameRefused);
        }
    }

    let flags = BitFlags::<RequestNameFlags>::from_bits_truncate(flags);
    let (reply, change) = {
        let (peers, names) = bus.registries_mut();
        names.request_name(peers, &name, peer_id, flags)?
    };

    if let Some(change) = change {
        driver::name_owner_changed(bus, Some(&change.name), change.old, change.new)?;
        driver::name_activated(bus, &change.name)?;
    }

    driver::send_reply(bus, peer_id, call, &(reply as u32,))?;

    Ok(())
}

pub(super) fn release_name(
    bus: &mut Bus,
    peer_id: u64,
    call: &MethodCall<'_>,
) -> Result<(), DriverError> {
    let name: String = call.read()?;

    if name == BUS_NAME {
        return Err(DriverError::NameReserved);
    }
    if name.starts_with(':') {
        return Err(DriverError::NameUnique);
    }
    if WellKnownName::try_from(name.as_str()).is_err() {
        return Err(DriverError::NameInvalid);
    }

    let (reply, change) = {
        let (peers, names) = bus.registries_mut();
        names.release_name(peers, &name, peer_id)
    };

    if let Some(change) = change {
        driver::name_owner_changed(bus, Some(&change.name), change.old, change.new)?;
    }

    driver::send_reply(bus, peer_id, call, &(reply as u32,))?;

    Ok(())
}

pub(super) fn list_queued_owners(
    bus: &mut Bus,
    peer_id: u64,
    call: &MethodCall<'_>,
) -> Result<(), DriverError> {
    let name: String = call.read()?;

    let mut owners = Vec::new();
    if name == BUS_NAME {
        owners.push(BUS_NAME.to_string());
    } else if let Some(id) = peers::unique_address_id(&name) {
        if !bus.peers.get(id).map(|p| p.is_registered()).unwrap_or(false) {
            return Err(DriverError::NameNotFound);
        }
        owners.push(peers::unique_address(id));
    } else {
        let entry = bus.names.get(&name).ok_or(DriverError::NameNotFound)?;
        if entry.primary().is_none() {
            return Err(DriverError::NameNotFound);
        }
        owners.extend(entry.owners().map(|o| peers::unique_address(o.peer_id)));
    }

    driver::send_reply(bus, peer_id, call, &(owners,))?;

    Ok(())
}

pub(super) fn list_names(
    bus: &mut Bus,
    peer_id: u64,
    call: &MethodCall<'_>,
) -> Result<(), DriverError> {
    let mut names = vec![BUS_NAME.to_string()];
    names.extend(
        bus.peers
            .iter()
            .filter(|(_, peer)| peer.is_registered())
            .map(|(id, _)| peers::unique_address(id)),
    );
    names.extend(
        bus.names
            .iter()
            .filter(|(_, entry)| entry.primary().is_some())
            .map(|(name, _)| name.clone()),
    );

    driver::send_reply(bus, peer_id, call, &(names,))?;

    Ok(())
}

pub(super) fn list_activatable_names(
    bus: &mut Bus,
    peer_id: u64,
    call: &MethodCall<'_>,
) -> Result<(), DriverError> {
    let mut names = vec![BUS_NAME.to_string()];
    names.extend(
        bus.names
            .iter()
            .filter(|(_, entry)| entry.activation().is_some())
            .map(|(name, _)| name.clone()),
    );

    driver::send_reply(bus, peer_id, call, &(names,))?;

    Ok(())
}

pub(super) fn name_has_owner(
    bus: &mut Bus,
    peer_id: u64,
    call: &MethodCall<'_>,
) -> Result<(), DriverError> {
    let name: String = call.read()?;
    let has_owner = name == BUS_NAME || bus.find_peer_by_name(&name).is_some();

    driver::send_reply(bus, peer_id, call, &(has_owner,))?;

    Ok(())
}

pub(super) fn start_service_by_name(
    bus: &mut Bus,
    peer_id: u64,
    call: &MethodCall<'_>,
) -> Result<(), DriverError> {
    // The flags are silently ignored.
    let (name, _flags): (String, u32) = call.read()?;

    let mut need_launch = false;
    let running = {
        let entry = bus
            .names
            .get_mut(&name)
            .filter(|entry| entry.activation().is_some())
            .ok_or(DriverError::NameNotActivatable)?;
        let has_primary = entry.primary().is_some();
        if !has_primary {
            let activation = entry
                .activation
                .as_mut()
                .ok_or(DriverError::NameNotActivatable)?;
            activation.queue_request(peer_id, call.msg)?;
            need_launch = !std::mem::replace(&mut activation.requested, true);
        }

        has_primary
    };

    if need_launch {
        bus.launcher().launch(&name);
    }
    if running {
        driver::send_reply(bus, peer_id, call, &(START_REPLY_ALREADY_RUNNING,))?;
    }
    // Otherwise the reply is deferred until the activation resolves.

    Ok(())
}

pub(super) fn update_activation_environment(
    bus: &mut Bus,
    peer_id: u64,
    call: &MethodCall<'_>,
) -> Result<(), DriverError> {
    {
        let peer = bus
            .peers
            .get(peer_id)
            .ok_or_else(|| anyhow!("unknown peer :1.{peer_id}"))?;
        if !bus.is_privileged(peer) {
            return Err(DriverError::PeerNotPrivileged);
        }
    }

    let env: HashMap<String, String> = call.read()?;
    let pairs: Vec<(String, String)> = env.into_iter().collect();
    bus.parent()
        .update_environment(&pairs)
        .map_err(|_| DriverError::ForwardFailed)?;

    driver::send_reply(bus, peer_id, call, &())?;

    Ok(())
}

pub(super) fn get_name_owner(
    bus: &mut Bus,
    peer_id: u64,
    call: &MethodCall<'_>,
) -> Result<(), DriverError> {
    let name: String = call.read()?;

    let owner = if name == BUS_NAME {
        BUS_NAME.to_string()
    } else {
        let id = bus
            .find_peer_by_name(&name)
            .ok_or(DriverError::NameOwnerNotFound)?;
        peers::unique_address(id)
    };

    driver::send_reply(bus, peer_id, call, &(owner.as_str(),))?;

    Ok(())
}

pub(super) fn get_connection_unix_user(
    bus: &mut Bus,
    peer_id: u64,
    call: &MethodCall<'_>,
) -> Result<(), DriverError> {
    let name: String = call.read()?;
    let creds = resolve_credentials(bus, &name)?;

    driver::send_reply(bus, peer_id, call, &(creds.uid,))?;

    Ok(())
}

pub(super) fn get_connection_unix_process_id(
    bus: &mut Bus,
    peer_id: u64,
    call: &MethodCall<'_>,
) -> Result<(), DriverError> {
    let name: String = call.read()?;
    let creds = resolve_credentials(bus, &name)?;

    driver::send_reply(bus, peer_id, call, &(creds.pid,))?;

    Ok(())
}

pub(super) fn get_connection_credentials(
    bus: &mut Bus,
    peer_id: u64,
    call: &MethodCall<'_>,
) -> Result<(), DriverError> {
    let name: String = call.read()?;
    let resolved = resolve_credentials(bus, &name)?;

    let mut credentials = ConnectionCredentials {
        unix_user_id: Some(resolved.uid),
        process_id: Some(resolved.pid),
        linux_security_label: None,
    };
    if let Some(mut label) = resolved.seclabel {
        // The security label is reported with the mandated trailing NUL.
        label.push(0);
        credentials.linux_security_label = Some(label);
    }

    driver::send_reply(bus, peer_id, call, &credentials)?;

    Ok(())
}

pub(super) fn get_adt_audit_session_data(
    bus: &mut Bus,
    _peer_id: u64,
    call: &MethodCall<'_>,
) -> Result<(), DriverError> {
    let name: String = call.read()?;

    // The name is resolved first so an unknown peer is reported as such.
    if name != BUS_NAME {
        bus.find_peer_by_name(&name).ok_or(DriverError::PeerNotFound)?;
    }

    // ADT audit session data is not a thing on Linux.
    Err(DriverError::AdtNotSupported)
}

pub(super) fn get_connection_selinux_security_context(
    bus: &mut Bus,
    peer_id: u64,
    call: &MethodCall<'_>,
) -> Result<(), DriverError> {
    let name: String = call.read()?;
    let resolved = resolve_credentials(bus, &name)?;

    if !bus.selinux_enabled() {
        return Err(DriverError::SelinuxNotSupported);
    }

    // Unlike the LinuxSecurityLabel credential, no trailing NUL here.
    driver::send_reply(bus, peer_id, call, &(resolved.seclabel.unwrap_or_default(),))?;

    Ok(())
}

pub(super) fn add_match(
    bus: &mut Bus,
    peer_id: u64,
    call: &MethodCall<'_>,
) -> Result<(), DriverError> {
    let rule: String = call.read()?;

    {
        let peer = bus
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| anyhow!("unknown peer :1.{peer_id}"))?;
        if peer.matches.len() >= peer::MAX_MATCH_RULES {
            return Err(DriverError::Quota);
        }
        peer.matches
            .add(&rule)
            .map_err(|_| DriverError::MatchInvalid)?;
    }

    driver::send_reply(bus, peer_id, call, &())?;

    Ok(())
}

pub(super) fn remove_match(
    bus: &mut Bus,
    peer_id: u64,
    call: &MethodCall<'_>,
) -> Result<(), DriverError> {
    let rule: String = call.read()?;

    {
        let peer = bus
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| anyhow!("unknown peer :1.{peer_id}"))?;
        peer.matches.remove(&rule).map_err(|e| match e {
            MatchError::NotFound => DriverError::MatchNotFound,
            MatchError::Invalid => DriverError::MatchInvalid,
        })?;
    }

    driver::send_reply(bus, peer_id, call, &())?;

    Ok(())
}

pub(super) fn reload_config(
    bus: &mut Bus,
    peer_id: u64,
    call: &MethodCall<'_>,
) -> Result<(), DriverError> {
    bus.parent()
        .reload_config(peer_id, call.serial)
        .map_err(|_| DriverError::ForwardFailed)?;

    // No reply yet; the parent calls back into the driver once done.
    bus.pending_reloads.push(PendingReload {
        sender_id: peer_id,
        serial: call.serial,
        call: call.msg.clone(),
    });

    Ok(())
}

pub(super) fn get_id(
    bus: &mut Bus,
    peer_id: u64,
    call: &MethodCall<'_>,
) -> Result<(), DriverError> {
    let id = bus.guid().as_str().to_string();

    driver::send_reply(bus, peer_id, call, &(id.as_str(),))?;

    Ok(())
}
