//! The dispatch core.
//!
//! Everything a peer sends enters through [`dispatch`]: calls addressed to
//! `org.freedesktop.DBus` are handled by the built-in method tables in
//! [`crate::fdo`], everything else is forwarded — unicast to a resolved
//! destination (or parked on an activation), broadcast through the match
//! registries. Peer teardown ([`goodbye`]) and the launcher/parent
//! callbacks re-enter the driver through the functions at the bottom.

#[cfg(unix)]
use std::os::fd::AsRawFd;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::warn;
use zbus::{zvariant::Type, Message, MessageBuilder, MessageFlags, MessageType};

use crate::{
    bus::Bus,
    connection::EnqueueError,
    error::DriverError,
    fdo::{self, MethodCall},
    peer::Peer,
    peers::{self, PeerRegistry, SendSource},
    policy::{ReceiveContext, SendContext},
    replies,
};

/// What the embedding broker has to do with the sender after a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    /// The sender violated the protocol; drop its connection.
    Disconnect,
}

/// Dispatch one message from a connected peer.
///
/// Protocol violations (malformed headers, traffic from monitors, routing
/// before `Hello`) ask for the sender to be disconnected; handler-level
/// failures are translated to D-Bus errors and sent back to the sender.
/// Only infrastructure failures surface as `Err`.
pub fn dispatch(bus: &mut Bus, peer_id: u64, msg: Arc<Message>) -> Result<Disposition> {
    let peer = bus
        .peers
        .get(peer_id)
        .ok_or_else(|| anyhow!("dispatch for unknown peer :1.{peer_id}"))?;
    if peer.is_monitor() {
        warn!(
            "Monitor {} sent a message, which is against the rules.",
            peer.unique_name()
        );
        return Ok(Disposition::Disconnect);
    }

    if msg.message_type() == MessageType::Invalid || msg.header().is_err() {
        return Ok(Disposition::Disconnect);
    }
    let msg = match stitch_sender(&msg, peer_id) {
        Ok(msg) => msg,
        Err(_) => return Ok(Disposition::Disconnect),
    };

    match dispatch_internal(bus, peer_id, &msg) {
        Ok(()) => Ok(Disposition::Continue),
        Err(DriverError::Fatal(e)) => Err(e),
        Err(
            DriverError::PeerNotRegistered
            | DriverError::InvalidMessage
            | DriverError::ProtocolViolation,
        ) => Ok(Disposition::Disconnect),
        Err(e) => {
            send_error(bus, peer_id, &msg, &e)?;

            Ok(Disposition::Continue)
        }
    }
}

fn dispatch_internal(bus: &mut Bus, peer_id: u64, msg: &Arc<Message>) -> Result<(), DriverError> {
    monitor_mirror(bus, msg)?;

    let header = msg.header().map_err(|_| DriverError::InvalidMessage)?;
    let destination = header
        .destination()
        .map_err(|_| DriverError::InvalidMessage)?
        .map(|d| d.to_string());
    let msg_type = msg.message_type();

    if msg_type == MessageType::MethodCall && destination.is_none() {
        // The empty destination is a special peer implementing only the
        // org.freedesktop.DBus.Peer interface.
        let interface = header
            .interface()
            .map_err(|_| DriverError::InvalidMessage)?
            .map(|i| i.to_string());
        if interface.is_some_and(|i| i != "org.freedesktop.DBus.Peer") {
            return Err(DriverError::UnexpectedMethod);
        }
        let call = MethodCall::new(msg, &header)?;

        return fdo::dispatch_method(bus, peer_id, fdo::PEER_METHODS, &call);
    }

    if destination.as_deref() == Some(fdo::BUS_NAME) {
        let registered = is_registered(bus, peer_id);
        return match fdo::dispatch_interface(bus, peer_id, msg, &header) {
            Err(DriverError::UnexpectedInterface | DriverError::UnexpectedMethod)
                if !registered =>
            {
                Err(DriverError::PeerNotYetRegistered)
            }
            other => other,
        };
    }

    if !is_registered(bus, peer_id) {
        return Err(DriverError::PeerNotRegistered);
    }

    match destination {
        None => {
            if msg_type == MessageType::Signal {
                forward_broadcast(bus, peer_id, msg)
            } else {
                Err(DriverError::UnexpectedMessageType)
            }
        }
        Some(destination) => match msg_type {
            MessageType::Signal | MessageType::MethodCall => {
                forward_unicast(bus, peer_id, &destination, msg)
            }
            MessageType::MethodReturn | MessageType::Error => {
                queue_reply(bus, peer_id, &destination, msg)
            }
            _ => Err(DriverError::UnexpectedMessageType),
        },
    }
}

fn is_registered(bus: &Bus, peer_id: u64) -> bool {
    bus.peers
        .get(peer_id)
        .map(Peer::is_registered)
        .unwrap_or(false)
}

/// The serial replies must quote, or 0 when the sender does not want one.
pub(crate) fn read_serial(msg: &Message) -> u32 {
    if msg
        .primary_header()
        .flags()
        .contains(MessageFlags::NoReplyExpected)
    {
        return 0;
    }

    msg.primary_header().serial_num().copied().unwrap_or(0)
}

/// Ensure the sender field carries the peer's own address, rebuilding the
/// message when the peer left it out (or lied about it).
fn stitch_sender(msg: &Arc<Message>, peer_id: u64) -> zbus::Result<Arc<Message>> {
    let address = peers::unique_address(peer_id);
    let header = msg.header()?;
    if let Some(sender) = header.sender()? {
        if sender.as_str() == address {
            return Ok(msg.clone());
        }
    }

    let signature = match header.signature()? {
        Some(signature) => signature.clone(),
        None => <()>::signature(),
    };
    let body = msg.body_as_bytes()?;
    let builder = MessageBuilder::from(header.clone()).sender(address.as_str())?;
    let new_msg = unsafe {
        builder.build_raw_body(
            body,
            signature,
            #[cfg(unix)]
            msg.take_fds().iter().map(|fd| fd.as_raw_fd()).collect(),
        )?
    };

    Ok(Arc::new(new_msg))
}

fn log_quota_disconnect(
    sender_id: Option<u64>,
    sender_names: &[String],
    receiver: &Peer,
    msg: &Message,
    what: &str,
) {
    warn!(
        sender = ?sender_id,
        ?sender_names,
        receiver = receiver.id(),
        receiver_names = ?receiver.owned_names_vec(),
        receiver_seclabel = ?receiver.policy().seclabel,
        message = ?msg,
        "Peer {} is being disconnected as it does not have the resources to receive {}.",
        receiver.unique_name(),
        what
    );
}

/// Mirror a routed message to every monitor whose rules select it.
///
/// Mirroring is a side effect of routing: failures to enqueue on a monitor
/// never affect the actual dispatch, except that a monitor over quota is
/// disconnected and any other queue failure is fatal.
pub(crate) fn monitor_mirror(bus: &Bus, msg: &Arc<Message>) -> Result<()> {
    if bus.n_monitors == 0 {
        return Ok(());
    }

    for (id, peer) in bus.peers.iter() {
        if !peer.is_monitor() || !peer.matches.matches(msg, &bus.names) {
            continue;
        }
        match peer.conn().enqueue(msg.clone()) {
            Ok(()) => (),
            Err(EnqueueError::Quota) => {
                peer.conn().shutdown();
                log_quota_disconnect(None, &[], peer, msg, "a message it subscribed to");
            }
            Err(EnqueueError::Closed) => {
                return Err(anyhow!("connection queue of monitor :1.{id} closed"));
            }
        }
    }

    Ok(())
}

/// Queue a driver-originated message on a peer, mirroring it to monitors
/// on the way.
pub(crate) fn send_unicast(bus: &Bus, receiver_id: u64, msg: &Arc<Message>) -> Result<()> {
    monitor_mirror(bus, msg)?;

    let Some(receiver) = bus.peers.get(receiver_id) else {
        return Ok(());
    };
    match receiver.conn().enqueue(msg.clone()) {
        Ok(()) => Ok(()),
        Err(EnqueueError::Quota) => {
            receiver.conn().shutdown();
            log_quota_disconnect(
                None,
                &[],
                receiver,
                msg,
                "a reply or unicast signal it expects",
            );

            Ok(())
        }
        Err(EnqueueError::Closed) => Err(anyhow!(
            "connection queue of :1.{receiver_id} closed during dispatch"
        )),
    }
}

fn send_error(bus: &Bus, receiver_id: u64, call: &Arc<Message>, e: &DriverError) -> Result<()> {
    let Some(error_name) = e.dbus_name() else {
        return Ok(());
    };

    send_error_named(bus, receiver_id, call, error_name, &e.to_string())
}

/// Answer `call` with a D-Bus error. Discarded when no reply was expected.
pub(crate) fn send_error_named(
    bus: &Bus,
    receiver_id: u64,
    call: &Message,
    error_name: &str,
    text: &str,
) -> Result<()> {
    if read_serial(call) == 0 {
        return Ok(());
    }

    let header = call.header()?;
    let msg = MessageBuilder::error(&header, error_name)?
        .sender(fdo::BUS_NAME)?
        .build(&(text,))?;

    send_unicast(bus, receiver_id, &Arc::new(msg))
}

/// Answer `call` with a method return. Discarded when no reply was
/// expected.
pub(crate) fn send_reply_to_call<B>(
    bus: &Bus,
    receiver_id: u64,
    call: &Message,
    body: &B,
) -> Result<()>
where
    B: serde::ser::Serialize + zbus::zvariant::DynamicType,
{
    if read_serial(call) == 0 {
        return Ok(());
    }

    let header = call.header()?;
    let msg = MessageBuilder::method_return(&header)?
        .sender(fdo::BUS_NAME)?
        .build(body)?;

    send_unicast(bus, receiver_id, &Arc::new(msg))
}

pub(crate) fn send_reply<B>(
    bus: &Bus,
    receiver_id: u64,
    call: &MethodCall<'_>,
    body: &B,
) -> Result<()>
where
    B: serde::ser::Serialize + zbus::zvariant::DynamicType,
{
    send_reply_to_call(bus, receiver_id, call.msg, body)
}

fn notify_name_lost(bus: &Bus, peer_id: u64, name: &str) -> Result<()> {
    let msg = MessageBuilder::signal(fdo::PATH, fdo::BUS_NAME, "NameLost")?
        .sender(fdo::BUS_NAME)?
        .destination(peers::unique_address(peer_id).as_str())?
        .build(&(name,))?;

    send_unicast(bus, peer_id, &Arc::new(msg))
}

fn notify_name_acquired(bus: &Bus, peer_id: u64, name: &str) -> Result<()> {
    let msg = MessageBuilder::signal(fdo::PATH, fdo::BUS_NAME, "NameAcquired")?
        .sender(fdo::BUS_NAME)?
        .destination(peers::unique_address(peer_id).as_str())?
        .build(&(name,))?;

    send_unicast(bus, peer_id, &Arc::new(msg))
}

fn notify_name_owner_changed(bus: &Bus, name: &str, old: &str, new: &str) -> Result<()> {
    let msg = Arc::new(
        MessageBuilder::signal(fdo::PATH, fdo::BUS_NAME, "NameOwnerChanged")?
            .sender(fdo::BUS_NAME)?
            .build(&(name, old, new))?,
    );

    for (id, peer) in bus.peers.iter() {
        let eligible = match peer.state() {
            crate::peer::PeerState::Registered | crate::peer::PeerState::Monitor => {
                peer.matches.matches(&msg, &bus.names)
            }
            crate::peer::PeerState::Unregistered => false,
        };
        if !eligible {
            continue;
        }

        let ctx = ReceiveContext {
            sender_names: &[],
            interface: Some(fdo::BUS_NAME),
            member: Some("NameOwnerChanged"),
            path: Some(fdo::PATH),
            msg_type: MessageType::Signal,
            broadcast: true,
            unix_fds: 0,
        };
        if peer.policy().check_receive(&ctx).is_err() {
            continue;
        }

        match peer.conn().enqueue(msg.clone()) {
            Ok(()) => (),
            Err(EnqueueError::Quota) => {
                peer.conn().shutdown();
                log_quota_disconnect(None, &[], peer, &msg, "a signal it subscribed to");
            }
            Err(EnqueueError::Closed) => {
                return Err(anyhow!("connection queue of :1.{id} closed"));
            }
        }
    }

    Ok(())
}

/// Emit the full triple for one ownership transition: `NameLost` to the old
/// owner, `NameOwnerChanged` to everyone subscribed, `NameAcquired` to the
/// new owner, in exactly that order. Without an explicit name this
/// describes a peer appearing or disappearing and the name is its unique
/// address.
pub(crate) fn name_owner_changed(
    bus: &Bus,
    name: Option<&str>,
    old: Option<u64>,
    new: Option<u64>,
) -> Result<()> {
    debug_assert!(old.is_some() || new.is_some());

    let old_address = old.map(peers::unique_address);
    let new_address = new.map(peers::unique_address);
    let name = match name {
        Some(name) => name.to_string(),
        None => old_address
            .clone()
            .or_else(|| new_address.clone())
            .unwrap_or_default(),
    };

    if let Some(old_id) = old {
        notify_name_lost(bus, old_id, &name)?;
    }
    notify_name_owner_changed(
        bus,
        &name,
        old_address.as_deref().unwrap_or(""),
        new_address.as_deref().unwrap_or(""),
    )?;
    if let Some(new_id) = new {
        notify_name_acquired(bus, new_id, &name)?;
    }

    Ok(())
}

/// The peer-layer unicast queueing contract: send policy, receive policy,
/// reply-slot allocation, quota-aware enqueue.
pub(crate) fn queue_unicast(
    peers: &mut PeerRegistry,
    src: &SendSource,
    receiver_id: u64,
    msg: &Arc<Message>,
) -> Result<(), DriverError> {
    let header = msg.header().map_err(|_| DriverError::InvalidMessage)?;
    let interface = header
        .interface()
        .ok()
        .flatten()
        .map(|i| i.to_string());
    let member = header.member().ok().flatten().map(|m| m.to_string());
    let path = header.path().ok().flatten().map(|p| p.to_string());
    let unix_fds = header.unix_fds().ok().flatten().unwrap_or(0);
    let msg_type = msg.message_type();

    let receiver_names = match peers.get(receiver_id) {
        Some(receiver) => receiver.owned_names_vec(),
        None => return Err(DriverError::DestinationNotFound),
    };

    let send_ctx = SendContext {
        destination_names: &receiver_names,
        interface: interface.as_deref(),
        member: member.as_deref(),
        path: path.as_deref(),
        msg_type,
        broadcast: false,
        unix_fds,
    };
    if let Err(e) = src.policy.check_send(&send_ctx) {
        warn!(
            sender = src.id,
            sender_names = ?src.names,
            sender_seclabel = ?src.policy.seclabel,
            receiver = receiver_id,
            ?receiver_names,
            message = ?msg,
            error = ?e,
            "A security policy denied :1.{} to send a message to :1.{}.",
            src.id,
            receiver_id
        );
        return Err(DriverError::SendDenied);
    }

    let receive_denied = {
        let receiver = peers
            .get(receiver_id)
            .ok_or(DriverError::DestinationNotFound)?;
        let recv_ctx = ReceiveContext {
            sender_names: &src.names,
            interface: interface.as_deref(),
            member: member.as_deref(),
            path: path.as_deref(),
            msg_type,
            broadcast: false,
            unix_fds,
        };
        receiver.policy().check_receive(&recv_ctx).is_err()
    };
    if receive_denied {
        warn!(
            sender = src.id,
            sender_names = ?src.names,
            receiver = receiver_id,
            ?receiver_names,
            message = ?msg,
            "A security policy denied :1.{} to receive a message from :1.{}.",
            receiver_id,
            src.id
        );
        return Err(DriverError::ReceiveDenied);
    }

    // Method calls that expect a reply reserve their reply slot first.
    let serial = read_serial(msg);
    let wants_reply =
        msg_type == MessageType::MethodCall && serial != 0 && peers.get(src.id).is_some();
    if wants_reply {
        replies::allocate(peers, src.id, receiver_id, serial, msg)?;
    }

    let enqueued = peers
        .get(receiver_id)
        .map(|receiver| receiver.conn().enqueue(msg.clone()));
    match enqueued {
        None | Some(Ok(())) => Ok(()),
        Some(Err(EnqueueError::Quota)) => {
            if wants_reply {
                replies::consume(peers, receiver_id, src.id, serial);
            }

            Err(DriverError::Quota)
        }
        Some(Err(EnqueueError::Closed)) => {
            Err(anyhow!("connection queue of :1.{receiver_id} closed").into())
        }
    }
}

fn forward_unicast(
    bus: &mut Bus,
    sender_id: u64,
    destination: &str,
    msg: &Arc<Message>,
) -> Result<(), DriverError> {
    let src = SendSource::capture(&bus.peers, sender_id)
        .ok_or_else(|| anyhow!("unknown sender :1.{sender_id}"))?;

    let Some(receiver_id) = bus.find_peer_by_name(destination) else {
        if msg
            .primary_header()
            .flags()
            .contains(MessageFlags::NoAutoStart)
        {
            return Err(DriverError::DestinationNotFound);
        }

        let need_launch = {
            let Some(activation) = bus
                .names
                .get_mut(destination)
                .and_then(|name| name.activation.as_mut())
            else {
                return Err(DriverError::NameNotActivatable);
            };
            activation.queue_message(src, msg)?;
            !std::mem::replace(&mut activation.requested, true)
        };
        if need_launch {
            bus.launcher().launch(destination);
        }

        return Ok(());
    };

    queue_unicast(&mut bus.peers, &src, receiver_id, msg)
}

fn forward_broadcast(bus: &Bus, sender_id: u64, msg: &Arc<Message>) -> Result<(), DriverError> {
    let src = SendSource::capture(&bus.peers, sender_id)
        .ok_or_else(|| anyhow!("unknown sender :1.{sender_id}"))?;

    let header = msg.header().map_err(|_| DriverError::InvalidMessage)?;
    let interface = header.interface().ok().flatten().map(|i| i.to_string());
    let member = header.member().ok().flatten().map(|m| m.to_string());
    let path = header.path().ok().flatten().map(|p| p.to_string());
    let unix_fds = header.unix_fds().ok().flatten().unwrap_or(0);

    for (id, peer) in bus.peers.iter() {
        if !peer.is_registered() || !peer.matches.matches(msg, &bus.names) {
            continue;
        }

        let receiver_names = peer.owned_names_vec();
        let send_ctx = SendContext {
            destination_names: &receiver_names,
            interface: interface.as_deref(),
            member: member.as_deref(),
            path: path.as_deref(),
            msg_type: MessageType::Signal,
            broadcast: true,
            unix_fds,
        };
        if src.policy.check_send(&send_ctx).is_err() {
            continue;
        }
        let recv_ctx = ReceiveContext {
            sender_names: &src.names,
            interface: interface.as_deref(),
            member: member.as_deref(),
            path: path.as_deref(),
            msg_type: MessageType::Signal,
            broadcast: true,
            unix_fds,
        };
        if peer.policy().check_receive(&recv_ctx).is_err() {
            continue;
        }

        match peer.conn().enqueue(msg.clone()) {
            Ok(()) => (),
            Err(EnqueueError::Quota) => {
                peer.conn().shutdown();
                log_quota_disconnect(
                    Some(src.id),
                    &src.names,
                    peer,
                    msg,
                    "a signal it subscribed to",
                );
            }
            Err(EnqueueError::Closed) => {
                return Err(anyhow!("connection queue of :1.{id} closed").into());
            }
        }
    }

    Ok(())
}

fn queue_reply(
    bus: &mut Bus,
    sender_id: u64,
    destination: &str,
    msg: &Arc<Message>,
) -> Result<(), DriverError> {
    let reply_serial = msg.reply_serial().ok_or(DriverError::InvalidMessage)?;
    let waiter_id = bus
        .find_peer_by_name(destination)
        .ok_or(DriverError::UnexpectedReply)?;

    replies::consume(&mut bus.peers, sender_id, waiter_id, reply_serial)
        .ok_or(DriverError::UnexpectedReply)?;

    let Some(waiter) = bus.peers.get(waiter_id) else {
        return Ok(());
    };
    match waiter.conn().enqueue(msg.clone()) {
        Ok(()) => Ok(()),
        Err(EnqueueError::Quota) => {
            waiter.conn().shutdown();
            log_quota_disconnect(Some(sender_id), &[], waiter, msg, "a reply it expects");

            Ok(())
        }
        Err(EnqueueError::Closed) => {
            Err(anyhow!("connection queue of :1.{waiter_id} closed").into())
        }
    }
}

/// Unwind all bus state of a peer.
///
/// Used for disconnects and, with `silent` set, for the transition to
/// monitor: names and reply slots are released without any disappearance
/// signalling. Calling it again on an already-unwound peer is a no-op.
pub fn goodbye(bus: &mut Bus, peer_id: u64, silent: bool) -> Result<()> {
    let Some(peer) = bus.peers.get_mut(peer_id) else {
        return Ok(());
    };
    peer.matches.clear();

    // Replies this peer was still waiting for are no longer expected.
    let owned_replies: Vec<(u64, u32)> = std::mem::take(&mut peer.owned_replies)
        .into_iter()
        .collect();
    for (replier_id, serial) in owned_replies {
        if let Some(replier) = bus.peers.get_mut(replier_id) {
            replier.replies.remove(&(peer_id, serial));
        }
    }

    let changes = {
        let (peers, names) = bus.registries_mut();
        names.release_peer(peers, peer_id)
    };
    if !silent {
        for change in &changes {
            name_owner_changed(bus, Some(&change.name), change.old, change.new)?;
        }
    }

    let state = match bus.peers.get(peer_id) {
        Some(peer) => peer.state(),
        None => return Ok(()),
    };
    match state {
        crate::peer::PeerState::Registered => {
            if !silent {
                name_owner_changed(bus, None, Some(peer_id), None)?;
            }
            if let Some(peer) = bus.peers.get_mut(peer_id) {
                peer.unregister();
            }
        }
        crate::peer::PeerState::Monitor => {
            if let Some(peer) = bus.peers.get_mut(peer_id) {
                peer.stop_monitor();
            }
            bus.n_monitors -= 1;
        }
        crate::peer::PeerState::Unregistered => (),
    }

    // Whoever still waits for an answer from this peer gets told there
    // will not be one.
    let pending: Vec<((u64, u32), crate::replies::ReplySlot)> =
        match bus.peers.get_mut(peer_id) {
            Some(peer) => std::mem::take(&mut peer.replies).into_iter().collect(),
            None => Vec::new(),
        };
    for ((waiter_id, serial), slot) in pending {
        if let Some(waiter) = bus.peers.get_mut(waiter_id) {
            waiter.owned_replies.remove(&(peer_id, serial));
        }
        if !silent {
            send_error_named(
                bus,
                waiter_id,
                &slot.call,
                "org.freedesktop.DBus.Error.NoReply",
                "Remote peer disconnected",
            )?;
        }
    }

    Ok(())
}

/// A name with an activation record became owned: complete the pending
/// `StartServiceByName` requests and replay the parked auto-start traffic
/// on the fresh owner.
pub(crate) fn name_activated(bus: &mut Bus, name: &str) -> Result<(), DriverError> {
    let Some(owner) = bus.names.lookup(name) else {
        return Ok(());
    };
    let Some((requests, messages)) = bus.names.get_mut(name).and_then(|entry| {
        let activation = entry.activation.as_mut()?;
        // The launcher must be asked again should the name be dropped.
        activation.requested = false;
        Some((
            std::mem::take(&mut activation.pending_requests),
            std::mem::take(&mut activation.pending_messages),
        ))
    }) else {
        return Ok(());
    };

    for request in requests {
        if bus.peers.get(request.sender_id).is_some() {
            send_reply_to_call(
                bus,
                request.sender_id,
                &request.call,
                &(fdo::START_REPLY_SUCCESS,),
            )?;
        }
    }

    for pending in messages {
        let result = queue_unicast(&mut bus.peers, &pending.source, owner, &pending.msg);
        match result {
            Ok(()) => (),
            Err(DriverError::Fatal(e)) => return Err(e.into()),
            Err(
                e @ (DriverError::Quota
                | DriverError::ExpectedReplyExists
                | DriverError::SendDenied
                | DriverError::ReceiveDenied),
            ) => {
                if bus.peers.get(pending.source.id).is_some() {
                    send_error(bus, pending.source.id, &pending.msg, &e)?;
                }
            }
            Err(_) => (),
        }
    }

    Ok(())
}

/// The launcher gave up on a name: everyone waiting gets an error.
pub fn name_activation_failed(bus: &mut Bus, name: &str) -> Result<()> {
    let Some((requests, messages)) = bus.names.get_mut(name).and_then(|entry| {
        let activation = entry.activation.as_mut()?;
        activation.requested = false;
        Some((
            std::mem::take(&mut activation.pending_requests),
            std::mem::take(&mut activation.pending_messages),
        ))
    }) else {
        return Ok(());
    };

    for request in requests {
        if bus.peers.get(request.sender_id).is_some() {
            send_error_named(
                bus,
                request.sender_id,
                &request.call,
                "org.freedesktop.DBus.Error.ServiceUnknown",
                "Could not activate remote peer.",
            )?;
        }
    }
    for pending in messages {
        if bus.peers.get(pending.source.id).is_some() {
            send_error_named(
                bus,
                pending.source.id,
                &pending.msg,
                "org.freedesktop.DBus.Error.NameHasNoOwner",
                "Could not activate remote peer.",
            )?;
        }
    }

    Ok(())
}

/// The parent applied the configuration; answer the pending `ReloadConfig`.
pub fn reload_config_completed(bus: &mut Bus, sender_id: u64, serial: u32) -> Result<()> {
    if let Some(pending) = bus.take_pending_reload(sender_id, serial) {
        if bus.peers.get(sender_id).is_some() {
            send_reply_to_call(bus, sender_id, &pending.call, &())?;
        }
    }

    Ok(())
}

/// The parent refused the new configuration.
pub fn reload_config_invalid(bus: &mut Bus, sender_id: u64, serial: u32) -> Result<()> {
    if let Some(pending) = bus.take_pending_reload(sender_id, serial) {
        if bus.peers.get(sender_id).is_some() {
            send_error_named(
                bus,
                sender_id,
                &pending.call,
                "org.freedesktop.DBus.Error.Failed",
                "Config invalid. Reload ignored.",
            )?;
        }
    }

    Ok(())
}
