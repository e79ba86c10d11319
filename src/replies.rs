//! Expected-reply accounting.
//!
//! When peer X sends a method call to peer Y with a reply expected, a slot
//! keyed by `(X, serial)` is recorded on Y and back-referenced from X. The
//! slot authorizes exactly one method return or error from Y to X with that
//! reply serial; everything else bounces with `UnexpectedReply`. The slot
//! keeps the original call around so the driver can synthesize a `NoReply`
//! error should Y disappear first.

use std::sync::Arc;

use zbus::Message;

use crate::{error::DriverError, peer, peers::PeerRegistry};

#[derive(Debug)]
pub struct ReplySlot {
    pub(crate) call: Arc<Message>,
}

/// Record that `sender` expects a reply with `serial` from `receiver`.
pub(crate) fn allocate(
    peers: &mut PeerRegistry,
    sender_id: u64,
    receiver_id: u64,
    serial: u32,
    call: &Arc<Message>,
) -> Result<(), DriverError> {
    {
        let Some(receiver) = peers.get(receiver_id) else {
            return Ok(());
        };
        if receiver.replies.contains_key(&(sender_id, serial)) {
            return Err(DriverError::ExpectedReplyExists);
        }
    }
    if let Some(sender) = peers.get(sender_id) {
        if sender.owned_replies.len() >= peer::MAX_PENDING_REPLIES {
            return Err(DriverError::Quota);
        }
    }

    if let Some(receiver) = peers.get_mut(receiver_id) {
        receiver
            .replies
            .insert((sender_id, serial), ReplySlot { call: call.clone() });
    }
    if let Some(sender) = peers.get_mut(sender_id) {
        sender.owned_replies.insert((receiver_id, serial));
    }

    Ok(())
}

/// Consume the slot matching an incoming reply. Returns `None` when no such
/// reply was expected.
pub(crate) fn consume(
    peers: &mut PeerRegistry,
    replier_id: u64,
    waiter_id: u64,
    serial: u32,
) -> Option<ReplySlot> {
    let slot = peers
        .get_mut(replier_id)?
        .replies
        .remove(&(waiter_id, serial))?;
    if let Some(waiter) = peers.get_mut(waiter_id) {
        waiter.owned_replies.remove(&(replier_id, serial));
    }

    Some(slot)
}
