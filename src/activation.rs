//! Pending service activations.
//!
//! A name with an activation record can be started on demand: either
//! explicitly through `StartServiceByName` or implicitly by sending a
//! message to the (absent) name without `NO_AUTO_START`. Both kinds of
//! triggers are parked here until the launcher reports back or the service
//! shows up and takes the name.

use std::sync::Arc;

use zbus::Message;

use crate::{error::DriverError, peers::SendSource};

/// Bounds on how much may pile up behind one not-yet-running service.
const MAX_PENDING_REQUESTS: usize = 256;
const MAX_PENDING_MESSAGES: usize = 256;

/// A `StartServiceByName` call whose reply waits for the activation.
#[derive(Debug)]
pub(crate) struct ActivationRequest {
    pub sender_id: u64,
    pub call: Arc<Message>,
}

/// An auto-start message to be replayed once the service owns the name.
/// The sender's identity is snapshotted so the message can still be
/// delivered (and policy-checked) after the sender disconnected.
#[derive(Debug)]
pub(crate) struct ActivationMessage {
    pub source: SendSource,
    pub msg: Arc<Message>,
}

#[derive(Debug, Default)]
pub struct Activation {
    /// The launcher was asked to start the service and has not reported
    /// back yet.
    pub(crate) requested: bool,
    pub(crate) pending_requests: Vec<ActivationRequest>,
    pub(crate) pending_messages: Vec<ActivationMessage>,
}

impl Activation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_requested(&self) -> bool {
        self.requested
    }

    pub(crate) fn queue_request(
        &mut self,
        sender_id: u64,
        call: &Arc<Message>,
    ) -> Result<(), DriverError> {
        if self.pending_requests.len() >= MAX_PENDING_REQUESTS {
            return Err(DriverError::Quota);
        }
        self.pending_requests.push(ActivationRequest {
            sender_id,
            call: call.clone(),
        });

        Ok(())
    }

    pub(crate) fn queue_message(
        &mut self,
        source: SendSource,
        msg: &Arc<Message>,
    ) -> Result<(), DriverError> {
        if self.pending_messages.len() >= MAX_PENDING_MESSAGES {
            return Err(DriverError::Quota);
        }
        self.pending_messages.push(ActivationMessage {
            source,
            msg: msg.clone(),
        });

        Ok(())
    }
}
