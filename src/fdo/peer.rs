//! The `org.freedesktop.DBus.Peer` interface.
//!
//! Also served for method calls without any destination: the empty
//! destination acts as a special peer implementing just this interface.

use super::MethodCall;
use crate::{bus::Bus, driver, error::DriverError};

pub(super) fn ping(bus: &mut Bus, peer_id: u64, call: &MethodCall<'_>) -> Result<(), DriverError> {
    driver::send_reply(bus, peer_id, call, &())?;

    Ok(())
}

pub(super) fn get_machine_id(
    bus: &mut Bus,
    peer_id: u64,
    call: &MethodCall<'_>,
) -> Result<(), DriverError> {
    let machine_id = bus.machine_id().to_string();

    driver::send_reply(bus, peer_id, call, &(machine_id.as_str(),))?;

    Ok(())
}
