//! The `org.freedesktop.DBus.Properties` interface.
//!
//! The driver exposes exactly two properties, both read-only constants on
//! the `org.freedesktop.DBus` interface.

use std::collections::HashMap;

use zbus::zvariant::{Array, Value};

use super::{MethodCall, BUS_NAME};
use crate::{bus::Bus, driver, error::DriverError};

fn features(bus: &Bus) -> Value<'static> {
    let mut features: Vec<&str> = Vec::new();
    if bus.selinux_enabled() {
        features.push("SELinux");
    }

    Value::Array(Array::from(features))
}

fn interfaces() -> Value<'static> {
    Value::Array(Array::from(vec!["org.freedesktop.DBus.Monitoring"]))
}

pub(super) fn get(bus: &mut Bus, peer_id: u64, call: &MethodCall<'_>) -> Result<(), DriverError> {
    let (interface, property): (String, String) = call.read()?;

    if interface != BUS_NAME {
        return Err(DriverError::UnexpectedInterface);
    }

    let value = match property.as_str() {
        "Features" => features(bus),
        "Interfaces" => interfaces(),
        _ => return Err(DriverError::UnexpectedProperty),
    };

    driver::send_reply(bus, peer_id, call, &(value,))?;

    Ok(())
}

pub(super) fn set(
    _bus: &mut Bus,
    _peer_id: u64,
    call: &MethodCall<'_>,
) -> Result<(), DriverError> {
    let (interface, property, _value): (String, String, Value<'_>) = call.read()?;

    if interface != BUS_NAME {
        return Err(DriverError::UnexpectedInterface);
    }
    if property != "Features" && property != "Interfaces" {
        return Err(DriverError::UnexpectedProperty);
    }

    Err(DriverError::ReadonlyProperty)
}

pub(super) fn get_all(
    bus: &mut Bus,
    peer_id: u64,
    call: &MethodCall<'_>,
) -> Result<(), DriverError> {
    let interface: String = call.read()?;

    if interface != BUS_NAME {
        return Err(DriverError::UnexpectedInterface);
    }

    let mut properties: HashMap<&str, Value<'_>> = HashMap::new();
    properties.insert("Features", features(bus));
    properties.insert("Interfaces", interfaces());

    driver::send_reply(bus, peer_id, call, &(properties,))?;

    Ok(())
}
