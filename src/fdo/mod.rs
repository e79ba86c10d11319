//! The built-in interfaces of the bus driver.
//!
//! Five interfaces live on `org.freedesktop.DBus`; each has a static table
//! mapping method names to handlers, with the method's registration
//! requirement, pinned object path and input/output signatures. Dispatch is
//! a linear scan, the tables are small.

mod dbus;
mod introspectable;
mod monitoring;
mod peer;
mod properties;

pub use dbus::ConnectionCredentials;

use std::sync::Arc;

use anyhow::anyhow;
use tracing::warn;
use zbus::{Message, MessageHeader, MessageType};

use crate::{bus::Bus, driver, error::DriverError, policy::SendContext};

pub const BUS_NAME: &str = "org.freedesktop.DBus";
pub const PATH: &str = "/org/freedesktop/DBus";

/// `StartServiceByName` reply codes.
pub const START_REPLY_SUCCESS: u32 = 1;
pub const START_REPLY_ALREADY_RUNNING: u32 = 2;

/// An incoming method call, predigested for the handlers.
pub(crate) struct MethodCall<'m> {
    pub msg: &'m Arc<Message>,
    /// 0 when the caller does not expect a reply.
    pub serial: u32,
    pub member: String,
    pub path: String,
    pub interface: Option<String>,
    /// Body signature as found on the wire; empty for bodyless calls.
    pub signature: String,
}

impl<'m> MethodCall<'m> {
    pub(crate) fn new(
        msg: &'m Arc<Message>,
        header: &MessageHeader<'_>,
    ) -> Result<Self, DriverError> {
        let member = header
            .member()
            .map_err(|_| DriverError::InvalidMessage)?
            .ok_or(DriverError::InvalidMessage)?
            .to_string();
        let path = header
            .path()
            .map_err(|_| DriverError::InvalidMessage)?
            .ok_or(DriverError::InvalidMessage)?
            .to_string();
        let interface = header
            .interface()
            .map_err(|_| DriverError::InvalidMessage)?
            .map(|i| i.to_string());
        let signature = header
            .signature()
            .map_err(|_| DriverError::InvalidMessage)?
            .map(|s| s.to_string())
            .unwrap_or_default();

        Ok(Self {
            msg,
            serial: driver::read_serial(msg),
            member,
            path,
            interface,
            signature,
        })
    }

    /// Deserialize the verified input tuple.
    pub(crate) fn read<'d, B>(&'d self) -> Result<B, DriverError>
    where
        B: zbus::zvariant::DynamicDeserialize<'d>,
    {
        self.msg.body().map_err(|_| DriverError::InvalidMessage)
    }
}

pub(crate) type MethodHandler = fn(&mut Bus, u64, &MethodCall<'_>) -> Result<(), DriverError>;

pub(crate) struct DriverMethod {
    pub name: &'static str,
    /// Skipped (leading to `UnexpectedMethod`) before `Hello`.
    pub needs_registration: bool,
    /// Only callable on this path, or on any path when `None`.
    pub path: Option<&'static str>,
    pub in_sig: &'static str,
    pub out_sig: &'static str,
    pub handler: MethodHandler,
}

pub(crate) struct DriverInterface {
    pub name: &'static str,
    pub methods: &'static [DriverMethod],
}

pub(crate) static DBUS_METHODS: &[DriverMethod] = &[
    DriverMethod {
        name: "Hello",
        needs_registration: false,
        path: None,
        in_sig: "",
        out_sig: "s",
        handler: dbus::hello,
    },
    DriverMethod {
        name: "AddMatch",
        needs_registration: true,
        path: None,
        in_sig: "s",
        out_sig: "",
        handler: dbus::add_match,
    },
    DriverMethod {
        name: "RemoveMatch",
        needs_registration: true,
        path: None,
        in_sig: "s",
        out_sig: "",
        handler: dbus::remove_match,
    },
    DriverMethod {
        name: "RequestName",
        needs_registration: true,
        path: None,
        in_sig: "su",
        out_sig: "u",
        handler: dbus::request_name,
    },
    DriverMethod {
        name: "ReleaseName",
        needs_registration: true,
        path: None,
        in_sig: "s",
        out_sig: "u",
        handler: dbus::release_name,
    },
    DriverMethod {
        name: "GetConnectionCredentials",
        needs_registration: true,
        path: None,
        in_sig: "s",
        out_sig: "a{sv}",
        handler: dbus::get_connection_credentials,
    },
    DriverMethod {
        name: "GetConnectionUnixUser",
        needs_registration: true,
        path: None,
        in_sig: "s",
        out_sig: "u",
        handler: dbus::get_connection_unix_user,
    },
    DriverMethod {
        name: "GetConnectionUnixProcessID",
        needs_registration: true,
        path: None,
        in_sig: "s",
        out_sig: "u",
        handler: dbus::get_connection_unix_process_id,
    },
    DriverMethod {
        name: "GetAdtAuditSessionData",
        needs_registration: true,
        path: None,
        in_sig: "s",
        out_sig: "ay",
        handler: dbus::get_adt_audit_session_data,
    },
    DriverMethod {
        name: "GetConnectionSELinuxSecurityContext",
        needs_registration: true,
        path: None,
        in_sig: "s",
        out_sig: "ay",
        handler: dbus::get_connection_selinux_security_context,
    },
    DriverMethod {
        name: "StartServiceByName",
        needs_registration: true,
        path: None,
        in_sig: "su",
        out_sig: "u",
        handler: dbus::start_service_by_name,
    },
    DriverMethod {
        name: "ListQueuedOwners",
        needs_registration: true,
        path: None,
        in_sig: "s",
        out_sig: "as",
        handler: dbus::list_queued_owners,
    },
    DriverMethod {
        name: "ListNames",
        needs_registration: true,
        path: None,
        in_sig: "",
        out_sig: "as",
        handler: dbus::list_names,
    },
    DriverMethod {
        name: "ListActivatableNames",
        needs_registration: true,
        path: None,
        in_sig: "",
        out_sig: "as",
        handler: dbus::list_activatable_names,
    },
    DriverMethod {
        name: "NameHasOwner",
        needs_registration: true,
        path: None,
        in_sig: "s",
        out_sig: "b",
        handler: dbus::name_has_owner,
    },
    DriverMethod {
        name: "UpdateActivationEnvironment",
        needs_registration: true,
        path: Some(PATH),
        in_sig: "a{ss}",
        out_sig: "",
        handler: dbus::update_activation_environment,
    },
    DriverMethod {
        name: "GetNameOwner",
        needs_registration: true,
        path: None,
        in_sig: "s",
        out_sig: "s",
        handler: dbus::get_name_owner,
    },
    DriverMethod {
        name: "ReloadConfig",
        needs_registration: true,
        path: None,
        in_sig: "",
        out_sig: "",
        handler: dbus::reload_config,
    },
    DriverMethod {
        name: "GetId",
        needs_registration: true,
        path: None,
        in_sig: "",
        out_sig: "s",
        handler: dbus::get_id,
    },
];

pub(crate) static MONITORING_METHODS: &[DriverMethod] = &[DriverMethod {
    name: "BecomeMonitor",
    needs_registration: true,
    path: Some(PATH),
    in_sig: "asu",
    out_sig: "",
    handler: monitoring::become_monitor,
}];

pub(crate) static INTROSPECTABLE_METHODS: &[DriverMethod] = &[DriverMethod {
    name: "Introspect",
    needs_registration: true,
    path: None,
    in_sig: "",
    out_sig: "s",
    handler: introspectable::introspect,
}];

pub(crate) static PEER_METHODS: &[DriverMethod] = &[
    DriverMethod {
        name: "Ping",
        needs_registration: true,
        path: None,
        in_sig: "",
        out_sig: "",
        handler: peer::ping,
    },
    DriverMethod {
        name: "GetMachineId",
        needs_registration: true,
        path: None,
        in_sig: "",
        out_sig: "s",
        handler: peer::get_machine_id,
    },
];

pub(crate) static PROPERTIES_METHODS: &[DriverMethod] = &[
    DriverMethod {
        name: "Get",
        needs_registration: true,
        path: Some(PATH),
        in_sig: "ss",
        out_sig: "v",
        handler: properties::get,
    },
    DriverMethod {
        name: "Set",
        needs_registration: true,
        path: Some(PATH),
        in_sig: "ssv",
        out_sig: "",
        handler: properties::set,
    },
    DriverMethod {
        name: "GetAll",
        needs_registration: true,
        path: Some(PATH),
        in_sig: "s",
        out_sig: "a{sv}",
        handler: properties::get_all,
    },
];

pub(crate) static INTERFACES: &[DriverInterface] = &[
    DriverInterface {
        name: "org.freedesktop.DBus",
        methods: DBUS_METHODS,
    },
    DriverInterface {
        name: "org.freedesktop.DBus.Monitoring",
        methods: MONITORING_METHODS,
    },
    DriverInterface {
        name: "org.freedesktop.DBus.Introspectable",
        methods: INTROSPECTABLE_METHODS,
    },
    DriverInterface {
        name: "org.freedesktop.DBus.Peer",
        methods: PEER_METHODS,
    },
    DriverInterface {
        name: "org.freedesktop.DBus.Properties",
        methods: PROPERTIES_METHODS,
    },
];

/// Find and invoke a method in one interface table. Methods requiring
/// registration are invisible to unregistered peers.
pub(crate) fn dispatch_method(
    bus: &mut Bus,
    peer_id: u64,
    methods: &[DriverMethod],
    call: &MethodCall<'_>,
) -> Result<(), DriverError> {
    let registered = bus
        .peers
        .get(peer_id)
        .map(|p| p.is_registered())
        .unwrap_or(false);

    for method in methods {
        if method.name != call.member {
            continue;
        }
        if registered || !method.needs_registration {
            return handle_method(method, bus, peer_id, call);
        }
    }

    Err(DriverError::UnexpectedMethod)
}

fn handle_method(
    method: &DriverMethod,
    bus: &mut Bus,
    peer_id: u64,
    call: &MethodCall<'_>,
) -> Result<(), DriverError> {
    if let Some(path) = method.path {
        if call.path != path {
            return Err(DriverError::UnexpectedPath);
        }
    }
    if call.signature != method.in_sig {
        return Err(DriverError::UnexpectedSignature);
    }

    (method.handler)(bus, peer_id, call)
}

/// Route a method call addressed to the driver. Non-call messages sent to
/// the driver are dropped on the floor.
pub(crate) fn dispatch_interface(
    bus: &mut Bus,
    peer_id: u64,
    msg: &Arc<Message>,
    header: &MessageHeader<'_>,
) -> Result<(), DriverError> {
    if msg.message_type() != MessageType::MethodCall {
        return Ok(());
    }

    let call = MethodCall::new(msg, header)?;

    {
        let peer = bus
            .peers
            .get(peer_id)
            .ok_or_else(|| anyhow!("unknown peer :1.{peer_id}"))?;
        let ctx = SendContext {
            destination_names: &[],
            interface: call.interface.as_deref(),
            member: Some(&call.member),
            path: Some(&call.path),
            msg_type: MessageType::MethodCall,
            broadcast: false,
            unix_fds: header.unix_fds().ok().flatten().unwrap_or(0),
        };
        if let Err(e) = peer.policy().check_send(&ctx) {
            warn!(
                sender = peer_id,
                sender_names = ?peer.owned_names_vec(),
                sender_seclabel = ?peer.policy().seclabel,
                message = ?msg,
                error = ?e,
                "A security policy denied {} to send method call {}:{}.{} to org.freedesktop.DBus.",
                peer.unique_name(),
                call.path,
                call.interface.as_deref().unwrap_or(""),
                call.member
            );
            return Err(DriverError::SendDenied);
        }
    }

    match call.interface.as_deref() {
        Some(interface) => {
            for iface in INTERFACES {
                if iface.name == interface {
                    return dispatch_method(bus, peer_id, iface.methods, &call);
                }
            }

            Err(DriverError::UnexpectedInterface)
        }
        None => {
            // No interface given: first table with a matching method wins.
            for iface in INTERFACES {
                match dispatch_method(bus, peer_id, iface.methods, &call) {
                    Err(DriverError::UnexpectedMethod) => continue,
                    other => return other,
                }
            }

            Err(DriverError::UnexpectedMethod)
        }
    }
}
