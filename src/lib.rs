//! The driver core of a D-Bus message broker.
//!
//! This crate terminates the `org.freedesktop.DBus` service of a message
//! bus: it dispatches calls to the built-in bus interfaces, routes unicast
//! and broadcast traffic between peers, tracks well-known-name ownership
//! (including the `NameOwnerChanged` signalling around every transition),
//! accounts expected replies, mirrors traffic to monitors and hands
//! messages destined for not-yet-running services over to an activation
//! launcher.
//!
//! Socket I/O, authentication and configuration loading are out of scope;
//! they are represented by the contracts in [`connection`], [`policy`] and
//! [`bus`]. An embedding broker feeds parsed [`zbus::Message`]s into
//! [`driver::dispatch`] and drains the per-peer connection queues.

pub mod activation;
pub mod bus;
pub mod connection;
pub mod driver;
pub mod error;
pub mod fdo;
pub mod match_rules;
pub mod name_registry;
pub mod peer;
pub mod peers;
pub mod policy;
pub mod replies;
pub mod tracing_subscriber;
