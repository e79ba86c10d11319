//! Per-peer collections of match rules.

use std::collections::BTreeMap;

use thiserror::Error;
use zbus::{MatchRule, Message, OwnedMatchRule};

use crate::{name_registry::NameRegistry, peers};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MatchError {
    #[error("invalid match rule")]
    Invalid,
    #[error("no such match rule")]
    NotFound,
}

#[derive(Debug)]
struct MatchEntry {
    /// Everything the zbus matcher handles correctly, i.e. the rule with
    /// its `sender`/`destination` keys stripped. `None` when nothing is
    /// left over (or for the wildcard rule).
    rule: Option<OwnedMatchRule>,
    /// Sender matcher, applied manually: the zbus matcher compares the
    /// rule's sender literally against the header, but the header always
    /// carries the stamped unique name, so a well-known sender has to be
    /// resolved through the name registry first.
    sender: Option<String>,
    /// Destination matcher, same story: the message may be addressed to a
    /// well-known name that only the registry can resolve.
    destination: Option<String>,
    /// First-argument matcher, kept out of band so `NameOwnerChanged`
    /// subscriptions scoped to a single name are honored independently of
    /// how much argument matching the zbus matcher covers.
    arg0: Option<String>,
    /// The same rule may be added more than once; removal drops one
    /// reference at a time.
    count: usize,
}

impl MatchEntry {
    fn parse(rule_string: &str) -> Result<Self, MatchError> {
        if rule_string.is_empty() {
            // The wildcard rule.
            return Ok(Self {
                rule: None,
                sender: None,
                destination: None,
                arg0: None,
                count: 1,
            });
        }

        let parsed = MatchRule::try_from(rule_string).map_err(|_| MatchError::Invalid)?;
        let sender = parsed.sender().map(|s| s.to_string());
        let destination = parsed.destination().map(|d| d.to_string());

        let stripped = strip_routing_keys(rule_string);
        let rule = if stripped.is_empty() {
            None
        } else {
            Some(
                MatchRule::try_from(stripped.as_str())
                    .map_err(|_| MatchError::Invalid)?
                    .into(),
            )
        };

        Ok(Self {
            rule,
            sender,
            destination,
            arg0: parse_arg0(rule_string),
            count: 1,
        })
    }
}

/// A peer's match rules, keyed by the verbatim rule string.
#[derive(Debug, Default)]
pub struct MatchRules {
    entries: BTreeMap<String, MatchEntry>,
    n_rules: usize,
}

impl MatchRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// A set consisting of the single wildcard rule, as handed to monitors
    /// that subscribed with an empty rule array.
    pub fn wildcard() -> Self {
        let mut rules = Self::new();
        rules.add("").expect("empty rule is the wildcard");
        rules
    }

    pub fn add(&mut self, rule_string: &str) -> Result<(), MatchError> {
        match self.entries.get_mut(rule_string) {
            Some(entry) => entry.count += 1,
            None => {
                let entry = MatchEntry::parse(rule_string)?;
                self.entries.insert(rule_string.to_string(), entry);
            }
        }
        self.n_rules += 1;

        Ok(())
    }

    /// Remove one instance of the rule.
    pub fn remove(&mut self, rule_string: &str) -> Result<(), MatchError> {
        let entry = self
            .entries
            .get_mut(rule_string)
            .ok_or(MatchError::NotFound)?;
        entry.count -= 1;
        if entry.count == 0 {
            self.entries.remove(rule_string);
        }
        self.n_rules -= 1;

        Ok(())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.n_rules = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of rule references, the quantity quotas apply to.
    pub fn len(&self) -> usize {
        self.n_rules
    }

    /// Match the message against the rules.
    ///
    /// Sender and destination expressed as well-known names are resolved
    /// through the name registry before comparing, which the zbus matcher
    /// cannot do on its own.
    pub fn matches(&self, msg: &Message, names: &NameRegistry) -> bool {
        self.entries.values().any(|e| entry_matches(e, msg, names))
    }
}

fn entry_matches(entry: &MatchEntry, msg: &Message, names: &NameRegistry) -> bool {
    // The zbus matcher covers type, path, interface, member and friends;
    // sender and destination were stripped from the rule it sees.
    if let Some(rule) = &entry.rule {
        match rule.matches(msg) {
            Ok(true) => (),
            Ok(false) => return false,
            Err(e) => {
                tracing::warn!("error matching rule: {}", e);

                return false;
            }
        }
    }

    if let Some(want) = &entry.sender {
        let Some(expected) = resolve_to_unique(want, names) else {
            // An unowned well-known sender cannot have sent anything.
            return false;
        };
        let sender = msg
            .header()
            .ok()
            .and_then(|hdr| hdr.sender().ok().flatten().map(|s| s.to_string()));
        if sender.as_deref() != Some(expected.as_str()) {
            return false;
        }
    }

    if let Some(want) = &entry.destination {
        let Some(expected) = resolve_to_unique(want, names) else {
            return false;
        };
        let dest = msg
            .header()
            .ok()
            .and_then(|hdr| hdr.destination().ok().flatten().map(|d| d.to_string()));
        let Some(actual) = dest.as_deref().and_then(|d| resolve_to_unique(d, names)) else {
            return false;
        };
        if actual != expected {
            return false;
        }
    }

    if let Some(want) = &entry.arg0 {
        let first_is_string = msg
            .body_signature()
            .map(|s| s.as_str().starts_with('s'))
            .unwrap_or(false);
        if !first_is_string {
            return false;
        }
        match msg.body_unchecked::<&str>() {
            Ok(arg0) if arg0 == want => (),
            _ => return false,
        }
    }

    true
}

/// The unique address a bus name currently designates. Unique names (and
/// the driver's own name) stand for themselves.
fn resolve_to_unique(name: &str, names: &NameRegistry) -> Option<String> {
    if name.starts_with(':') || name == "org.freedesktop.DBus" {
        return Some(name.to_string());
    }

    names.lookup(name).map(peers::unique_address)
}

/// Drop the `sender`/`destination` components from a rule string; those
/// are matched manually.
fn strip_routing_keys(rule_string: &str) -> String {
    rule_string
        .split(',')
        .filter(|part| {
            let key = part.split_once('=').map(|(key, _)| key.trim());
            !matches!(key, Some("sender") | Some("destination"))
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Pull the `arg0='…'` matcher out of a rule string.
fn parse_arg0(rule_string: &str) -> Option<String> {
    for part in rule_string.split(',') {
        if let Some((key, value)) = part.split_once('=') {
            if key.trim() == "arg0" {
                return Some(value.trim().trim_matches('\'').to_string());
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use zbus::MessageBuilder;

    use super::*;
    use crate::{
        connection::{Connection, EnqueueError, MessageQueue},
        peer::PeerCredentials,
        peers::PeerRegistry,
        policy::PolicySnapshot,
    };

    #[derive(Debug)]
    struct NullQueue;

    impl MessageQueue for NullQueue {
        fn enqueue(&self, _msg: Arc<Message>) -> Result<(), EnqueueError> {
            Ok(())
        }

        fn shutdown(&self) {}
    }

    /// A registry where `com.example.Service` is owned by `:1.0`.
    fn names_with_service() -> NameRegistry {
        let mut peers = PeerRegistry::new();
        peers.add(
            Connection::new(Box::new(NullQueue)),
            PeerCredentials {
                uid: nix::unistd::Uid::from_raw(1000),
                pid: 1,
                seclabel: None,
            },
            PolicySnapshot::allow_all_arc(),
        );
        let mut names = NameRegistry::new();
        names
            .request_name(&mut peers, "com.example.Service", 0, Default::default())
            .unwrap();

        names
    }

    fn signal_from(sender: &str) -> Message {
        MessageBuilder::signal("/com/example/Object", "com.example.Iface", "Changed")
            .unwrap()
            .sender(sender)
            .unwrap()
            .build(&())
            .unwrap()
    }

    #[test]
    fn duplicate_rules_are_reference_counted() {
        let mut rules = MatchRules::new();
        rules.add("type='signal'").unwrap();
        rules.add("type='signal'").unwrap();
        assert_eq!(rules.len(), 2);

        rules.remove("type='signal'").unwrap();
        assert!(!rules.is_empty());
        rules.remove("type='signal'").unwrap();
        assert!(rules.is_empty());
        assert_eq!(rules.remove("type='signal'"), Err(MatchError::NotFound));
    }

    #[test]
    fn garbage_is_rejected() {
        let mut rules = MatchRules::new();
        assert_eq!(rules.add("not a rule"), Err(MatchError::Invalid));
    }

    #[test]
    fn arg0_is_extracted() {
        assert_eq!(
            parse_arg0("type='signal',arg0='com.example.Name'"),
            Some("com.example.Name".to_string())
        );
        assert_eq!(parse_arg0("type='signal'"), None);
    }

    #[test]
    fn routing_keys_are_stripped() {
        assert_eq!(
            strip_routing_keys("type='signal',sender='com.example.Service',member='Changed'"),
            "type='signal',member='Changed'"
        );
        assert_eq!(strip_routing_keys("destination=':1.0'"), "");
    }

    #[test]
    fn well_known_sender_rules_resolve_through_the_registry() {
        let names = names_with_service();
        let mut rules = MatchRules::new();
        rules
            .add("type='signal',sender='com.example.Service'")
            .unwrap();

        // The message carries the stamped unique name of the owner.
        assert!(rules.matches(&signal_from(":1.0"), &names));
        assert!(!rules.matches(&signal_from(":1.9"), &names));

        // With nobody owning the name, nothing can match.
        assert!(!rules.matches(&signal_from(":1.0"), &NameRegistry::new()));
    }

    #[test]
    fn destination_rules_resolve_well_known_destinations() {
        let names = names_with_service();
        let mut rules = MatchRules::new();
        rules.add("destination=':1.0'").unwrap();

        let msg = MessageBuilder::method_call("/com/example/Object", "Frob")
            .unwrap()
            .destination("com.example.Service")
            .unwrap()
            .sender(":1.3")
            .unwrap()
            .build(&())
            .unwrap();
        assert!(rules.matches(&msg, &names));
        assert!(!rules.matches(&msg, &NameRegistry::new()));

        let elsewhere = MessageBuilder::method_call("/com/example/Object", "Frob")
            .unwrap()
            .destination(":1.7")
            .unwrap()
            .sender(":1.3")
            .unwrap()
            .build(&())
            .unwrap();
        assert!(!rules.matches(&elsewhere, &names));
    }
}
