//! Per-peer policy snapshots.
//!
//! The bus configuration is compiled into an immutable snapshot when a peer
//! authenticates; the compiler itself lives outside this crate. The driver
//! only consumes the snapshot: a send check on the sender's snapshot, a
//! receive check on the receiver's, and an ownership check when a name is
//! requested. Rules are evaluated in order, last match wins, like the
//! reference bus configuration language.

use std::sync::Arc;

use thiserror::Error;
use zbus::MessageType;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("denied by mandatory policy")]
    AccessDenied,
    #[error("denied by SELinux policy")]
    SelinuxAccessDenied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Allow,
    Deny,
}

/// Attributes a `<allow send_*>`/`<deny send_*>` rule can constrain.
/// `None` matches anything.
#[derive(Debug, Clone, Default)]
pub struct SendRule {
    pub destination: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<String>,
    pub msg_type: Option<MessageType>,
    pub broadcast: Option<bool>,
    /// The rule was compiled from the SELinux policy rather than the
    /// mandatory bus policy; denials it decides are reported as such.
    pub selinux: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ReceiveRule {
    pub sender: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<String>,
    pub msg_type: Option<MessageType>,
    /// See [`SendRule::selinux`].
    pub selinux: bool,
}

#[derive(Debug, Clone)]
pub struct OwnRule {
    pub name: String,
    /// Match every name under the `name.` prefix (`own_prefix`).
    pub prefix: bool,
}

/// Everything the send check sees about one message transmission.
#[derive(Debug)]
pub struct SendContext<'a> {
    /// Well-known names owned by the receiver; empty when the receiver is
    /// the driver itself.
    pub destination_names: &'a [String],
    pub interface: Option<&'a str>,
    pub member: Option<&'a str>,
    pub path: Option<&'a str>,
    pub msg_type: MessageType,
    pub broadcast: bool,
    pub unix_fds: u32,
}

#[derive(Debug)]
pub struct ReceiveContext<'a> {
    /// Well-known names owned by the sender; empty when the driver sends.
    pub sender_names: &'a [String],
    pub interface: Option<&'a str>,
    pub member: Option<&'a str>,
    pub path: Option<&'a str>,
    pub msg_type: MessageType,
    pub broadcast: bool,
    pub unix_fds: u32,
}

/// Immutable policy view captured at peer-authentication time.
#[derive(Debug, Clone)]
pub struct PolicySnapshot {
    pub seclabel: Option<Vec<u8>>,
    send_default: Access,
    send_rules: Vec<(Access, SendRule)>,
    receive_default: Access,
    receive_rules: Vec<(Access, ReceiveRule)>,
    own_default: Access,
    own_rules: Vec<(Access, OwnRule)>,
}

impl Default for PolicySnapshot {
    fn default() -> Self {
        Self::allow_all()
    }
}

impl PolicySnapshot {
    pub fn allow_all() -> Self {
        Self {
            seclabel: None,
            send_default: Access::Allow,
            send_rules: Vec::new(),
            receive_default: Access::Allow,
            receive_rules: Vec::new(),
            own_default: Access::Allow,
            own_rules: Vec::new(),
        }
    }

    pub fn allow_all_arc() -> Arc<Self> {
        Arc::new(Self::allow_all())
    }

    pub fn with_seclabel(mut self, seclabel: Vec<u8>) -> Self {
        self.seclabel = Some(seclabel);
        self
    }

    pub fn send_rule(mut self, access: Access, rule: SendRule) -> Self {
        self.send_rules.push((access, rule));
        self
    }

    pub fn receive_rule(mut self, access: Access, rule: ReceiveRule) -> Self {
        self.receive_rules.push((access, rule));
        self
    }

    pub fn own_rule(mut self, access: Access, rule: OwnRule) -> Self {
        self.own_rules.push((access, rule));
        self
    }

    pub fn check_send(&self, ctx: &SendContext<'_>) -> Result<(), PolicyError> {
        let mut verdict = (self.send_default, false);
        for (access, rule) in &self.send_rules {
            if send_rule_matches(rule, ctx) {
                verdict = (*access, rule.selinux);
            }
        }
        match verdict {
            (Access::Allow, _) => Ok(()),
            (Access::Deny, false) => Err(PolicyError::AccessDenied),
            (Access::Deny, true) => Err(PolicyError::SelinuxAccessDenied),
        }
    }

    pub fn check_receive(&self, ctx: &ReceiveContext<'_>) -> Result<(), PolicyError> {
        let mut verdict = (self.receive_default, false);
        for (access, rule) in &self.receive_rules {
            if receive_rule_matches(rule, ctx) {
                verdict = (*access, rule.selinux);
            }
        }
        match verdict {
            (Access::Allow, _) => Ok(()),
            (Access::Deny, false) => Err(PolicyError::AccessDenied),
            (Access::Deny, true) => Err(PolicyError::SelinuxAccessDenied),
        }
    }

    pub fn check_own(&self, name: &str) -> Result<(), PolicyError> {
        let mut verdict = self.own_default;
        for (access, rule) in &self.own_rules {
            let matches = if rule.prefix {
                name == rule.name || name.strip_prefix(rule.name.as_str()).is_some_and(|rest| rest.starts_with('.'))
            } else {
                name == rule.name
            };
            if matches {
                verdict = *access;
            }
        }
        match verdict {
            Access::Allow => Ok(()),
            Access::Deny => Err(PolicyError::AccessDenied),
        }
    }
}

fn send_rule_matches(rule: &SendRule, ctx: &SendContext<'_>) -> bool {
    if let Some(destination) = &rule.destination {
        if !ctx.destination_names.iter().any(|n| n == destination) {
            return false;
        }
    }
    if let Some(interface) = &rule.interface {
        if ctx.interface != Some(interface.as_str()) {
            return false;
        }
    }
    if let Some(member) = &rule.member {
        if ctx.member != Some(member.as_str()) {
            return false;
        }
    }
    if let Some(path) = &rule.path {
        if ctx.path != Some(path.as_str()) {
            return false;
        }
    }
    if let Some(msg_type) = rule.msg_type {
        if ctx.msg_type != msg_type {
            return false;
        }
    }
    if let Some(broadcast) = rule.broadcast {
        if ctx.broadcast != broadcast {
            return false;
        }
    }
    true
}

fn receive_rule_matches(rule: &ReceiveRule, ctx: &ReceiveContext<'_>) -> bool {
    if let Some(sender) = &rule.sender {
        if !ctx.sender_names.iter().any(|n| n == sender) {
            return false;
        }
    }
    if let Some(interface) = &rule.interface {
        if ctx.interface != Some(interface.as_str()) {
            return false;
        }
    }
    if let Some(member) = &rule.member {
        if ctx.member != Some(member.as_str()) {
            return false;
        }
    }
    if let Some(path) = &rule.path {
        if ctx.path != Some(path.as_str()) {
            return false;
        }
    }
    if let Some(msg_type) = rule.msg_type {
        if ctx.msg_type != msg_type {
            return false;
        }
    }
    true
}
