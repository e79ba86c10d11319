//! The `org.freedesktop.DBus.Monitoring` interface.

use anyhow::anyhow;
use tracing::debug;

use super::MethodCall;
use crate::{bus::Bus, driver, error::DriverError, match_rules::MatchRules, peer};

pub(super) fn become_monitor(
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

    let (rule_strings, flags): (Vec<String>, u32) = call.read()?;

    // Build the complete match set before touching the peer, so a bad rule
    // leaves everything as it was. An empty rule array subscribes to
    // everything, like a single empty rule would.
    let matches = if rule_strings.is_empty() {
        MatchRules::wildcard()
    } else {
        let mut matches = MatchRules::new();
        for rule in &rule_strings {
            if matches.len() >= peer::MAX_MATCH_RULES {
                return Err(DriverError::Quota);
            }
            matches.add(rule).map_err(|_| DriverError::MatchInvalid)?;
        }
        matches
    };

    if flags != 0 {
        return Err(DriverError::UnexpectedFlags);
    }

    // Reply first: the caller must see the method return before the
    // monitored stream starts.
    driver::send_reply(bus, peer_id, call, &())?;

    // Silently shed all names, matches and reply slots, then switch roles.
    driver::goodbye(bus, peer_id, true)?;
    if let Some(peer) = bus.peers.get_mut(peer_id) {
        peer.become_monitor(matches);
        bus.n_monitors += 1;
        debug!("{} became a monitor", crate::peers::unique_address(peer_id));
    }

    Ok(())
}
