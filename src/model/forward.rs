//! RTP forwarding rules registered on the gateway

use std::collections::HashMap;

use crate::model::codec::VideoCodec;

/// Identifies a forwarding destination for one publisher. Two rules with the
/// same key would mirror the same stream to the same place.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardKey {
    pub publisher_id: u64,
    pub host: String,
    pub port: u16,
}

/// Where the gateway mirrors a published RTP stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingRule {
    pub publisher_id: u64,
    pub host: String,
    pub port: u16,
    pub codec: VideoCodec,
    pub payload_type: u8,
    /// Gateway stream id, needed to stop the forwarder again
    pub stream_id: Option<u64>,
}

impl ForwardingRule {
    pub fn key(&self) -> ForwardKey {
        ForwardKey {
            publisher_id: self.publisher_id,
            host: self.host.clone(),
            port: self.port,
        }
    }
}

/// Outcome of a confirmed forwarding request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    /// The rule now live
    pub rule: ForwardingRule,
    /// A rule for the same destination that the new one displaced. Its
    /// forwarder still exists on the gateway and has to be stopped.
    pub replaced: Option<ForwardingRule>,
}

/// Live forwarding rules plus the one request in flight, if any.
#[derive(Debug, Default)]
pub struct ForwardTable {
    rules: HashMap<ForwardKey, ForwardingRule>,
    pending: Option<ForwardingRule>,
}

impl ForwardTable {
    pub fn contains(&self, key: &ForwardKey) -> bool {
        self.rules.contains_key(key)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Remember a request that has been sent but not yet confirmed.
    pub fn set_pending(&mut self, rule: ForwardingRule) {
        self.pending = Some(rule);
    }

    /// Move the pending request into the live set once the gateway confirmed
    /// it. Returns `None` when the confirmation does not match what was
    /// requested.
    pub fn confirm(&mut self, publisher_id: u64, stream_id: Option<u64>) -> Option<Confirmation> {
        let pending = self.pending.take()?;
        if pending.publisher_id != publisher_id {
            self.pending = Some(pending);
            return None;
        }

        let rule = ForwardingRule {
            stream_id,
            ..pending
        };
        let replaced = self
            .rules
            .insert(rule.key(), rule.clone())
            .filter(|old| old.stream_id != rule.stream_id);
        Some(Confirmation { rule, replaced })
    }

    /// Forget the rules of a publisher that left the room. The gateway tears
    /// down its forwarders together with the publisher.
    pub fn remove_publisher(&mut self, publisher_id: u64) -> Vec<ForwardingRule> {
        if self
            .pending
            .as_ref()
            .is_some_and(|p| p.publisher_id == publisher_id)
        {
            self.pending = None;
        }

        let keys: Vec<ForwardKey> = self
            .rules
            .keys()
            .filter(|k| k.publisher_id == publisher_id)
            .cloned()
            .collect();
        keys.iter().filter_map(|k| self.rules.remove(k)).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Drop every rule. Used once the session they lived in is gone.
    pub fn clear(&mut self) -> Vec<ForwardingRule> {
        self.pending = None;
        self.rules.drain().map(|(_, r)| r).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(publisher_id: u64) -> ForwardingRule {
        ForwardingRule {
            publisher_id,
            host: "127.0.0.1".into(),
            port: 6000,
            codec: VideoCodec::Vp9,
            payload_type: 96,
            stream_id: None,
        }
    }

    #[test]
    fn confirmation_for_other_publisher_keeps_pending() {
        let mut table = ForwardTable::default();
        table.set_pending(rule(42));

        assert!(table.confirm(7, Some(1)).is_none());
        assert!(table.is_pending());

        let live = table.confirm(42, Some(99)).unwrap();
        assert_eq!(live.rule.stream_id, Some(99));
        assert_eq!(live.replaced, None);
        assert!(!table.is_pending());
        assert!(table.contains(&rule(42).key()));
    }

    #[test]
    fn same_destination_hands_back_the_displaced_rule() {
        let mut table = ForwardTable::default();
        table.set_pending(rule(42));
        table.confirm(42, Some(1));
        table.set_pending(rule(42));
        let confirmation = table.confirm(42, Some(2)).unwrap();

        assert_eq!(confirmation.replaced.and_then(|r| r.stream_id), Some(1));
        assert_eq!(table.len(), 1);
        let rules = table.clear();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].stream_id, Some(2));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn removing_a_publisher_keeps_other_rules() {
        let mut table = ForwardTable::default();
        table.set_pending(rule(42));
        table.confirm(42, Some(1));
        table.set_pending(rule(7));
        table.confirm(7, Some(2));
        table.set_pending(rule(42));

        let removed = table.remove_publisher(42);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].stream_id, Some(1));
        assert!(!table.is_pending());
        assert!(table.contains(&rule(7).key()));
        assert!(!table.contains(&rule(42).key()));
    }
}
