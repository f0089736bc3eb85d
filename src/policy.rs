//! Policy evaluation: claim tags, ordered rule sets, and address ACLs.
//!
//! Rule sets are evaluated in priority order, first match wins. The
//! datapath always consults reject rules before accept rules in the same
//! direction. ACLs cover unprotected peers that cannot present a token.

use std::net::Ipv4Addr;
use std::sync::Arc;

/// What a matched policy does to the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    /// Allow the flow
    Accept,
    /// Drop the flow
    Reject,
}

/// The decision attached to a rule or ACL entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowPolicy {
    /// Verdict for matching flows
    pub action: PolicyAction,
    /// Identifier of the originating policy, carried in flow reports
    pub policy_id: String,
}

impl FlowPolicy {
    /// Accept policy with the given identifier.
    pub fn accept(policy_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            action: PolicyAction::Accept,
            policy_id: policy_id.into(),
        })
    }

    /// Reject policy with the given identifier.
    pub fn reject(policy_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            action: PolicyAction::Reject,
            policy_id: policy_id.into(),
        })
    }
}

/// An ordered set of `key=value` tags: a workload identity or the claims
/// carried in a token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagStore {
    tags: Vec<String>,
}

impl TagStore {
    /// Build a store from `key=value` strings.
    pub fn from_slice(tags: &[&str]) -> Self {
        Self {
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    /// Append a tag from its key and value.
    pub fn append_key_value(&mut self, key: &str, value: &str) {
        self.tags.push(format!("{key}={value}"));
    }

    /// Value of the first tag with the given key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.tags.iter().find_map(|t| {
            let (k, v) = t.split_once('=')?;
            (k == key).then_some(v)
        })
    }

    /// Whether the exact tag is present.
    pub fn contains(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// The raw tag strings.
    pub fn as_slice(&self) -> &[String] {
        &self.tags
    }
}

/// A conjunction of tags that must all be present for a rule to match.
#[derive(Debug, Clone)]
pub struct TagSelector {
    clauses: Vec<String>,
}

impl TagSelector {
    /// Selector matching when every given tag is present.
    pub fn new(clauses: &[&str]) -> Self {
        Self {
            clauses: clauses.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn matches(&self, claims: &TagStore) -> bool {
        self.clauses.iter().all(|c| claims.contains(c))
    }
}

/// A priority-ordered list of `(selector, policy)` rules.
#[derive(Default)]
pub struct RuleSet {
    rules: Vec<(TagSelector, Arc<FlowPolicy>)>,
}

impl RuleSet {
    /// Empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule at the lowest priority.
    pub fn add_rule(&mut self, selector: TagSelector, policy: Arc<FlowPolicy>) {
        self.rules.push((selector, policy));
    }

    /// First rule whose selector matches the claims, with its index.
    pub fn search(&self, claims: &TagStore) -> Option<(usize, Arc<FlowPolicy>)> {
        self.rules
            .iter()
            .enumerate()
            .find(|(_, (sel, _))| sel.matches(claims))
            .map(|(i, (_, plc))| (i, plc.clone()))
    }
}

/// One ACL entry: an IPv4 prefix, a port range, and the policy to apply.
pub struct AclRule {
    addr: Ipv4Addr,
    prefix_len: u8,
    port_range: (u16, u16),
    policy: Arc<FlowPolicy>,
}

impl AclRule {
    /// Rule covering `addr/prefix_len` and the inclusive port range.
    pub fn new(
        addr: Ipv4Addr,
        prefix_len: u8,
        port_range: (u16, u16),
        policy: Arc<FlowPolicy>,
    ) -> Self {
        debug_assert!(prefix_len <= 32);
        Self {
            addr,
            prefix_len,
            port_range,
            policy,
        }
    }

    fn matches(&self, ip: Ipv4Addr, port: u16) -> bool {
        if port < self.port_range.0 || port > self.port_range.1 {
            return false;
        }
        let mask = if self.prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix_len as u32)
        };
        (u32::from(ip) & mask) == (u32::from(self.addr) & mask)
    }
}

/// Ordered ACL entries for flows with unprotected peers.
#[derive(Default)]
pub struct AclSet {
    rules: Vec<AclRule>,
}

impl AclSet {
    /// Empty ACL set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry at the lowest priority.
    pub fn add_rule(&mut self, rule: AclRule) {
        self.rules.push(rule);
    }

    /// Policy of the first entry covering the address and port.
    pub fn matching_action(&self, ip: Ipv4Addr, port: u16) -> Option<Arc<FlowPolicy>> {
        self.rules
            .iter()
            .find(|r| r.matches(ip, port))
            .map(|r| r.policy.clone())
    }
}
