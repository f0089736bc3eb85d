//! Per-workload contexts and the registry the datapath resolves them from.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::cache::TtlCache;
use crate::policy::{AclSet, FlowPolicy, RuleSet, TagStore};

/// Registry key whose context answers for any otherwise-unmatched IP.
pub const DEFAULT_NETWORK: &str = "0.0.0.0/0";

/// How long a cached SYN token stays reusable before it is re-signed.
pub const SYN_TOKEN_VALIDITY: Duration = Duration::from_millis(500);

/// Kind of workload a context describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PuType {
    /// A container under policy
    Container,
    /// A host process under policy
    LinuxProcess,
    /// Synthetic context for host-mode packets with no matching workload
    Transient,
}

pub(crate) struct SynTokenCache {
    pub(crate) token: Vec<u8>,
    pub(crate) expiration: Instant,
}

/// Identity, policy, and per-workload caches for one processing unit.
///
/// Rule sets and ACLs are immutable once the context is registered; the
/// only locked state is the cached SYN token.
pub struct PuContext {
    /// Stable identifier used in flow reports
    pub management_id: String,
    /// Workload kind
    pub pu_type: PuType,
    identity: TagStore,
    /// Rules evaluated against claims received on ingress, reject first
    pub reject_rcv: RuleSet,
    /// Accept rules for ingress claims
    pub accept_rcv: RuleSet,
    /// Rules evaluated against the responder's claims under mutual auth
    pub reject_txt: RuleSet,
    /// Accept rules for responder claims
    pub accept_txt: RuleSet,
    /// ACLs for inbound flows from unprotected peers
    pub network_acls: AclSet,
    /// ACLs for outbound flows to unprotected peers
    pub application_acls: AclSet,
    pub(crate) external_ip_cache: TtlCache<String, Arc<FlowPolicy>>,
    pub(crate) syn_token: Mutex<SynTokenCache>,
}

impl PuContext {
    /// Create a context with empty rule sets. Callers populate the rules
    /// and ACLs before registering the context.
    pub fn new(
        management_id: impl Into<String>,
        pu_type: PuType,
        identity: TagStore,
        external_ip_ttl: Duration,
    ) -> Self {
        Self {
            management_id: management_id.into(),
            pu_type,
            identity,
            reject_rcv: RuleSet::new(),
            accept_rcv: RuleSet::new(),
            reject_txt: RuleSet::new(),
            accept_txt: RuleSet::new(),
            network_acls: AclSet::new(),
            application_acls: AclSet::new(),
            external_ip_cache: TtlCache::new(external_ip_ttl),
            syn_token: Mutex::new(SynTokenCache {
                token: Vec::new(),
                expiration: Instant::now(),
            }),
        }
    }

    /// Synthetic context for a host-mode packet with no matching workload.
    pub fn transient() -> Arc<Self> {
        Arc::new(Self::new(
            "transient",
            PuType::Transient,
            TagStore::default(),
            Duration::from_secs(1),
        ))
    }

    /// The workload's identity claim set.
    pub fn identity(&self) -> &TagStore {
        &self.identity
    }

    /// Cached external-peer policy for an `ip:port` key, TTL refreshed.
    pub fn external_policy(&self, key: &String) -> Option<Arc<FlowPolicy>> {
        self.external_ip_cache.get(key)
    }
}

/// Lookup indexes mapping packet attributes to contexts.
///
/// The discovery subsystem registers and removes entries; the datapath
/// only reads. Context lifetime is owned here, connections hold weak
/// references.
#[derive(Default)]
pub struct PuRegistry {
    pu_from_ip: DashMap<String, Arc<PuContext>>,
    pu_from_mark: DashMap<String, Arc<PuContext>>,
    pu_from_port: DashMap<String, Arc<PuContext>>,
}

impl PuRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a context by workload IP. Use [`DEFAULT_NETWORK`] as the key
    /// to install the fallback context.
    pub fn register_ip(&self, ip: impl Into<String>, context: Arc<PuContext>) {
        self.pu_from_ip.insert(ip.into(), context);
    }

    /// Index a context by cgroup mark.
    pub fn register_mark(&self, mark: impl Into<String>, context: Arc<PuContext>) {
        self.pu_from_mark.insert(mark.into(), context);
    }

    /// Index a context by local port.
    pub fn register_port(&self, port: impl Into<String>, context: Arc<PuContext>) {
        self.pu_from_port.insert(port.into(), context);
    }

    /// Context registered for an IP.
    pub fn pu_from_ip(&self, ip: &str) -> Option<Arc<PuContext>> {
        self.pu_from_ip.get(ip).map(|e| e.value().clone())
    }

    /// Context registered for a mark.
    pub fn pu_from_mark(&self, mark: &str) -> Option<Arc<PuContext>> {
        self.pu_from_mark.get(mark).map(|e| e.value().clone())
    }

    /// Context registered for a port.
    pub fn pu_from_port(&self, port: &str) -> Option<Arc<PuContext>> {
        self.pu_from_port.get(port).map(|e| e.value().clone())
    }

    /// Drop every index entry pointing at the given context. Called on
    /// workload teardown; in-flight connections observe a dead weak
    /// reference and drop.
    pub fn unregister(&self, management_id: &str) {
        self.pu_from_ip
            .retain(|_, c| c.management_id != management_id);
        self.pu_from_mark
            .retain(|_, c| c.management_id != management_id);
        self.pu_from_port
            .retain(|_, c| c.management_id != management_id);
    }
}
