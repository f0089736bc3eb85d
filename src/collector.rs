//! Flow event reporting.

use crate::error::DropReason;
use crate::packet::TcpPacket;
use crate::policy::FlowPolicy;

/// Identity recorded when an endpoint is unknown.
pub const DEFAULT_ENDPOINT: &str = "default";

/// One flow event handed to the collector.
pub struct FlowRecord {
    /// Packet source address
    pub source_ip: String,
    /// Packet destination address
    pub destination_ip: String,
    /// Packet source port
    pub source_port: u16,
    /// Packet destination port
    pub destination_port: u16,
    /// Identity of the transmitting endpoint
    pub source_id: String,
    /// Identity of the receiving endpoint
    pub destination_id: String,
    /// Reason for a rejected flow
    pub drop_reason: Option<DropReason>,
    /// Identifier of the policy that decided the flow, when one matched
    pub policy_id: Option<String>,
}

impl FlowRecord {
    /// Build a record from a packet tuple and endpoint identities.
    pub fn new(packet: &TcpPacket, source_id: impl Into<String>, destination_id: impl Into<String>) -> Self {
        Self {
            source_ip: packet.source_address().to_string(),
            destination_ip: packet.destination_address().to_string(),
            source_port: packet.source_port(),
            destination_port: packet.destination_port(),
            source_id: source_id.into(),
            destination_id: destination_id.into(),
            drop_reason: None,
            policy_id: None,
        }
    }

    /// Record the drop reason.
    pub fn rejected(mut self, reason: DropReason) -> Self {
        self.drop_reason = Some(reason);
        self
    }

    /// Record the deciding policy.
    pub fn with_policy(mut self, policy: Option<&FlowPolicy>) -> Self {
        self.policy_id = policy.map(|p| p.policy_id.clone());
        self
    }
}

/// Telemetry sink for flow decisions.
///
/// Each drop is reported exactly once, at the point the decision is made.
pub trait Collector: Send + Sync {
    /// A handshake completed and the flow was authorized.
    fn report_accepted_flow(&self, record: FlowRecord);
    /// A flow was dropped; the record carries the reason.
    fn report_rejected_flow(&self, record: FlowRecord);
    /// An ACL decided a flow from an unprotected peer.
    fn report_external_service_flow(&self, record: FlowRecord);
    /// An external-peer flow was released from the datapath.
    fn report_reverse_external_service_flow(&self, record: FlowRecord);
}

/// Collector that discards every event.
pub struct NullCollector;

impl Collector for NullCollector {
    fn report_accepted_flow(&self, _record: FlowRecord) {}
    fn report_rejected_flow(&self, _record: FlowRecord) {}
    fn report_external_service_flow(&self, _record: FlowRecord) {}
    fn report_reverse_external_service_flow(&self, _record: FlowRecord) {}
}
