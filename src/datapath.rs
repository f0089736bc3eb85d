//! The per-packet TCP authentication state machine and its dispatchers.
//!
//! Two entry points process every TCP segment crossing the enforcer:
//! [`Datapath::process_application_tcp`] for egress from a protected
//! workload and [`Datapath::process_network_tcp`] for ingress. Each
//! classifies the segment by its SYN/ACK bits, resolves or creates the
//! connection, takes its lock for the rest of the call, runs the matching
//! handshake handler, and emits a verdict. Handshake segments gain or
//! lose the auth option and token payload in place; everything after the
//! handshake passes untouched once conntrack offload takes over.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::cache::TtlCache;
use crate::collector::{Collector, FlowRecord, DEFAULT_ENDPOINT};
use crate::connection::{AuthInfo, SharedConnection, TcpConnection, TcpFlowState};
use crate::conntrack::Conntrack;
use crate::context::{PuContext, PuRegistry, DEFAULT_NETWORK, SYN_TOKEN_VALIDITY};
use crate::error::{DatapathError, DropReason};
use crate::packet::{
    tcp_flags_to_str, PacketDirection, TcpPacket, AUTH_OPTION_BASE_LEN, TCP_ACK_MASK,
    TCP_AUTHENTICATION_OPTION, TCP_SYN_ACK_MASK, TCP_SYN_MASK,
};
use crate::policy::{FlowPolicy, PolicyAction};
use crate::service::ServiceHook;
use crate::tokens::{ConnectionClaims, TokenEngine, TRANSMITTER_LABEL};

/// Claim key carrying the destination port of a received SYN, appended to
/// the peer's claims so port-scoped policies can match.
pub const PORT_NUMBER_LABEL: &str = "@port";

/// First mark value assigned to monitored cgroups. A SYN-ACK arriving
/// with `INITIAL_MARK - 1` traversed the global capture rule and belongs
/// to a process outside our policy.
pub const INITIAL_MARK: u32 = 100;

/// Final verdict for one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Forward the packet, mutated by the handshake
    Accept,
    /// Forward the packet unmodified
    Pass,
    /// Reject the packet
    Drop(DropReason),
}

/// How the enforcer is deployed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationalMode {
    /// In-process enforcement for containers on this host
    LocalContainer,
    /// Enforcer running inside the container's network namespace
    RemoteContainer,
    /// Enforcement for host processes
    LocalServer,
}

/// Tunables for a datapath instance.
pub struct DatapathConfig {
    /// Deployment mode
    pub mode: OperationalMode,
    /// Require the initiator's policy to also accept the responder
    pub mutual_authorization: bool,
    /// Mark written to conntrack for offloaded flows
    pub conn_mark: u32,
    /// Lifetime of origin and reply flow-cache entries
    pub flow_cache_ttl: Duration,
    /// Lifetime of source-port cache entries; kept short so a reused
    /// port is not attributed to a dead flow
    pub source_port_ttl: Duration,
}

impl Default for DatapathConfig {
    fn default() -> Self {
        Self {
            mode: OperationalMode::LocalServer,
            mutual_authorization: false,
            conn_mark: 0x61,
            flow_cache_ttl: Duration::from_secs(60),
            source_port_ttl: Duration::from_secs(20),
        }
    }
}

/// The TCP authentication datapath.
///
/// Owns the flow caches and the collaborator handles. Entry points are
/// safe to call from many packet workers at once; per-connection state is
/// guarded by the connection lock, held from resolution to verdict.
pub struct Datapath {
    config: DatapathConfig,
    registry: Arc<PuRegistry>,
    token_engine: Arc<dyn TokenEngine>,
    conntrack: Arc<dyn Conntrack>,
    collector: Arc<dyn Collector>,
    service: Option<Arc<dyn ServiceHook>>,

    app_orig: TtlCache<String, SharedConnection>,
    app_reply: TtlCache<String, SharedConnection>,
    net_orig: TtlCache<String, SharedConnection>,
    net_reply: TtlCache<String, SharedConnection>,
    source_port: TtlCache<String, SharedConnection>,

    ack_size: usize,
}

impl Datapath {
    /// Build a datapath from its collaborators.
    pub fn new(
        config: DatapathConfig,
        registry: Arc<PuRegistry>,
        token_engine: Arc<dyn TokenEngine>,
        conntrack: Arc<dyn Conntrack>,
        collector: Arc<dyn Collector>,
    ) -> Self {
        let ack_size = token_engine.ack_size();
        Self {
            app_orig: TtlCache::new(config.flow_cache_ttl),
            app_reply: TtlCache::new(config.flow_cache_ttl),
            net_orig: TtlCache::new(config.flow_cache_ttl),
            net_reply: TtlCache::new(config.flow_cache_ttl),
            source_port: TtlCache::new(config.source_port_ttl),
            config,
            registry,
            token_engine,
            conntrack,
            collector,
            service: None,
            ack_size,
        }
    }

    /// Install the optional service hook.
    pub fn with_service_hook(mut self, hook: Arc<dyn ServiceHook>) -> Self {
        self.service = Some(hook);
        self
    }

    /// Process a segment leaving a protected workload.
    pub fn process_application_tcp(&self, packet: &mut TcpPacket) -> Verdict {
        debug!(
            flow = %packet.l4_flow_hash(),
            flags = %tcp_flags_to_str(packet.tcp_flags()),
            "processing application packet"
        );

        let resolved = match packet.tcp_flags() & TCP_SYN_ACK_MASK {
            TCP_SYN_MASK => self.app_syn_retrieve_state(packet),
            TCP_SYN_ACK_MASK => match self.app_retrieve_state(packet) {
                Ok(resolved) => Ok(resolved),
                Err(err) => {
                    if packet.mark == (INITIAL_MARK - 1).to_string() {
                        // SYN-ACK through the global capture rule: a
                        // process we do not monitor. Let it through.
                        debug!(flow = %packet.l4_flow_hash(), "unmonitored SYN-ACK passed");
                        return Verdict::Pass;
                    }
                    Err(err)
                }
            },
            _ => self.app_retrieve_state(packet),
        };

        let (context, conn) = match resolved {
            Ok(resolved) => resolved,
            Err(err) => {
                debug!(
                    flow = %packet.l4_flow_hash(),
                    flags = %tcp_flags_to_str(packet.tcp_flags()),
                    error = %err,
                    "application packet rejected"
                );
                return Verdict::Drop(err.reason());
            }
        };

        let mut state = conn.lock();

        if let Some(hook) = &self.service {
            if !hook.pre_process_app(packet, &context, &mut state) {
                self.report_service_drop(packet, &context.management_id, remote_id(&state));
                return Verdict::Drop(DropReason::ServiceFailure);
            }
        }

        let policy = match self.process_application_packet(packet, &context, &conn, &mut state) {
            Ok(policy) => policy,
            Err(err) => {
                debug!(
                    flow = %packet.l4_flow_hash(),
                    flags = %tcp_flags_to_str(packet.tcp_flags()),
                    error = %err,
                    "dropping application packet"
                );
                return Verdict::Drop(err.reason());
            }
        };

        if let Some(hook) = &self.service {
            if !hook.post_process_app(packet, policy.as_deref(), &context, &mut state) {
                self.report_service_drop(packet, &context.management_id, remote_id(&state));
                return Verdict::Drop(DropReason::ServiceFailure);
            }
        }

        self.finish(packet)
    }

    /// Process a segment arriving from the network.
    pub fn process_network_tcp(&self, packet: &mut TcpPacket) -> Verdict {
        debug!(
            flow = %packet.l4_flow_hash(),
            flags = %tcp_flags_to_str(packet.tcp_flags()),
            "processing network packet"
        );

        let (context, conn) = match packet.tcp_flags() & TCP_SYN_ACK_MASK {
            TCP_SYN_MASK => match self.net_syn_retrieve_state(packet) {
                Ok((context, Some(conn))) => (context, conn),
                Ok((_, None)) => return self.pass_transient(packet),
                Err(err) => {
                    debug!(
                        flow = %packet.l4_flow_hash(),
                        error = %err,
                        "network SYN rejected"
                    );
                    return Verdict::Drop(err.reason());
                }
            },
            TCP_SYN_ACK_MASK => match self.net_syn_ack_retrieve_state(packet) {
                Ok(resolved) => resolved,
                Err(err) => {
                    // Not a flow we initiated: drop without a report.
                    debug!(flow = %packet.l4_flow_hash(), "SYN-ACK with no recorded state ignored");
                    return Verdict::Drop(err.reason());
                }
            },
            _ => match self.net_retrieve_state(packet) {
                Ok(resolved) => resolved,
                Err(err) => {
                    debug!(
                        flow = %packet.l4_flow_hash(),
                        error = %err,
                        "network packet rejected"
                    );
                    return Verdict::Drop(err.reason());
                }
            },
        };

        let mut state = conn.lock();

        if let Some(hook) = &self.service {
            if !hook.pre_process_net(packet, &context, &mut state) {
                self.report_service_drop(packet, remote_id(&state), &context.management_id);
                return Verdict::Drop(DropReason::ServiceFailure);
            }
        }

        let (policy, claims) = match self.process_network_packet(packet, &context, &conn, &mut state)
        {
            Ok(outcome) => outcome,
            Err(err) => {
                debug!(
                    flow = %packet.l4_flow_hash(),
                    flags = %tcp_flags_to_str(packet.tcp_flags()),
                    error = %err,
                    "dropping network packet"
                );
                return Verdict::Drop(err.reason());
            }
        };

        if let Some(hook) = &self.service {
            if !hook.post_process_net(packet, policy.as_deref(), claims.as_ref(), &context, &mut state)
            {
                self.report_service_drop(packet, remote_id(&state), &context.management_id);
                return Verdict::Drop(DropReason::ServiceFailure);
            }

            if state.service_connection {
                if let Some(timeout) = state.time_out {
                    self.net_reply.set_time_out(&packet.l4_flow_hash(), timeout);
                }
            }
        }

        self.finish(packet)
    }

    fn finish(&self, packet: &mut TcpPacket) -> Verdict {
        if packet.was_modified() {
            packet.update_tcp_checksum();
            Verdict::Accept
        } else {
            Verdict::Pass
        }
    }

    // A host-mode SYN with no matching workload: strip any auth data and
    // forward without creating state.
    fn pass_transient(&self, packet: &mut TcpPacket) -> Verdict {
        if packet.has_auth_option() && packet.tcp_data_detach().is_err() {
            debug!(flow = %packet.l4_flow_hash(), "could not strip auth data from transient SYN");
        }
        self.finish(packet)
    }

    // ---- application-side handshake ------------------------------------

    fn process_application_packet(
        &self,
        packet: &mut TcpPacket,
        context: &Arc<PuContext>,
        conn: &SharedConnection,
        state: &mut TcpConnection,
    ) -> Result<Option<Arc<FlowPolicy>>, DatapathError> {
        match packet.tcp_flags() & TCP_SYN_ACK_MASK {
            TCP_SYN_MASK => self.process_application_syn(packet, context, conn, state),
            TCP_ACK_MASK => self.process_application_ack(packet, context, state),
            TCP_SYN_ACK_MASK => self.process_application_syn_ack(packet, context, state),
            _ => Ok(None),
        }
    }

    fn process_application_syn(
        &self,
        packet: &mut TcpPacket,
        context: &Arc<PuContext>,
        conn: &SharedConnection,
        state: &mut TcpConnection,
    ) -> Result<Option<Arc<FlowPolicy>>, DatapathError> {
        // A destination already known to be unprotected short-circuits
        // the handshake entirely.
        let external_key = format!("{}:{}", packet.destination_address(), packet.destination_port());
        if let Some(policy) = context.external_policy(&external_key) {
            self.app_orig.add_or_update(packet.l4_flow_hash(), conn.clone());
            self.source_port.add_or_update(
                packet.source_port_hash(PacketDirection::Application),
                conn.clone(),
            );
            return Ok(Some(policy));
        }

        let token = self.create_syn_token(context, &mut state.auth)?;

        state.set_state(TcpFlowState::SynSend);
        self.app_orig.add_or_update(packet.l4_flow_hash(), conn.clone());
        self.source_port.add_or_update(
            packet.source_port_hash(PacketDirection::Application),
            conn.clone(),
        );

        packet.tcp_data_attach(&authentication_option(), &token)?;
        Ok(None)
    }

    fn process_application_syn_ack(
        &self,
        packet: &mut TcpPacket,
        context: &Arc<PuContext>,
        state: &mut TcpConnection,
    ) -> Result<Option<Arc<FlowPolicy>>, DatapathError> {
        if state.state() == TcpFlowState::Data && !state.service_connection {
            // Handshake already finished on both sides; offload the flow
            // and forget it.
            if let Err(err) = self.conntrack.update_mark(
                packet.destination_address(),
                packet.source_address(),
                packet.ip_proto(),
                packet.destination_port(),
                packet.source_port(),
                self.config.conn_mark,
            ) {
                error!(
                    flow = %packet.l4_reverse_flow_hash(),
                    error = %err,
                    "conntrack update failed for completed flow"
                );
            }

            let net_entry = self.net_orig.remove(&packet.l4_reverse_flow_hash());
            let reply_entry = self.app_reply.remove(&packet.l4_flow_hash());
            if net_entry.is_none() || reply_entry.is_none() {
                debug!(flow = %packet.l4_flow_hash(), "stale cache entries for offloaded flow");
            }

            return Ok(None);
        }

        // Either we received a SYN, or our SYN-ACK response was lost and
        // this is the retransmission.
        if matches!(
            state.state(),
            TcpFlowState::SynReceived | TcpFlowState::SynAckSend
        ) {
            let token = self.create_syn_ack_token(context, &mut state.auth)?;
            state.set_state(TcpFlowState::SynAckSend);
            packet.tcp_data_attach(&authentication_option(), &token)?;
            return Ok(None);
        }

        error!(
            state = ?state.state(),
            flow = %packet.l4_flow_hash(),
            "SYN-ACK transmitted in invalid state"
        );
        Err(DatapathError::InvalidState)
    }

    fn process_application_ack(
        &self,
        packet: &mut TcpPacket,
        _context: &Arc<PuContext>,
        state: &mut TcpConnection,
    ) -> Result<Option<Arc<FlowPolicy>>, DatapathError> {
        if state.state() == TcpFlowState::Data {
            return Ok(None);
        }

        if matches!(
            state.state(),
            TcpFlowState::SynAckReceived | TcpFlowState::SynSend
        ) {
            // Sign both challenges together; random per connection, which
            // closes the replay window.
            let token = self.create_ack_token(&state.auth)?;

            // The sequence adjustment after detach depends on the token
            // length being exact.
            if token.len() != self.ack_size {
                return Err(DatapathError::InvalidFormat);
            }

            packet.tcp_data_attach(&authentication_option(), &token)?;
            state.set_state(TcpFlowState::AckSend);

            if !state.service_connection
                && packet.source_address() != packet.destination_address()
            {
                if let Err(err) = self.conntrack.update_mark(
                    packet.source_address(),
                    packet.destination_address(),
                    packet.ip_proto(),
                    packet.source_port(),
                    packet.destination_port(),
                    self.config.conn_mark,
                ) {
                    error!(
                        flow = %packet.l4_flow_hash(),
                        error = %err,
                        "conntrack update failed after ack"
                    );
                }
            }

            return Ok(None);
        }

        if state.state() == TcpFlowState::AckSend {
            // First data segment after the handshake. Drop the source-port
            // entry so a later connection reusing the port is not
            // attributed to this flow; the flow caches age out on TTL.
            if self
                .source_port
                .remove(&packet.source_port_hash(PacketDirection::Application))
                .is_none()
            {
                warn!(
                    hash = %packet.source_port_hash(PacketDirection::Application),
                    "source-port entry already gone"
                );
            }
            state.set_state(TcpFlowState::Data);
            return Ok(None);
        }

        Err(DatapathError::InvalidState)
    }

    // ---- network-side handshake ----------------------------------------

    fn process_network_packet(
        &self,
        packet: &mut TcpPacket,
        context: &Arc<PuContext>,
        conn: &SharedConnection,
        state: &mut TcpConnection,
    ) -> Result<(Option<Arc<FlowPolicy>>, Option<ConnectionClaims>), DatapathError> {
        match packet.tcp_flags() & TCP_SYN_ACK_MASK {
            TCP_SYN_MASK => self.process_network_syn(packet, context, conn, state),
            TCP_ACK_MASK => self.process_network_ack(packet, context, state),
            TCP_SYN_ACK_MASK => self.process_network_syn_ack(packet, context, conn, state),
            _ => Ok((None, None)),
        }
    }

    fn process_network_syn(
        &self,
        packet: &mut TcpPacket,
        context: &Arc<PuContext>,
        conn: &SharedConnection,
        state: &mut TcpConnection,
    ) -> Result<(Option<Arc<FlowPolicy>>, Option<ConnectionClaims>), DatapathError> {
        // A SYN without the auth option comes from an unprotected peer;
        // the network ACLs decide.
        if !packet.has_auth_option() {
            let policy = context
                .network_acls
                .matching_action(packet.source_address(), packet.destination_port());
            self.collector.report_external_service_flow(
                FlowRecord::new(packet, DEFAULT_ENDPOINT, &context.management_id)
                    .with_policy(policy.as_deref()),
            );

            return match policy {
                Some(policy) if policy.action == PolicyAction::Accept => {
                    state.set_state(TcpFlowState::Data);
                    self.net_orig.add_or_update(packet.l4_flow_hash(), conn.clone());
                    self.app_reply
                        .add_or_update(packet.l4_reverse_flow_hash(), conn.clone());
                    Ok((Some(policy), None))
                }
                _ => Err(DatapathError::PolicyDrop),
            };
        }

        let mut claims = match self.parse_packet_token(&mut state.auth, packet.read_tcp_data()) {
            Ok(claims) => claims,
            Err(_) => {
                // No valid claims means no state to keep; the source will
                // retransmit after we drop.
                self.collector.report_rejected_flow(
                    FlowRecord::new(packet, DEFAULT_ENDPOINT, &context.management_id)
                        .rejected(DropReason::InvalidToken),
                );
                return Err(DatapathError::InvalidToken);
            }
        };

        let tx_label = state.auth.remote_context_id.clone();
        if packet.tcp_data_detach().is_err() {
            self.collector.report_rejected_flow(
                FlowRecord::new(packet, &tx_label, &context.management_id)
                    .rejected(DropReason::InvalidFormat),
            );
            return Err(DatapathError::InvalidFormat);
        }

        let dport = packet.destination_port().to_string();
        let tags = match claims.tags.as_mut() {
            Some(tags) => {
                tags.append_key_value(PORT_NUMBER_LABEL, &dport);
                &*tags
            }
            None => return Err(DatapathError::InvalidToken),
        };

        if let Some((_, policy)) = context.reject_rcv.search(tags) {
            self.collector.report_rejected_flow(
                FlowRecord::new(packet, &tx_label, &context.management_id)
                    .rejected(DropReason::PolicyDrop)
                    .with_policy(Some(policy.as_ref())),
            );
            return Err(DatapathError::PolicyDrop);
        }

        if let Some((_, policy)) = context.accept_rcv.search(tags) {
            state.set_state(TcpFlowState::SynReceived);
            self.net_orig.add_or_update(packet.l4_flow_hash(), conn.clone());
            self.app_reply
                .add_or_update(packet.l4_reverse_flow_hash(), conn.clone());
            state.flow_policy = Some(policy.clone());
            return Ok((Some(policy), Some(claims)));
        }

        self.collector.report_rejected_flow(
            FlowRecord::new(packet, &tx_label, &context.management_id)
                .rejected(DropReason::PolicyDrop),
        );
        Err(DatapathError::PolicyDrop)
    }

    fn process_network_syn_ack(
        &self,
        packet: &mut TcpPacket,
        context: &Arc<PuContext>,
        conn: &SharedConnection,
        state: &mut TcpConnection,
    ) -> Result<(Option<Arc<FlowPolicy>>, Option<ConnectionClaims>), DatapathError> {
        if !packet.has_auth_option() {
            // The responder is unprotected. Decide once via the
            // application ACLs, then cache so the next SYN short-circuits.
            let external_key = format!("{}:{}", packet.source_address(), packet.source_port());
            if let Some(policy) = context.external_policy(&external_key) {
                self.release_flow(context, &policy, packet);
                return Ok((Some(policy), None));
            }

            let policy = context
                .application_acls
                .matching_action(packet.source_address(), packet.source_port());
            let policy = match policy {
                Some(policy) if policy.action == PolicyAction::Accept => policy,
                other => {
                    self.collector.report_external_service_flow(
                        FlowRecord::new(packet, DEFAULT_ENDPOINT, &context.management_id)
                            .with_policy(other.as_deref()),
                    );
                    return Err(DatapathError::PolicyDrop);
                }
            };

            context
                .external_ip_cache
                .add_or_update(external_key, policy.clone());

            // Subsequent segments of this flow bypass the state machines.
            state.set_state(TcpFlowState::Data);
            self.release_flow(context, &policy, packet);
            return Ok((Some(policy), None));
        }

        if packet.read_tcp_data().is_empty() {
            self.collector.report_rejected_flow(
                FlowRecord::new(packet, DEFAULT_ENDPOINT, &context.management_id)
                    .rejected(DropReason::MissingToken),
            );
            return Err(DatapathError::MissingToken);
        }

        let claims = match self.parse_packet_token(&mut state.auth, packet.read_tcp_data()) {
            Ok(claims) => claims,
            Err(_) => {
                self.collector.report_rejected_flow(
                    FlowRecord::new(packet, DEFAULT_ENDPOINT, &context.management_id)
                        .rejected(DropReason::InvalidToken),
                );
                return Err(DatapathError::InvalidToken);
            }
        };

        if packet.tcp_data_detach().is_err() {
            self.collector.report_rejected_flow(
                FlowRecord::new(packet, &state.auth.remote_context_id, &context.management_id)
                    .rejected(DropReason::InvalidFormat),
            );
            return Err(DatapathError::InvalidFormat);
        }

        // The reverse policy: under mutual authorization the responder's
        // claims must also pass our transmit rules.
        let tags = claims.tags.as_ref().ok_or(DatapathError::InvalidToken)?;

        if self.config.mutual_authorization && context.reject_txt.search(tags).is_some() {
            self.collector.report_rejected_flow(
                FlowRecord::new(packet, &state.auth.remote_context_id, &context.management_id)
                    .rejected(DropReason::PolicyDrop),
            );
            return Err(DatapathError::PolicyDrop);
        }

        let matched = context.accept_txt.search(tags);
        if !self.config.mutual_authorization || matched.is_some() {
            state.set_state(TcpFlowState::SynAckReceived);
            self.net_reply.add_or_update(packet.l4_flow_hash(), conn.clone());
            return Ok((matched.map(|(_, policy)| policy), Some(claims)));
        }

        self.collector.report_rejected_flow(
            FlowRecord::new(packet, &state.auth.remote_context_id, &context.management_id)
                .rejected(DropReason::PolicyDrop),
        );
        Err(DatapathError::PolicyDrop)
    }

    fn process_network_ack(
        &self,
        packet: &mut TcpPacket,
        context: &Arc<PuContext>,
        state: &mut TcpConnection,
    ) -> Result<(Option<Arc<FlowPolicy>>, Option<ConnectionClaims>), DatapathError> {
        // Duplicate or retransmitted ACK after completion.
        if matches!(state.state(), TcpFlowState::Data | TcpFlowState::AckSend) {
            return Ok((None, None));
        }

        if matches!(
            state.state(),
            TcpFlowState::SynAckSend | TcpFlowState::SynReceived
        ) {
            if !packet.has_auth_option() {
                self.collector.report_rejected_flow(
                    FlowRecord::new(packet, DEFAULT_ENDPOINT, &context.management_id)
                        .rejected(DropReason::InvalidFormat),
                );
                return Err(DatapathError::InvalidFormat);
            }

            if self
                .parse_ack_token(&state.auth, packet.read_tcp_data())
                .is_err()
            {
                self.collector.report_rejected_flow(
                    FlowRecord::new(packet, DEFAULT_ENDPOINT, &context.management_id)
                        .rejected(DropReason::InvalidFormat),
                );
                return Err(DatapathError::InvalidFormat);
            }

            if packet.tcp_data_detach().is_err() {
                self.collector.report_rejected_flow(
                    FlowRecord::new(packet, DEFAULT_ENDPOINT, &context.management_id)
                        .rejected(DropReason::InvalidFormat),
                );
                return Err(DatapathError::InvalidFormat);
            }

            self.collector.report_accepted_flow(
                FlowRecord::new(packet, &state.auth.remote_context_id, &context.management_id)
                    .with_policy(state.flow_policy.as_deref()),
            );

            state.set_state(TcpFlowState::Data);

            if !state.service_connection {
                if let Err(err) = self.conntrack.update_mark(
                    packet.source_address(),
                    packet.destination_address(),
                    packet.ip_proto(),
                    packet.source_port(),
                    packet.destination_port(),
                    self.config.conn_mark,
                ) {
                    error!(
                        flow = %packet.l4_flow_hash(),
                        error = %err,
                        "conntrack update failed after handshake"
                    );
                }
            }

            return Ok((None, None));
        }

        if state.service_connection {
            return Ok((None, None));
        }

        // ACK in the SYN state without a SYN-ACK in between.
        self.collector.report_rejected_flow(
            FlowRecord::new(packet, &state.auth.remote_context_id, &context.management_id)
                .rejected(DropReason::InvalidState),
        );
        error!(
            state = ?state.state(),
            flow = %packet.l4_flow_hash(),
            context = %context.management_id,
            "invalid state reached on network ack"
        );
        Err(DatapathError::InvalidState)
    }

    // ---- token wrappers -------------------------------------------------

    // Re-use the cached SYN token within its validity window, giving this
    // connection a fresh nonce. The context lock is held across the
    // read-randomize-write sequence so two connections can never observe
    // the same nonce.
    fn create_syn_token(
        &self,
        context: &PuContext,
        auth: &mut AuthInfo,
    ) -> Result<Vec<u8>, DatapathError> {
        let mut cached = context.syn_token.lock();

        if cached.expiration > Instant::now() && !cached.token.is_empty() {
            let mut token = cached.token.clone();
            if let Ok(nonce) = self.token_engine.randomize(&mut token) {
                cached.token = token.clone();
                auth.local_context = nonce;
                return Ok(token);
            }
            // Randomization failed; fall through and sign a fresh token.
        }

        let claims = ConnectionClaims {
            tags: Some(context.identity().clone()),
            ..Default::default()
        };
        let (token, nonce) = self.token_engine.create_and_sign(false, &claims)?;

        cached.token = token.clone();
        cached.expiration = Instant::now() + SYN_TOKEN_VALIDITY;
        auth.local_context = nonce;
        Ok(token)
    }

    // The received nonce must be signed back, so no caching is possible.
    fn create_syn_ack_token(
        &self,
        context: &PuContext,
        auth: &mut AuthInfo,
    ) -> Result<Vec<u8>, DatapathError> {
        let claims = ConnectionClaims {
            tags: Some(context.identity().clone()),
            lcl: Vec::new(),
            rmt: auth.remote_context.clone(),
        };
        let (token, nonce) = self.token_engine.create_and_sign(false, &claims)?;
        auth.local_context = nonce;
        Ok(token)
    }

    fn create_ack_token(&self, auth: &AuthInfo) -> Result<Vec<u8>, DatapathError> {
        let claims = ConnectionClaims {
            tags: None,
            lcl: auth.local_context.clone(),
            rmt: auth.remote_context.clone(),
        };
        let (token, _) = self.token_engine.create_and_sign(true, &claims)?;
        Ok(token)
    }

    // Open a SYN or SYN-ACK token and capture the peer's identity, nonce,
    // and certificate. Connection state is untouched on error.
    fn parse_packet_token(
        &self,
        auth: &mut AuthInfo,
        data: &[u8],
    ) -> Result<ConnectionClaims, DatapathError> {
        let decoded = self
            .token_engine
            .decode(false, data, auth.remote_public_key.as_deref())?;

        let tags = decoded.claims.tags.as_ref().ok_or(DatapathError::InvalidToken)?;
        let remote_id = tags
            .get(TRANSMITTER_LABEL)
            .ok_or(DatapathError::InvalidToken)?
            .to_string();

        auth.remote_public_key = decoded.certificate;
        auth.remote_context = decoded.nonce;
        auth.remote_context_id = remote_id;
        Ok(decoded.claims)
    }

    // ACK tokens carry no identity; validate that both nonces match the
    // connection before anything else trusts the packet.
    fn parse_ack_token(
        &self,
        auth: &AuthInfo,
        data: &[u8],
    ) -> Result<ConnectionClaims, DatapathError> {
        let decoded = self
            .token_engine
            .decode(true, data, auth.remote_public_key.as_deref())?;

        if decoded.claims.rmt != auth.local_context || decoded.claims.lcl != auth.remote_context {
            return Err(DatapathError::InvalidFormat);
        }
        Ok(decoded.claims)
    }

    // ---- state resolution ----------------------------------------------

    fn app_syn_retrieve_state(
        &self,
        packet: &TcpPacket,
    ) -> Result<(Arc<PuContext>, SharedConnection), DatapathError> {
        let context = self.context_from_ip(
            true,
            &packet.source_address().to_string(),
            &packet.mark,
            &packet.source_port().to_string(),
        )?;

        let conn = match self.app_orig.get(&packet.l4_flow_hash()) {
            Some(conn) => conn,
            None => TcpConnection::new(),
        };

        {
            let mut state = conn.lock();
            state.context = Arc::downgrade(&context);
            state.auth.local_context_id = context.management_id.clone();
            state.auth.remote_ip = packet.destination_address().to_string();
            state.auth.remote_port = packet.destination_port().to_string();
        }
        Ok((context, conn))
    }

    fn app_retrieve_state(
        &self,
        packet: &TcpPacket,
    ) -> Result<(Arc<PuContext>, SharedConnection), DatapathError> {
        let hash = packet.l4_flow_hash();

        let conn = if let Some(conn) = self.app_reply.get(&hash) {
            self.refresh_service_timer(&self.app_reply, &hash, &conn);
            conn
        } else if let Some(conn) = self.app_orig.get(&hash) {
            self.refresh_service_timer(&self.app_orig, &hash, &conn);
            conn
        } else {
            if self.config.mode != OperationalMode::RemoteContainer {
                // A SYN-ACK for a SYN we never recorded. Remember the port
                // for this mark's context so the retry resolves.
                if let Ok(context) = self.context_from_ip(
                    true,
                    &packet.source_address().to_string(),
                    &packet.mark,
                    &packet.source_port().to_string(),
                ) {
                    self.registry
                        .register_port(packet.source_port().to_string(), context);
                }
            }
            return Err(DatapathError::StateNotFound);
        };

        let context = conn
            .lock()
            .context
            .upgrade()
            .ok_or(DatapathError::NoContext)?;
        Ok((context, conn))
    }

    fn net_syn_retrieve_state(
        &self,
        packet: &TcpPacket,
    ) -> Result<(Arc<PuContext>, Option<SharedConnection>), DatapathError> {
        let context = match self.context_from_ip(
            false,
            &packet.destination_address().to_string(),
            &packet.mark,
            &packet.destination_port().to_string(),
        ) {
            Ok(context) => context,
            Err(_) if self.config.mode != OperationalMode::RemoteContainer => {
                // Host process we are not monitoring. Hand back a transient
                // context with no connection; the dispatcher forwards the
                // packet with its auth data stripped and keeps no state.
                return Ok((PuContext::transient(), None));
            }
            Err(err) => return Err(err),
        };

        let conn = match self.net_orig.get(&packet.l4_flow_hash()) {
            Some(conn) => conn,
            None => TcpConnection::new(),
        };

        {
            let mut state = conn.lock();
            state.context = Arc::downgrade(&context);
            state.auth.local_context_id = context.management_id.clone();
            state.auth.remote_ip = packet.source_address().to_string();
            state.auth.remote_port = packet.source_port().to_string();
        }
        Ok((context, Some(conn)))
    }

    fn net_syn_ack_retrieve_state(
        &self,
        packet: &TcpPacket,
    ) -> Result<(Arc<PuContext>, SharedConnection), DatapathError> {
        let conn = self
            .source_port
            .get(&packet.source_port_hash(PacketDirection::Network))
            .ok_or(DatapathError::StateNotFound)?;

        let context = conn
            .lock()
            .context
            .upgrade()
            .ok_or(DatapathError::NoContext)?;
        Ok((context, conn))
    }

    fn net_retrieve_state(
        &self,
        packet: &TcpPacket,
    ) -> Result<(Arc<PuContext>, SharedConnection), DatapathError> {
        let hash = packet.l4_flow_hash();

        let conn = if let Some(conn) = self.net_reply.get(&hash) {
            self.refresh_service_timer(&self.net_reply, &hash, &conn);
            conn
        } else if let Some(conn) = self.net_orig.get(&hash) {
            self.refresh_service_timer(&self.net_orig, &hash, &conn);
            conn
        } else {
            return Err(DatapathError::StateNotFound);
        };

        let context = conn
            .lock()
            .context
            .upgrade()
            .ok_or(DatapathError::NoContext)?;
        Ok((context, conn))
    }

    // Service connections keep their cache entries alive for the plugin's
    // configured timeout rather than the default TTL.
    fn refresh_service_timer(
        &self,
        cache: &TtlCache<String, SharedConnection>,
        hash: &String,
        conn: &SharedConnection,
    ) {
        let state = conn.lock();
        if state.service_connection {
            if let Some(timeout) = state.time_out {
                cache.set_time_out(hash, timeout);
            }
        }
    }

    fn context_from_ip(
        &self,
        app: bool,
        packet_ip: &str,
        mark: &str,
        port: &str,
    ) -> Result<Arc<PuContext>, DatapathError> {
        if let Some(context) = self.registry.pu_from_ip(packet_ip) {
            return Ok(context);
        }

        // Local containers always have their IP registered.
        if self.config.mode == OperationalMode::LocalContainer {
            return Err(DatapathError::NoContext);
        }

        if let Some(context) = self.registry.pu_from_ip(DEFAULT_NETWORK) {
            return Ok(context);
        }

        let context = if app {
            self.registry.pu_from_mark(mark)
        } else {
            self.registry.pu_from_port(port)
        };
        context.ok_or(DatapathError::NoContext)
    }

    // ---- external-peer flow release ------------------------------------

    // Stop tracking a flow whose responder is unprotected: forget the
    // application-side entries, mark conntrack so the kernel takes over,
    // and report the reverse flow. The packet here is the responder's
    // SYN-ACK, so the application entries are keyed by the reverse tuple.
    fn release_flow(&self, context: &PuContext, policy: &Arc<FlowPolicy>, packet: &TcpPacket) {
        let orig = self.app_orig.remove(&packet.l4_reverse_flow_hash());
        let port = self
            .source_port
            .remove(&packet.source_port_hash(PacketDirection::Network));
        if orig.is_none() || port.is_none() {
            debug!(flow = %packet.l4_flow_hash(), "stale cache entries for released flow");
        }

        if let Err(err) = self.conntrack.update_mark(
            packet.destination_address(),
            packet.source_address(),
            packet.ip_proto(),
            packet.destination_port(),
            packet.source_port(),
            self.config.conn_mark,
        ) {
            error!(
                flow = %packet.l4_flow_hash(),
                error = %err,
                "conntrack update failed for released flow"
            );
        }

        self.collector.report_reverse_external_service_flow(
            FlowRecord::new(packet, DEFAULT_ENDPOINT, &context.management_id)
                .with_policy(Some(policy.as_ref())),
        );
    }

    fn report_service_drop(&self, packet: &TcpPacket, source_id: &str, destination_id: &str) {
        self.collector.report_rejected_flow(
            FlowRecord::new(packet, source_id, destination_id)
                .rejected(DropReason::ServiceFailure),
        );
    }
}

fn remote_id(state: &TcpConnection) -> &str {
    if state.auth.remote_context_id.is_empty() {
        DEFAULT_ENDPOINT
    } else {
        &state.auth.remote_context_id
    }
}

fn authentication_option() -> [u8; AUTH_OPTION_BASE_LEN] {
    [
        TCP_AUTHENTICATION_OPTION,
        AUTH_OPTION_BASE_LEN as u8,
        0,
        0,
    ]
}
