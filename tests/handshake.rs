//! End-to-end handshake scenarios through a pair of datapaths.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use palisade::collector::{Collector, FlowRecord};
use palisade::connection::{TcpConnection, CONTEXT_NONCE_LEN};
use palisade::conntrack::Conntrack;
use palisade::context::{PuContext, PuRegistry, PuType};
use palisade::datapath::{Datapath, DatapathConfig, OperationalMode, Verdict};
use palisade::error::{DatapathError, DropReason};
use palisade::packet::{TcpPacket, TCP_ACK_MASK, TCP_SYN_ACK_MASK, TCP_SYN_MASK};
use palisade::policy::{AclRule, AclSet, FlowPolicy, RuleSet, TagSelector, TagStore};
use palisade::service::ServiceHook;
use palisade::tokens::{ConnectionClaims, SealedTokenEngine, TokenEngine};

const SECRET: &[u8] = b"integration-secret";

const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const SERVER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const CLIENT_PORT: u16 = 40000;
const SERVER_PORT: u16 = 80;

#[derive(Default)]
struct Recorder {
    accepted: Mutex<Vec<FlowRecord>>,
    rejected: Mutex<Vec<FlowRecord>>,
    external: Mutex<Vec<FlowRecord>>,
    reverse_external: Mutex<Vec<FlowRecord>>,
}

impl Collector for Recorder {
    fn report_accepted_flow(&self, record: FlowRecord) {
        self.accepted.lock().push(record);
    }
    fn report_rejected_flow(&self, record: FlowRecord) {
        self.rejected.lock().push(record);
    }
    fn report_external_service_flow(&self, record: FlowRecord) {
        self.external.lock().push(record);
    }
    fn report_reverse_external_service_flow(&self, record: FlowRecord) {
        self.reverse_external.lock().push(record);
    }
}

#[derive(Default)]
struct MarkLog {
    marks: Mutex<Vec<(String, String, u16, u16, u32)>>,
}

impl Conntrack for MarkLog {
    fn update_mark(
        &self,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        _protocol: u8,
        src_port: u16,
        dst_port: u16,
        mark: u32,
    ) -> Result<(), DatapathError> {
        self.marks
            .lock()
            .push((src_ip.to_string(), dst_ip.to_string(), src_port, dst_port, mark));
        Ok(())
    }
}

struct Side {
    datapath: Datapath,
    registry: Arc<PuRegistry>,
    collector: Arc<Recorder>,
    conntrack: Arc<MarkLog>,
}

fn side(mode: OperationalMode, build: impl FnOnce(&Arc<PuRegistry>)) -> Side {
    let registry = Arc::new(PuRegistry::new());
    build(&registry);

    let collector = Arc::new(Recorder::default());
    let conntrack = Arc::new(MarkLog::default());
    let datapath = Datapath::new(
        DatapathConfig {
            mode,
            ..Default::default()
        },
        registry.clone(),
        Arc::new(SealedTokenEngine::new(SECRET)),
        conntrack.clone(),
        collector.clone(),
    );

    Side {
        datapath,
        registry,
        collector,
        conntrack,
    }
}

fn pu(id: &str, tags: &[&str], configure: impl FnOnce(&mut PuContext)) -> Arc<PuContext> {
    let mut context = PuContext::new(
        id,
        PuType::Container,
        TagStore::from_slice(tags),
        Duration::from_secs(60),
    );
    configure(&mut context);
    Arc::new(context)
}

fn client_side() -> Side {
    side(OperationalMode::LocalContainer, |registry| {
        let context = pu("pu-a", &["transmitter-id=pu-a", "app=client"], |_| {});
        registry.register_ip(CLIENT_IP.to_string(), context);
    })
}

fn server_side() -> Side {
    side(OperationalMode::LocalContainer, |registry| {
        let context = pu("pu-b", &["transmitter-id=pu-b", "app=server"], |context| {
            let mut accept = RuleSet::new();
            accept.add_rule(TagSelector::new(&["app=client"]), FlowPolicy::accept("allow-client"));
            context.accept_rcv = accept;
        });
        registry.register_ip(SERVER_IP.to_string(), context);
    })
}

fn transfer(packet: &TcpPacket) -> TcpPacket {
    TcpPacket::parse(packet.as_bytes().to_vec(), "").expect("wire packet must reparse")
}

fn syn() -> TcpPacket {
    TcpPacket::craft(CLIENT_IP, CLIENT_PORT, SERVER_IP, SERVER_PORT, TCP_SYN_MASK, 100)
}

fn syn_ack() -> TcpPacket {
    TcpPacket::craft(SERVER_IP, SERVER_PORT, CLIENT_IP, CLIENT_PORT, TCP_SYN_ACK_MASK, 300)
}

fn ack() -> TcpPacket {
    TcpPacket::craft(CLIENT_IP, CLIENT_PORT, SERVER_IP, SERVER_PORT, TCP_ACK_MASK, 101)
}

// Drives the three-way handshake through both datapaths up to (and
// excluding) the client's final ACK.
fn run_to_syn_ack(client: &Side, server: &Side) {
    let mut p = syn();
    assert_eq!(client.datapath.process_application_tcp(&mut p), Verdict::Accept);
    assert!(p.has_auth_option());

    let mut p = transfer(&p);
    assert_eq!(server.datapath.process_network_tcp(&mut p), Verdict::Accept);
    assert!(!p.has_auth_option());
    assert!(p.read_tcp_data().is_empty());

    let mut p = syn_ack();
    assert_eq!(server.datapath.process_application_tcp(&mut p), Verdict::Accept);
    assert!(p.has_auth_option());

    let mut p = transfer(&p);
    assert_eq!(client.datapath.process_network_tcp(&mut p), Verdict::Accept);
    assert!(!p.has_auth_option());
}

#[test]
fn happy_path_both_protected() {
    let client = client_side();
    let server = server_side();

    run_to_syn_ack(&client, &server);

    // Client finishes with the dual-nonce ACK token.
    let mut p = ack();
    assert_eq!(client.datapath.process_application_tcp(&mut p), Verdict::Accept);
    assert!(p.has_auth_option());

    let mut p = transfer(&p);
    assert_eq!(server.datapath.process_network_tcp(&mut p), Verdict::Accept);
    assert!(!p.has_auth_option());

    // Both ends programmed conntrack for the flow.
    {
        let client_marks = client.conntrack.marks.lock();
        assert_eq!(client_marks.len(), 1);
        assert_eq!(client_marks[0].0, CLIENT_IP.to_string());
        let server_marks = server.conntrack.marks.lock();
        assert_eq!(server_marks.len(), 1);
        assert_eq!(server_marks[0].4, 0x61);
    }

    // The server reported the accepted flow with both identities.
    {
        let accepted = server.collector.accepted.lock();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].source_id, "pu-a");
        assert_eq!(accepted[0].destination_id, "pu-b");
        assert_eq!(accepted[0].policy_id.as_deref(), Some("allow-client"));
        assert!(server.collector.rejected.lock().is_empty());
    }

    // First data segment: both sides now pass untouched.
    let mut p = ack();
    assert_eq!(client.datapath.process_application_tcp(&mut p), Verdict::Pass);
    let mut p = transfer(&p);
    assert_eq!(server.datapath.process_network_tcp(&mut p), Verdict::Pass);

    // The source-port entry is gone: a stray SYN-ACK for the port is no
    // longer attributed to this flow.
    let mut p = syn_ack();
    assert_eq!(
        client.datapath.process_network_tcp(&mut p),
        Verdict::Drop(DropReason::StateMissing)
    );
}

#[test]
fn external_server_flow_is_released_and_cached() {
    let external_ip = Ipv4Addr::new(1, 2, 3, 4);
    let client = side(OperationalMode::LocalContainer, |registry| {
        let context = pu("pu-a", &["transmitter-id=pu-a", "app=client"], |context| {
            let mut acls = AclSet::new();
            acls.add_rule(AclRule::new(
                Ipv4Addr::new(1, 2, 3, 0),
                24,
                (80, 80),
                FlowPolicy::accept("allow-external-web"),
            ));
            context.application_acls = acls;
        });
        registry.register_ip(CLIENT_IP.to_string(), context);
    });

    // First SYN goes out with a token; the destination is not yet known
    // to be unprotected.
    let mut p = TcpPacket::craft(CLIENT_IP, CLIENT_PORT, external_ip, 80, TCP_SYN_MASK, 1);
    assert_eq!(client.datapath.process_application_tcp(&mut p), Verdict::Accept);
    assert!(p.has_auth_option());

    // The server answers without an option; the application ACLs decide
    // and the flow is released.
    let mut p = TcpPacket::craft(external_ip, 80, CLIENT_IP, CLIENT_PORT, TCP_SYN_ACK_MASK, 50);
    assert_eq!(client.datapath.process_network_tcp(&mut p), Verdict::Pass);

    assert_eq!(client.conntrack.marks.lock().len(), 1);
    let reverse = client.collector.reverse_external.lock();
    assert_eq!(reverse.len(), 1);
    assert_eq!(reverse[0].policy_id.as_deref(), Some("allow-external-web"));
    drop(reverse);

    // A new SYN within the cache TTL short-circuits: no token attached.
    let mut p = TcpPacket::craft(CLIENT_IP, CLIENT_PORT, external_ip, 80, TCP_SYN_MASK, 200);
    assert_eq!(client.datapath.process_application_tcp(&mut p), Verdict::Pass);
    assert!(!p.has_auth_option());
}

#[test]
fn ingress_policy_reject_reports_and_keeps_no_state() {
    let client = client_side();
    let server = side(OperationalMode::LocalContainer, |registry| {
        let context = pu("pu-b", &["transmitter-id=pu-b", "app=server"], |context| {
            let mut reject = RuleSet::new();
            reject.add_rule(TagSelector::new(&["app=client"]), FlowPolicy::reject("deny-client"));
            context.reject_rcv = reject;
            // Reject dominates even with a matching accept rule.
            let mut accept = RuleSet::new();
            accept.add_rule(TagSelector::new(&["app=client"]), FlowPolicy::accept("allow-client"));
            context.accept_rcv = accept;
        });
        registry.register_ip(SERVER_IP.to_string(), context);
    });

    let mut p = syn();
    assert_eq!(client.datapath.process_application_tcp(&mut p), Verdict::Accept);

    let mut p = transfer(&p);
    assert_eq!(
        server.datapath.process_network_tcp(&mut p),
        Verdict::Drop(DropReason::PolicyDrop)
    );

    let rejected = server.collector.rejected.lock();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].drop_reason, Some(DropReason::PolicyDrop));
    assert_eq!(rejected[0].source_id, "pu-a");
    assert_eq!(rejected[0].policy_id.as_deref(), Some("deny-client"));
    drop(rejected);

    // No connection state was kept: a follow-up ACK has nothing to match.
    let mut p = ack();
    assert_eq!(
        server.datapath.process_network_tcp(&mut p),
        Verdict::Drop(DropReason::StateMissing)
    );
}

#[test]
fn port_scoped_policy_matches_synthetic_label() {
    let client = client_side();
    let server = side(OperationalMode::LocalContainer, |registry| {
        let context = pu("pu-b", &["transmitter-id=pu-b"], |context| {
            let mut accept = RuleSet::new();
            accept.add_rule(
                TagSelector::new(&["app=client", "@port=80"]),
                FlowPolicy::accept("allow-port-80"),
            );
            context.accept_rcv = accept;
        });
        registry.register_ip(SERVER_IP.to_string(), context);
    });

    let mut p = syn();
    assert_eq!(client.datapath.process_application_tcp(&mut p), Verdict::Accept);
    let mut p = transfer(&p);
    assert_eq!(server.datapath.process_network_tcp(&mut p), Verdict::Accept);
}

#[test]
fn missing_option_on_syn_ack_consults_acls_and_drops() {
    let client = client_side();

    let mut p = syn();
    assert_eq!(client.datapath.process_application_tcp(&mut p), Verdict::Accept);

    // SYN-ACK arrives without a token and no ACL allows the peer.
    let mut p = syn_ack();
    assert_eq!(
        client.datapath.process_network_tcp(&mut p),
        Verdict::Drop(DropReason::PolicyDrop)
    );

    let external = client.collector.external.lock();
    assert_eq!(external.len(), 1);
    assert!(external[0].policy_id.is_none());
    drop(external);

    // State is still SynSend: the retransmitted SYN re-attaches a token
    // and the handshake can proceed once the peer behaves.
    let mut p = syn();
    assert_eq!(client.datapath.process_application_tcp(&mut p), Verdict::Accept);
    assert!(p.has_auth_option());
}

#[test]
fn ack_nonce_mismatch_drops_and_leaves_state_intact() {
    let client = client_side();
    let server = server_side();

    run_to_syn_ack(&client, &server);

    // Forge an ACK whose nonces belong to no connection.
    let engine = SealedTokenEngine::new(SECRET);
    let claims = ConnectionClaims {
        tags: None,
        lcl: vec![0xaa; CONTEXT_NONCE_LEN],
        rmt: vec![0xbb; CONTEXT_NONCE_LEN],
    };
    let (token, _) = engine.create_and_sign(true, &claims).unwrap();

    let mut forged = ack();
    forged.tcp_data_attach(&[34, 4, 0, 0], &token).unwrap();
    let mut forged = transfer(&forged);
    assert_eq!(
        server.datapath.process_network_tcp(&mut forged),
        Verdict::Drop(DropReason::InvalidFormat)
    );
    assert_eq!(
        server.collector.rejected.lock()[0].drop_reason,
        Some(DropReason::InvalidFormat)
    );

    // The genuine ACK still completes the handshake.
    let mut p = ack();
    assert_eq!(client.datapath.process_application_tcp(&mut p), Verdict::Accept);
    let mut p = transfer(&p);
    assert_eq!(server.datapath.process_network_tcp(&mut p), Verdict::Accept);
    assert_eq!(server.collector.accepted.lock().len(), 1);
}

#[test]
fn syn_ack_without_source_port_state_drops_silently() {
    let client = client_side();

    let mut p = syn_ack();
    assert_eq!(
        client.datapath.process_network_tcp(&mut p),
        Verdict::Drop(DropReason::StateMissing)
    );

    assert!(client.collector.rejected.lock().is_empty());
    assert!(client.collector.external.lock().is_empty());
}

#[test]
fn unprotected_peer_accepted_by_network_acl() {
    let server = side(OperationalMode::LocalContainer, |registry| {
        let context = pu("pu-b", &["transmitter-id=pu-b"], |context| {
            let mut acls = AclSet::new();
            acls.add_rule(AclRule::new(
                Ipv4Addr::new(10, 9, 0, 0),
                16,
                (0, 65535),
                FlowPolicy::accept("allow-legacy"),
            ));
            context.network_acls = acls;
        });
        registry.register_ip(SERVER_IP.to_string(), context);
    });

    // A plain SYN from an unprotected peer in the allowed range.
    let mut p = TcpPacket::craft(Ipv4Addr::new(10, 9, 1, 1), 5555, SERVER_IP, SERVER_PORT, TCP_SYN_MASK, 1);
    assert_eq!(server.datapath.process_network_tcp(&mut p), Verdict::Pass);

    let external = server.collector.external.lock();
    assert_eq!(external.len(), 1);
    assert_eq!(external[0].policy_id.as_deref(), Some("allow-legacy"));
    drop(external);

    // Later segments of the flow pass through the Data state.
    let mut p = TcpPacket::craft(Ipv4Addr::new(10, 9, 1, 1), 5555, SERVER_IP, SERVER_PORT, TCP_ACK_MASK, 2);
    assert_eq!(server.datapath.process_network_tcp(&mut p), Verdict::Pass);
}

#[test]
fn unprotected_peer_outside_acls_is_dropped() {
    let server = server_side();

    let mut p = TcpPacket::craft(Ipv4Addr::new(172, 16, 0, 9), 5555, SERVER_IP, SERVER_PORT, TCP_SYN_MASK, 1);
    assert_eq!(
        server.datapath.process_network_tcp(&mut p),
        Verdict::Drop(DropReason::PolicyDrop)
    );
    assert_eq!(server.collector.external.lock().len(), 1);
}

#[test]
fn host_mode_unknown_syn_passes_with_auth_data_stripped() {
    let host = side(OperationalMode::LocalServer, |_| {});

    let mut p = syn();
    p.tcp_data_attach(&[34, 4, 0, 0], b"leftover-token").unwrap();
    let mut p = transfer(&p);

    assert_eq!(host.datapath.process_network_tcp(&mut p), Verdict::Accept);
    assert!(!p.has_auth_option());
    assert!(p.read_tcp_data().is_empty());

    // No state was created for the transient context.
    let mut p = ack();
    assert_eq!(
        host.datapath.process_network_tcp(&mut p),
        Verdict::Drop(DropReason::StateMissing)
    );
}

#[test]
fn host_mode_unrecorded_syn_ack_registers_port_for_retry() {
    let host = side(OperationalMode::LocalServer, |registry| {
        let context = pu("pu-host", &["transmitter-id=pu-host"], |_| {});
        registry.register_mark("2001", context);
    });

    let mut p = syn_ack();
    p.mark = "2001".into();
    assert_eq!(
        host.datapath.process_application_tcp(&mut p),
        Verdict::Drop(DropReason::StateMissing)
    );

    // The responder's port now resolves to the context for the retry.
    assert!(host
        .registry
        .pu_from_port(&p.source_port().to_string())
        .is_some());
}

#[test]
fn global_rule_syn_ack_passes_unmodified() {
    let host = side(OperationalMode::LocalServer, |_| {});

    let mut p = syn_ack();
    p.mark = "99".into();
    assert_eq!(host.datapath.process_application_tcp(&mut p), Verdict::Pass);
}

struct RefusingHook;

impl ServiceHook for RefusingHook {
    fn pre_process_app(
        &self,
        _packet: &mut TcpPacket,
        _context: &PuContext,
        _conn: &mut TcpConnection,
    ) -> bool {
        false
    }

    fn post_process_app(
        &self,
        _packet: &mut TcpPacket,
        _policy: Option<&FlowPolicy>,
        _context: &PuContext,
        _conn: &mut TcpConnection,
    ) -> bool {
        true
    }

    fn pre_process_net(
        &self,
        _packet: &mut TcpPacket,
        _context: &PuContext,
        _conn: &mut TcpConnection,
    ) -> bool {
        true
    }

    fn post_process_net(
        &self,
        _packet: &mut TcpPacket,
        _policy: Option<&FlowPolicy>,
        _claims: Option<&ConnectionClaims>,
        _context: &PuContext,
        _conn: &mut TcpConnection,
    ) -> bool {
        true
    }
}

#[test]
fn service_hook_refusal_drops_packet() {
    let registry = Arc::new(PuRegistry::new());
    let context = pu("pu-a", &["transmitter-id=pu-a"], |_| {});
    registry.register_ip(CLIENT_IP.to_string(), context);

    let collector = Arc::new(Recorder::default());
    let datapath = Datapath::new(
        DatapathConfig {
            mode: OperationalMode::LocalContainer,
            ..Default::default()
        },
        registry,
        Arc::new(SealedTokenEngine::new(SECRET)),
        Arc::new(MarkLog::default()),
        collector.clone(),
    )
    .with_service_hook(Arc::new(RefusingHook));

    let mut p = syn();
    assert_eq!(
        datapath.process_application_tcp(&mut p),
        Verdict::Drop(DropReason::ServiceFailure)
    );
    assert_eq!(
        collector.rejected.lock()[0].drop_reason,
        Some(DropReason::ServiceFailure)
    );
}

#[test]
fn concurrent_handshakes_complete_independently() {
    let client = Arc::new(client_side());
    let server = Arc::new(server_side());

    let mut workers = Vec::new();
    for i in 0..8u16 {
        let client = client.clone();
        let server = server.clone();
        workers.push(std::thread::spawn(move || {
            let port = CLIENT_PORT + 1 + i;
            let mut p = TcpPacket::craft(CLIENT_IP, port, SERVER_IP, SERVER_PORT, TCP_SYN_MASK, 1);
            assert_eq!(client.datapath.process_application_tcp(&mut p), Verdict::Accept);
            let mut p = transfer(&p);
            assert_eq!(server.datapath.process_network_tcp(&mut p), Verdict::Accept);
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }
}
