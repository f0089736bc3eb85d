//! Pre- and post-processing hooks for service plugins.

use crate::connection::TcpConnection;
use crate::context::PuContext;
use crate::packet::TcpPacket;
use crate::policy::FlowPolicy;
use crate::tokens::ConnectionClaims;

/// Optional packet hooks invoked around the handshake handlers.
///
/// A hook returning `false` drops the packet with a service failure. A
/// hook may mutate the packet; it must call
/// [`TcpPacket::set_modified`] afterwards so the checksum is refreshed.
pub trait ServiceHook: Send + Sync {
    /// Before handling an application-side packet.
    fn pre_process_app(
        &self,
        packet: &mut TcpPacket,
        context: &PuContext,
        conn: &mut TcpConnection,
    ) -> bool;

    /// After handling an application-side packet.
    fn post_process_app(
        &self,
        packet: &mut TcpPacket,
        policy: Option<&FlowPolicy>,
        context: &PuContext,
        conn: &mut TcpConnection,
    ) -> bool;

    /// Before handling a network-side packet.
    fn pre_process_net(
        &self,
        packet: &mut TcpPacket,
        context: &PuContext,
        conn: &mut TcpConnection,
    ) -> bool;

    /// After handling a network-side packet.
    fn post_process_net(
        &self,
        packet: &mut TcpPacket,
        policy: Option<&FlowPolicy>,
        claims: Option<&ConnectionClaims>,
        context: &PuContext,
        conn: &mut TcpConnection,
    ) -> bool;
}
