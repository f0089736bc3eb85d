//! Kernel connection-tracker offload interface.

use std::net::Ipv4Addr;

use crate::error::DatapathError;

/// Handle for marking completed flows in the kernel connection tracker.
///
/// The datapath calls this once per flow after the handshake finishes so
/// an upstream netfilter rule lets later segments bypass the enforcer.
/// Failures are logged by the caller and never change a packet verdict.
pub trait Conntrack: Send + Sync {
    /// Set the connection mark for the given flow tuple.
    #[allow(clippy::too_many_arguments)]
    fn update_mark(
        &self,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        protocol: u8,
        src_port: u16,
        dst_port: u16,
        mark: u32,
    ) -> Result<(), DatapathError>;
}

/// Conntrack handle that does nothing. Stands in when no kernel tracker
/// is reachable, e.g. in tests.
pub struct NullConntrack;

impl Conntrack for NullConntrack {
    fn update_mark(
        &self,
        _src_ip: Ipv4Addr,
        _dst_ip: Ipv4Addr,
        _protocol: u8,
        _src_port: u16,
        _dst_port: u16,
        _mark: u32,
    ) -> Result<(), DatapathError> {
        Ok(())
    }
}
