//! Error types for the authentication datapath.

use thiserror::Error;

/// Errors that can occur while processing a packet through the datapath.
#[derive(Error, Debug)]
pub enum DatapathError {
    /// Packet bytes do not form a valid IPv4/TCP segment
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),
    /// No processing-unit context matches the packet
    #[error("no processing unit context for packet")]
    NoContext,
    /// No connection state recorded for the flow
    #[error("connection state not found")]
    StateNotFound,
    /// Token signature or structure rejected
    #[error("invalid handshake token")]
    InvalidToken,
    /// Handshake segment carried no token payload
    #[error("handshake token missing")]
    MissingToken,
    /// Auth option or nonce binding failed validation
    #[error("invalid handshake format")]
    InvalidFormat,
    /// A policy rule rejected the flow
    #[error("rejected by policy")]
    PolicyDrop,
    /// Packet arrived in a state that does not accept it
    #[error("packet received in invalid connection state")]
    InvalidState,
    /// A service hook refused the packet
    #[error("service hook refused packet")]
    ServiceFailure,
    /// Token sealing or opening failed
    #[error("crypto failure")]
    CryptoFailure,
}

impl DatapathError {
    /// Map the error to the drop reason carried in the verdict.
    pub fn reason(&self) -> DropReason {
        match self {
            Self::MalformedPacket(_) | Self::InvalidFormat => DropReason::InvalidFormat,
            Self::NoContext => DropReason::NoContext,
            Self::StateNotFound => DropReason::StateMissing,
            Self::InvalidToken | Self::CryptoFailure => DropReason::InvalidToken,
            Self::MissingToken => DropReason::MissingToken,
            Self::PolicyDrop => DropReason::PolicyDrop,
            Self::InvalidState => DropReason::InvalidState,
            Self::ServiceFailure => DropReason::ServiceFailure,
        }
    }
}

/// Reason a packet was dropped.
///
/// The first six variants are the categories surfaced to the collector;
/// the last two describe resolution failures that are never reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Token signature or structure rejected
    InvalidToken,
    /// Handshake segment carried no token payload
    MissingToken,
    /// Auth option or nonce binding failed validation
    InvalidFormat,
    /// A policy rule rejected the flow
    PolicyDrop,
    /// Packet arrived in a state that does not accept it
    InvalidState,
    /// A service hook refused the packet
    ServiceFailure,
    /// No processing-unit context matches the packet
    NoContext,
    /// No connection state recorded for the flow
    StateMissing,
}
