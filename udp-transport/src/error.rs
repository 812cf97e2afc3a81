use std::io;

/// Unified result type for the transport.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the transport.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Standard IO error, e.g. from binding or sending on a socket.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Netlink-origin error while querying or subscribing to the routing table.
    #[error(transparent)]
    Netlink(#[from] rtnetlink::Error),

    /// A peer has no endpoint set yet; there is nowhere to send to.
    #[error("peer has no endpoint")]
    NoEndpoint,

    /// No route could be resolved to the peer's endpoint address.
    #[error("no route to peer endpoint")]
    NoRoute,

    /// The socket for the endpoint's address family is not currently bound
    /// (family unsupported on this host, or the socket pair is draining).
    #[error("network unreachable: no socket for this address family")]
    NetworkUnreachable,

    /// Neither IPv4 nor IPv6 UDP transport is available on this host.
    #[error("no UDP transport available")]
    NoTransport,

    /// A send was attempted with an empty chain; there was nothing to do.
    #[error("chain was already empty")]
    AlreadyComplete,

    /// The send-buffer allocator is out of memory (as opposed to a pool miss,
    /// which never fails; see `pool` module docs).
    #[error("insufficient resources to complete the send")]
    InsufficientResources,

    /// An inbound datagram or peer endpoint carried a malformed address.
    #[error("invalid address")]
    InvalidAddress,

    /// A caller-supplied parameter was malformed (e.g. a peer endpoint with
    /// no address family set).
    #[error("invalid parameter")]
    InvalidParameter,
}

impl Error {
    /// Mirrors the `STATUS_ADDRESS_ALREADY_EXISTS` retry condition in the
    /// original ephemeral-port allocation loop.
    pub(crate) fn is_addr_in_use(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::AddrInUse)
    }
}
