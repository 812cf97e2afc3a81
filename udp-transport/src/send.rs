//! Outbound send paths: the three entry points a tunnel engine calls to get
//! an encrypted datagram onto the wire, sharing one dispatcher.
//!
//! Ported from `SocketSendNblsToPeer`/`SocketSendBufferToPeer`/
//! `SocketSendBufferAsReplyToNbl`/`SendAsync` in the original driver.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;

use bufferpool::Buffer;
use bytes::BytesMut;

use crate::device::Transport;
use crate::endpoint::{endpoint_from_datagram, PeerEndpoint};
use crate::error::{Error, Result};
use crate::socket::AddressFamily;

/// Wire length of a minimal transport-data message carrying no payload:
/// header (16 bytes) + Poly1305 tag (16 bytes). Grounded on `boringtun`'s
/// `DATA_OVERHEAD_SZ` (`noise/mod.rs`), which is the smallest message the
/// noise layer above this transport ever emits.
pub const KEEPALIVE_LEN: usize = 32;

/// Sends a chain of already-encrypted packets to `peer` in one logical send.
///
/// Mirrors `SocketSendNblsToPeer`: resolves the peer's source once, then
/// dispatches every packet in the chain, and reports whether every packet in
/// the chain was keepalive-sized.
pub async fn send_chain_to_peer(
    transport: &Transport,
    peer: &PeerEndpoint,
    chain: Vec<Buffer<BytesMut>>,
) -> Result<bool> {
    if chain.is_empty() {
        return Err(Error::AlreadyComplete);
    }

    let mut all_keepalive = true;
    let mut total_bytes = 0u64;
    for packet in &chain {
        total_bytes += packet.len() as u64;
        if packet.len() != KEEPALIVE_LEN {
            all_keepalive = false;
        }
    }

    transport
        .resolver
        .resolve_peer_source(peer, transport.tunnel_ifindex())
        .await?;

    let endpoint = peer.get();
    let dst = endpoint.addr.ok_or(Error::NoEndpoint)?;
    let src = endpoint.src.map(|s| s.ip);

    // `WskSendMessages` sends the whole chain as one batched syscall; absent
    // an equivalent primitive here, this polyfills it as N individual sends
    // sharing one logical outcome, exactly as the "Polyfill for platforms
    // without SendMessages" design note prescribes.
    for packet in &chain {
        send_async(transport, dst, src, packet)?;
    }

    peer.add_tx_bytes(total_bytes);
    transport
        .stats
        .tx_packets
        .fetch_add(chain.len() as u64, Ordering::Relaxed);
    transport.stats.tx_bytes.fetch_add(total_bytes, Ordering::Relaxed);

    Ok(all_keepalive)
}

/// Sends a single internally-allocated buffer to `peer`.
///
/// Mirrors `SocketSendBufferToPeer`.
pub async fn send_buffer_to_peer(transport: &Transport, peer: &PeerEndpoint, buf: &[u8]) -> Result<()> {
    let payload = transport.pool.pull_initialised(buf);

    transport
        .resolver
        .resolve_peer_source(peer, transport.tunnel_ifindex())
        .await?;

    let endpoint = peer.get();
    let dst = endpoint.addr.ok_or(Error::NoEndpoint)?;
    let src = endpoint.src.map(|s| s.ip);

    send_async(transport, dst, src, &payload)?;
    peer.add_tx_bytes(payload.len() as u64);

    Ok(())
}

/// Sends a single internally-allocated buffer back to whoever sent
/// `datagram`, without consulting any peer's cached endpoint.
///
/// Mirrors `SocketSendBufferAsReplyToNbl`: the destination and source are
/// derived straight from the inbound datagram's learned address, so there is
/// no resolver call and this never awaits.
pub fn send_reply_to_datagram(
    transport: &Transport,
    datagram: &socket_factory::DatagramIn<'_>,
    buf: &[u8],
) -> Result<()> {
    let payload = transport.pool.pull_initialised(buf);
    let (endpoint, _routing_generation) = endpoint_from_datagram(datagram, &transport.generations)?;

    let dst = endpoint.addr.ok_or(Error::InvalidAddress)?;
    let src = endpoint.src.map(|s| s.ip);

    send_async(transport, dst, src, &payload)
}

/// Shared dispatch: picks the device's socket for `dst`'s family under an
/// RCU-style read and issues the datagram.
///
/// Mirrors `SendAsync`: returns `Success` once the send has been issued — a
/// failure from the socket itself is a completion-time failure in the
/// original (silent, stats-only); only the precondition "no socket for this
/// family" is surfaced to the caller, matching `STATUS_NETWORK_UNREACHABLE`.
fn send_async(transport: &Transport, dst: SocketAddr, src: Option<IpAddr>, packet: &[u8]) -> Result<()> {
    let family = AddressFamily::of(&dst);
    let guard = transport.sockets.for_family(family).load();
    let Some(socket) = guard.as_ref() else {
        return Err(Error::NetworkUnreachable);
    };

    if let Err(e) = socket.send(dst, src, packet) {
        tracing::debug!(error = %e, %dst, "Outbound send failed");
        transport.stats.tx_errors.fetch_add(1, Ordering::Relaxed);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::TransportConfig;

    #[tokio::test]
    async fn send_chain_to_peer_rejects_empty_chain() {
        let transport = Transport::new(TransportConfig::default()).await.expect("transport init");
        let peer = PeerEndpoint::new(Some("127.0.0.1:51820".parse().unwrap()));

        let result = send_chain_to_peer(&transport, &peer, Vec::new()).await;

        assert!(matches!(result, Err(Error::AlreadyComplete)));
    }

    #[tokio::test]
    async fn send_buffer_to_peer_round_trips_over_loopback() {
        let server = Transport::new(TransportConfig::default()).await.expect("server transport");
        let client = Transport::new(TransportConfig::default()).await.expect("client transport");

        let server_port = server.local_port();
        let peer = PeerEndpoint::new(Some(format!("127.0.0.1:{server_port}").parse().unwrap()));

        send_buffer_to_peer(&client, &peer, b"hello, peer").await.expect("send should succeed");

        assert_eq!(peer.tx_bytes(), "hello, peer".len() as u64);
    }
}
