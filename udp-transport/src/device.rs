//! Transport bootstrap and the device's socket pair: the two listening
//! sockets (v4/v6) published behind an RCU-style swap, rebuilt wholesale on
//! `rebind`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use futures::TryStreamExt;
use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
use netlink_packet_route::RouteNetlinkMessage;
use rtnetlink::Handle;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::{Error, Result};
use crate::resolver::{Resolver, ResolverConfig, RoutingGenerations};
use crate::socket::{AddressFamily, Socket};

/// The two listening sockets (`Wg->Sock4`/`Wg->Sock6`), published through an
/// `ArcSwapOption` in place of `RcuAssignPointer`/`RcuDereference`. Sends
/// only ever take a transient `Guard` via `load()`; [`crate::recv::receive_loop`]
/// clones the `Arc` to hold it across its receive poll, so the old socket
/// handed back by `reinit` is not guaranteed to be the sole owner the
/// instant its rundown drains — only that no in-flight *accepted* datagram
/// still references it (see [`Socket::close`]).
#[derive(Default)]
pub struct SocketPair {
    v4: ArcSwapOption<Socket>,
    v6: ArcSwapOption<Socket>,
    port: std::sync::atomic::AtomicU16,
}

impl SocketPair {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Acquire)
    }

    pub(crate) fn for_family(&self, family: AddressFamily) -> &ArcSwapOption<Socket> {
        match family {
            AddressFamily::V4 => &self.v4,
            AddressFamily::V6 => &self.v6,
        }
    }

    /// Swaps in a new socket pair and waits for the old one to close.
    /// Mirrors `SocketReinit`: publish-then-synchronize-then-close.
    pub async fn reinit(&self, new4: Option<Socket>, new6: Option<Socket>, port: u16) {
        let new4 = new4.map(Arc::new);
        let new6 = new6.map(Arc::new);
        let had_any = new4.is_some() || new6.is_some();

        let old4 = self.v4.swap(new4);
        let old6 = self.v6.swap(new6);

        if had_any {
            self.port.store(port, Ordering::Release);
        }

        if let Some(old) = old4 {
            old.close().await;
        }
        if let Some(old) = old6 {
            old.close().await;
        }
    }
}

pub struct TransportConfig {
    /// The tunnel device's own interface index, excluded from route
    /// candidates during resolution (`Peer->Device->InterfaceLuid`).
    pub tunnel_ifindex: u32,
    pub resolver: ResolverConfig,
    /// Size, in bytes, of buffers drawn from the send-context pool.
    pub send_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tunnel_ifindex: 0,
            resolver: ResolverConfig::default(),
            send_buffer_size: 1500,
        }
    }
}

/// Transport-wide state: the socket pair, the resolver, and the
/// route-change watcher that keeps [`RoutingGenerations`] current.
///
/// There is no process-wide singleton the way `WskInit`/`WskUnload` guard
/// one: a `Transport` is constructed once per caller and its `Result` is the
/// cached init outcome, so there is nothing further to memoize (see
/// DESIGN.md).
pub struct Transport {
    pub(crate) sockets: SocketPair,
    pub(crate) resolver: Resolver,
    pub(crate) generations: Arc<RoutingGenerations>,
    pub(crate) pool: crate::pool::SendBufferPool,
    pub(crate) stats: Stats,
    tunnel_ifindex: u32,
    has_v4: bool,
    has_v6: bool,
    running: AtomicBool,
    route_watch: tokio::task::JoinHandle<()>,
}

/// Transport-wide counters. Names follow the original's `ifHCOut*`/
/// `ifInDiscards` MIB-style counters.
#[derive(Default)]
pub struct Stats {
    pub in_discards: std::sync::atomic::AtomicU64,
    pub tx_packets: std::sync::atomic::AtomicU64,
    pub tx_bytes: std::sync::atomic::AtomicU64,
    pub tx_errors: std::sync::atomic::AtomicU64,
}

impl Transport {
    /// Binds the initial socket pair, probes family availability, and
    /// starts watching for routing-table changes. Roughly the user-space
    /// equivalent of `WskInit` followed by `SocketInit`.
    pub async fn new(config: TransportConfig) -> Result<Arc<Self>> {
        let has_v4 = probe_family(AddressFamily::V4);
        let has_v6 = probe_family(AddressFamily::V6);

        if !has_v4 && !has_v6 {
            return Err(Error::NoTransport);
        }

        let (mut connection, handle, mut route_events) = rtnetlink::new_connection()?;
        subscribe_to_route_changes(&mut connection)?;
        tokio::spawn(connection);

        let generations = RoutingGenerations::new();
        let route_watch = tokio::spawn(route_watch_worker(route_events, generations.clone()));

        let transport = Arc::new(Self {
            sockets: SocketPair::new(),
            resolver: Resolver::new(handle, generations.clone(), config.resolver),
            generations,
            pool: crate::pool::SendBufferPool::new(config.send_buffer_size),
            stats: Stats::default(),
            tunnel_ifindex: config.tunnel_ifindex,
            has_v4,
            has_v6,
            running: AtomicBool::new(true),
            route_watch,
        });

        transport.rebind(0).await?;

        Ok(transport)
    }

    pub fn tunnel_ifindex(&self) -> u32 {
        self.tunnel_ifindex
    }

    pub fn is_up(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn local_port(&self) -> u16 {
        self.sockets.port()
    }

    pub fn local_addr(&self, family: AddressFamily) -> Option<SocketAddr> {
        let guard = self.sockets.for_family(family).load();
        guard.as_ref().map(|socket| socket.local_addr())
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// (Re)binds both sockets to `port` (0 for ephemeral) and swaps them in.
    /// Mirrors `SocketInit`'s retry loop: if IPv6 fails to bind an ephemeral
    /// port already taken by the just-bound IPv4 socket, drop it and retry,
    /// up to 100 times.
    pub async fn rebind(&self, port: u16) -> Result<()> {
        const MAX_RETRIES: u32 = 100;
        let mut retries = 0;

        loop {
            let new4 = if self.has_v4 {
                Some(Socket::bind(AddressFamily::V4, port)?)
            } else {
                None
            };

            let new6 = if self.has_v6 {
                match Socket::bind(AddressFamily::V6, port) {
                    Ok(socket) => Some(socket),
                    Err(e) if port == 0 && e.is_addr_in_use() && retries < MAX_RETRIES => {
                        // `new4` drops here, closing its fd, exactly as
                        // `CloseSocket(New4)` does before the retry.
                        retries += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            } else {
                None
            };

            let bound_port = new4
                .as_ref()
                .or(new6.as_ref())
                .map(|s| s.local_addr().port())
                .unwrap_or(port);

            self.sockets.reinit(new4, new6, bound_port).await;
            return Ok(());
        }
    }

    /// Tears down the transport: stops accepting new receives and closes
    /// both sockets. Mirrors `WskUnload`'s only-if-initialized teardown.
    pub async fn unload(&self) {
        self.running.store(false, Ordering::Release);
        self.sockets.reinit(None, None, 0).await;
        self.route_watch.abort();
    }
}

/// Binds the netlink socket to the route-change multicast groups so the
/// connection's message stream carries `RTM_NEWROUTE`/`RTM_DELROUTE`
/// notifications. Grounded on `bin-shared::tun_device_manager::linux`'s
/// `subscribe_to_route_changes`.
fn subscribe_to_route_changes(
    connection: &mut rtnetlink::proto::Connection<RouteNetlinkMessage>,
) -> Result<()> {
    use rtnetlink::sys::{AsyncSocket, SocketAddr};

    let groups = (libc::RTMGRP_IPV4_ROUTE | libc::RTMGRP_IPV6_ROUTE) as u32;

    connection
        .socket_mut()
        .socket_mut()
        .bind(&SocketAddr::new(0, groups))
        .map_err(Error::Io)?;

    Ok(())
}

/// Watches the route-change notification stream and bumps the per-family
/// routing generation counter on every `RTM_NEWROUTE`/`RTM_DELROUTE`,
/// mirroring `RouteChangeCallback`'s `InterlockedAdd(.., 2)`.
async fn route_watch_worker(
    mut events: UnboundedReceiver<(NetlinkMessage<RouteNetlinkMessage>, rtnetlink::sys::SocketAddr)>,
    generations: Arc<RoutingGenerations>,
) {
    while let Some((message, _)) = events.recv().await {
        let NetlinkPayload::InnerMessage(inner) = message.payload else {
            continue;
        };

        if !matches!(
            inner,
            RouteNetlinkMessage::NewRoute(_) | RouteNetlinkMessage::DelRoute(_)
        ) {
            continue;
        }

        // Bump both families on every route-change notification rather than
        // decoding which family the change affects: per spec.md §5, routing
        // generations are advisory, so the only cost of over-bumping is an
        // occasional unnecessary re-resolution, never a correctness issue.
        generations.bump(AddressFamily::V4);
        generations.bump(AddressFamily::V6);
    }
}

fn probe_family(family: AddressFamily) -> bool {
    match Socket::bind(family, 0) {
        Ok(_) => true,
        Err(e) => {
            tracing::debug!(%family, error = %e, "Transport not available for family");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::PeerEndpoint;
    use crate::send::send_buffer_to_peer;

    /// Mirrors spec.md §8 scenario 5: a stream of sends racing a single
    /// `rebind` (the user-space `SocketReinit`) must never see a freed
    /// socket and must only ever fail with a well-defined error.
    #[tokio::test]
    async fn concurrent_sends_survive_a_socket_reinit() {
        let transport = Transport::new(TransportConfig::default()).await.expect("transport init");
        let server_port = transport.local_port();
        let peer = Arc::new(PeerEndpoint::new(Some(
            format!("127.0.0.1:{server_port}").parse().unwrap(),
        )));

        let sender = {
            let transport = transport.clone();
            let peer = peer.clone();
            tokio::spawn(async move {
                for _ in 0..2_000 {
                    let result = send_buffer_to_peer(&transport, &peer, b"ping").await;
                    assert!(matches!(
                        result,
                        Ok(()) | Err(Error::NetworkUnreachable) | Err(Error::NoRoute)
                    ));
                }
            })
        };

        transport.rebind(0).await.expect("rebind should succeed");

        sender.await.expect("sender task panicked");
        transport.unload().await;
    }
}
