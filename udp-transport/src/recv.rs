//! Inbound receive path: turns a socket's datagram stream into batches
//! handed off to the tunnel engine, gating each datagram on the socket's
//! rundown protection until the engine releases it.
//!
//! Ported from the `Receive` WSK callback in the original driver. There is
//! no kernel thread invoking a callback here; `receive_loop` is the
//! user-space stand-in, a task that polls the bound socket and performs the
//! same per-datagram bookkeeping inline.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;

use crate::device::Transport;
use crate::rundown::RundownGuard;
use crate::socket::AddressFamily;

/// What the tunnel engine does with a batch of inbound datagrams. Stands in
/// for the out-of-scope engine's `PacketReceive` entry point.
pub trait PacketSink: Send + Sync {
    fn packet_received(&self, batch: Vec<ReceivedDatagram>);
}

/// One inbound datagram, still holding the owning socket's rundown
/// protection. Dropping it is the release: it mirrors the original's
/// "stash a back-pointer to the socket in the indication's `Next` slot,
/// release it later" pattern, except the release is automatic.
pub struct ReceivedDatagram {
    pub from: std::net::SocketAddr,
    pub local: std::net::SocketAddr,
    pub packet: Bytes,
    _rundown: RundownGuard,
}

/// Repeatedly polls `family`'s socket and hands batches of received
/// datagrams to `sink`. Exits once the device's socket for `family` is torn
/// down (e.g. on `Transport::unload`) and not replaced.
///
/// Mirrors `Receive`: for every datagram, checks the device is up and
/// acquires the socket's rundown protection before accepting it; either
/// failing drops the datagram and bumps `ifInDiscards`.
pub async fn receive_loop(transport: Arc<Transport>, family: AddressFamily, sink: Arc<dyn PacketSink>) {
    let mut buf = vec![0u8; 65535];

    loop {
        let socket = {
            let guard = transport.sockets.for_family(family).load();
            match guard.as_ref() {
                Some(socket) => Arc::clone(socket),
                None => return,
            }
        };

        let datagrams = std::future::poll_fn(|cx| socket.poll_recv_from(&mut buf, cx)).await;

        let datagrams = match datagrams {
            Ok(datagrams) => datagrams,
            Err(e) => {
                tracing::debug!(error = %e, %family, "Failed to receive datagram");
                continue;
            }
        };

        let mut batch = Vec::new();

        for datagram in datagrams {
            if !transport.is_up() {
                transport.stats.in_discards.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let Some(rundown) = socket.rundown().acquire() else {
                transport.stats.in_discards.fetch_add(1, Ordering::Relaxed);
                continue;
            };

            batch.push(ReceivedDatagram {
                from: datagram.from,
                local: datagram.local,
                packet: Bytes::copy_from_slice(datagram.packet),
                _rundown: rundown,
            });
        }

        if !batch.is_empty() {
            sink.packet_received(batch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::TransportConfig;
    use parking_lot::Mutex;

    struct CollectingSink {
        received: Mutex<Vec<ReceivedDatagram>>,
    }

    impl PacketSink for CollectingSink {
        fn packet_received(&self, mut batch: Vec<ReceivedDatagram>) {
            self.received.lock().append(&mut batch);
        }
    }

    #[tokio::test]
    async fn discards_when_device_is_down() {
        let transport = Transport::new(TransportConfig::default()).await.expect("transport init");
        transport.unload().await;

        assert!(!transport.is_up());
        assert_eq!(transport.stats().in_discards.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn receive_loop_hands_batches_to_sink() {
        let transport = Arc::new(Transport::new(TransportConfig::default()).await.expect("transport init"));
        let server_port = transport.local_port();

        let sink = Arc::new(CollectingSink {
            received: Mutex::new(Vec::new()),
        });

        let handle = tokio::spawn(receive_loop(transport.clone(), AddressFamily::V4, sink.clone()));

        let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.expect("client bind");
        client
            .send_to(b"hello", format!("127.0.0.1:{server_port}"))
            .await
            .expect("send should succeed");

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        handle.abort();
        transport.unload().await;

        let received = sink.received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(&received[0].packet[..], b"hello");
    }
}
