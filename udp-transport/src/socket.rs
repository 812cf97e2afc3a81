//! The socket object: a single bound UDP socket plus the rundown protection
//! that gates its close against in-flight sends/receives.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::AsRawFd;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use socket_factory::{DatagramIn, DatagramOut};

use crate::error::{Error, Result};
use crate::rundown::Rundown;

/// Address family a [`Socket`] is bound to. There is exactly one socket per
/// family in a [`crate::device::SocketPair`], matching `Wg->Sock4`/`Wg->Sock6`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::V4 => f.write_str("IPv4"),
            AddressFamily::V6 => f.write_str("IPv6"),
        }
    }
}

impl AddressFamily {
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => AddressFamily::V4,
            SocketAddr::V6(_) => AddressFamily::V6,
        }
    }

    fn wildcard(self, port: u16) -> SocketAddr {
        match self {
            AddressFamily::V4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            AddressFamily::V6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
        }
    }
}

pub struct Socket {
    udp: Mutex<socket_factory::UdpSocket>,
    local_addr: SocketAddr,
    family: AddressFamily,
    rundown: Rundown,
}

impl Socket {
    /// Binds a new UDP socket for `family` on `port` (0 for ephemeral).
    ///
    /// `quinn_udp::UdpSocketState` (used internally by `socket_factory::udp`)
    /// already enables `IP_PKTINFO`/`IPV6_PKTINFO` so that received datagrams
    /// carry their destination address and outbound ones can carry an
    /// explicit source; the only option layered on top here is UDP checksum
    /// disabling, a Linux-only, best-effort knob the original always set for
    /// v4 sockets (`UDP_NOCHECKSUM`).
    pub fn bind(family: AddressFamily, port: u16) -> Result<Self> {
        let addr = family.wildcard(port);
        let udp = socket_factory::udp(&addr)?;
        let local_addr = local_addr_of(&udp)?;

        if family == AddressFamily::V4 {
            disable_checksum_best_effort(&udp);
        }

        tracing::debug!(%family, local = %local_addr, "Bound UDP socket");

        Ok(Self {
            udp: Mutex::new(udp),
            local_addr,
            family,
            rundown: Rundown::new(),
        })
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn rundown(&self) -> &Rundown {
        &self.rundown
    }

    /// Sends one datagram. `src` carries the resolver's chosen source
    /// address, if any; `None` lets the OS pick.
    pub fn send(&self, dst: SocketAddr, src: Option<IpAddr>, packet: &[u8]) -> Result<()> {
        let src = src.map(|ip| SocketAddr::new(ip, 0));

        self.udp.lock().send(DatagramOut {
            src,
            dst,
            packet: packet.into(),
            segment_size: None,
        })?;

        Ok(())
    }

    pub fn poll_recv_from<'b>(
        &self,
        buffer: &'b mut [u8],
        cx: &mut Context<'_>,
    ) -> Poll<Result<impl Iterator<Item = DatagramIn<'b>> + fmt::Debug>> {
        self.udp.lock().poll_recv_from(buffer, cx).map_err(Error::from)
    }

    /// Waits for every accepted receive to finish, then drops this `Arc`.
    /// Mirrors `CloseSocket`'s rundown wait ahead of the actual
    /// `WskCloseSocket`.
    ///
    /// Takes `Arc<Self>` rather than `self`: the socket is reached through an
    /// [`arc_swap::ArcSwapOption`] elsewhere. Sends borrow it through a
    /// transient `Guard`, gone by the time this runs. [`crate::recv::receive_loop`]
    /// does hold a cloned `Arc` across its `poll_recv_from` await, so this
    /// `Arc` is not always the sole one left: the rundown drain still
    /// guarantees no in-flight *accepted* datagram references the socket
    /// (preventing use-after-free), but the fd itself may not actually close
    /// until that loop's pending poll also completes or is cancelled and
    /// drops its clone.
    pub async fn close(self: std::sync::Arc<Self>) {
        self.rundown.wait_drained().await;
        tracing::debug!(family = %self.family, local = %self.local_addr, "Closed UDP socket");
    }
}

fn local_addr_of(udp: &socket_factory::UdpSocket) -> Result<SocketAddr> {
    use std::os::fd::AsFd;

    let raw = udp.as_fd();
    let socket = socket2::SockRef::from(&raw);
    Ok(socket.local_addr()?.as_socket().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "socket has no local address")
    })?)
}

#[cfg(target_os = "linux")]
fn disable_checksum_best_effort(udp: &socket_factory::UdpSocket) {
    let fd = udp.as_raw_fd();
    let value: libc::c_int = 1;

    // SAFETY: `fd` is a valid, open socket for the lifetime of this call;
    // `value` is a plain `c_int` matching `SO_NO_CHECK`'s expected optval.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_NO_CHECK,
            std::ptr::addr_of!(value).cast(),
            std::mem::size_of_val(&value) as libc::socklen_t,
        )
    };

    if rc != 0 {
        tracing::trace!(
            error = %std::io::Error::last_os_error(),
            "Failed to disable UDP checksum on v4 socket"
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn disable_checksum_best_effort(_udp: &socket_factory::UdpSocket) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_ephemeral_wildcard_socket() {
        let socket = Socket::bind(AddressFamily::V4, 0).expect("bind should succeed");
        assert_ne!(socket.local_addr().port(), 0);
        assert_eq!(socket.family(), AddressFamily::V4);
    }
}
