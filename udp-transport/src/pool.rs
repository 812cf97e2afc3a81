//! Send-context pool: a lock-free pool of reusable, fixed-size buffers for
//! outbound datagrams, replacing the `ExAllocateFromLookasideListEx`
//! lookaside list used for `SOCKET_SEND_CTX` in the original.

use bufferpool::{Buffer, BufferPool};
use bytes::BytesMut;

/// A pool of reusable outbound-datagram buffers.
///
/// Exhaustion never blocks or fails here: like `bufferpool::BufferPool`, a
/// miss just allocates a fresh buffer and returns it to the pool on drop.
/// [`crate::Error`]'s `NoTransport`/IO variants cover genuine allocator
/// failure; there is no dedicated "pool exhausted" error, which is a
/// deliberate divergence from a literal port of the lookaside list (see
/// DESIGN.md).
#[derive(Clone)]
pub struct SendBufferPool {
    inner: BufferPool<BytesMut>,
}

impl SendBufferPool {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            inner: BufferPool::new(buffer_size, "udp_transport::send"),
        }
    }

    pub fn pull(&self) -> Buffer<BytesMut> {
        self.inner.pull()
    }

    pub fn pull_initialised(&self, data: &[u8]) -> Buffer<BytesMut> {
        self.inner.pull_initialised(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulled_buffer_round_trips_contents() {
        let pool = SendBufferPool::new(1500);
        let buf = pool.pull_initialised(b"hello");
        assert_eq!(&buf[..], b"hello");
    }
}
