use std::io;
use std::io::{IoSlice, IoSliceMut};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::buffers::page::Page;

/// Identity of a socket in the readiness dispatcher's binding table
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SocketId(pub u64);

impl SocketId {
    pub fn next() -> SocketId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SocketId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Effective buffer sizes and Nagle setting of a live connection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnTunables {
    pub tx_buffer_size: usize,
    pub rx_buffer_size: usize,
    pub nagle: bool,
}

/// The non-blocking byte stream operations the transmit and receive engines are built on.
///
/// All operations return immediately. When the socket cannot take (or provide) any data, they
///  fail with [io::ErrorKind::WouldBlock], and a failed send additionally marks the socket as out
///  of space until [TransportSocket::clear_out_of_space] is called.
pub trait TransportSocket: Send + Sync + 'static {
    fn id(&self) -> SocketId;

    /// Gather write. `more` hints that more data follows immediately, allowing the network stack
    ///  to coalesce segments.
    fn send_vectored(&self, bufs: &[IoSlice<'_>], more: bool) -> io::Result<usize>;

    /// Sends a byte range of a page without staging it in a buffer first. Only called on sockets
    ///  that report [TransportSocket::zero_copy_capable], and the caller keeps the page alive and
    ///  unmodified until the peer acknowledges the data.
    fn send_page(&self, page: &Page, offset: usize, len: usize, more: bool) -> io::Result<usize>;

    /// Scatter read, returning `Ok(0)` on end of stream
    fn recv_vectored(&self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize>;

    fn zero_copy_capable(&self) -> bool;

    /// `true` if a send failed for lack of buffer space, and no write space notification has
    ///  cleared the condition since
    fn is_out_of_space(&self) -> bool;
    fn clear_out_of_space(&self);

    /// Asks the network stack to acknowledge received data right away
    fn eager_ack(&self);

    /// Sends whatever the network stack holds back for coalescing right away
    fn push(&self) -> io::Result<()>;

    fn tunables(&self) -> io::Result<ConnTunables>;

    fn shutdown(&self);
}
