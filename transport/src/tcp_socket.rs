use std::io;
use std::io::{IoSlice, IoSliceMut};
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use socket2::SockRef;
use tokio::io::{Interest, Ready};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::buffers::page::Page;
use crate::sockopt;
use crate::socket::{ConnTunables, SocketId, TransportSocket};

#[cfg(target_os = "linux")]
const MSG_MORE: libc::c_int = libc::MSG_MORE;
#[cfg(not(target_os = "linux"))]
const MSG_MORE: libc::c_int = 0;

#[cfg(target_os = "linux")]
const MSG_NOSIGNAL: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const MSG_NOSIGNAL: libc::c_int = 0;

/// [TransportSocket] over a tokio [TcpStream]. Tokio is used for readiness only, all actual I/O
///  goes through non-blocking `try_*` calls.
///
/// The socket does not send zero-copy. `MSG_ZEROCOPY` reports completions through the socket's
///  error queue, which tokio's readiness tracking turns into a permanent 'write closed' state.
///  Pages are therefore always sent through a mapping, and only the peer's side of the zero-copy
///  protocol (acknowledging requests) is active on TCP connections.
pub struct TcpTransportSocket {
    id: SocketId,
    stream: TcpStream,
    out_of_space: AtomicBool,
}

impl TcpTransportSocket {
    pub fn new(stream: TcpStream) -> TcpTransportSocket {
        TcpTransportSocket {
            id: SocketId::next(),
            stream,
            out_of_space: AtomicBool::new(false),
        }
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub async fn ready(&self, interest: Interest) -> io::Result<Ready> {
        self.stream.ready(interest).await
    }

    /// Free space in the socket's send buffer
    pub fn write_space(&self) -> usize {
        let send_buffer = SockRef::from(&self.stream).send_buffer_size().unwrap_or(0);
        send_buffer.saturating_sub(self.unsent_bytes())
    }

    #[cfg(target_os = "linux")]
    fn unsent_bytes(&self) -> usize {
        use std::os::fd::AsRawFd;

        let mut queued: libc::c_int = 0;
        let rc = unsafe { libc::ioctl(self.stream.as_raw_fd(), libc::TIOCOUTQ, &mut queued as *mut libc::c_int) };
        if rc < 0 {
            debug!("SIOCOUTQ failed: {}", io::Error::last_os_error());
            return 0;
        }
        queued.max(0) as usize
    }

    #[cfg(not(target_os = "linux"))]
    fn unsent_bytes(&self) -> usize {
        0
    }

    /// Clears tokio's cached write readiness so that the next readiness poll waits for the
    ///  network stack to report freed space again
    pub fn rearm_writable(&self) {
        let _ = self.stream.try_io(Interest::WRITABLE, || Err::<(), _>(io::ErrorKind::WouldBlock.into()));
    }

    fn send_flags(more: bool) -> libc::c_int {
        if more {
            MSG_NOSIGNAL | MSG_MORE
        }
        else {
            MSG_NOSIGNAL
        }
    }

    fn track_space<T>(&self, result: io::Result<T>) -> io::Result<T> {
        if let Err(e) = &result {
            if e.kind() == io::ErrorKind::WouldBlock {
                trace!("socket {:?} is out of send buffer space", self.id);
                self.out_of_space.store(true, Ordering::Release);
            }
        }
        result
    }
}

impl TransportSocket for TcpTransportSocket {
    fn id(&self) -> SocketId {
        self.id
    }

    fn send_vectored(&self, bufs: &[IoSlice<'_>], more: bool) -> io::Result<usize> {
        let flags = Self::send_flags(more);
        let result = self.stream.try_io(Interest::WRITABLE, || {
            SockRef::from(&self.stream).send_vectored_with_flags(bufs, flags)
        });
        self.track_space(result)
    }

    fn send_page(&self, _page: &Page, _offset: usize, _len: usize, _more: bool) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "TCP sockets do not send zero-copy"))
    }

    fn recv_vectored(&self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        self.stream.try_read_vectored(bufs)
    }

    fn zero_copy_capable(&self) -> bool {
        false
    }

    fn is_out_of_space(&self) -> bool {
        self.out_of_space.load(Ordering::Acquire)
    }

    fn clear_out_of_space(&self) {
        self.out_of_space.store(false, Ordering::Release);
    }

    fn eager_ack(&self) {
        if let Err(e) = sockopt::eager_ack(&self.stream) {
            debug!("can't request eager ack on {:?}: {}", self.id, e);
        }
    }

    fn push(&self) -> io::Result<()> {
        sockopt::push(&self.stream)
    }

    fn tunables(&self) -> io::Result<ConnTunables> {
        sockopt::conn_tunables(&self.stream)
    }

    fn shutdown(&self) {
        if let Err(e) = SockRef::from(&self.stream).shutdown(Shutdown::Both) {
            debug!("shutdown of {:?} failed: {}", self.id, e);
        }
    }
}
