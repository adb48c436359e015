use std::collections::VecDeque;
use std::io;
use std::io::{IoSlice, IoSliceMut};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;

use crate::buffers::page::Page;
use crate::buffers::page_pool::PagePool;
use crate::config::TransportConfig;
use crate::connection::{Connection, ConnectionInfo};
use crate::error::TransportError;
use crate::hello::{ByteOrder, Capabilities, ConnectionType, PROTOCOL_V2};
use crate::identity::{EndpointId, ProcessId};
use crate::message_handler::{CorruptionAction, MessageHandler};
use crate::message_header::{MessagePayload, RoutedHeader};
use crate::socket::{ConnTunables, SocketId, TransportSocket};

pub fn routed(payload_len: u32) -> RoutedHeader {
    RoutedHeader {
        dest_endpoint: EndpointId(2),
        src_endpoint: EndpointId(1),
        dest_process: ProcessId(20),
        src_process: ProcessId(10),
        msg_type: 3,
        payload_len,
        body: [7; RoutedHeader::BODY_LEN],
    }
}

#[derive(Default)]
struct Pipe {
    data: VecDeque<u8>,
    closed: bool,
}

/// One end of an in-memory byte stream with bounded buffer space, for driving the transmit and
///  receive engines deterministically
pub struct MemorySocket {
    id: SocketId,
    outgoing: Arc<Mutex<Pipe>>,
    incoming: Arc<Mutex<Pipe>>,
    capacity: usize,
    max_per_call: usize,

    out_of_space: AtomicBool,
    blocked: AtomicBool,
    spurious_would_block: AtomicUsize,
    corrupt_at: Mutex<Option<usize>>,
    total_sent: AtomicUsize,
    shut_down: AtomicBool,

    send_calls: AtomicUsize,
    recv_calls: AtomicUsize,
    page_sends: AtomicUsize,
    eager_acks: AtomicUsize,
    pushes: AtomicUsize,
    more_flags: Mutex<Vec<bool>>,
}

impl MemorySocket {
    /// Two connected sockets. `capacity` limits the bytes in flight per direction,
    ///  `max_per_call` the bytes transferred by a single send or receive call.
    pub fn pair(capacity: usize, max_per_call: usize) -> (Arc<MemorySocket>, Arc<MemorySocket>) {
        let a_to_b = Arc::new(Mutex::new(Pipe::default()));
        let b_to_a = Arc::new(Mutex::new(Pipe::default()));
        (
            Arc::new(MemorySocket::new(a_to_b.clone(), b_to_a.clone(), capacity, max_per_call)),
            Arc::new(MemorySocket::new(b_to_a, a_to_b, capacity, max_per_call)),
        )
    }

    fn new(outgoing: Arc<Mutex<Pipe>>, incoming: Arc<Mutex<Pipe>>, capacity: usize, max_per_call: usize) -> MemorySocket {
        MemorySocket {
            id: SocketId::next(),
            outgoing,
            incoming,
            capacity,
            max_per_call,
            out_of_space: AtomicBool::new(false),
            blocked: AtomicBool::new(false),
            spurious_would_block: AtomicUsize::new(0),
            corrupt_at: Mutex::new(None),
            total_sent: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
            send_calls: AtomicUsize::new(0),
            recv_calls: AtomicUsize::new(0),
            page_sends: AtomicUsize::new(0),
            eager_acks: AtomicUsize::new(0),
            pushes: AtomicUsize::new(0),
            more_flags: Default::default(),
        }
    }

    /// Makes raw bytes available to the peer, regardless of buffer space
    pub fn push_raw(&self, data: &[u8]) {
        self.outgoing.lock().data.extend(data);
    }

    /// Drains everything the peer sent to this socket
    pub fn take_all(&self) -> Vec<u8> {
        self.incoming.lock().data.drain(..).collect()
    }

    /// End of stream for the peer once it consumed the remaining data
    pub fn close(&self) {
        self.outgoing.lock().closed = true;
    }

    /// Bytes sent by this socket that the peer did not receive yet
    pub fn in_flight(&self) -> usize {
        self.outgoing.lock().data.len()
    }

    /// Sends fail for lack of space while blocked
    pub fn block_sends(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::SeqCst);
    }

    /// The next `n` sends report `WouldBlock` although the socket has space, as happens when
    ///  space is freed concurrently
    pub fn spurious_would_block(&self, n: usize) {
        self.spurious_would_block.store(n, Ordering::SeqCst);
    }

    /// Flips a bit in the byte at the given offset of the outgoing stream
    pub fn corrupt_at(&self, offset: usize) {
        *self.corrupt_at.lock() = Some(offset);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn send_calls(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }

    pub fn recv_calls(&self) -> usize {
        self.recv_calls.load(Ordering::SeqCst)
    }

    pub fn page_sends(&self) -> usize {
        self.page_sends.load(Ordering::SeqCst)
    }

    pub fn eager_acks(&self) -> usize {
        self.eager_acks.load(Ordering::SeqCst)
    }

    pub fn pushes(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    pub fn more_flags(&self) -> Vec<bool> {
        self.more_flags.lock().clone()
    }

    fn write(&self, chunks: &[&[u8]], more: bool) -> io::Result<usize> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        if self.is_shut_down() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        if self.spurious_would_block.load(Ordering::SeqCst) > 0 {
            self.spurious_would_block.fetch_sub(1, Ordering::SeqCst);
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let mut pipe = self.outgoing.lock();
        let available = self.capacity.saturating_sub(pipe.data.len());
        if available == 0 || self.blocked.load(Ordering::SeqCst) {
            self.out_of_space.store(true, Ordering::SeqCst);
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let corrupt_at = *self.corrupt_at.lock();
        let mut remaining = available.min(self.max_per_call);
        let mut sent = 0;
        for chunk in chunks {
            let n = chunk.len().min(remaining);
            for &byte in &chunk[..n] {
                let offset = self.total_sent.fetch_add(1, Ordering::SeqCst);
                if corrupt_at == Some(offset) {
                    pipe.data.push_back(byte ^ 0x10);
                }
                else {
                    pipe.data.push_back(byte);
                }
            }
            sent += n;
            remaining -= n;
            if remaining == 0 {
                break;
            }
        }
        self.more_flags.lock().push(more);
        Ok(sent)
    }
}

impl TransportSocket for MemorySocket {
    fn id(&self) -> SocketId {
        self.id
    }

    fn send_vectored(&self, bufs: &[IoSlice<'_>], more: bool) -> io::Result<usize> {
        let chunks: Vec<&[u8]> = bufs.iter().map(|b| &b[..]).collect();
        self.write(&chunks, more)
    }

    fn send_page(&self, page: &Page, offset: usize, len: usize, more: bool) -> io::Result<usize> {
        self.page_sends.fetch_add(1, Ordering::SeqCst);
        let mapped = page.map();
        self.write(&[&mapped[offset..offset + len]], more)
    }

    fn recv_vectored(&self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        self.recv_calls.fetch_add(1, Ordering::SeqCst);
        let mut pipe = self.incoming.lock();
        if pipe.data.is_empty() {
            if pipe.closed {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let mut remaining = self.max_per_call;
        let mut received = 0;
        for buf in bufs.iter_mut() {
            let n = buf.len().min(remaining).min(pipe.data.len());
            for (i, byte) in pipe.data.drain(..n).enumerate() {
                buf[i] = byte;
            }
            received += n;
            remaining -= n;
            if remaining == 0 || pipe.data.is_empty() {
                break;
            }
        }
        Ok(received)
    }

    fn zero_copy_capable(&self) -> bool {
        true
    }

    fn is_out_of_space(&self) -> bool {
        self.out_of_space.load(Ordering::SeqCst)
    }

    fn clear_out_of_space(&self) {
        self.out_of_space.store(false, Ordering::SeqCst);
    }

    fn eager_ack(&self) {
        self.eager_acks.fetch_add(1, Ordering::SeqCst);
    }

    fn push(&self) -> io::Result<()> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn tunables(&self) -> io::Result<ConnTunables> {
        Ok(ConnTunables {
            tx_buffer_size: self.capacity,
            rx_buffer_size: self.capacity,
            nagle: false,
        })
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.outgoing.lock().closed = true;
    }
}

/// A protocol version 2 control connection on top of `socket`
pub fn test_connection(socket: Arc<MemorySocket>, config: TransportConfig, handler: Arc<dyn MessageHandler>) -> Arc<Connection> {
    let caps = Capabilities::negotiate(PROTOCOL_V2, ByteOrder::Network, socket.zero_copy_capable(), &config);
    let info = ConnectionInfo {
        peer: EndpointId(2),
        peer_process: ProcessId(20),
        peer_incarnation: 1,
        conn_type: ConnectionType::Control,
        socket: socket.id(),
        peer_addr: SocketAddr::from(([10, 0, 0, 2], 988)),
        local_addr: SocketAddr::from(([10, 0, 0, 1], 1023)),
        peer_ips: vec![Ipv4Addr::new(10, 0, 0, 2)],
    };
    Connection::new(info, caps, socket, Arc::new(config), handler, Arc::new(PagePool::new(16)))
}

/// Records everything it is called with
pub struct CollectingHandler {
    messages: Mutex<Vec<(RoutedHeader, Vec<u8>)>>,
    corruptions: Mutex<Vec<String>>,
    closed: Mutex<Vec<(ConnectionInfo, String)>>,
    action: CorruptionAction,
}

impl Default for CollectingHandler {
    fn default() -> Self {
        CollectingHandler::with_action(CorruptionAction::Drop)
    }
}

impl CollectingHandler {
    pub fn with_action(action: CorruptionAction) -> CollectingHandler {
        CollectingHandler {
            messages: Default::default(),
            corruptions: Default::default(),
            closed: Default::default(),
            action,
        }
    }

    pub fn messages(&self) -> Vec<(RoutedHeader, Vec<u8>)> {
        self.messages.lock().clone()
    }

    pub fn num_messages(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn corruptions(&self) -> Vec<String> {
        self.corruptions.lock().clone()
    }

    pub fn closed(&self) -> Vec<(ConnectionInfo, String)> {
        self.closed.lock().clone()
    }
}

impl MessageHandler for CollectingHandler {
    fn on_message(&self, _conn: &ConnectionInfo, header: RoutedHeader, payload: MessagePayload) {
        self.messages.lock().push((header, payload.to_vec()));
    }

    fn on_corruption(&self, _conn: &ConnectionInfo, error: &TransportError) -> CorruptionAction {
        self.corruptions.lock().push(error.to_string());
        self.action
    }

    fn on_closed(&self, conn: &ConnectionInfo, reason: &TransportError) {
        self.closed.lock().push((conn.clone(), reason.to_string()));
    }
}

/// Collects the results passed to unit completions, in the order they were called
#[derive(Clone, Default)]
pub struct CompletionLog {
    results: Arc<Mutex<Vec<Result<(), String>>>>,
}

impl CompletionLog {
    pub fn callback(&self) -> impl FnOnce(Result<(), TransportError>) + Send + 'static {
        let results = self.results.clone();
        move |result| results.lock().push(result.map_err(|e| e.to_string()))
    }

    pub fn results(&self) -> Vec<Result<(), String>> {
        self.results.lock().clone()
    }
}
