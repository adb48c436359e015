use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

use crate::buffers::page_pool::PagePool;
use crate::config::TransportConfig;
use crate::dispatcher::ReadinessTarget;
use crate::error::TransportError;
use crate::hello::{Capabilities, ConnectionType};
use crate::identity::{EndpointId, ProcessId};
use crate::message_handler::{CorruptionAction, MessageHandler};
use crate::message_header::{Frame, MessagePayload};
use crate::rx::{receive, Received, RxState};
use crate::socket::{ConnTunables, SocketId, TransportSocket};
use crate::tx::{transmit, Completion, OutboundUnit};

/// Who a connection talks to, as established by the handshake
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer: EndpointId,
    pub peer_process: ProcessId,
    pub peer_incarnation: u64,
    pub conn_type: ConnectionType,
    pub socket: SocketId,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
    /// addresses the peer advertised in its hello
    pub peer_ips: Vec<Ipv4Addr>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Active,
    /// teardown started, no further sends or receives are issued
    Closing,
    /// the socket's readiness notifications are handed back to their original target
    Detached,
}

struct TxQueue {
    queue: VecDeque<OutboundUnit>,
    /// units that were sent zero-copy, waiting for the peer's ack before they complete
    zc_pending: FxHashMap<u64, OutboundUnit>,
    next_cookie: u64,
}

/// State of a single transport connection.
///
/// Transmit and receive progress is made inside readiness callbacks. Each direction has a
///  'scheduled' flag that keeps a second thread from running the same engine concurrently, and
///  a 'ready' flag recording that a notification arrived. A thread that finds the engine already
///  scheduled leaves the work to the thread running it, which re-checks the 'ready' flag before
///  it returns.
pub struct Connection {
    info: ConnectionInfo,
    caps: Capabilities,
    socket: Arc<dyn TransportSocket>,
    config: Arc<TransportConfig>,
    handler: Arc<dyn MessageHandler>,
    page_pool: Arc<PagePool>,

    closing: AtomicBool,
    state: Mutex<ConnectionState>,
    saved_target: Mutex<Option<Arc<dyn ReadinessTarget>>>,

    tx: Mutex<TxQueue>,
    tx_ready: AtomicBool,
    tx_scheduled: AtomicBool,

    rx: Mutex<RxState>,
    rx_ready: AtomicBool,
    rx_scheduled: AtomicBool,

    wakeup: Notify,
}

impl Connection {
    pub fn new(
        info: ConnectionInfo,
        caps: Capabilities,
        socket: Arc<dyn TransportSocket>,
        config: Arc<TransportConfig>,
        handler: Arc<dyn MessageHandler>,
        page_pool: Arc<PagePool>,
    ) -> Arc<Connection> {
        debug_assert_eq!(info.socket, socket.id());
        Arc::new(Connection {
            info,
            caps,
            socket,
            config,
            handler,
            page_pool,
            closing: AtomicBool::new(false),
            state: Mutex::new(ConnectionState::Active),
            saved_target: Mutex::new(None),
            tx: Mutex::new(TxQueue {
                queue: VecDeque::new(),
                zc_pending: FxHashMap::default(),
                next_cookie: 0,
            }),
            tx_ready: AtomicBool::new(true),
            tx_scheduled: AtomicBool::new(false),
            rx: Mutex::new(RxState::new()),
            rx_ready: AtomicBool::new(false),
            rx_scheduled: AtomicBool::new(false),
            wakeup: Notify::new(),
        })
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn socket(&self) -> &dyn TransportSocket {
        self.socket.as_ref()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// `true` while transmission waits for write space
    pub fn is_tx_blocked(&self) -> bool {
        !self.tx_ready.load(Ordering::Acquire)
    }

    /// Notified whenever the interest in readiness events changes
    pub fn wakeup(&self) -> &Notify {
        &self.wakeup
    }

    pub fn queued_units(&self) -> usize {
        self.tx.lock().queue.len()
    }

    pub fn pending_zero_copy_acks(&self) -> usize {
        self.tx.lock().zc_pending.len()
    }

    /// Effective buffer sizes and Nagle setting of the socket
    pub fn tunables(&self) -> Result<ConnTunables, TransportError> {
        if self.is_closing() {
            return Err(TransportError::Shutdown);
        }
        Ok(self.socket.tunables()?)
    }

    /// Sends data the network stack holds back for coalescing
    pub fn push(&self) -> Result<(), TransportError> {
        if self.is_closing() {
            return Err(TransportError::Shutdown);
        }
        trace!("pushing {:?}", self.info.socket);
        Ok(self.socket.push()?)
    }

    pub(crate) fn eager_ack_bit(&self) -> u32 {
        match self.info.conn_type.slot() {
            Some(slot) => 1 << slot,
            None => 0,
        }
    }

    /// Validates `unit` and appends it to the transmit queue without sending anything
    pub fn queue_unit(&self, mut unit: OutboundUnit) -> Result<(), TransportError> {
        if unit.payload().num_frags() > self.config.max_frags {
            let msg = format!("{} fragments exceed the maximum of {}", unit.payload().num_frags(), self.config.max_frags);
            unit.complete(Err(TransportError::ProtocolError(msg.clone())));
            return Err(TransportError::ProtocolError(msg));
        }
        if unit.payload_len() > self.config.max_message_size as usize {
            let msg = format!("payload of {} bytes exceeds the maximum of {}", unit.payload_len(), self.config.max_message_size);
            unit.complete(Err(TransportError::ProtocolError(msg.clone())));
            return Err(TransportError::ProtocolError(msg));
        }

        let mut tx = self.tx.lock();
        // checked under the queue lock so that teardown can't miss a unit
        if self.is_closing() {
            drop(tx);
            unit.complete(Err(TransportError::Shutdown));
            return Err(TransportError::Shutdown);
        }

        if self.caps.zero_copy && unit.is_zero_copy_eligible(self.config.zc_min_frag) {
            tx.next_cookie += 1;
            unit.request_zero_copy_ack(tx.next_cookie);
        }
        trace!("queueing {:?} on {:?}", unit, self.info.socket);
        tx.queue.push_back(unit);
        Ok(())
    }

    /// Runs the transmit engine unless another thread is running it already
    pub fn schedule_tx(&self) -> Result<(), TransportError> {
        loop {
            if self.tx_scheduled.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            let result = self.process_tx();
            self.tx_scheduled.store(false, Ordering::Release);
            result?;

            if self.is_tx_blocked() || self.tx.lock().queue.is_empty() {
                return Ok(());
            }
        }
    }

    pub(crate) fn on_write_space(&self) -> Result<(), TransportError> {
        self.tx_ready.store(true, Ordering::Release);
        self.schedule_tx()
    }

    pub(crate) fn on_readable(&self) -> Result<(), TransportError> {
        self.rx_ready.store(true, Ordering::Release);
        loop {
            if self.rx_scheduled.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            let result = self.process_rx();
            self.rx_scheduled.store(false, Ordering::Release);
            result?;

            if !self.rx_ready.load(Ordering::Acquire) {
                return Ok(());
            }
        }
    }

    fn process_tx(&self) -> Result<(), TransportError> {
        let mut completed = Vec::new();
        let result = self.transmit_queued(&mut completed);

        // completions may queue new units, so they run without the queue lock
        for completion in completed {
            completion(Ok(()));
        }
        result
    }

    fn transmit_queued(&self, completed: &mut Vec<Completion>) -> Result<(), TransportError> {
        let mut tx = self.tx.lock();
        while self.tx_ready.load(Ordering::Acquire) {
            let more_queued = tx.queue.len() > 1;
            let unit = match tx.queue.front_mut() {
                Some(unit) => unit,
                None => break,
            };

            // cleared before the attempt, write space reported while sending sets it again
            self.tx_ready.store(false, Ordering::Release);
            match transmit(self, unit, more_queued) {
                Ok(_) => {
                    self.tx_ready.store(true, Ordering::Release);
                    if unit.resid() > 0 {
                        continue;
                    }
                    if let Some(mut unit) = tx.queue.pop_front() {
                        let cookie = unit.header().zc_req_cookie;
                        if cookie != 0 {
                            trace!("{:?} waits for zero-copy ack {}", unit, cookie);
                            tx.zc_pending.insert(cookie, unit);
                        }
                        else if let Some(completion) = unit.take_completion() {
                            completed.push(completion);
                        }
                    }
                }
                Err(TransportError::WouldBlock) => {
                    if self.socket.is_out_of_space() && !self.tx_ready.load(Ordering::Acquire) {
                        trace!("{:?} is waiting for write space", self.info.socket);
                        self.wakeup.notify_one();
                        break;
                    }
                    // write space was reported since the send started
                    self.tx_ready.store(true, Ordering::Release);
                }
                Err(e) => {
                    self.tx_ready.store(true, Ordering::Release);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn process_rx(&self) -> Result<(), TransportError> {
        let mut rx = self.rx.lock();
        self.rx_ready.store(false, Ordering::Release);
        loop {
            if rx.is_phase_complete() {
                if let Some(received) = rx.advance(&self.caps, &self.config, &self.page_pool)? {
                    self.handle_received(received)?;
                }
                continue;
            }

            match receive(self, &mut rx) {
                Ok(_) => {}
                Err(TransportError::WouldBlock) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn handle_received(&self, received: Received) -> Result<(), TransportError> {
        let Received { header, frame, corruption } = received;

        // the sender's pages are released by the ack, even if the data turned out to be corrupt
        if header.zc_req_cookie != 0 {
            self.queue_zero_copy_ack(header.zc_req_cookie)?;
        }

        if let Some(error) = corruption {
            warn!("{:?} from {:?}", error, self.info.peer);
            if let Frame::Payload(_, MessagePayload::Pages(pages)) = frame {
                self.page_pool.recycle(pages);
            }
            let action = self.handler.on_corruption(&self.info, &error);

            // the ack cookie can't be trusted, and without it the acknowledged unit never completes
            if header.zc_ack_cookie != 0 {
                debug!("corrupt message carries zero-copy ack {}: closing", header.zc_ack_cookie);
                return Err(error);
            }
            return match action {
                CorruptionAction::Drop => Ok(()),
                CorruptionAction::Close => Err(error),
            };
        }

        if header.zc_ack_cookie != 0 {
            self.complete_zero_copy(header.zc_ack_cookie)?;
        }

        match frame {
            Frame::NoOp => trace!("no-op on {:?}", self.info.socket),
            Frame::Payload(routed, payload) => self.handler.on_message(&self.info, routed, payload),
        }
        Ok(())
    }

    fn queue_zero_copy_ack(&self, cookie: u64) -> Result<(), TransportError> {
        {
            let mut tx = self.tx.lock();
            if self.is_closing() {
                return Err(TransportError::Shutdown);
            }
            if !tx.queue.iter_mut().any(|unit| unit.try_attach_zero_copy_ack(cookie)) {
                trace!("sending zero-copy ack {} as no-op", cookie);
                tx.queue.push_back(OutboundUnit::noop(cookie));
            }
        }
        self.schedule_tx()
    }

    fn complete_zero_copy(&self, cookie: u64) -> Result<(), TransportError> {
        let unit = self.tx.lock().zc_pending.remove(&cookie);
        match unit {
            Some(unit) => {
                trace!("zero-copy ack {} completes {:?}", cookie, unit);
                unit.complete(Ok(()));
                Ok(())
            }
            None => Err(TransportError::ProtocolError(format!("zero-copy ack for unknown cookie {}", cookie))),
        }
    }

    pub(crate) fn save_target(&self, target: Arc<dyn ReadinessTarget>) {
        *self.saved_target.lock() = Some(target);
    }

    pub(crate) fn take_saved_target(&self) -> Option<Arc<dyn ReadinessTarget>> {
        self.saved_target.lock().take()
    }

    /// Sets the closing flag, returning `false` if it was set before
    pub(crate) fn mark_closing(&self) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.state.lock() = ConnectionState::Closing;
        true
    }

    /// Final step of teardown, after the socket binding was cleared: fails everything still
    ///  queued and notifies the handler
    pub(crate) fn detach(&self, reason: TransportError) {
        *self.state.lock() = ConnectionState::Detached;
        self.socket.shutdown();

        let (queued, pending) = {
            let mut tx = self.tx.lock();
            (std::mem::take(&mut tx.queue), std::mem::take(&mut tx.zc_pending))
        };
        let num_failed = queued.len() + pending.len();
        for unit in queued.into_iter().chain(pending.into_values()) {
            unit.complete(Err(TransportError::Shutdown));
        }

        // a receive callback may still be running on another thread, it owns the pages then
        if let Some(mut rx) = self.rx.try_lock() {
            self.page_pool.recycle(rx.take_pages());
        }

        self.wakeup.notify_one();
        if num_failed > 0 {
            debug!("failed {} outstanding units on {:?}", num_failed, self.info.socket);
        }
        info!("connection to {:?} ({:?}) closed: {}", self.info.peer, self.info.conn_type, reason);
        self.handler.on_closed(&self.info, &reason);
    }
}
