//! Receive engine and message assembly.
//!
//! Incoming bytes pass through the phases of a message: the fixed message header, the routed
//!  header (payload messages only), and the payload. Payloads up to a page go into a single
//!  buffer, bigger ones into pool pages that are mapped one at a time while data arrives.
//!
//! When the connection supports checksums and the header carries one, a running checksum is
//!  kept over everything received after the header. The header's own contribution (with a zero
//!  checksum field) is added when the header is complete.

use std::io::IoSliceMut;
use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::buffers::page::{PageFrag, PAGE_SIZE};
use crate::buffers::page_pool::PagePool;
use crate::checksum::{checksum, finalize, CHECKSUM_SEED};
use crate::config::TransportConfig;
use crate::connection::Connection;
use crate::error::TransportError;
use crate::hello::Capabilities;
use crate::message_header::{Frame, MessageHeader, MessageKind, MessagePayload, RoutedHeader};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RxPhase {
    Header,
    Routed,
    FlatPayload,
    PagePayload,
}

/// A completely received message, together with the result of checksum verification
#[derive(Debug)]
pub struct Received {
    pub header: MessageHeader,
    pub frame: Frame,
    pub corruption: Option<TransportError>,
}

pub struct RxState {
    phase: RxPhase,
    offset: usize,
    header_buf: [u8; MessageHeader::SERIALIZED_LEN],
    routed_buf: [u8; RoutedHeader::SERIALIZED_LEN],
    header: Option<MessageHeader>,
    routed: Option<RoutedHeader>,
    flat: BytesMut,
    pages: Vec<PageFrag>,
    frag_index: usize,
    checksumming: bool,
    csum: u32,
    csum_bytes: usize,
}

impl RxState {
    pub fn new() -> RxState {
        RxState {
            phase: RxPhase::Header,
            offset: 0,
            header_buf: [0; MessageHeader::SERIALIZED_LEN],
            routed_buf: [0; RoutedHeader::SERIALIZED_LEN],
            header: None,
            routed: None,
            flat: BytesMut::new(),
            pages: Vec::new(),
            frag_index: 0,
            checksumming: false,
            csum: CHECKSUM_SEED,
            csum_bytes: 0,
        }
    }

    /// The running checksum and the number of bytes it covers so far
    pub fn checksum_progress(&self) -> (u32, usize) {
        (self.csum, self.csum_bytes)
    }

    /// Bytes still wanted before the current phase is complete
    pub fn wanted(&self) -> usize {
        match self.phase {
            RxPhase::Header => MessageHeader::SERIALIZED_LEN - self.offset,
            RxPhase::Routed => RoutedHeader::SERIALIZED_LEN - self.offset,
            RxPhase::FlatPayload => self.flat.len() - self.offset,
            RxPhase::PagePayload => self.pages[self.frag_index..].iter().map(|f| f.len).sum::<usize>() - self.offset,
        }
    }

    pub fn is_phase_complete(&self) -> bool {
        match self.phase {
            RxPhase::PagePayload => self.frag_index == self.pages.len(),
            _ => self.wanted() == 0,
        }
    }

    /// Moves on to the next phase once the current one is complete, returning the message
    ///  when it is done
    pub fn advance(&mut self, caps: &Capabilities, config: &TransportConfig, pool: &PagePool) -> Result<Option<Received>, TransportError> {
        debug_assert!(self.is_phase_complete());

        match self.phase {
            RxPhase::Header => {
                let header = MessageHeader::deser(&mut &self.header_buf[..], caps.byte_order)?;
                self.start_checksum(&header, caps);
                match header.kind {
                    MessageKind::NoOp => {
                        self.header = Some(header);
                        Ok(Some(self.complete(Frame::NoOp)))
                    }
                    MessageKind::Payload => {
                        self.header = Some(header);
                        self.enter(RxPhase::Routed);
                        Ok(None)
                    }
                }
            }
            RxPhase::Routed => {
                let routed = RoutedHeader::deser(&mut &self.routed_buf[..], caps.byte_order, config.max_message_size)?;
                let payload_len = routed.payload_len as usize;
                trace!("receiving {:?}", routed);
                self.routed = Some(routed);

                if payload_len == 0 {
                    let frame = self.payload_frame(MessagePayload::Flat(Bytes::new()));
                    return Ok(Some(self.complete(frame)));
                }

                if payload_len <= PAGE_SIZE {
                    self.flat = BytesMut::zeroed(payload_len);
                    self.enter(RxPhase::FlatPayload);
                }
                else {
                    self.pages = pool.frags_for(payload_len);
                    self.frag_index = 0;
                    self.enter(RxPhase::PagePayload);
                }
                Ok(None)
            }
            RxPhase::FlatPayload => {
                let payload = std::mem::take(&mut self.flat).freeze();
                let frame = self.payload_frame(MessagePayload::Flat(payload));
                Ok(Some(self.complete(frame)))
            }
            RxPhase::PagePayload => {
                let pages = std::mem::take(&mut self.pages);
                let frame = self.payload_frame(MessagePayload::Pages(pages));
                Ok(Some(self.complete(frame)))
            }
        }
    }

    /// Pages of a partially received message, for returning them to the pool on teardown
    pub fn take_pages(&mut self) -> Vec<PageFrag> {
        std::mem::take(&mut self.pages)
    }

    fn enter(&mut self, phase: RxPhase) {
        self.phase = phase;
        self.offset = 0;
    }

    fn start_checksum(&mut self, header: &MessageHeader, caps: &Capabilities) {
        self.checksumming = caps.checksum && header.checksum != 0;
        if !self.checksumming {
            return;
        }

        let mut raw = self.header_buf;
        raw[MessageHeader::CHECKSUM_OFFSET..MessageHeader::CHECKSUM_OFFSET + 4].fill(0);
        self.csum = checksum(CHECKSUM_SEED, &raw);
        self.csum_bytes = raw.len();
    }

    fn payload_frame(&mut self, payload: MessagePayload) -> Frame {
        match self.routed.take() {
            Some(routed) => Frame::Payload(routed, payload),
            None => Frame::NoOp,
        }
    }

    fn complete(&mut self, frame: Frame) -> Received {
        let header = self.header.take().unwrap_or_else(|| MessageHeader::noop(0));

        let mut corruption = None;
        if self.checksumming {
            let actual = finalize(self.csum);
            if actual != header.checksum {
                debug!("checksum mismatch after {} bytes: expected {:#x}, calculated {:#x}", self.csum_bytes, header.checksum, actual);
                corruption = Some(TransportError::CorruptionDetected {
                    expected: header.checksum,
                    actual,
                });
            }
        }

        self.checksumming = false;
        self.csum = CHECKSUM_SEED;
        self.csum_bytes = 0;
        self.frag_index = 0;
        self.enter(RxPhase::Header);

        Received {
            header,
            frame,
            corruption,
        }
    }
}

impl Default for RxState {
    fn default() -> Self {
        RxState::new()
    }
}

/// One non-blocking receive call for the current phase, returning the number of bytes received
pub fn receive(conn: &Connection, rx: &mut RxState) -> Result<usize, TransportError> {
    if conn.is_closing() {
        return Err(TransportError::Shutdown);
    }

    let received = match rx.phase {
        RxPhase::PagePayload => recv_kiov(conn, rx)?,
        _ => recv_iov(conn, rx)?,
    };

    if conn.config().eager_ack & conn.eager_ack_bit() != 0 {
        conn.socket().eager_ack();
    }
    Ok(received)
}

fn recv_iov(conn: &Connection, rx: &mut RxState) -> Result<usize, TransportError> {
    let RxState { phase, offset, header_buf, routed_buf, flat, checksumming, csum, csum_bytes, .. } = rx;

    let target: &mut [u8] = match phase {
        RxPhase::Header => &mut header_buf[*offset..],
        RxPhase::Routed => &mut routed_buf[*offset..],
        RxPhase::FlatPayload => &mut flat[*offset..],
        RxPhase::PagePayload => return Err(TransportError::ProtocolError("page payload in flat receive path".to_string())),
    };
    if target.is_empty() {
        return Ok(0);
    }

    let received = conn.socket().recv_vectored(&mut [IoSliceMut::new(target)])?;
    if received == 0 {
        return Err(TransportError::eof());
    }

    if *checksumming {
        *csum = checksum(*csum, &target[..received]);
        *csum_bytes += received;
    }
    *offset += received;
    Ok(received)
}

/// Receives into the current page fragment, which is mapped for the duration of the call only
fn recv_kiov(conn: &Connection, rx: &mut RxState) -> Result<usize, TransportError> {
    let frag = match rx.pages.get(rx.frag_index) {
        Some(frag) => frag,
        None => return Ok(0),
    };

    let received = {
        let mut mapped = frag.page.map();
        let target = &mut mapped[frag.offset + rx.offset..frag.offset + frag.len];
        let received = conn.socket().recv_vectored(&mut [IoSliceMut::new(target)])?;
        if received == 0 {
            return Err(TransportError::eof());
        }

        if rx.checksumming {
            rx.csum = checksum(rx.csum, &target[..received]);
            rx.csum_bytes += received;
        }
        received
    };

    rx.offset += received;
    if rx.offset == frag.len {
        rx.frag_index += 1;
        rx.offset = 0;
    }
    Ok(received)
}
