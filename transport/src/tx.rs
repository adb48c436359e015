//! Transmit engine: turns a queued [OutboundUnit] into non-blocking send calls.
//!
//! A unit goes out as its serialized header (message header plus routed header for payload
//!  messages), followed by its payload. Flat payloads are sent together with the header in a
//!  single gather write. Page payloads are sent one fragment per call after the header, either
//!  handed to the socket as a page (zero-copy) or through a short-lived mapping of the page.

use std::fmt::{Debug, Formatter};
use std::io;
use std::io::IoSlice;
use bytes::{Bytes, BytesMut};
use tracing::{trace, warn};

use crate::buffers::page::PageFrag;
use crate::checksum::{checksum, finalize, CHECKSUM_SEED};
use crate::connection::Connection;
use crate::error::TransportError;
use crate::message_header::{MessageHeader, MessageKind, RoutedHeader};

pub type Completion = Box<dyn FnOnce(Result<(), TransportError>) + Send>;

pub enum TxPayload {
    Flat(Vec<Bytes>),
    Pages(Vec<PageFrag>),
}

impl TxPayload {
    pub fn len(&self) -> usize {
        match self {
            TxPayload::Flat(bufs) => bufs.iter().map(|b| b.len()).sum(),
            TxPayload::Pages(frags) => frags.iter().map(|f| f.len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_frags(&self) -> usize {
        match self {
            TxPayload::Flat(bufs) => bufs.len(),
            TxPayload::Pages(frags) => frags.len(),
        }
    }
}

/// One queued message. The header is serialized (and checksummed, if applicable) on the first
///  send attempt, and `sent` tracks progress across partial sends.
pub struct OutboundUnit {
    header: MessageHeader,
    routed: Option<RoutedHeader>,
    payload: TxPayload,
    header_buf: Option<Bytes>,
    nob: usize,
    sent: usize,
    checksummed: bool,
    completion: Option<Completion>,
}

impl Debug for OutboundUnit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "OutboundUnit{{{:?}, {}/{} bytes sent}}", self.header.kind, self.sent, self.nob)
    }
}

impl OutboundUnit {
    /// A payload message. The routed header's payload length is set from the payload.
    pub fn message(mut routed: RoutedHeader, payload: TxPayload) -> OutboundUnit {
        let payload_len = payload.len();
        routed.payload_len = u32::try_from(payload_len).unwrap_or(u32::MAX);
        OutboundUnit {
            header: MessageHeader::payload(0),
            routed: Some(routed),
            payload,
            header_buf: None,
            nob: MessageHeader::SERIALIZED_LEN + RoutedHeader::SERIALIZED_LEN + payload_len,
            sent: 0,
            checksummed: false,
            completion: None,
        }
    }

    pub fn noop(zc_ack_cookie: u64) -> OutboundUnit {
        OutboundUnit {
            header: MessageHeader::noop(zc_ack_cookie),
            routed: None,
            payload: TxPayload::Flat(Vec::new()),
            header_buf: None,
            nob: MessageHeader::SERIALIZED_LEN,
            sent: 0,
            checksummed: false,
            completion: None,
        }
    }

    /// Registers a callback that is invoked exactly once: with `Ok` after the unit was sent (and
    ///  acknowledged by the peer if it was sent zero-copy), or with the error that aborted it.
    pub fn with_completion(mut self, completion: impl FnOnce(Result<(), TransportError>) + Send + 'static) -> OutboundUnit {
        self.completion = Some(Box::new(completion));
        self
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn payload(&self) -> &TxPayload {
        &self.payload
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Bytes that remain to be sent
    pub fn resid(&self) -> usize {
        self.nob - self.sent
    }

    pub fn is_checksummed(&self) -> bool {
        self.checksummed
    }

    /// The header is fixed once the first send attempt serialized it
    pub fn is_started(&self) -> bool {
        self.header_buf.is_some()
    }

    /// Page payloads with at least one fragment big enough for a zero-copy send
    pub(crate) fn is_zero_copy_eligible(&self, zc_min_frag: usize) -> bool {
        match &self.payload {
            TxPayload::Pages(frags) => frags.iter().any(|f| f.len >= zc_min_frag),
            TxPayload::Flat(_) => false,
        }
    }

    pub(crate) fn request_zero_copy_ack(&mut self, cookie: u64) {
        debug_assert!(!self.is_started());
        self.header.zc_req_cookie = cookie;
    }

    /// Piggybacks an ack for a peer's zero-copy request. Fails if the header went out already
    ///  or carries an ack.
    pub(crate) fn try_attach_zero_copy_ack(&mut self, cookie: u64) -> bool {
        if self.is_started() || self.header.zc_ack_cookie != 0 {
            return false;
        }
        self.header.zc_ack_cookie = cookie;
        true
    }

    pub(crate) fn take_completion(&mut self) -> Option<Completion> {
        self.completion.take()
    }

    /// Finishes the unit, invoking its completion (if any)
    pub fn complete(mut self, result: Result<(), TransportError>) {
        if let Some(completion) = self.completion.take() {
            completion(result);
        }
    }

    fn header_len(&self) -> usize {
        match self.header.kind {
            MessageKind::NoOp => MessageHeader::SERIALIZED_LEN,
            MessageKind::Payload => MessageHeader::SERIALIZED_LEN + RoutedHeader::SERIALIZED_LEN,
        }
    }

    fn serialize_header(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.header_len());
        self.header.ser(&mut buf);
        if let Some(routed) = &self.routed {
            routed.ser(&mut buf);
        }
        buf.freeze()
    }
}

/// One non-blocking attempt to make progress on `unit`, returning the number of bytes sent.
///
/// `more_queued` tells whether other units wait behind this one, which is passed on to the
///  socket as a 'more data follows' hint together with the unit's own remaining bytes.
pub fn transmit(conn: &Connection, unit: &mut OutboundUnit, more_queued: bool) -> Result<usize, TransportError> {
    if conn.is_closing() {
        return Err(TransportError::Shutdown);
    }

    if !unit.is_started() {
        if conn.config().enable_checksum
            && conn.capabilities().checksum
            && unit.sent == 0
            && unit.header.checksum == 0
        {
            checksum_tx(conn, unit);
        }
        unit.header_buf = Some(unit.serialize_header());
    }

    let header_len = unit.header_len();
    let sent = if unit.sent < header_len || matches!(unit.payload, TxPayload::Flat(_)) {
        send_iov(conn, unit, more_queued)?
    }
    else {
        send_kiov(conn, unit, more_queued)?
    };

    trace!("sent {} bytes of {:?}", sent, unit);
    Ok(sent)
}

/// Computes the unit's checksum over the header (with a zero checksum field) and all payload
///  fragments, mapping page fragments one at a time.
fn checksum_tx(conn: &Connection, unit: &mut OutboundUnit) {
    let mut header_buf = BytesMut::with_capacity(unit.header_len());
    unit.header.ser(&mut header_buf);
    if let Some(routed) = &unit.routed {
        routed.ser(&mut header_buf);
    }
    let mut csum = checksum(CHECKSUM_SEED, &header_buf);

    match &unit.payload {
        TxPayload::Flat(bufs) => {
            for buf in bufs {
                csum = checksum(csum, buf);
            }
        }
        TxPayload::Pages(frags) => {
            for frag in frags {
                let mapped = frag.page.map();
                csum = checksum(csum, &mapped[frag.offset..frag.offset + frag.len]);
            }
        }
    }

    let mut csum = finalize(csum);
    if conn.config().take_checksum_error() {
        warn!("injecting checksum error into message on {:?}", conn.info());
        csum = finalize(csum.wrapping_add(1));
    }

    unit.header.checksum = csum;
    unit.checksummed = true;
}

/// Gather write of the header and (for flat payloads) the payload buffers, starting where the
///  previous call left off
fn send_iov(conn: &Connection, unit: &mut OutboundUnit, more_queued: bool) -> Result<usize, TransportError> {
    let header_buf = match &unit.header_buf {
        Some(buf) => buf,
        None => return Err(TransportError::ProtocolError("unit was not prepared".to_string())),
    };

    let mut segments: Vec<&[u8]> = Vec::with_capacity(1 + unit.payload.num_frags());
    segments.push(header_buf);
    if let TxPayload::Flat(bufs) = &unit.payload {
        segments.extend(bufs.iter().map(|b| b.as_ref()));
    }

    let mut scratch: Vec<IoSlice<'_>> = Vec::with_capacity(segments.len());
    let mut skip = unit.sent;
    let mut offered = 0;
    for segment in segments {
        if skip >= segment.len() {
            skip -= segment.len();
            continue;
        }
        offered += segment.len() - skip;
        scratch.push(IoSlice::new(&segment[skip..]));
        skip = 0;
    }

    let more = more_queued || offered < unit.resid();
    let sent = conn.socket().send_vectored(&scratch, more)?;
    if sent == 0 && offered > 0 {
        return Err(TransportError::TransportFailure(io::ErrorKind::WriteZero.into()));
    }
    unit.sent += sent;
    Ok(sent)
}

/// Sends (the rest of) the current page fragment
fn send_kiov(conn: &Connection, unit: &mut OutboundUnit, more_queued: bool) -> Result<usize, TransportError> {
    let frags = match &unit.payload {
        TxPayload::Pages(frags) => frags,
        TxPayload::Flat(_) => return Err(TransportError::ProtocolError("flat payload in page send path".to_string())),
    };

    let mut skip = unit.sent - unit.header_len();
    let mut current = None;
    for frag in frags {
        if skip < frag.len {
            current = Some(frag);
            break;
        }
        skip -= frag.len;
    }
    let frag = match current {
        Some(frag) => frag,
        None => return Ok(0),
    };

    let offered = frag.len - skip;
    let more = more_queued || offered < unit.resid();

    let zero_copy = conn.capabilities().zero_copy
        && frag.len >= conn.config().zc_min_frag
        && unit.header.zc_req_cookie != 0;

    let sent = if zero_copy {
        conn.socket().send_page(&frag.page, frag.offset + skip, offered, more)?
    }
    else {
        let mapped = frag.page.map();
        let scratch = [IoSlice::new(&mapped[frag.offset + skip..frag.offset + frag.len])];
        conn.socket().send_vectored(&scratch, more)?
    };

    if sent == 0 {
        return Err(TransportError::TransportFailure(io::ErrorKind::WriteZero.into()));
    }
    unit.sent += sent;
    Ok(sent)
}
