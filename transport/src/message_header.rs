use std::fmt::{Debug, Formatter};
use bytes::{Buf, BufMut, Bytes};

use crate::buffers::page::PageFrag;
use crate::error::TransportError;
use crate::hello::ByteOrder;
use crate::identity::{EndpointId, ProcessId};

pub const MSG_NOOP: u32 = 0xc0;
pub const MSG_PAYLOAD: u32 = 0xc1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    /// framing-only message without routed header or payload, e.g. to carry a zero-copy ack
    NoOp,
    Payload,
}

/// Header that precedes every message after the hello.
///
/// ```ascii
///  0: kind (u32): 0xC0 = no-op, 0xC1 = payload
///  4: checksum (u32), 0 if the message is not checksummed
///  8: zero-copy request cookie (u64), non-zero to ask the peer for an ack after receipt
/// 16: zero-copy ack cookie (u64), non-zero to acknowledge a peer's request
/// 24: routed header and payload, only for kind 'payload'
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub kind: MessageKind,
    pub checksum: u32,
    pub zc_req_cookie: u64,
    pub zc_ack_cookie: u64,
}

impl MessageHeader {
    pub const SERIALIZED_LEN: usize = 24;
    pub const CHECKSUM_OFFSET: usize = 4;

    pub fn noop(zc_ack_cookie: u64) -> MessageHeader {
        MessageHeader {
            kind: MessageKind::NoOp,
            checksum: 0,
            zc_req_cookie: 0,
            zc_ack_cookie,
        }
    }

    pub fn payload(zc_req_cookie: u64) -> MessageHeader {
        MessageHeader {
            kind: MessageKind::Payload,
            checksum: 0,
            zc_req_cookie,
            zc_ack_cookie: 0,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(match self.kind {
            MessageKind::NoOp => MSG_NOOP,
            MessageKind::Payload => MSG_PAYLOAD,
        });
        buf.put_u32(self.checksum);
        buf.put_u64(self.zc_req_cookie);
        buf.put_u64(self.zc_ack_cookie);
    }

    pub fn deser(buf: &mut impl Buf, order: ByteOrder) -> Result<Self, TransportError> {
        let kind = match order.get_u32(buf)? {
            MSG_NOOP => MessageKind::NoOp,
            MSG_PAYLOAD => MessageKind::Payload,
            other => return Err(TransportError::ProtocolError(format!("unknown message kind {:#x}", other))),
        };
        let checksum = order.get_u32(buf)?;
        let zc_req_cookie = order.get_u64(buf)?;
        let zc_ack_cookie = order.get_u64(buf)?;

        if kind == MessageKind::NoOp && zc_req_cookie != 0 {
            return Err(TransportError::ProtocolError("no-op message requests a zero-copy ack for a payload it cannot have".to_string()));
        }

        Ok(MessageHeader {
            kind,
            checksum,
            zc_req_cookie,
            zc_ack_cookie,
        })
    }
}

/// The upper layer's header, embedded in every payload message. The transport reads the payload
///  length from it and treats the rest as opaque.
///
/// ```ascii
///  0: destination endpoint (u64)
///  8: source endpoint (u64)
/// 16: destination process (u32)
/// 20: source process (u32)
/// 24: message type (u32)
/// 28: payload length (u32)
/// 32: upper layer data (40 bytes)
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct RoutedHeader {
    pub dest_endpoint: EndpointId,
    pub src_endpoint: EndpointId,
    pub dest_process: ProcessId,
    pub src_process: ProcessId,
    pub msg_type: u32,
    pub payload_len: u32,
    pub body: [u8; RoutedHeader::BODY_LEN],
}

impl Debug for RoutedHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RoutedHeader{{{:?}:{} -> {:?}:{}, type {}, {} bytes}}",
               self.src_endpoint, self.src_process.0, self.dest_endpoint, self.dest_process.0, self.msg_type, self.payload_len)
    }
}

impl RoutedHeader {
    pub const SERIALIZED_LEN: usize = 72;
    pub const BODY_LEN: usize = 40;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.dest_endpoint.0);
        buf.put_u64(self.src_endpoint.0);
        buf.put_u32(self.dest_process.0);
        buf.put_u32(self.src_process.0);
        buf.put_u32(self.msg_type);
        buf.put_u32(self.payload_len);
        buf.put_slice(&self.body);
    }

    pub fn deser(buf: &mut impl Buf, order: ByteOrder, max_message_size: u32) -> Result<Self, TransportError> {
        let dest_endpoint = EndpointId(order.get_u64(buf)?);
        let src_endpoint = EndpointId(order.get_u64(buf)?);
        let dest_process = ProcessId(order.get_u32(buf)?);
        let src_process = ProcessId(order.get_u32(buf)?);
        let msg_type = order.get_u32(buf)?;
        let payload_len = order.get_u32(buf)?;
        if payload_len > max_message_size {
            return Err(TransportError::ProtocolError(format!("payload of {} bytes exceeds maximum of {}", payload_len, max_message_size)));
        }

        if buf.remaining() < Self::BODY_LEN {
            return Err(TransportError::ProtocolError("routed header is truncated".to_string()));
        }
        let mut body = [0u8; Self::BODY_LEN];
        buf.copy_to_slice(&mut body);

        Ok(RoutedHeader {
            dest_endpoint,
            src_endpoint,
            dest_process,
            src_process,
            msg_type,
            payload_len,
            body,
        })
    }
}

/// Payload of a received message, either a single buffer or a list of pool pages
#[derive(Clone, Debug)]
pub enum MessagePayload {
    Flat(Bytes),
    Pages(Vec<PageFrag>),
}

impl MessagePayload {
    pub fn len(&self) -> usize {
        match self {
            MessagePayload::Flat(b) => b.len(),
            MessagePayload::Pages(frags) => frags.iter().map(|f| f.len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the payload into contiguous memory
    pub fn to_vec(&self) -> Vec<u8> {
        match self {
            MessagePayload::Flat(b) => b.to_vec(),
            MessagePayload::Pages(frags) => {
                let mut result = Vec::with_capacity(self.len());
                for frag in frags {
                    frag.copy_to(&mut result);
                }
                result
            }
        }
    }
}

/// A completely received message
#[derive(Clone, Debug)]
pub enum Frame {
    NoOp,
    Payload(RoutedHeader, MessagePayload),
}
