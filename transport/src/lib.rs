//! Socket transport for a cluster messaging fabric: messages between endpoints travel over
//!  typed TCP connections.
//!
//! ## Design goals
//!
//! * A pair of endpoints may hold several connections at the same time, one per connection type,
//!   so that small control messages are not stuck behind bulk transfers
//! * All I/O is non-blocking and happens inside readiness callbacks. Progress that can't be made
//!   now is picked up by the next readable / write space notification
//! * Large payloads live in pages that are mapped one at a time, and they can be handed to the
//!   socket without copying them first (zero-copy), keeping the pages alive until the peer
//!   acknowledges them
//! * Optional end-to-end checksums detect corruption that TCP's checksum misses
//! * Restarted endpoints are detected by their incarnation, so stale connections are not reused
//!
//! ## Hello
//!
//! Both sides of a new connection send a hello message, the connecting side first. All numbers
//!  are in the sender's byte order, which the receiver detects from the magic number:
//!
//! ```ascii
//!  0: magic 0x534f434b (u32)
//!  4: protocol version (u32)
//!  8: sender endpoint id (u64)
//! 16: receiver endpoint id (u64)
//! 24: sender process id (u32)
//! 28: receiver process id (u32)
//! 32: sender incarnation (u64)
//! 40: sender's last known incarnation of the receiver, 0 if unknown (u64)
//! 48: connection type (u32): 0 any, 1 control, 2 bulk in, 3 bulk out
//! 52: number of IPv4 addresses (u32)
//! 56: IPv4 addresses (u32 each)
//! ```
//!
//! The reply carries the inverted connection type, i.e. bulk in becomes bulk out and vice versa.
//!
//! ## Messages
//!
//! Every message starts with a fixed header:
//!
//! ```ascii
//!  0: kind (u32): 0xc0 no-op, 0xc1 payload
//!  4: checksum (u32), 0 if there is none
//!  8: zero-copy request cookie (u64), 0 if no ack is requested
//! 16: zero-copy ack cookie (u64), 0 if nothing is acknowledged
//! ```
//!
//! Payload messages continue with the routed header and the payload:
//!
//! ```ascii
//!  0: destination endpoint (u64)
//!  8: source endpoint (u64)
//! 16: destination process (u32)
//! 20: source process (u32)
//! 24: message type (u32)
//! 28: payload length (u32)
//! 32: message body (40 bytes)
//! 72: payload
//! ```
//!
//! The checksum is a CRC-32 over the message header (with a zero checksum field), the routed
//!  header and the payload. A calculated value of 0 is sent as 1, so that 0 can mean 'no
//!  checksum'.

pub mod buffers;
pub mod checksum;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod hello;
pub mod identity;
pub mod message_handler;
pub mod message_header;
pub mod rx;
pub mod socket;
pub mod sockopt;
pub mod tcp_socket;
pub mod tx;

#[cfg(test)]
mod test_util;
