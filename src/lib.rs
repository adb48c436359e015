//! Endpoint layer on top of the socket transport: establishes typed connections to peers,
//!  tracks them per peer and incarnation, and picks the connection each message goes over.

pub mod endpoint;
pub mod handshake;
pub mod peer;

#[cfg(test)]
mod test_util;
