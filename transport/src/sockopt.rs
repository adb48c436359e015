//! Socket options for transport connections. Everything here is applied once when a connection
//!  is established, apart from [push] and [eager_ack] which are used per message.

use std::io;
use std::time::Duration;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tracing::{debug, error};

use crate::config::TransportConfig;
use crate::socket::ConnTunables;

pub fn setup_socket(stream: &TcpStream, config: &TransportConfig) -> io::Result<()> {
    let sock = SockRef::from(stream);

    // close aborts immediately, discarding unsent data
    sock.set_linger(Some(Duration::ZERO))
        .inspect_err(|e| error!("can't set SO_LINGER: {}", e))?;
    set_linger2_off(stream)
        .inspect_err(|e| error!("can't set TCP_LINGER2: {}", e))?;

    if !config.nagle {
        sock.set_nodelay(true)
            .inspect_err(|e| error!("can't disable nagle: {}", e))?;
    }

    if config.tx_buffer_size > 0 {
        sock.set_send_buffer_size(config.tx_buffer_size)
            .inspect_err(|e| error!("can't set send buffer size {}: {}", config.tx_buffer_size, e))?;
    }
    if config.rx_buffer_size > 0 {
        sock.set_recv_buffer_size(config.rx_buffer_size)
            .inspect_err(|e| error!("can't set receive buffer size {}: {}", config.rx_buffer_size, e))?;
    }

    if !config.keepalive_enabled() {
        sock.set_keepalive(false)?;
        return Ok(());
    }

    let keepalive = TcpKeepalive::new()
        .with_time(config.keepalive_idle)
        .with_interval(config.keepalive_interval)
        .with_retries(config.keepalive_count);
    sock.set_tcp_keepalive(&keepalive)
        .inspect_err(|e| error!("can't configure keepalive: {}", e))?;

    debug!("configured socket: nagle={}, keepalive={:?}/{:?}/{}", config.nagle, config.keepalive_idle, config.keepalive_interval, config.keepalive_count);
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_linger2_off(stream: &TcpStream) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let value: libc::c_int = -1;
    unsafe {
        if libc::setsockopt(
            stream.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_LINGER2,
            &value as *const _ as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_linger2_off(_stream: &TcpStream) -> io::Result<()> {
    Ok(())
}

pub fn conn_tunables(stream: &TcpStream) -> io::Result<ConnTunables> {
    let sock = SockRef::from(stream);
    Ok(ConnTunables {
        tx_buffer_size: sock.send_buffer_size()?,
        rx_buffer_size: sock.recv_buffer_size()?,
        nagle: !sock.nodelay()?,
    })
}

/// Flushes whatever Nagle's algorithm holds back by toggling TCP_NODELAY
pub fn push(stream: &TcpStream) -> io::Result<()> {
    let sock = SockRef::from(stream);
    let nodelay = sock.nodelay()?;
    sock.set_nodelay(true)?;
    sock.set_nodelay(nodelay)
}

#[cfg(target_os = "linux")]
pub fn eager_ack(stream: &TcpStream) -> io::Result<()> {
    SockRef::from(stream).set_quickack(true)
}

#[cfg(not(target_os = "linux"))]
pub fn eager_ack(_stream: &TcpStream) -> io::Result<()> {
    Ok(())
}
