use std::sync::Arc;
use tokio::io::Interest;
use tokio::select;
use tracing::{debug, trace};

use crate::connection::Connection;
use crate::dispatcher::{ReadinessDispatcher, WriteSpaceOutcome};
use crate::tcp_socket::TcpTransportSocket;
use crate::socket::TransportSocket;

/// Turns tokio readiness of a connection's socket into dispatcher events, until the connection
///  is torn down. Write readiness is only waited for while transmission is blocked.
pub async fn drive(dispatcher: Arc<ReadinessDispatcher>, socket: Arc<TcpTransportSocket>, conn: Arc<Connection>) {
    let id = socket.id();
    debug!("driving {:?} for {:?}", id, conn.info().peer);

    while !conn.is_closing() {
        let interest = if conn.is_tx_blocked() {
            Interest::READABLE | Interest::WRITABLE
        }
        else {
            Interest::READABLE
        };

        select! {
            ready = socket.ready(interest) => {
                let ready = match ready {
                    Ok(ready) => ready,
                    Err(e) => {
                        dispatcher.terminate(&conn, e.into());
                        break;
                    }
                };

                if ready.is_readable() || ready.is_read_closed() {
                    dispatcher.data_ready(id);
                }
                if ready.is_writable() || ready.is_write_closed() {
                    let outcome = dispatcher.write_space(id, socket.write_space());
                    if outcome == WriteSpaceOutcome::BelowWatermark {
                        socket.rearm_writable();
                    }
                }
            }
            _ = conn.wakeup().notified() => {
                trace!("re-evaluating interest for {:?}", id);
            }
        }
    }

    dispatcher.unregister_socket(id);
    debug!("stopped driving {:?}", id);
}
