//! UDP listener loop
//!
//! Receives datagrams into a full-size buffer, parses them, and enqueues
//! requests for the worker. Transient socket errors are logged and the
//! loop continues; only errors that cannot clear on retry terminate the
//! listener (and only this listener).

use std::io;
use std::sync::Arc;

use hickory_proto::op::Message;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use super::{DnsRequest, Responder, MAX_UDP_PACKET};
use crate::upstream::Transport;

pub(super) async fn serve(
    socket: Arc<UdpSocket>,
    queue: mpsc::Sender<DnsRequest>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_UDP_PACKET];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, peer)) => {
                    match Message::from_vec(&buf[..len]) {
                        Ok(message) => {
                            let request = DnsRequest {
                                transport: Transport::Udp,
                                message,
                                responder: Responder::Udp {
                                    socket: Arc::clone(&socket),
                                    peer,
                                },
                            };
                            if queue.send(request).await.is_err() {
                                // Worker is gone; nothing left to serve.
                                break;
                            }
                        }
                        Err(e) => {
                            debug!(peer = %peer, error = %e, "dropping unparsable datagram");
                        }
                    }
                }
                Err(e) => {
                    if is_fatal(&e) {
                        error!(error = %e, "udp listener failed");
                        break;
                    }
                    debug!(error = %e, "transient udp receive error");
                }
            },
            _ = shutdown.changed() => {
                info!("udp listener stopping");
                break;
            }
        }
    }
}

/// Receive errors that will not clear on retry.
fn is_fatal(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::AddrInUse | io::ErrorKind::OutOfMemory
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_error_classification() {
        assert!(is_fatal(&io::Error::new(
            io::ErrorKind::PermissionDenied,
            "denied"
        )));
        assert!(!is_fatal(&io::Error::new(
            io::ErrorKind::ConnectionReset,
            "reset"
        )));
        assert!(!is_fatal(&io::Error::new(
            io::ErrorKind::WouldBlock,
            "again"
        )));
    }
}
