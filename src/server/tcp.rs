//! TCP listener loop
//!
//! Accepts connections and spawns one task per client. Each task reads
//! length-prefixed queries (RFC 1035 section 4.2.2), enqueues them for the
//! worker, awaits the reply on a oneshot slot, and writes it back with the
//! same framing. Read and write are both bounded by the configured
//! timeouts; an idle or stalled client just loses its connection.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, error, info};

use super::{DnsRequest, Responder};
use crate::upstream::Transport;

/// Smallest well-formed DNS message (a bare header).
const MIN_DNS_MESSAGE_SIZE: usize = 12;

pub(super) async fn serve(
    listener: Arc<TcpListener>,
    queue: mpsc::Sender<DnsRequest>,
    read_timeout: Duration,
    write_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(
                        stream,
                        peer,
                        queue.clone(),
                        read_timeout,
                        write_timeout,
                    ));
                }
                Err(e) => {
                    if is_fatal(&e) {
                        error!(error = %e, "tcp listener failed");
                        break;
                    }
                    debug!(error = %e, "transient accept error");
                }
            },
            _ = shutdown.changed() => {
                info!("tcp listener stopping");
                break;
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    queue: mpsc::Sender<DnsRequest>,
    read_timeout: Duration,
    write_timeout: Duration,
) {
    loop {
        let frame = match timeout(read_timeout, read_frame(&mut stream)).await {
            Ok(Ok(Some(frame))) => frame,
            // Clean EOF, the client is done.
            Ok(Ok(None)) => return,
            Ok(Err(e)) => {
                debug!(peer = %peer, error = %e, "tcp read error");
                return;
            }
            Err(_) => {
                debug!(peer = %peer, "tcp read timeout");
                return;
            }
        };

        let message = match Message::from_vec(&frame) {
            Ok(message) => message,
            Err(e) => {
                debug!(peer = %peer, error = %e, "dropping unparsable tcp query");
                return;
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = DnsRequest {
            transport: Transport::Tcp,
            message,
            responder: Responder::Tcp { reply: reply_tx },
        };
        if queue.send(request).await.is_err() {
            // Shutting down; the responder was released with the request.
            return;
        }

        let payload = match reply_rx.await {
            Ok(payload) => payload,
            // Responder dropped during shutdown.
            Err(_) => return,
        };

        match timeout(write_timeout, write_frame(&mut stream, &payload)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(peer = %peer, error = %e, "tcp write error");
                return;
            }
            Err(_) => {
                debug!(peer = %peer, "tcp write timeout");
                return;
            }
        }
    }
}

/// Read one length-prefixed message; `None` on clean EOF before a frame.
async fn read_frame(stream: &mut TcpStream) -> io::Result<Option<Vec<u8>>> {
    let mut prefix = [0u8; 2];
    match stream.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u16::from_be_bytes(prefix) as usize;
    if len < MIN_DNS_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message too small: {len} bytes"),
        ));
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Some(body))
}

async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> io::Result<()> {
    #[allow(clippy::cast_possible_truncation)]
    let prefix = (payload.len().min(u16::MAX as usize) as u16).to_be_bytes();
    stream.write_all(&prefix).await?;
    stream.write_all(payload).await?;
    stream.flush().await
}

/// Accept errors that will not clear on retry.
fn is_fatal(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::AddrInUse
    )
}
