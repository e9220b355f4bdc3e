//! DNS transport
//!
//! Binds UDP and TCP listeners on the same address, funnels every incoming
//! message into a bounded request queue, and runs a worker task that feeds
//! the [`QueryEngine`]. A single consumer is sufficient for correctness;
//! the stores and cache stay thread-safe so the worker count could scale
//! without semantic changes.
//!
//! ```text
//! UDP listener ──┐
//!                ├──▶ request queue ──▶ worker ──▶ QueryEngine ──▶ responder
//! TCP listener ──┘
//! ```
//!
//! Shutdown: the watch signal stops both listeners, which closes the queue
//! sender side; the worker drains outstanding requests and exits, releasing
//! any TCP responders still waiting.

mod handler;
mod tcp;
mod udp;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub use handler::{EngineStats, QueryEngine};

use crate::error::{Error, Result};
use crate::upstream::Transport;

/// UDP receive buffer, sized for the largest possible DNS message.
const MAX_UDP_PACKET: usize = 65535;

/// Bound on requests parked between the listeners and the worker.
const REQUEST_QUEUE_DEPTH: usize = 1024;

/// Default TCP read/write timeout.
const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(3);

/// Write-once handle that delivers a reply to the requesting client.
pub enum Responder {
    /// Reply with a datagram to the peer that sent the query
    Udp {
        /// The listener socket, shared with the UDP loop
        socket: Arc<UdpSocket>,
        /// The client address
        peer: SocketAddr,
    },
    /// Reply through the connection task that framed the query
    Tcp {
        /// Slot the connection task is awaiting
        reply: oneshot::Sender<Vec<u8>>,
    },
}

impl Responder {
    /// Deliver the serialized reply, consuming the handle.
    ///
    /// Write failures are logged and swallowed; a failed reply must never
    /// take down the worker.
    pub async fn send(self, payload: Vec<u8>) {
        match self {
            Self::Udp { socket, peer } => {
                if let Err(e) = socket.send_to(&payload, peer).await {
                    warn!(peer = %peer, error = %e, "failed to send reply");
                }
            }
            Self::Tcp { reply } => {
                // The connection task may have timed out or hung up.
                let _ = reply.send(payload);
            }
        }
    }
}

/// One parsed client query plus the handle to answer it.
///
/// Created on listener receipt, consumed exactly once by the engine.
pub struct DnsRequest {
    /// Transport the query arrived on
    pub transport: Transport,
    /// The parsed query message
    pub message: Message,
    /// Where the reply goes
    pub responder: Responder,
}

/// The DNS proxy server: two listeners, one queue, one worker.
pub struct Server {
    engine: Arc<QueryEngine>,
    udp: Option<Arc<UdpSocket>>,
    tcp: Option<Arc<TcpListener>>,
    read_timeout: Duration,
    write_timeout: Duration,
    shutdown: watch::Sender<bool>,
}

impl Server {
    /// Bind UDP and TCP on `addr`.
    ///
    /// A bind failure on one transport disables that transport with an
    /// error log; the server only refuses to start when both fail.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ListenerBind`] when neither transport could bind.
    pub async fn bind(addr: SocketAddr, engine: Arc<QueryEngine>) -> Result<Self> {
        let udp = UdpSocket::bind(addr).await;
        let tcp = TcpListener::bind(addr).await;

        match (udp, tcp) {
            (Err(udp_err), Err(tcp_err)) => {
                error!(addr = %addr, error = %tcp_err, "failed to bind TCP listener");
                Err(Error::ListenerBind {
                    addr: addr.to_string(),
                    source: udp_err,
                })
            }
            (udp, tcp) => {
                let udp = match udp {
                    Ok(socket) => Some(Arc::new(socket)),
                    Err(e) => {
                        error!(addr = %addr, error = %e, "UDP listener disabled");
                        None
                    }
                };
                let tcp = match tcp {
                    Ok(listener) => Some(Arc::new(listener)),
                    Err(e) => {
                        error!(addr = %addr, error = %e, "TCP listener disabled");
                        None
                    }
                };

                let (shutdown, _) = watch::channel(false);
                Ok(Self {
                    engine,
                    udp,
                    tcp,
                    read_timeout: DEFAULT_IO_TIMEOUT,
                    write_timeout: DEFAULT_IO_TIMEOUT,
                    shutdown,
                })
            }
        }
    }

    /// Override the TCP read/write timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, read_timeout: Duration, write_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self.write_timeout = write_timeout;
        self
    }

    /// Address the UDP listener actually bound to, if it is up.
    #[must_use]
    pub fn local_udp_addr(&self) -> Option<SocketAddr> {
        self.udp.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Address the TCP listener actually bound to, if it is up.
    #[must_use]
    pub fn local_tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// The engine shared with the worker.
    #[must_use]
    pub fn engine(&self) -> &Arc<QueryEngine> {
        &self.engine
    }

    /// Signal both listeners to stop accepting and let the worker drain.
    pub fn shutdown(&self) {
        debug!("shutting down");
        let _ = self.shutdown.send(true);
    }

    /// Serve until shutdown is signaled.
    ///
    /// # Errors
    ///
    /// Infallible today; the signature leaves room for fatal runtime
    /// failures to surface.
    pub async fn run(&self) -> Result<()> {
        let (queue_tx, queue_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);

        let worker = tokio::spawn(run_worker(Arc::clone(&self.engine), queue_rx));

        let mut listeners = JoinSet::new();
        if let Some(socket) = &self.udp {
            listeners.spawn(udp::serve(
                Arc::clone(socket),
                queue_tx.clone(),
                self.shutdown.subscribe(),
            ));
        }
        if let Some(listener) = &self.tcp {
            listeners.spawn(tcp::serve(
                Arc::clone(listener),
                queue_tx.clone(),
                self.read_timeout,
                self.write_timeout,
                self.shutdown.subscribe(),
            ));
        }
        drop(queue_tx);

        info!(
            udp = ?self.local_udp_addr(),
            tcp = ?self.local_tcp_addr(),
            "ready for connections"
        );

        // One listener failing terminates only itself; we stay up until
        // every listener has returned.
        while listeners.join_next().await.is_some() {}

        // Queue senders are gone; the worker drains and exits.
        let _ = worker.await;
        info!("stopped");
        Ok(())
    }
}

async fn run_worker(engine: Arc<QueryEngine>, mut queue: mpsc::Receiver<DnsRequest>) {
    while let Some(request) = queue.recv().await {
        engine.handle(request).await;
    }
    debug!("request worker drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::AnswerCache;
    use crate::config::RejectConfig;
    use crate::error::Result as CrateResult;
    use crate::store::{DomainStore, MemDomainStore};
    use crate::upstream::Resolver;
    use async_trait::async_trait;
    use hickory_proto::op::MessageType;

    struct EchoResolver;

    #[async_trait]
    impl Resolver for EchoResolver {
        async fn lookup(&self, _transport: Transport, query: &Message) -> CrateResult<Message> {
            let mut reply = query.clone();
            reply.set_message_type(MessageType::Response);
            Ok(reply)
        }
    }

    fn test_engine() -> Arc<QueryEngine> {
        Arc::new(QueryEngine::new(
            Arc::new(EchoResolver),
            Arc::new(MemDomainStore::new()) as Arc<dyn DomainStore>,
            Arc::new(MemDomainStore::new()) as Arc<dyn DomainStore>,
            Arc::new(AnswerCache::new(
                Duration::from_secs(600),
                Duration::from_secs(60),
            )),
            RejectConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_bind_both_transports() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = Server::bind(addr, test_engine()).await.unwrap();

        assert!(server.local_udp_addr().is_some());
        assert!(server.local_tcp_addr().is_some());
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = Arc::new(Server::bind(addr, test_engine()).await.unwrap());

        let runner = Arc::clone(&server);
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        server.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(result.is_ok(), "server should stop after shutdown signal");
    }
}
