use super::resolver::{DnsResolverRef, SystemResolver};
use super::tcp::TcpConnection;
use super::udp::UdpConnection;
use super::{SipAddr, SipConnection, TransportSender};
use crate::message::Transport;
use crate::{Error, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Messages larger than this must go over a congestion-controlled transport
/// (RFC 3261 section 18.1.1: MTU minus 200, with the conventional 1300 byte
/// floor).
pub const DEFAULT_UDP_MTU_THRESHOLD: usize = 1300;

pub struct TransportLayerInner {
    cancel_token: CancellationToken,
    /// Local sockets we serve: the UDP socket(s), keyed by local address.
    listens: RwLock<HashMap<SipAddr, SipConnection>>,
    /// Stream listeners waiting for `serve` to start their accept loops.
    pending_listeners: Mutex<Vec<(TcpListener, Transport)>>,
    /// Established stream connections keyed by (remote, transport), reused
    /// for outbound sends and server responses (RFC 3261 section 18).
    connections: RwLock<HashMap<SipAddr, SipConnection>>,
    /// Set once `serve` runs; outbound connections created later reuse it
    /// for their read loops.
    event_sender: RwLock<Option<TransportSender>>,
    resolver: RwLock<DnsResolverRef>,
    udp_mtu_threshold: AtomicUsize,
}

#[derive(Clone)]
pub struct TransportLayer {
    pub inner: Arc<TransportLayerInner>,
}

impl TransportLayer {
    pub fn new(cancel_token: CancellationToken) -> Self {
        TransportLayer {
            inner: Arc::new(TransportLayerInner {
                cancel_token,
                listens: RwLock::new(HashMap::new()),
                pending_listeners: Mutex::new(Vec::new()),
                connections: RwLock::new(HashMap::new()),
                event_sender: RwLock::new(None),
                resolver: RwLock::new(Arc::new(SystemResolver)),
                udp_mtu_threshold: AtomicUsize::new(DEFAULT_UDP_MTU_THRESHOLD),
            }),
        }
    }

    pub fn set_resolver(&self, resolver: DnsResolverRef) {
        *self.inner.resolver.write().unwrap() = resolver;
    }

    pub fn resolver(&self) -> DnsResolverRef {
        self.inner.resolver.read().unwrap().clone()
    }

    pub fn set_udp_mtu_threshold(&self, threshold: usize) {
        self.inner
            .udp_mtu_threshold
            .store(threshold, Ordering::Relaxed);
    }

    pub async fn add_udp_listener(&self, local: SocketAddr) -> Result<SipAddr> {
        let connection = UdpConnection::create_connection(local).await?;
        let addr = connection.the_addr().clone();
        self.inner
            .listens
            .write()
            .unwrap()
            .insert(addr.clone(), SipConnection::Udp(connection));
        Ok(addr)
    }

    pub async fn add_tcp_listener(&self, local: SocketAddr) -> Result<SipAddr> {
        let listener = TcpListener::bind(local).await?;
        let addr = SipAddr::new(Transport::Tcp, listener.local_addr()?.into());
        self.inner
            .pending_listeners
            .lock()
            .unwrap()
            .push((listener, Transport::Tcp));
        Ok(addr)
    }

    /// The local address used when building Via headers, preferring a listen
    /// matching the requested transport.
    pub fn first_listen_addr(&self, transport: Option<Transport>) -> Option<SipAddr> {
        let listens = self.inner.listens.read().unwrap();
        match transport {
            Some(t) => listens
                .keys()
                .find(|addr| addr.r#type == Some(t))
                .cloned()
                .or_else(|| listens.keys().next().cloned()),
            None => listens.keys().next().cloned(),
        }
    }

    /// Start the read loops of every listen. Must run before traffic flows;
    /// connections opened later attach to the same event sender.
    pub async fn serve(&self, sender: TransportSender) -> Result<()> {
        self.inner
            .event_sender
            .write()
            .unwrap()
            .replace(sender.clone());

        let listens = self.inner.listens.read().unwrap().clone();
        for (addr, connection) in listens {
            let sender = sender.clone();
            let token = self.inner.cancel_token.child_token();
            info!("serving {}", addr);
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    result = connection.serve_loop(sender) => {
                        if let Err(e) = result {
                            warn!("listen {} stopped: {}", addr, e);
                        }
                    }
                }
            });
        }

        let pending = {
            let mut lock = self.inner.pending_listeners.lock().unwrap();
            std::mem::take(&mut *lock)
        };
        for (listener, transport) in pending {
            let sender = sender.clone();
            let token = self.inner.cancel_token.child_token();
            match transport {
                Transport::Tcp => {
                    tokio::spawn(async move {
                        TcpConnection::serve_listener(listener, sender, token)
                            .await
                            .ok();
                    });
                }
                other => warn!("no accept loop for {} listener", other),
            }
        }
        Ok(())
    }

    pub fn get_connection(&self, addr: &SipAddr) -> Option<SipConnection> {
        self.inner.connections.read().unwrap().get(addr).cloned()
    }

    pub fn add_connection(&self, connection: SipConnection) {
        self.inner
            .connections
            .write()
            .unwrap()
            .insert(connection.the_addr().clone(), connection);
    }

    pub fn remove_connection(&self, addr: &SipAddr) {
        self.inner.connections.write().unwrap().remove(addr);
    }

    /// Select a connection for an outgoing message per RFC 3263: the
    /// target's explicit transport wins, then message size picks UDP or TCP.
    /// Returns the connection together with the resolved destination.
    pub async fn lookup(&self, target: &SipAddr, msg_len: usize) -> Result<(SipConnection, SipAddr)> {
        let transport = match target.r#type {
            Some(t) => t,
            None => {
                if msg_len > self.inner.udp_mtu_threshold.load(Ordering::Relaxed) {
                    Transport::Tcp
                } else {
                    Transport::Udp
                }
            }
        };

        let candidates = self
            .resolver()
            .resolve(&target.addr, transport)
            .await?;
        let destination = SipAddr::new(
            transport,
            candidates
                .first()
                .copied()
                .ok_or(Error::NoDestinations)?
                .into(),
        );

        match transport {
            Transport::Udp => {
                let connection = self
                    .first_listen_addr(Some(Transport::Udp))
                    .and_then(|addr| self.inner.listens.read().unwrap().get(&addr).cloned())
                    .ok_or_else(|| {
                        Error::TransportLayerError(
                            "no udp listen socket".to_string(),
                            destination.clone(),
                        )
                    })?;
                Ok((connection, destination))
            }
            Transport::Tcp => {
                if let Some(connection) = self.get_connection(&destination) {
                    return Ok((connection, destination));
                }
                let connection = SipConnection::Tcp(TcpConnection::connect(&destination).await?);
                self.attach_connection(connection.clone());
                Ok((connection, destination))
            }
            #[cfg(feature = "rustls")]
            Transport::Tls => {
                if let Some(connection) = self.get_connection(&destination) {
                    return Ok((connection, destination));
                }
                let server_name = match &target.addr.host {
                    crate::message::Host::Domain(domain) => Some(domain.clone()),
                    _ => None,
                };
                let connection = SipConnection::Tls(
                    super::tls::TlsConnection::connect(&destination, server_name.as_deref())
                        .await?,
                );
                self.attach_connection(connection.clone());
                Ok((connection, destination))
            }
            #[cfg(not(feature = "rustls"))]
            Transport::Tls => Err(Error::TransportLayerError(
                "tls support not compiled in".to_string(),
                destination,
            )),
            Transport::Sctp => Err(Error::TransportLayerError(
                "sctp transport not supported".to_string(),
                destination,
            )),
        }
    }

    /// Cache an outbound connection and start its read loop on the shared
    /// event sender.
    fn attach_connection(&self, connection: SipConnection) {
        self.add_connection(connection.clone());
        let sender = self.inner.event_sender.read().unwrap().clone();
        if let Some(sender) = sender {
            let token = self.inner.cancel_token.child_token();
            let layer = self.clone();
            tokio::spawn(async move {
                let addr = connection.the_addr().clone();
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = connection.serve_loop(sender) => {}
                }
                layer.remove_connection(&addr);
            });
        }
    }
}
