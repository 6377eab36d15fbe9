use super::stream::StreamConnectionInner;
use super::{SipAddr, SipConnection, TransportEvent, TransportSender};
use crate::message::{Host, SipMessage, Transport};
use crate::{Error, Result};
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

type Stream = TlsStream<TcpStream>;

/// Certificate material for the acceptor side, PEM encoded.
pub struct TlsConfig {
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

#[derive(Clone)]
pub struct TlsConnection {
    inner: Arc<StreamConnectionInner<ReadHalf<Stream>, WriteHalf<Stream>>>,
}

impl TlsConnection {
    /// Connect to a TLS peer, verifying against the webpki root store. The
    /// server name defaults to the target's host name.
    pub async fn connect(remote: &SipAddr, server_name: Option<&str>) -> Result<Self> {
        let remote_socketaddr = remote.get_socketaddr()?;
        let name = match server_name {
            Some(name) => name.to_string(),
            None => match &remote.addr.host {
                Host::Domain(domain) => domain.clone(),
                Host::Ip(ip) => ip.to_string(),
            },
        };

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(name.clone())
            .map_err(|_| Error::TransportLayerError(format!("invalid server name: {}", name), remote.clone()))?;

        let tcp = TcpStream::connect(remote_socketaddr).await?;
        let local_addr = SipAddr::new(Transport::Tls, tcp.local_addr()?.into());
        let remote_addr = SipAddr::new(Transport::Tls, remote_socketaddr.into());
        let stream: Stream = TlsStream::Client(connector.connect(server_name, tcp).await?);
        info!("tls connected {} -> {}", local_addr, remote_addr);

        let (read_half, write_half) = tokio::io::split(stream);
        Ok(TlsConnection {
            inner: Arc::new(StreamConnectionInner::new(
                local_addr, remote_addr, read_half, write_half,
            )),
        })
    }

    pub fn build_acceptor(config: &TlsConfig) -> Result<TlsAcceptor> {
        let certs = rustls_pemfile::certs(&mut config.cert.as_slice())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Error(format!("invalid certificate: {}", e)))?;
        let key = rustls_pemfile::private_key(&mut config.key.as_slice())
            .map_err(|e| Error::Error(format!("invalid private key: {}", e)))?
            .ok_or_else(|| Error::Error("no private key found".to_string()))?;
        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::Error(format!("tls config: {}", e)))?;
        Ok(TlsAcceptor::from(Arc::new(server_config)))
    }

    /// Accept loop for a TLS listening socket.
    pub async fn serve_listener(
        listener: TcpListener,
        acceptor: TlsAcceptor,
        sender: TransportSender,
        cancel_token: CancellationToken,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (tcp, peer) = accepted?;
                    let acceptor = acceptor.clone();
                    let sender = sender.clone();
                    tokio::spawn(async move {
                        let local_addr = match tcp.local_addr() {
                            Ok(addr) => SipAddr::new(Transport::Tls, addr.into()),
                            Err(e) => {
                                error!("tls local addr: {}", e);
                                return;
                            }
                        };
                        match acceptor.accept(tcp).await {
                            Ok(stream) => {
                                let remote_addr = SipAddr::new(Transport::Tls, peer.into());
                                let stream: Stream = TlsStream::Server(stream);
                                let (read_half, write_half) = tokio::io::split(stream);
                                let connection = TlsConnection {
                                    inner: Arc::new(StreamConnectionInner::new(
                                        local_addr, remote_addr, read_half, write_half,
                                    )),
                                };
                                info!("tls accepted {}", peer);
                                sender
                                    .send(TransportEvent::New(connection.the_addr().clone()))
                                    .ok();
                                connection.serve_loop(sender).await.ok();
                            }
                            Err(e) => error!("tls handshake with {} failed: {}", peer, e),
                        }
                    });
                }
            }
        }
    }

    pub fn the_addr(&self) -> &SipAddr {
        &self.inner.remote_addr
    }

    pub async fn send_message(&self, msg: SipMessage) -> Result<()> {
        self.inner.send_message(msg).await
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        self.inner
            .serve_loop(sender, SipConnection::Tls(self.clone()))
            .await
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
