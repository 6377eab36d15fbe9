use super::stream::{StreamConnection, StreamConnectionInner};
use super::{SipAddr, SipConnection, TransportEvent, TransportSender};
use crate::message::{SipMessage, Transport};
use crate::Result;
use std::sync::Arc;
use tokio::net::{
    tcp::{OwnedReadHalf, OwnedWriteHalf},
    TcpListener, TcpStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Clone)]
pub struct TcpConnection {
    inner: Arc<StreamConnectionInner<OwnedReadHalf, OwnedWriteHalf>>,
}

impl TcpConnection {
    pub async fn connect(remote: &SipAddr) -> Result<Self> {
        let remote_socketaddr = remote.get_socketaddr()?;
        let stream = TcpStream::connect(remote_socketaddr).await?;
        let local_addr = SipAddr::new(Transport::Tcp, stream.local_addr()?.into());
        let remote_addr = SipAddr::new(Transport::Tcp, remote_socketaddr.into());
        info!("tcp connected {} -> {}", local_addr, remote_addr);
        let (read_half, write_half) = stream.into_split();
        Ok(TcpConnection {
            inner: Arc::new(StreamConnectionInner::new(
                local_addr, remote_addr, read_half, write_half,
            )),
        })
    }

    fn from_stream(stream: TcpStream) -> Result<Self> {
        let local_addr = SipAddr::new(Transport::Tcp, stream.local_addr()?.into());
        let remote_addr = SipAddr::new(Transport::Tcp, stream.peer_addr()?.into());
        let (read_half, write_half) = stream.into_split();
        Ok(TcpConnection {
            inner: Arc::new(StreamConnectionInner::new(
                local_addr, remote_addr, read_half, write_half,
            )),
        })
    }

    /// Accept loop for a listening socket. Each accepted connection is
    /// announced to the endpoint and served until it closes.
    pub async fn serve_listener(
        listener: TcpListener,
        sender: TransportSender,
        cancel_token: CancellationToken,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    match TcpConnection::from_stream(stream) {
                        Ok(connection) => {
                            info!("tcp accepted {}", peer);
                            sender.send(TransportEvent::New(connection.the_addr().clone())).ok();
                            let sender = sender.clone();
                            tokio::spawn(async move {
                                connection.serve_loop(sender).await.ok();
                            });
                        }
                        Err(e) => error!("failed to accept tcp connection from {}: {}", peer, e),
                    }
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
            .serve_loop(sender, SipConnection::Tcp(self.clone()))
            .await
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[async_trait::async_trait]
impl StreamConnection for TcpConnection {
    fn get_addr(&self) -> &SipAddr {
        self.the_addr()
    }

    async fn send_message(&self, msg: SipMessage) -> Result<()> {
        TcpConnection::send_message(self, msg).await
    }

    async fn send_raw(&self, data: &[u8]) -> Result<()> {
        self.inner.send_raw(data).await
    }

    async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        TcpConnection::serve_loop(self, sender).await
    }

    async fn close(&self) -> Result<()> {
        TcpConnection::close(self).await
    }
}
