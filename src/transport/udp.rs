use super::{SipAddr, SipConnection, TransportEvent, TransportSender};
use crate::message::{parser, SipMessage, Transport};
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info};

struct UdpConnectionInner {
    local_addr: SipAddr,
    socket: UdpSocket,
}

/// The shared UDP socket. One instance serves both directions; datagrams are
/// framed individually and parse errors are dropped after logging.
#[derive(Clone)]
pub struct UdpConnection {
    inner: Arc<UdpConnectionInner>,
}

impl UdpConnection {
    pub async fn create_connection(local: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        let local_addr = SipAddr::new(Transport::Udp, socket.local_addr()?.into());
        info!("udp listening on {}", local_addr);
        Ok(UdpConnection {
            inner: Arc::new(UdpConnectionInner { local_addr, socket }),
        })
    }

    pub fn the_addr(&self) -> &SipAddr {
        &self.inner.local_addr
    }

    pub async fn send(&self, msg: SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        let destination = destination
            .ok_or_else(|| {
                Error::TransportLayerError(
                    "udp send without destination".to_string(),
                    self.inner.local_addr.clone(),
                )
            })?
            .get_socketaddr()?;
        let data = msg.to_bytes();
        debug!("sending {} bytes to {}", data.len(), destination);
        self.inner.socket.send_to(&data, destination).await?;
        Ok(())
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let mut buf = vec![0u8; super::stream::MAX_SIP_MESSAGE_SIZE];
        loop {
            let (n, source) = self.inner.socket.recv_from(&mut buf).await?;
            let msg = match parser::parse_datagram(&buf[..n]) {
                Ok(msg) => msg,
                Err(e) => {
                    // Unparseable datagrams are dropped, not fatal.
                    debug!("dropping datagram from {}: {}", source, e);
                    continue;
                }
            };
            let msg = match SipConnection::update_msg_received(msg, source, Transport::Udp) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("dropping datagram from {}: {}", source, e);
                    continue;
                }
            };
            sender.send(TransportEvent::Incoming(
                msg,
                SipConnection::Udp(self.clone()),
                SipAddr::new(Transport::Udp, source.into()),
            ))?;
        }
    }
}
