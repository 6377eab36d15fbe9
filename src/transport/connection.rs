use super::tcp::TcpConnection;
#[cfg(feature = "rustls")]
use super::tls::TlsConnection;
use super::udp::UdpConnection;
use super::{SipAddr, TransportSender};
use crate::message::{SipMessage, Transport};
use crate::Result;
use std::fmt;
use std::net::SocketAddr;

/// Stream keepalive ping and its answer (RFC 5626 CRLF keepalive).
pub const KEEPALIVE_REQUEST: &[u8] = b"\r\n\r\n";
pub const KEEPALIVE_RESPONSE: &[u8] = b"\r\n";

/// A transport connection: the UDP socket, or one cached stream connection.
#[derive(Clone)]
pub enum SipConnection {
    Udp(UdpConnection),
    Tcp(TcpConnection),
    #[cfg(feature = "rustls")]
    Tls(TlsConnection),
}

impl SipConnection {
    pub fn transport(&self) -> Transport {
        match self {
            SipConnection::Udp(_) => Transport::Udp,
            SipConnection::Tcp(_) => Transport::Tcp,
            #[cfg(feature = "rustls")]
            SipConnection::Tls(_) => Transport::Tls,
        }
    }

    /// Stream transports do their own loss recovery; the transaction layer
    /// skips retransmission timers on them.
    pub fn is_reliable(&self) -> bool {
        self.transport().is_stream()
    }

    /// The cache key address: the remote peer for stream transports, the
    /// local socket for UDP.
    pub fn the_addr(&self) -> &SipAddr {
        match self {
            SipConnection::Udp(conn) => conn.the_addr(),
            SipConnection::Tcp(conn) => conn.the_addr(),
            #[cfg(feature = "rustls")]
            SipConnection::Tls(conn) => conn.the_addr(),
        }
    }

    /// Send a message. `destination` is required for UDP and ignored by
    /// connected stream transports.
    pub async fn send(&self, msg: SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        match self {
            SipConnection::Udp(conn) => conn.send(msg, destination).await,
            SipConnection::Tcp(conn) => conn.send_message(msg).await,
            #[cfg(feature = "rustls")]
            SipConnection::Tls(conn) => conn.send_message(msg).await,
        }
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        match self {
            SipConnection::Udp(conn) => conn.serve_loop(sender).await,
            SipConnection::Tcp(conn) => conn.serve_loop(sender).await,
            #[cfg(feature = "rustls")]
            SipConnection::Tls(conn) => conn.serve_loop(sender).await,
        }
    }

    pub async fn close(&self) -> Result<()> {
        match self {
            SipConnection::Udp(_) => Ok(()),
            SipConnection::Tcp(conn) => conn.close().await,
            #[cfg(feature = "rustls")]
            SipConnection::Tls(conn) => conn.close().await,
        }
    }

    /// Stamp the topmost Via of an inbound request with `received=` (when
    /// the sent-by host differs from the source) and fill in `rport=` when
    /// the peer asked for it (RFC 3581). Responses pass through untouched.
    pub fn update_msg_received(
        msg: SipMessage,
        source: SocketAddr,
        _transport: Transport,
    ) -> Result<SipMessage> {
        let mut msg = msg;
        if let SipMessage::Request(req) = &mut msg {
            let via = req.headers.via_header_mut()?;
            let sent_by_matches = match &via.sent_by.host {
                crate::message::Host::Ip(ip) => *ip == source.ip(),
                crate::message::Host::Domain(_) => false,
            };
            if !sent_by_matches {
                via.set_received(source.ip().to_string());
            }
            if via.rport() == Some(None) {
                via.set_rport(source.port());
            }
        }
        Ok(msg)
    }
}

impl fmt::Display for SipConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.the_addr())
    }
}

impl From<UdpConnection> for SipConnection {
    fn from(conn: UdpConnection) -> Self {
        SipConnection::Udp(conn)
    }
}

impl From<TcpConnection> for SipConnection {
    fn from(conn: TcpConnection) -> Self {
        SipConnection::Tcp(conn)
    }
}

#[cfg(feature = "rustls")]
impl From<TlsConnection> for SipConnection {
    fn from(conn: TlsConnection) -> Self {
        SipConnection::Tls(conn)
    }
}
