//! Transport layer: per-destination send, connection cache for stream
//! transports, inbound dispatch and stream framing state.

pub mod connection;
pub mod resolver;
pub mod stream;
pub mod tcp;
#[cfg(feature = "rustls")]
pub mod tls;
pub mod transport_layer;
pub mod udp;

pub use connection::SipConnection;
pub use transport_layer::TransportLayer;

use crate::message::{HostWithPort, Scheme, SipMessage, Transport, Uri};
use crate::{Error, Result};
use std::fmt;
use std::net::SocketAddr;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// A transport-qualified peer or local address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SipAddr {
    pub r#type: Option<Transport>,
    pub addr: HostWithPort,
}

impl SipAddr {
    pub fn new(transport: Transport, addr: HostWithPort) -> Self {
        SipAddr {
            r#type: Some(transport),
            addr,
        }
    }

    pub fn transport(&self) -> Transport {
        self.r#type.unwrap_or_default()
    }

    pub fn get_socketaddr(&self) -> Result<SocketAddr> {
        self.addr.try_socketaddr(self.transport().default_port())
    }
}

impl fmt::Display for SipAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.r#type {
            Some(t) => write!(f, "{}:{}", t.to_string().to_ascii_lowercase(), self.addr),
            None => write!(f, "{}", self.addr),
        }
    }
}

impl From<SocketAddr> for SipAddr {
    fn from(addr: SocketAddr) -> Self {
        SipAddr {
            r#type: None,
            addr: addr.into(),
        }
    }
}

impl From<HostWithPort> for SipAddr {
    fn from(addr: HostWithPort) -> Self {
        SipAddr { r#type: None, addr }
    }
}

/// Derive the destination for a request URI: explicit `transport` parameter
/// first, else TLS for sips, else left open for the size-based default.
impl TryFrom<&Uri> for SipAddr {
    type Error = Error;

    fn try_from(uri: &Uri) -> Result<Self> {
        let transport = uri
            .transport()
            .or(match uri.scheme {
                Some(Scheme::Sips) => Some(Transport::Tls),
                _ => None,
            });
        Ok(SipAddr {
            r#type: transport,
            addr: uri.host_with_port.clone(),
        })
    }
}

/// Events flowing from connections to the endpoint.
pub enum TransportEvent {
    Incoming(SipMessage, SipConnection, SipAddr),
    New(SipAddr),
    Closed(SipAddr),
}

pub type TransportSender = UnboundedSender<TransportEvent>;
pub type TransportReceiver = UnboundedReceiver<TransportEvent>;
