//! The SIP wire codec: methods, status codes, URIs, typed headers and
//! message framing.

pub mod address;
pub mod auth;
pub mod headers;
pub mod method;
pub mod parser;
pub mod status;
pub mod uri;

#[cfg(test)]
mod tests;

pub use address::{CSeq, NameAddr, Via};
pub use auth::{Auth, AuthScheme};
pub use headers::{Header, Headers};
pub use method::Method;
pub use status::{StatusCode, StatusCodeKind};
pub use uri::{Host, HostWithPort, Param, Scheme, Transport, Uri, UserInfo};

use crate::{Error, Result};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    #[default]
    V2,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SIP/2.0")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Request {
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}\r\n{}\r\n", self.method, self.uri, self.version, self.headers)?;
        if !self.body.is_empty() {
            f.write_str(&String::from_utf8_lossy(&self.body))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status_code: StatusCode,
    /// Reason phrase as received; `None` means the canonical phrase for the
    /// status code.
    pub reason_phrase: Option<String>,
    pub version: Version,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Response {
    pub fn reason(&self) -> &str {
        match &self.reason_phrase {
            Some(reason) if !reason.is_empty() => reason,
            _ => self.status_code.reason(),
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The `received=` value the peer stamped on our topmost Via, if any,
    /// joined with the rport value. Used for public address discovery.
    pub fn via_received(&self) -> Option<HostWithPort> {
        let via = self.headers.via_header().ok()?;
        let received = via.received()?;
        let ip: std::net::IpAddr = received.parse().ok()?;
        Some(HostWithPort {
            host: Host::Ip(ip),
            port: via.rport().flatten().or(via.sent_by.port),
        })
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}\r\n{}\r\n",
            self.version,
            self.status_code,
            self.reason(),
            self.headers
        )?;
        if !self.body.is_empty() {
            f.write_str(&String::from_utf8_lossy(&self.body))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl SipMessage {
    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn headers(&self) -> &Headers {
        match self {
            SipMessage::Request(req) => &req.headers,
            SipMessage::Response(resp) => &resp.headers,
        }
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        match self {
            SipMessage::Request(req) => &mut req.headers,
            SipMessage::Response(resp) => &mut resp.headers,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = match self {
            SipMessage::Request(req) => {
                format!("{} {} {}\r\n{}\r\n", req.method, req.uri, req.version, req.headers)
                    .into_bytes()
            }
            SipMessage::Response(resp) => format!(
                "{} {} {}\r\n{}\r\n",
                resp.version,
                resp.status_code,
                resp.reason(),
                resp.headers
            )
            .into_bytes(),
        };
        match self {
            SipMessage::Request(req) => bytes.extend_from_slice(&req.body),
            SipMessage::Response(resp) => bytes.extend_from_slice(&resp.body),
        }
        bytes
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipMessage::Request(req) => write!(f, "{}", req),
            SipMessage::Response(resp) => write!(f, "{}", resp),
        }
    }
}

impl From<Request> for SipMessage {
    fn from(req: Request) -> Self {
        SipMessage::Request(req)
    }
}

impl From<Response> for SipMessage {
    fn from(resp: Response) -> Self {
        SipMessage::Response(resp)
    }
}

impl TryFrom<&[u8]> for SipMessage {
    type Error = Error;

    fn try_from(data: &[u8]) -> Result<Self> {
        parser::parse_datagram(data)
    }
}
