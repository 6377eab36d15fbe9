use super::parser::{quote_if_needed, split_params, unquote};
use super::uri::{HostWithPort, Param, Transport, Uri};
use super::{Method, Version};
use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// name-addr value shared by From, To, Contact, Route and Record-Route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<String>,
    pub uri: Uri,
    pub params: Vec<Param>,
}

impl NameAddr {
    pub fn new(uri: Uri) -> Self {
        NameAddr {
            display_name: None,
            uri,
            params: Vec::new(),
        }
    }

    pub fn tag(&self) -> Option<&str> {
        self.params.iter().find_map(|p| match p {
            Param::Tag(tag) => Some(tag.as_str()),
            _ => None,
        })
    }

    pub fn with_tag(mut self, tag: String) -> Self {
        self.set_tag(tag);
        self
    }

    pub fn set_tag(&mut self, tag: String) {
        for param in self.params.iter_mut() {
            if let Param::Tag(existing) = param {
                *existing = tag;
                return;
            }
        }
        self.params.push(Param::Tag(tag));
    }

    /// Contact q-value; malformed values sort last.
    pub fn q(&self) -> Option<f32> {
        self.params.iter().find_map(|p| match p {
            Param::Q(q) => q.parse::<f32>().ok(),
            _ => None,
        })
    }

    pub fn expires(&self) -> Option<u32> {
        self.params.iter().find_map(|p| match p {
            Param::Expires(seconds) => Some(*seconds),
            _ => None,
        })
    }
}

impl FromStr for NameAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts = split_params(s);
        let (addr_part, param_parts) = parts
            .split_first()
            .ok_or_else(|| Error::BadRequest(format!("empty address: {}", s)))?;

        let (display_name, uri) = match addr_part.find('<') {
            Some(open) => {
                let close = addr_part
                    .rfind('>')
                    .ok_or_else(|| Error::BadRequest(format!("unterminated name-addr: {}", s)))?;
                let display = addr_part[..open].trim();
                let display_name = if display.is_empty() {
                    None
                } else {
                    Some(unquote(display))
                };
                (display_name, addr_part[open + 1..close].parse()?)
            }
            None => (None, addr_part.parse()?),
        };

        let mut params = Vec::new();
        for part in param_parts {
            if part.is_empty() {
                continue;
            }
            params.push(Param::parse(part)?);
        }
        Ok(NameAddr {
            display_name,
            uri,
            params,
        })
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(display_name) = &self.display_name {
            write!(f, "{} ", quote_if_needed(display_name))?;
        }
        write!(f, "<{}>", self.uri)?;
        for param in &self.params {
            write!(f, ";{}", param)?;
        }
        Ok(())
    }
}

/// A Via header value: sent-protocol, sent-by and parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    pub version: Version,
    pub transport: Transport,
    pub sent_by: HostWithPort,
    pub params: Vec<Param>,
}

impl Via {
    pub fn branch(&self) -> Option<&str> {
        self.params.iter().find_map(|p| match p {
            Param::Branch(branch) => Some(branch.as_str()),
            _ => None,
        })
    }

    pub fn received(&self) -> Option<&str> {
        self.params.iter().find_map(|p| match p {
            Param::Received(received) => Some(received.as_str()),
            _ => None,
        })
    }

    /// `Some(None)` when the peer asked for rport but no value was filled
    /// in yet.
    pub fn rport(&self) -> Option<Option<u16>> {
        self.params.iter().find_map(|p| match p {
            Param::Rport(port) => Some(*port),
            _ => None,
        })
    }

    pub fn set_received(&mut self, received: String) {
        for param in self.params.iter_mut() {
            if let Param::Received(existing) = param {
                *existing = received;
                return;
            }
        }
        self.params.push(Param::Received(received));
    }

    pub fn set_rport(&mut self, port: u16) {
        for param in self.params.iter_mut() {
            if let Param::Rport(value) = param {
                *value = Some(port);
                return;
            }
        }
        self.params.push(Param::Rport(Some(port)));
    }
}

impl FromStr for Via {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts = split_params(s);
        let (head, param_parts) = parts
            .split_first()
            .ok_or_else(|| Error::BadRequest(format!("empty via: {}", s)))?;

        let (protocol, sent_by) = head
            .split_once(char::is_whitespace)
            .ok_or_else(|| Error::BadRequest(format!("via without sent-by: {}", s)))?;
        let mut proto_parts = protocol.split('/');
        let name = proto_parts.next().unwrap_or_default();
        let version = proto_parts.next().unwrap_or_default();
        let transport = proto_parts
            .next()
            .ok_or_else(|| Error::BadRequest(format!("via without transport: {}", s)))?;
        if !name.eq_ignore_ascii_case("SIP") || version != "2.0" {
            return Err(Error::BadRequest(format!("unsupported via protocol: {}", protocol)));
        }

        let mut params = Vec::new();
        for part in param_parts {
            if part.is_empty() {
                continue;
            }
            params.push(Param::parse(part)?);
        }
        Ok(Via {
            version: Version::V2,
            transport: transport.parse()?,
            sent_by: sent_by.trim().parse()?,
            params,
        })
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} {}", self.version, self.transport, self.sent_by)?;
        for param in &self.params {
            write!(f, ";{}", param)?;
        }
        Ok(())
    }
}

/// CSeq header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl FromStr for CSeq {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (seq, method) = s
            .trim()
            .split_once(char::is_whitespace)
            .ok_or_else(|| Error::BadRequest(format!("invalid cseq: {}", s)))?;
        Ok(CSeq {
            seq: seq
                .parse()
                .map_err(|_| Error::BadRequest(format!("invalid cseq number: {}", seq)))?,
            method: method.trim().parse()?,
        })
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}
