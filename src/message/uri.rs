use super::parser::{quote_if_needed, unquote};
use crate::{Error, Result};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Transport protocol token as it appears in Via headers and URI
/// `transport` parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Transport {
    #[default]
    Udp,
    Tcp,
    Tls,
    Sctp,
}

impl Transport {
    /// Stream transports carry framing state and live in the connection
    /// cache; UDP does not.
    pub fn is_stream(&self) -> bool {
        !matches!(self, Transport::Udp)
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Transport::Tls => 5061,
            _ => 5060,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Udp => f.write_str("UDP"),
            Transport::Tcp => f.write_str("TCP"),
            Transport::Tls => f.write_str("TLS"),
            Transport::Sctp => f.write_str("SCTP"),
        }
    }
}

impl FromStr for Transport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "UDP" => Ok(Transport::Udp),
            "TCP" => Ok(Transport::Tcp),
            "TLS" => Ok(Transport::Tls),
            "SCTP" => Ok(Transport::Sctp),
            other => Err(Error::Error(format!("unknown transport: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Sip,
    Sips,
    Tel,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Sip => f.write_str("sip"),
            Scheme::Sips => f.write_str("sips"),
            Scheme::Tel => f.write_str("tel"),
        }
    }
}

impl FromStr for Scheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sip" => Ok(Scheme::Sip),
            "sips" => Ok(Scheme::Sips),
            "tel" => Ok(Scheme::Tel),
            other => Err(Error::BadRequest(format!("unknown scheme: {}", other))),
        }
    }
}

/// The userinfo part of a URI. The password field is accepted on parse but
/// RFC 3261 discourages its use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub user: String,
    pub password: Option<String>,
}

impl fmt::Display for UserInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.password {
            Some(password) => write!(f, "{}:{}", self.user, password),
            None => f.write_str(&self.user),
        }
    }
}

/// A host: DNS name or IP literal. Domain comparison and hashing are
/// case-insensitive per RFC 3261 section 19.1.4.
#[derive(Debug, Clone)]
pub enum Host {
    Domain(String),
    Ip(IpAddr),
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Host::Domain(a), Host::Domain(b)) => a.eq_ignore_ascii_case(b),
            (Host::Ip(a), Host::Ip(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Host {}

impl Hash for Host {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Host::Domain(domain) => domain.to_ascii_lowercase().hash(state),
            Host::Ip(ip) => ip.hash(state),
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Domain(domain) => f.write_str(domain),
            Host::Ip(IpAddr::V4(ip)) => write!(f, "{}", ip),
            Host::Ip(IpAddr::V6(ip)) => write!(f, "[{}]", ip),
        }
    }
}

impl FromStr for Host {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(literal) = s.strip_prefix('[') {
            let literal = literal
                .strip_suffix(']')
                .ok_or_else(|| Error::BadRequest(format!("unterminated IPv6 literal: {}", s)))?;
            return Ok(Host::Ip(IpAddr::V6(literal.parse().map_err(|_| {
                Error::BadRequest(format!("invalid IPv6 literal: {}", s))
            })?)));
        }
        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(Host::Ip(ip));
        }
        if s.is_empty() {
            return Err(Error::BadRequest("empty host".to_string()));
        }
        Ok(Host::Domain(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostWithPort {
    pub host: Host,
    pub port: Option<u16>,
}

impl HostWithPort {
    /// Only IP-literal hosts convert directly; names go through the
    /// resolver first.
    pub fn try_socketaddr(&self, default_port: u16) -> Result<SocketAddr> {
        match &self.host {
            Host::Ip(ip) => Ok(SocketAddr::new(*ip, self.port.unwrap_or(default_port))),
            Host::Domain(domain) => Err(Error::DnsResolutionError(format!(
                "unresolved host: {}",
                domain
            ))),
        }
    }
}

impl fmt::Display for HostWithPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => write!(f, "{}", self.host),
        }
    }
}

impl FromStr for HostWithPort {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        // IPv6 literals keep their colons inside the brackets.
        let (host_part, port_part) = if s.starts_with('[') {
            match s.find(']') {
                Some(end) => match s[end + 1..].strip_prefix(':') {
                    Some(port) => (&s[..=end], Some(port)),
                    None => (s, None),
                },
                None => return Err(Error::BadRequest(format!("unterminated IPv6 literal: {}", s))),
            }
        } else {
            match s.rfind(':') {
                Some(pos) => (&s[..pos], Some(&s[pos + 1..])),
                None => (s, None),
            }
        };
        let port = match port_part {
            Some(port) => Some(
                port.parse::<u16>()
                    .map_err(|_| Error::BadRequest(format!("invalid port: {}", port)))?,
            ),
            None => None,
        };
        Ok(HostWithPort {
            host: host_part.parse()?,
            port,
        })
    }
}

impl From<SocketAddr> for HostWithPort {
    fn from(addr: SocketAddr) -> Self {
        HostWithPort {
            host: Host::Ip(addr.ip()),
            port: Some(addr.port()),
        }
    }
}

impl From<IpAddr> for HostWithPort {
    fn from(ip: IpAddr) -> Self {
        HostWithPort {
            host: Host::Ip(ip),
            port: None,
        }
    }
}

/// A URI or header field parameter.
///
/// The parameters RFC 3261 gives semantics get typed variants; everything
/// else is `Other(name, value)`. Relative order is preserved wherever
/// parameters travel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    Transport(Transport),
    User(String),
    Method(String),
    Ttl(u8),
    Maddr(String),
    Lr,
    Tag(String),
    Branch(String),
    Received(String),
    Rport(Option<u16>),
    Expires(u32),
    Q(String),
    Other(String, Option<String>),
}

impl Param {
    pub fn parse(s: &str) -> Result<Param> {
        let (name, value) = match s.find('=') {
            Some(pos) => (&s[..pos], Some(unquote(s[pos + 1..].trim()))),
            None => (s, None),
        };
        let name = name.trim();
        Ok(match (name.to_ascii_lowercase().as_str(), value) {
            ("transport", Some(v)) => Param::Transport(v.parse()?),
            ("user", Some(v)) => Param::User(v),
            ("method", Some(v)) => Param::Method(v),
            ("ttl", Some(v)) => Param::Ttl(v.parse()?),
            ("maddr", Some(v)) => Param::Maddr(v),
            ("lr", _) => Param::Lr,
            ("tag", Some(v)) => Param::Tag(v),
            ("branch", Some(v)) => Param::Branch(v),
            ("received", Some(v)) => Param::Received(v),
            ("rport", Some(v)) => Param::Rport(Some(v.parse()?)),
            ("rport", None) => Param::Rport(None),
            ("expires", Some(v)) => Param::Expires(v.parse()?),
            ("q", Some(v)) => Param::Q(v),
            (_, value) => Param::Other(name.to_string(), value),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Param::Transport(_) => "transport",
            Param::User(_) => "user",
            Param::Method(_) => "method",
            Param::Ttl(_) => "ttl",
            Param::Maddr(_) => "maddr",
            Param::Lr => "lr",
            Param::Tag(_) => "tag",
            Param::Branch(_) => "branch",
            Param::Received(_) => "received",
            Param::Rport(_) => "rport",
            Param::Expires(_) => "expires",
            Param::Q(_) => "q",
            Param::Other(name, _) => name,
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Param::Transport(t) => write!(f, "transport={}", t.to_string().to_ascii_lowercase()),
            Param::User(v) => write!(f, "user={}", v),
            Param::Method(v) => write!(f, "method={}", v),
            Param::Ttl(v) => write!(f, "ttl={}", v),
            Param::Maddr(v) => write!(f, "maddr={}", v),
            Param::Lr => f.write_str("lr"),
            Param::Tag(v) => write!(f, "tag={}", v),
            Param::Branch(v) => write!(f, "branch={}", v),
            Param::Received(v) => write!(f, "received={}", v),
            Param::Rport(Some(port)) => write!(f, "rport={}", port),
            Param::Rport(None) => f.write_str("rport"),
            Param::Expires(v) => write!(f, "expires={}", v),
            Param::Q(v) => write!(f, "q={}", v),
            Param::Other(name, Some(value)) => write!(f, "{}={}", name, quote_if_needed(value)),
            Param::Other(name, None) => f.write_str(name),
        }
    }
}

/// Convenience for parameter lists.
pub(crate) fn find_param<'a>(params: &'a [Param], name: &str) -> Option<&'a Param> {
    params.iter().find(|p| p.name().eq_ignore_ascii_case(name))
}

/// A SIP, SIPS or TEL URI.
#[derive(Debug, Clone)]
pub struct Uri {
    pub scheme: Option<Scheme>,
    pub auth: Option<UserInfo>,
    pub host_with_port: HostWithPort,
    pub params: Vec<Param>,
    pub headers: Vec<(String, String)>,
}

impl Uri {
    pub fn transport(&self) -> Option<Transport> {
        self.params.iter().find_map(|p| match p {
            Param::Transport(t) => Some(*t),
            _ => None,
        })
    }

    pub fn is_sips(&self) -> bool {
        self.scheme == Some(Scheme::Sips)
    }

    fn param_value<'a>(&'a self, name: &str) -> Option<String> {
        find_param(&self.params, name).map(|p| match p {
            Param::Other(_, Some(v)) => v.clone(),
            Param::Other(_, None) | Param::Lr | Param::Rport(None) => String::new(),
            other => {
                let s = other.to_string();
                match s.split_once('=') {
                    Some((_, v)) => v.to_string(),
                    None => String::new(),
                }
            }
        })
    }
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (scheme_part, rest) = s
            .split_once(':')
            .ok_or_else(|| Error::BadRequest(format!("uri without scheme: {}", s)))?;
        let scheme: Scheme = scheme_part.parse()?;

        let (rest, headers_part) = match rest.split_once('?') {
            Some((r, h)) => (r, Some(h)),
            None => (rest, None),
        };
        let (addr_part, params_part) = match rest.split_once(';') {
            Some((a, p)) => (a, Some(p)),
            None => (rest, None),
        };

        let (auth, host_part) = match addr_part.rfind('@') {
            Some(pos) => {
                let userinfo = &addr_part[..pos];
                let (user, password) = match userinfo.split_once(':') {
                    Some((u, p)) => (u.to_string(), Some(p.to_string())),
                    None => (userinfo.to_string(), None),
                };
                (Some(UserInfo { user, password }), &addr_part[pos + 1..])
            }
            None => (None, addr_part),
        };

        let host_with_port = match scheme {
            // tel: the subscriber number stands in host position.
            Scheme::Tel => HostWithPort {
                host: Host::Domain(host_part.to_string()),
                port: None,
            },
            _ => host_part.parse()?,
        };

        let mut params = Vec::new();
        if let Some(params_part) = params_part {
            for item in params_part.split(';') {
                if item.is_empty() {
                    continue;
                }
                params.push(Param::parse(item)?);
            }
        }

        let mut headers = Vec::new();
        if let Some(headers_part) = headers_part {
            for item in headers_part.split('&') {
                if item.is_empty() {
                    continue;
                }
                match item.split_once('=') {
                    Some((name, value)) => headers.push((name.to_string(), value.to_string())),
                    None => headers.push((item.to_string(), String::new())),
                }
            }
        }

        Ok(Uri {
            scheme: Some(scheme),
            auth,
            host_with_port,
            params,
            headers,
        })
    }
}

impl TryFrom<&str> for Uri {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        s.parse()
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(scheme) = &self.scheme {
            write!(f, "{}:", scheme)?;
        }
        if let Some(auth) = &self.auth {
            write!(f, "{}@", auth)?;
        }
        write!(f, "{}", self.host_with_port)?;
        for param in &self.params {
            write!(f, ";{}", param)?;
        }
        for (i, (name, value)) in self.headers.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            if value.is_empty() {
                write!(f, "{}{}", sep, name)?;
            } else {
                write!(f, "{}{}={}", sep, name, value)?;
            }
        }
        Ok(())
    }
}

/// URI comparison per RFC 3261 section 19.1.4: the user part is
/// case-sensitive, host and scheme are not; transport, user, ttl, method and
/// maddr parameters must agree when either side carries them; any other
/// parameter is only compared when present on both sides.
impl PartialEq for Uri {
    fn eq(&self, other: &Self) -> bool {
        if self.scheme != other.scheme {
            return false;
        }
        match (&self.auth, &other.auth) {
            (Some(a), Some(b)) => {
                if a.user != b.user || a.password != b.password {
                    return false;
                }
            }
            (None, None) => {}
            _ => return false,
        }
        if self.host_with_port != other.host_with_port {
            return false;
        }
        for name in ["transport", "user", "ttl", "method", "maddr"] {
            let mine = self.param_value(name);
            let theirs = other.param_value(name);
            if mine.is_some() || theirs.is_some() {
                let eq = match (&mine, &theirs) {
                    (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                    _ => false,
                };
                if !eq {
                    return false;
                }
            }
        }
        for param in &self.params {
            if matches!(param, Param::Other(..)) {
                if let Some(theirs) = other.param_value(param.name()) {
                    let mine = self.param_value(param.name()).unwrap_or_default();
                    if !mine.eq_ignore_ascii_case(&theirs) {
                        return false;
                    }
                }
            }
        }
        if !self.headers.is_empty() || !other.headers.is_empty() {
            if self.headers.len() != other.headers.len() {
                return false;
            }
            for (name, value) in &self.headers {
                let matched = other
                    .headers
                    .iter()
                    .any(|(n, v)| n.eq_ignore_ascii_case(name) && v == value);
                if !matched {
                    return false;
                }
            }
        }
        true
    }
}

impl Eq for Uri {}

impl Default for Uri {
    fn default() -> Self {
        Uri {
            scheme: Some(Scheme::Sip),
            auth: None,
            host_with_port: HostWithPort {
                host: Host::Domain("invalid.invalid".to_string()),
                port: None,
            },
            params: Vec::new(),
            headers: Vec::new(),
        }
    }
}
