use super::address::{CSeq, NameAddr, Via};
use super::auth::Auth;
use super::method::Method;
use super::parser::split_list;
use crate::{Error, Result};
use std::fmt;

/// A typed SIP header.
///
/// The RFC 3261 catalog gets typed variants; unknown headers are carried as
/// `Other(name, value)` with the name preserved as received. Address-list
/// headers (Via, Route, Record-Route, Contact) hold one value per entry so
/// the collection keeps their relative order; token-list headers hold their
/// whole comma-separated list in one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    Via(Via),
    From(NameAddr),
    To(NameAddr),
    Contact(NameAddr),
    Route(NameAddr),
    RecordRoute(NameAddr),
    CallId(String),
    CSeq(CSeq),
    MaxForwards(u32),
    ContentLength(u32),
    ContentType(String),
    ContentEncoding(String),
    Expires(u32),
    MinExpires(u32),
    UserAgent(String),
    Server(String),
    Subject(String),
    Date(String),
    Accept(String),
    Event(String),
    Warning(String),
    Allow(Vec<Method>),
    Supported(Vec<String>),
    Require(Vec<String>),
    Unsupported(Vec<String>),
    ProxyRequire(Vec<String>),
    Authorization(Auth),
    ProxyAuthorization(Auth),
    WwwAuthenticate(Auth),
    ProxyAuthenticate(Auth),
    Other(String, String),
}

/// Canonical (lowercase) name for a wire header name, expanding the RFC 3261
/// section 20 compact forms.
fn canonical_name(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    match lower.as_str() {
        "i" => "call-id".to_string(),
        "m" => "contact".to_string(),
        "e" => "content-encoding".to_string(),
        "l" => "content-length".to_string(),
        "c" => "content-type".to_string(),
        "f" => "from".to_string(),
        "s" => "subject".to_string(),
        "t" => "to".to_string(),
        "v" => "via".to_string(),
        "k" => "supported".to_string(),
        _ => lower,
    }
}

fn parse_token_list(value: &str) -> Vec<String> {
    split_list(value).into_iter().map(|t| t.to_string()).collect()
}

fn parse_method_list(value: &str) -> Result<Vec<Method>> {
    split_list(value).into_iter().map(|t| t.parse()).collect()
}

impl Header {
    /// Parse one wire header line (already unfolded) into one or more typed
    /// headers. Address-list headers expand a comma-joined value into
    /// individual entries.
    pub fn parse(name: &str, value: &str) -> Result<Vec<Header>> {
        let canonical = canonical_name(name);
        Ok(match canonical.as_str() {
            "via" => split_list(value)
                .into_iter()
                .map(|v| v.parse().map(Header::Via))
                .collect::<Result<Vec<_>>>()?,
            "route" => split_list(value)
                .into_iter()
                .map(|v| v.parse().map(Header::Route))
                .collect::<Result<Vec<_>>>()?,
            "record-route" => split_list(value)
                .into_iter()
                .map(|v| v.parse().map(Header::RecordRoute))
                .collect::<Result<Vec<_>>>()?,
            "contact" => split_list(value)
                .into_iter()
                .map(|v| v.parse().map(Header::Contact))
                .collect::<Result<Vec<_>>>()?,
            "from" => vec![Header::From(value.parse()?)],
            "to" => vec![Header::To(value.parse()?)],
            "call-id" => vec![Header::CallId(value.to_string())],
            "cseq" => vec![Header::CSeq(value.parse()?)],
            "max-forwards" => vec![Header::MaxForwards(
                value
                    .parse()
                    .map_err(|_| Error::BadRequest(format!("invalid max-forwards: {}", value)))?,
            )],
            "content-length" => vec![Header::ContentLength(
                value
                    .parse()
                    .map_err(|_| Error::BadRequest(format!("invalid content-length: {}", value)))?,
            )],
            "content-type" => vec![Header::ContentType(value.to_string())],
            "content-encoding" => vec![Header::ContentEncoding(value.to_string())],
            "expires" => vec![Header::Expires(
                value
                    .parse()
                    .map_err(|_| Error::BadRequest(format!("invalid expires: {}", value)))?,
            )],
            "min-expires" => vec![Header::MinExpires(
                value
                    .parse()
                    .map_err(|_| Error::BadRequest(format!("invalid min-expires: {}", value)))?,
            )],
            "user-agent" => vec![Header::UserAgent(value.to_string())],
            "server" => vec![Header::Server(value.to_string())],
            "subject" => vec![Header::Subject(value.to_string())],
            "date" => vec![Header::Date(value.to_string())],
            "accept" => vec![Header::Accept(value.to_string())],
            "event" => vec![Header::Event(value.to_string())],
            "warning" => vec![Header::Warning(value.to_string())],
            "allow" => vec![Header::Allow(parse_method_list(value)?)],
            "supported" => vec![Header::Supported(parse_token_list(value))],
            "require" => vec![Header::Require(parse_token_list(value))],
            "unsupported" => vec![Header::Unsupported(parse_token_list(value))],
            "proxy-require" => vec![Header::ProxyRequire(parse_token_list(value))],
            "authorization" => vec![Header::Authorization(value.parse()?)],
            "proxy-authorization" => vec![Header::ProxyAuthorization(value.parse()?)],
            "www-authenticate" => vec![Header::WwwAuthenticate(value.parse()?)],
            "proxy-authenticate" => vec![Header::ProxyAuthenticate(value.parse()?)],
            _ => vec![Header::Other(name.to_string(), value.to_string())],
        })
    }

    /// Wire display name.
    pub fn name(&self) -> &str {
        match self {
            Header::Via(_) => "Via",
            Header::From(_) => "From",
            Header::To(_) => "To",
            Header::Contact(_) => "Contact",
            Header::Route(_) => "Route",
            Header::RecordRoute(_) => "Record-Route",
            Header::CallId(_) => "Call-ID",
            Header::CSeq(_) => "CSeq",
            Header::MaxForwards(_) => "Max-Forwards",
            Header::ContentLength(_) => "Content-Length",
            Header::ContentType(_) => "Content-Type",
            Header::ContentEncoding(_) => "Content-Encoding",
            Header::Expires(_) => "Expires",
            Header::MinExpires(_) => "Min-Expires",
            Header::UserAgent(_) => "User-Agent",
            Header::Server(_) => "Server",
            Header::Subject(_) => "Subject",
            Header::Date(_) => "Date",
            Header::Accept(_) => "Accept",
            Header::Event(_) => "Event",
            Header::Warning(_) => "Warning",
            Header::Allow(_) => "Allow",
            Header::Supported(_) => "Supported",
            Header::Require(_) => "Require",
            Header::Unsupported(_) => "Unsupported",
            Header::ProxyRequire(_) => "Proxy-Require",
            Header::Authorization(_) => "Authorization",
            Header::ProxyAuthorization(_) => "Proxy-Authorization",
            Header::WwwAuthenticate(_) => "WWW-Authenticate",
            Header::ProxyAuthenticate(_) => "Proxy-Authenticate",
            Header::Other(name, _) => name,
        }
    }

    fn value_string(&self) -> String {
        match self {
            Header::Via(v) => v.to_string(),
            Header::From(v) | Header::To(v) | Header::Contact(v) | Header::Route(v)
            | Header::RecordRoute(v) => v.to_string(),
            Header::CallId(v)
            | Header::ContentType(v)
            | Header::ContentEncoding(v)
            | Header::UserAgent(v)
            | Header::Server(v)
            | Header::Subject(v)
            | Header::Date(v)
            | Header::Accept(v)
            | Header::Event(v)
            | Header::Warning(v) => v.clone(),
            Header::CSeq(v) => v.to_string(),
            Header::MaxForwards(v) | Header::ContentLength(v) | Header::Expires(v)
            | Header::MinExpires(v) => v.to_string(),
            Header::Allow(methods) => methods
                .iter()
                .map(|m| m.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            Header::Supported(tokens)
            | Header::Require(tokens)
            | Header::Unsupported(tokens)
            | Header::ProxyRequire(tokens) => tokens.join(", "),
            Header::Authorization(v)
            | Header::ProxyAuthorization(v)
            | Header::WwwAuthenticate(v)
            | Header::ProxyAuthenticate(v) => v.to_string(),
            Header::Other(_, v) => v.clone(),
        }
    }

    /// True when both headers are the same kind (same canonical name).
    fn same_kind(&self, other: &Header) -> bool {
        match (self, other) {
            (Header::Other(a, _), Header::Other(b, _)) => a.eq_ignore_ascii_case(b),
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name(), self.value_string())
    }
}

/// An ordered header collection. Relative order is preserved because it is
/// semantically meaningful for Via, Route, Record-Route and Contact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn push(&mut self, header: Header) {
        self.0.push(header);
    }

    /// Replace the first header of the same kind, or append.
    pub fn unique_push(&mut self, header: Header) {
        for existing in self.0.iter_mut() {
            if existing.same_kind(&header) {
                *existing = header;
                return;
            }
        }
        self.0.push(header);
    }

    pub fn extend(&mut self, headers: Vec<Header>) {
        self.0.extend(headers);
    }

    pub fn retain<F: FnMut(&Header) -> bool>(&mut self, f: F) {
        self.0.retain(f);
    }

    pub fn remove_first(&mut self, name: &str) -> Option<Header> {
        let pos = self
            .0
            .iter()
            .position(|h| h.name().eq_ignore_ascii_case(name))?;
        Some(self.0.remove(pos))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Header> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Header> {
        self.0.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn via_header(&self) -> Result<&Via> {
        self.iter()
            .find_map(|h| match h {
                Header::Via(via) => Some(via),
                _ => None,
            })
            .ok_or_else(|| Error::BadRequest("missing Via header".to_string()))
    }

    pub fn via_header_mut(&mut self) -> Result<&mut Via> {
        self.iter_mut()
            .find_map(|h| match h {
                Header::Via(via) => Some(via),
                _ => None,
            })
            .ok_or_else(|| Error::BadRequest("missing Via header".to_string()))
    }

    pub fn from_header(&self) -> Result<&NameAddr> {
        self.iter()
            .find_map(|h| match h {
                Header::From(addr) => Some(addr),
                _ => None,
            })
            .ok_or_else(|| Error::BadRequest("missing From header".to_string()))
    }

    pub fn to_header(&self) -> Result<&NameAddr> {
        self.iter()
            .find_map(|h| match h {
                Header::To(addr) => Some(addr),
                _ => None,
            })
            .ok_or_else(|| Error::BadRequest("missing To header".to_string()))
    }

    pub fn to_header_mut(&mut self) -> Result<&mut NameAddr> {
        self.iter_mut()
            .find_map(|h| match h {
                Header::To(addr) => Some(addr),
                _ => None,
            })
            .ok_or_else(|| Error::BadRequest("missing To header".to_string()))
    }

    pub fn call_id_header(&self) -> Result<&str> {
        self.iter()
            .find_map(|h| match h {
                Header::CallId(id) => Some(id.as_str()),
                _ => None,
            })
            .ok_or_else(|| Error::BadRequest("missing Call-ID header".to_string()))
    }

    pub fn cseq_header(&self) -> Result<&CSeq> {
        self.iter()
            .find_map(|h| match h {
                Header::CSeq(cseq) => Some(cseq),
                _ => None,
            })
            .ok_or_else(|| Error::BadRequest("missing CSeq header".to_string()))
    }

    pub fn contact_header(&self) -> Option<&NameAddr> {
        self.iter().find_map(|h| match h {
            Header::Contact(addr) => Some(addr),
            _ => None,
        })
    }

    pub fn contacts(&self) -> Vec<&NameAddr> {
        self.iter()
            .filter_map(|h| match h {
                Header::Contact(addr) => Some(addr),
                _ => None,
            })
            .collect()
    }

    pub fn routes(&self) -> Vec<&NameAddr> {
        self.iter()
            .filter_map(|h| match h {
                Header::Route(addr) => Some(addr),
                _ => None,
            })
            .collect()
    }

    pub fn record_routes(&self) -> Vec<&NameAddr> {
        self.iter()
            .filter_map(|h| match h {
                Header::RecordRoute(addr) => Some(addr),
                _ => None,
            })
            .collect()
    }

    pub fn content_length(&self) -> Option<u32> {
        self.iter().find_map(|h| match h {
            Header::ContentLength(len) => Some(*len),
            _ => None,
        })
    }

    /// All Require tokens, merged across occurrences.
    pub fn require_tokens(&self) -> Vec<String> {
        self.iter()
            .filter_map(|h| match h {
                Header::Require(tokens) => Some(tokens.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn www_authenticate(&self) -> Option<&Auth> {
        self.iter().find_map(|h| match h {
            Header::WwwAuthenticate(auth) => Some(auth),
            _ => None,
        })
    }

    pub fn proxy_authenticate(&self) -> Option<&Auth> {
        self.iter().find_map(|h| match h {
            Header::ProxyAuthenticate(auth) => Some(auth),
            _ => None,
        })
    }

    pub fn has(&self, name: &str) -> bool {
        let canonical = canonical_name(name);
        self.iter()
            .any(|h| canonical_name(h.name()) == canonical)
    }
}

impl From<Vec<Header>> for Headers {
    fn from(headers: Vec<Header>) -> Self {
        Headers(headers)
    }
}

impl IntoIterator for Headers {
    type Item = Header;
    type IntoIter = std::vec::IntoIter<Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for header in &self.0 {
            write!(f, "{}\r\n", header)?;
        }
        Ok(())
    }
}
