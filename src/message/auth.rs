use super::parser::{is_token, quote, split_list, unquote};
use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthScheme {
    Digest,
    Other(String),
}

impl fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthScheme::Digest => f.write_str("Digest"),
            AuthScheme::Other(scheme) => f.write_str(scheme),
        }
    }
}

/// Challenge or credentials value for the WWW-Authenticate, Authorization,
/// Proxy-Authenticate and Proxy-Authorization headers: a scheme followed by
/// an ordered comma-separated parameter list.
///
/// Parameter order is preserved through a parse/format round trip. Values
/// are unquoted on parse; on output the handful of parameters RFC 2617
/// requires to stay bare (qop in credentials, nc, algorithm, stale) are
/// emitted as tokens and everything else non-token is quoted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Auth {
    pub scheme: AuthScheme,
    pub params: Vec<(String, String)>,
}

const BARE_PARAMS: [&str; 4] = ["nc", "algorithm", "stale", "qop"];

impl Auth {
    pub fn digest(params: Vec<(String, String)>) -> Self {
        Auth {
            scheme: AuthScheme::Digest,
            params,
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, name: &str, value: String) {
        for (n, v) in self.params.iter_mut() {
            if n.eq_ignore_ascii_case(name) {
                *v = value;
                return;
            }
        }
        self.params.push((name.to_string(), value));
    }

    /// True for challenges that carry `qop="auth"` (possibly among other
    /// tokens).
    pub fn qop_auth(&self) -> bool {
        self.get("qop")
            .map(|qop| qop.split(',').any(|t| t.trim().eq_ignore_ascii_case("auth")))
            .unwrap_or(false)
    }
}

impl FromStr for Auth {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (scheme, rest) = s
            .split_once(char::is_whitespace)
            .ok_or_else(|| Error::BadRequest(format!("auth value without parameters: {}", s)))?;
        let scheme = if scheme.eq_ignore_ascii_case("digest") {
            AuthScheme::Digest
        } else {
            AuthScheme::Other(scheme.to_string())
        };

        let mut params = Vec::new();
        for item in split_list(rest) {
            let (name, value) = item
                .split_once('=')
                .ok_or_else(|| Error::BadRequest(format!("auth parameter without value: {}", item)))?;
            params.push((name.trim().to_string(), unquote(value.trim())));
        }
        Ok(Auth { scheme, params })
    }
}

impl fmt::Display for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.scheme)?;
        for (i, (name, value)) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            let bare = BARE_PARAMS.iter().any(|p| name.eq_ignore_ascii_case(p)) && is_token(value);
            if bare {
                write!(f, "{}={}", name, value)?;
            } else {
                write!(f, "{}={}", name, quote(value))?;
            }
        }
        Ok(())
    }
}
