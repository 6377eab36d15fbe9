//! ABNF primitives and message framing shared by the datagram and stream
//! codecs.

use super::headers::{Header, Headers};
use super::method::Method;
use super::status::StatusCode;
use super::uri::Uri;
use super::{Request, Response, SipMessage, Version};
use crate::{Error, Result};

/// token per RFC 3261 section 25.1.
pub(crate) fn is_token_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'!' | b'%' | b'*' | b'_' | b'+' | b'`' | b'\'' | b'~')
}

pub(crate) fn is_token(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(is_token_char)
}

/// Strip surrounding double quotes and unescape the contents. Unquoted input
/// passes through untouched.
pub(crate) fn unquote(s: &str) -> String {
    let s = s.trim();
    let Some(inner) = s.strip_prefix('"').and_then(|rest| rest.strip_suffix('"')) else {
        return s.to_string();
    };
    let mut out = String::with_capacity(inner.len());
    let mut escaped = false;
    for c in inner.chars() {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else {
            out.push(c);
        }
    }
    out
}

pub(crate) fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Tokens serialize bare; anything else becomes a quoted string.
pub(crate) fn quote_if_needed(s: &str) -> String {
    if is_token(s) {
        s.to_string()
    } else {
        quote(s)
    }
}

/// Split a comma-separated list value, ignoring commas inside quoted strings
/// and angle brackets. Used for every list-valued header.
pub(crate) fn split_list(value: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0usize;
    for (i, b) in value.bytes().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_quotes => escaped = true,
            b'"' => in_quotes = !in_quotes,
            b'<' if !in_quotes => depth += 1,
            b'>' if !in_quotes => depth = depth.saturating_sub(1),
            b',' if !in_quotes && depth == 0 => {
                items.push(value[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(value[start..].trim());
    items.retain(|item| !item.is_empty());
    items
}

/// Split `;`-separated parameters, ignoring separators inside quoted
/// strings and angle brackets. The first element is the part before any
/// parameter.
pub(crate) fn split_params(value: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0usize;
    for (i, b) in value.bytes().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_quotes => escaped = true,
            b'"' => in_quotes = !in_quotes,
            b'<' if !in_quotes => depth += 1,
            b'>' if !in_quotes => depth = depth.saturating_sub(1),
            b';' if !in_quotes && depth == 0 => {
                items.push(value[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(value[start..].trim());
    items
}

#[derive(Debug, Clone)]
pub(crate) enum StartLine {
    Request { method: Method, uri: Uri },
    Response { status: StatusCode, reason: String },
}

pub(crate) fn parse_start_line(line: &str) -> Result<StartLine> {
    let line = line.trim_end();
    if let Some(rest) = line.strip_prefix("SIP/2.0 ") {
        let (code, reason) = match rest.split_once(' ') {
            Some((code, reason)) => (code, reason),
            None => (rest, ""),
        };
        let code: u16 = code
            .parse()
            .map_err(|_| Error::BadResponse(format!("invalid status code: {}", code)))?;
        if !(100..700).contains(&code) {
            return Err(Error::BadResponse(format!("status code out of range: {}", code)));
        }
        return Ok(StartLine::Response {
            status: StatusCode::from_code(code),
            reason: reason.to_string(),
        });
    }

    let mut parts = line.split(' ');
    let method = parts
        .next()
        .ok_or_else(|| Error::BadRequest("empty start line".to_string()))?;
    let uri = parts
        .next()
        .ok_or_else(|| Error::BadRequest(format!("request line without uri: {}", line)))?;
    let version = parts
        .next()
        .ok_or_else(|| Error::BadRequest(format!("request line without version: {}", line)))?;
    if version != "SIP/2.0" {
        return Err(Error::BadRequest(format!("unsupported version: {}", version)));
    }
    Ok(StartLine::Request {
        method: method.parse()?,
        uri: uri.parse()?,
    })
}

/// Parse a raw header section (everything between the start line and the
/// blank line) into typed headers. Continuation lines starting with SP or
/// HTAB fold into the previous header value joined by a single SP.
pub(crate) fn parse_header_block(block: &str) -> Result<Headers> {
    let mut unfolded: Vec<String> = Vec::new();
    for line in block.split("\r\n").flat_map(|l| l.split('\n')) {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            let Some(prev) = unfolded.last_mut() else {
                return Err(Error::BadRequest("continuation before first header".to_string()));
            };
            let trimmed_prev = prev.trim_end().len();
            prev.truncate(trimmed_prev);
            prev.push(' ');
            prev.push_str(line.trim_start());
        } else {
            unfolded.push(line.to_string());
        }
    }

    let mut headers = Headers::default();
    for line in unfolded {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::BadRequest(format!("header without colon: {}", line)))?;
        for header in Header::parse(name.trim(), value.trim())? {
            headers.push(header);
        }
    }
    Ok(headers)
}

/// Locate the CRLF CRLF header/body boundary, scanning from `from`. Returns
/// the index just past the separator. Also accepts bare LF LF from lenient
/// peers.
pub(crate) fn find_header_end(buf: &[u8], from: usize) -> Option<usize> {
    let start = from.min(buf.len());
    for i in start..buf.len() {
        if buf[i] == b'\n' {
            if i >= 3 && &buf[i - 3..=i] == b"\r\n\r\n" {
                return Some(i + 1);
            }
            if i >= 1 && buf[i - 1] == b'\n' {
                return Some(i + 1);
            }
        }
    }
    None
}

pub(crate) fn build_message(
    start_line: StartLine,
    headers: Headers,
    body: Vec<u8>,
) -> SipMessage {
    match start_line {
        StartLine::Request { method, uri } => SipMessage::Request(Request {
            method,
            uri,
            version: Version::V2,
            headers,
            body,
        }),
        StartLine::Response { status, reason } => SipMessage::Response(Response {
            status_code: status,
            reason_phrase: Some(reason),
            version: Version::V2,
            headers,
            body,
        }),
    }
}

/// Parse a single datagram into a message. Bytes beyond Content-Length are
/// discarded; a datagram shorter than Content-Length is an error.
pub fn parse_datagram(data: &[u8]) -> Result<SipMessage> {
    // Leading CRLFs are allowed as keepalive padding.
    let mut offset = 0usize;
    while offset < data.len() && (data[offset] == b'\r' || data[offset] == b'\n') {
        offset += 1;
    }
    let data = &data[offset..];
    if data.is_empty() {
        return Err(Error::BadRequest("empty datagram".to_string()));
    }

    let head_end = find_header_end(data, 0)
        .ok_or_else(|| Error::BadRequest("no header terminator".to_string()))?;
    let head = std::str::from_utf8(&data[..head_end])
        .map_err(|_| Error::BadRequest("header section is not valid UTF-8".to_string()))?;
    let (first_line, rest) = match head.split_once('\n') {
        Some((line, rest)) => (line.trim_end_matches('\r'), rest),
        None => (head, ""),
    };
    let start_line = parse_start_line(first_line)?;
    let headers = parse_header_block(rest)?;

    let remainder = &data[head_end..];
    let body = match headers.content_length() {
        Some(len) => {
            let len = len as usize;
            if remainder.len() < len {
                return Err(match &start_line {
                    StartLine::Request { .. } => Error::BadRequest("content_too_small".to_string()),
                    StartLine::Response { .. } => {
                        Error::BadResponse("content_too_small".to_string())
                    }
                });
            }
            remainder[..len].to_vec()
        }
        None => remainder.to_vec(),
    };

    Ok(build_message(start_line, headers, body))
}
