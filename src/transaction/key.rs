use super::BRANCH_MAGIC_COOKIE;
use crate::message::{Method, Request, Response};
use crate::{Error, Result};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionRole {
    Client,
    Server,
}

/// The process-unique transaction id, built per RFC 3261 section 17.1.3 /
/// 17.2.3 from the topmost Via branch, its sent-by and the request method.
///
/// ACK matches the INVITE transaction it acknowledges, and an incoming
/// CANCEL matches the server transaction it cancels, so both map their
/// method to INVITE here; a CANCEL *client* transaction is its own
/// transaction and keeps the CANCEL method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub role: TransactionRole,
    pub branch: String,
    pub sent_by: String,
    pub method: Method,
}

fn key_method(method: &Method, role: TransactionRole) -> Method {
    match method {
        Method::Ack => Method::Invite,
        Method::Cancel if role == TransactionRole::Server => Method::Invite,
        other => other.clone(),
    }
}

impl TransactionKey {
    pub fn from_request(req: &Request, role: TransactionRole) -> Result<Self> {
        let via = req.headers.via_header()?;
        let branch = via
            .branch()
            .ok_or_else(|| Error::BadRequest("via without branch".to_string()))?;
        if !branch.starts_with(BRANCH_MAGIC_COOKIE) {
            return Err(Error::BadRequest(format!(
                "branch without magic cookie: {}",
                branch
            )));
        }
        Ok(TransactionKey {
            role,
            branch: branch.to_string(),
            sent_by: via.sent_by.to_string(),
            method: key_method(&req.method, role),
        })
    }

    /// Client-side key for an inbound response, from its topmost Via and
    /// the CSeq method.
    pub fn from_response(resp: &Response) -> Result<Self> {
        let via = resp.headers.via_header()?;
        let branch = via
            .branch()
            .ok_or_else(|| Error::BadResponse("via without branch".to_string()))?;
        let method = &resp.headers.cseq_header()?.method;
        Ok(TransactionKey {
            role: TransactionRole::Client,
            branch: branch.to_string(),
            sent_by: via.sent_by.to_string(),
            method: key_method(method, TransactionRole::Client),
        })
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.role {
            TransactionRole::Client => "uac",
            TransactionRole::Server => "uas",
        };
        write!(f, "{}:{}:{}:{}", role, self.method, self.branch, self.sent_by)
    }
}
