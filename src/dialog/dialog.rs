use super::DialogId;
use crate::message::{
    CSeq, Header, Method, NameAddr, Request, Response, Scheme, StatusCodeKind, Uri, Version,
};
use crate::transaction::key::TransactionRole;
use crate::{Error, Result};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    /// Established by a provisional response carrying a To-tag.
    Early,
    /// Established or confirmed by a 2xx.
    Confirmed,
    /// Ended by BYE or error.
    Terminated,
}

/// Dialog state per RFC 3261 section 12: the two URIs and tags, both CSeq
/// counters, the remote target and the route set.
#[derive(Debug, Clone)]
pub struct Dialog {
    pub id: DialogId,
    pub role: TransactionRole,
    pub state: DialogState,
    pub local_uri: Uri,
    pub remote_uri: Uri,
    pub local_seq: u32,
    /// Zero until the first in-dialog request arrives.
    pub remote_seq: u32,
    /// Where in-dialog requests go: the peer's Contact.
    pub remote_target: Uri,
    /// Record-Route captured at establishment, stored in the order Route
    /// headers will carry it.
    pub route_set: Vec<NameAddr>,
    pub secure: bool,
}

impl Dialog {
    /// Build the client side of a dialog from the original request and a
    /// dialog-establishing response (1xx with To-tag, or 2xx). The route
    /// set is the response's Record-Route reversed (RFC 3261 section
    /// 12.1.2).
    pub fn from_client_response(original: &Request, resp: &Response) -> Result<Self> {
        let id = DialogId::try_from(resp)?;
        if id.to_tag.is_empty() {
            return Err(Error::DialogError(
                "response does not establish a dialog".to_string(),
                id,
            ));
        }
        let remote_target = resp
            .headers
            .contact_header()
            .map(|c| c.uri.clone())
            .unwrap_or_else(|| original.uri.clone());
        let mut route_set: Vec<NameAddr> =
            resp.headers.record_routes().into_iter().cloned().collect();
        route_set.reverse();
        let state = if resp.status_code.kind() == StatusCodeKind::Provisional {
            DialogState::Early
        } else {
            DialogState::Confirmed
        };
        debug!("client dialog established: {}", id);
        Ok(Dialog {
            id,
            role: TransactionRole::Client,
            state,
            local_uri: original.headers.from_header()?.uri.clone(),
            remote_uri: original.headers.to_header()?.uri.clone(),
            local_seq: original.headers.cseq_header()?.seq,
            remote_seq: 0,
            remote_target,
            route_set,
            secure: original.uri.scheme == Some(Scheme::Sips),
        })
    }

    /// Build the server side from an incoming dialog-establishing request
    /// and the local tag the UAS assigned. Record-Route is kept in request
    /// order (RFC 3261 section 12.1.1).
    pub fn from_server_request(req: &Request, local_tag: &str) -> Result<Self> {
        let call_id = req.headers.call_id_header()?.to_string();
        let remote = req.headers.from_header()?;
        let id = DialogId {
            call_id,
            from_tag: local_tag.to_string(),
            to_tag: remote.tag().unwrap_or_default().to_string(),
        };
        let remote_target = req
            .headers
            .contact_header()
            .map(|c| c.uri.clone())
            .ok_or_else(|| {
                Error::DialogError("request without Contact".to_string(), id.clone())
            })?;
        debug!("server dialog established: {}", id);
        Ok(Dialog {
            id: id.clone(),
            role: TransactionRole::Server,
            state: DialogState::Confirmed,
            local_uri: req.headers.to_header()?.uri.clone(),
            remote_uri: remote.uri.clone(),
            local_seq: 0,
            remote_seq: req.headers.cseq_header()?.seq,
            remote_target,
            route_set: req.headers.record_routes().into_iter().cloned().collect(),
            secure: req.uri.scheme == Some(Scheme::Sips),
        })
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == DialogState::Confirmed
    }

    pub fn confirm(&mut self) {
        if self.state == DialogState::Early {
            self.state = DialogState::Confirmed;
        }
    }

    pub fn terminate(&mut self) {
        self.state = DialogState::Terminated;
    }

    /// Update the remote target from a 2xx Contact (re-INVITE or initial
    /// confirmation).
    pub fn update_remote_target(&mut self, resp: &Response) {
        if let Some(contact) = resp.headers.contact_header() {
            self.remote_target = contact.uri.clone();
        }
    }

    pub fn next_local_seq(&mut self) -> u32 {
        self.local_seq += 1;
        self.local_seq
    }

    /// Accept an in-dialog request only when its CSeq keeps the remote
    /// counter strictly monotonic (RFC 3261 section 12.2.2).
    pub fn validate_remote_seq(&mut self, seq: u32) -> bool {
        if self.remote_seq != 0 && seq <= self.remote_seq {
            return false;
        }
        self.remote_seq = seq;
        true
    }

    /// Construct an in-dialog request (BYE, re-INVITE, ...): Request-URI is
    /// the remote target, the stored route set becomes Route headers, tags
    /// ride on From/To per the dialog role.
    pub fn make_request(&mut self, method: Method, via: crate::message::Via) -> Request {
        let seq = self.next_local_seq();
        let (local_tag, remote_tag) = (self.id.from_tag.clone(), self.id.to_tag.clone());

        let mut from = NameAddr::new(self.local_uri.clone());
        if !local_tag.is_empty() {
            from.set_tag(local_tag);
        }
        let mut to = NameAddr::new(self.remote_uri.clone());
        if !remote_tag.is_empty() {
            to.set_tag(remote_tag);
        }

        let mut headers = vec![
            Header::Via(via),
            Header::CallId(self.id.call_id.clone()),
            Header::From(from),
            Header::To(to),
            Header::CSeq(CSeq {
                seq,
                method: method.clone(),
            }),
            Header::MaxForwards(70),
        ];
        for route in &self.route_set {
            headers.push(Header::Route(route.clone()));
        }
        headers.push(Header::ContentLength(0));

        Request {
            method,
            uri: self.remote_target.clone(),
            version: Version::V2,
            headers: headers.into(),
            body: vec![],
        }
    }
}
