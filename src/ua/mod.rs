//! UA cores: the UAC request workflow (target sets, redirection, digest
//! retry, failover, cancellation) and the UAS validation pipeline, driven
//! on behalf of an application callback.

pub mod uac;
pub mod uas;

#[cfg(test)]
mod tests;

use crate::dialog::authenticate::Credential;
use crate::dialog::{Dialog, DialogId};
use crate::message::{
    Header, Method, NameAddr, Request, Response, StatusCode, Uri,
};
use crate::transaction::endpoint::{Endpoint, EndpointInnerRef, TransactionReceiver};
use crate::transaction::key::TransactionRole;
use crate::transaction::{make_tag, transaction::Transaction};
use crate::transport::SipAddr;
use crate::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{info, warn};

/// Opaque handle for an in-flight UAC request.
pub type RequestId = u64;

/// Responses flowing back to the caller of [`UserAgent::send_request`].
/// Delivered from the request's driver task, never from the caller's.
#[derive(Debug)]
pub enum UacEvent {
    Provisional(RequestId, Response),
    Completed(RequestId, Result<Response>),
}

pub type UacEventSender = UnboundedSender<UacEvent>;
pub type UacEventReceiver = UnboundedReceiver<UacEvent>;

/// What a request handler did with an incoming request.
pub enum HandleResult {
    /// Send this response through the server transaction.
    Reply(Response),
    /// The handler already responded through the transaction handle (or
    /// the request needs none, like ACK).
    NoReply,
}

/// The application side of the UA: policy and per-method handling.
///
/// One UA can carry several callbacks; `is_applicable` picks the one that
/// claims an incoming request.
#[async_trait::async_trait]
pub trait UaCallback: Send + Sync + 'static {
    /// Methods this application accepts; anything else gets 405.
    fn allow(&self) -> Vec<Method> {
        vec![
            Method::Invite,
            Method::Ack,
            Method::Cancel,
            Method::Bye,
            Method::Options,
        ]
    }

    /// Extension tokens this application supports (for the Require check
    /// and the advertised Supported header).
    fn supported(&self) -> Vec<String> {
        Vec::new()
    }

    /// Product token for the Server header.
    fn server(&self) -> String {
        format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    }

    /// Whether merged-request detection (RFC 3261 section 8.2.2.2) runs
    /// for this application.
    fn detect_loops(&self) -> bool {
        true
    }

    /// Claim check for multi-application dispatch.
    fn is_applicable(&self, _req: &Request) -> bool {
        true
    }

    /// Handle a validated request. The transaction handle allows sending
    /// provisionals before returning the final reply.
    async fn handle_request(&self, tx: &mut Transaction) -> Result<HandleResult>;
}

/// Shared state between an in-flight request's driver task and
/// `cancel_request`, so a CANCEL can be issued promptly when a provisional
/// has been seen and deferred until one arrives otherwise.
pub(crate) struct PendingRequest {
    pub cancelled: AtomicBool,
    pub cancel_sent: AtomicBool,
    pub provisional_seen: AtomicBool,
    /// The request exactly as last sent on the wire (branch included), the
    /// template any CANCEL must copy.
    pub current: Mutex<Option<Request>>,
}

impl PendingRequest {
    pub(crate) fn new() -> Self {
        PendingRequest {
            cancelled: AtomicBool::new(false),
            cancel_sent: AtomicBool::new(false),
            provisional_seen: AtomicBool::new(false),
            current: Mutex::new(None),
        }
    }

    /// A new transaction attempt starts: remember its wire form and reset
    /// the per-transaction cancel bookkeeping.
    pub(crate) fn begin_attempt(&self, request: &Request) {
        self.provisional_seen.store(false, Ordering::SeqCst);
        self.cancel_sent.store(false, Ordering::SeqCst);
        self.current.lock().unwrap().replace(request.clone());
    }
}

/// Signature used for merged-request detection: the five identifying
/// fields, plus the topmost branch that tells a loop from a retransmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestSignature {
    call_id: String,
    from: String,
    to: String,
    cseq: String,
    request_uri: String,
    branch: String,
}

impl RequestSignature {
    fn of(req: &Request) -> Result<Self> {
        Ok(RequestSignature {
            call_id: req.headers.call_id_header()?.to_string(),
            from: req.headers.from_header()?.to_string(),
            to: req.headers.to_header()?.to_string(),
            cseq: req.headers.cseq_header()?.to_string(),
            request_uri: req.uri.to_string(),
            branch: req
                .headers
                .via_header()?
                .branch()
                .unwrap_or_default()
                .to_string(),
        })
    }

    fn is_merge_of(&self, other: &Self) -> bool {
        self.call_id == other.call_id
            && self.from == other.from
            && self.to == other.to
            && self.cseq == other.cseq
            && self.request_uri == other.request_uri
            && self.branch != other.branch
    }
}

const SEEN_REQUEST_CAPACITY: usize = 64;

pub struct UserAgentInner {
    pub endpoint: EndpointInnerRef,
    /// Identity used as From in new requests.
    pub local_uri: RwLock<Option<Uri>>,
    /// Contact advertised in new requests.
    pub contact: RwLock<Option<Uri>>,
    pub credential: RwLock<Option<Credential>>,
    callbacks: RwLock<Vec<Arc<dyn UaCallback>>>,
    requests: RwLock<HashMap<RequestId, Arc<PendingRequest>>>,
    last_request_id: AtomicU64,
    seen_requests: Mutex<VecDeque<RequestSignature>>,
    dialogs: RwLock<HashMap<DialogId, Dialog>>,
}

impl UserAgentInner {
    pub(crate) fn pick_callback(&self, req: &Request) -> Option<Arc<dyn UaCallback>> {
        self.callbacks
            .read()
            .unwrap()
            .iter()
            .find(|cb| cb.is_applicable(req))
            .cloned()
    }

    /// Record the request's signature and report whether an earlier sibling
    /// makes it a merged request.
    pub(crate) fn check_loop(&self, req: &Request) -> Result<bool> {
        let signature = RequestSignature::of(req)?;
        let mut seen = self.seen_requests.lock().unwrap();
        let looped = seen.iter().any(|s| signature.is_merge_of(s));
        if !looped {
            if seen.len() >= SEEN_REQUEST_CAPACITY {
                seen.pop_front();
            }
            seen.push_back(signature);
        }
        Ok(looped)
    }

    pub(crate) fn detach_request(&self, id: RequestId) {
        self.requests.write().unwrap().remove(&id);
    }

    /// Track dialog state from a UAC response: a dialog-establishing 1xx
    /// opens an early dialog, a 2xx confirms it and refreshes the remote
    /// target.
    pub(crate) fn note_dialog(&self, original: &Request, resp: &Response) {
        if original.method != Method::Invite {
            return;
        }
        let Ok(dialog) = Dialog::from_client_response(original, resp) else {
            return;
        };
        let id = dialog.id.clone();
        let mut dialogs = self.dialogs.write().unwrap();
        match dialogs.get_mut(&id) {
            Some(existing) => {
                if dialog.is_confirmed() {
                    existing.confirm();
                    existing.update_remote_target(resp);
                }
            }
            None => {
                dialogs.insert(id, dialog);
            }
        }
    }

    pub(crate) fn close_dialog(&self, request: &Request) {
        if let Ok(id) = DialogId::try_from(request) {
            if let Some(mut dialog) = self.dialogs.write().unwrap().remove(&id) {
                dialog.terminate();
            }
        }
    }
}

/// A user agent bound to one endpoint: the entry point for sending
/// requests and serving incoming ones.
pub struct UserAgent {
    pub inner: Arc<UserAgentInner>,
    incoming: Mutex<Option<TransactionReceiver>>,
}

impl UserAgent {
    pub fn new(endpoint: &Endpoint) -> Self {
        UserAgent {
            inner: Arc::new(UserAgentInner {
                endpoint: endpoint.inner.clone(),
                local_uri: RwLock::new(None),
                contact: RwLock::new(None),
                credential: RwLock::new(None),
                callbacks: RwLock::new(Vec::new()),
                requests: RwLock::new(HashMap::new()),
                last_request_id: AtomicU64::new(1),
                seen_requests: Mutex::new(VecDeque::new()),
                dialogs: RwLock::new(HashMap::new()),
            }),
            incoming: Mutex::new(Some(endpoint.incoming_transactions())),
        }
    }

    pub fn with_local_uri(self, uri: Uri) -> Self {
        self.inner.local_uri.write().unwrap().replace(uri);
        self
    }

    pub fn with_contact(self, uri: Uri) -> Self {
        self.inner.contact.write().unwrap().replace(uri);
        self
    }

    pub fn with_credential(self, credential: Credential) -> Self {
        self.inner.credential.write().unwrap().replace(credential);
        self
    }

    pub fn attach_callback(&self, callback: Arc<dyn UaCallback>) {
        self.inner.callbacks.write().unwrap().push(callback);
    }

    /// Serve incoming server transactions until the endpoint shuts down.
    pub async fn serve(&self) {
        let mut incoming = match self.incoming.lock().unwrap().take() {
            Some(incoming) => incoming,
            None => {
                warn!("user agent already serving");
                return;
            }
        };
        let cancel_token = self.inner.endpoint.cancel_token.clone();
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    info!("user agent stopped");
                    return;
                }
                tx = incoming.recv() => {
                    let Some(tx) = tx else { return };
                    let inner = self.inner.clone();
                    tokio::spawn(async move {
                        uas::process(inner, tx).await;
                    });
                }
            }
        }
    }

    /// Build an out-of-dialog request per RFC 3261 section 8.1.1.
    pub fn create_request(&self, method: Method, to: Uri) -> Result<Request> {
        let from_uri = self
            .inner
            .local_uri
            .read()
            .unwrap()
            .clone()
            .unwrap_or_else(|| to.clone());
        let from = NameAddr::new(from_uri).with_tag(make_tag());
        let to = NameAddr::new(to);
        let req_uri = to.uri.clone();
        let via = self.inner.endpoint.get_via(None, None)?;
        let mut request = self
            .inner
            .endpoint
            .make_request(method, req_uri, via, from, to, 1);
        if let Some(contact) = self.inner.contact.read().unwrap().clone() {
            request
                .headers
                .unique_push(Header::Contact(NameAddr::new(contact)));
        }
        request.headers.unique_push(Header::ContentLength(0));
        Ok(request)
    }

    /// Build an in-dialog request: the dialog supplies target, route set
    /// and CSeq.
    pub fn create_request_in_dialog(&self, method: Method, dialog: &mut Dialog) -> Result<Request> {
        let via = self.inner.endpoint.get_via(None, None)?;
        Ok(dialog.make_request(method, via))
    }

    /// Start the UAC workflow for `request`. Responses arrive on `sender`
    /// from a separate task. Fails synchronously with `NoDestinations`
    /// when the target cannot be resolved at all.
    pub async fn send_request(
        &self,
        request: Request,
        sender: UacEventSender,
    ) -> Result<RequestId> {
        let target = SipAddr::try_from(&request.uri)?;
        let candidates = self
            .inner
            .endpoint
            .transport_layer
            .resolver()
            .resolve(&target.addr, target.transport())
            .await
            .unwrap_or_default();
        if candidates.is_empty() {
            return Err(Error::NoDestinations);
        }

        let id = self.inner.last_request_id.fetch_add(1, Ordering::Relaxed);
        let pending = Arc::new(PendingRequest::new());
        self.inner
            .requests
            .write()
            .unwrap()
            .insert(id, pending.clone());

        let credential = self.inner.credential.read().unwrap().clone();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            uac::run(
                inner,
                uac::RequestJob {
                    id,
                    request,
                    sender,
                    credential,
                    pending,
                },
            )
            .await;
        });
        Ok(id)
    }

    /// CANCEL the in-flight request `id` per RFC 3261 section 9: sent at
    /// once when a provisional response has arrived, deferred until one
    /// does otherwise. Idempotent; unknown ids report `NoRequest`.
    pub fn cancel_request(&self, id: RequestId) -> Result<()> {
        let pending = self
            .inner
            .requests
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(Error::NoRequest)?;
        pending.cancelled.store(true, Ordering::SeqCst);
        if pending.provisional_seen.load(Ordering::SeqCst)
            && !pending.cancel_sent.swap(true, Ordering::SeqCst)
        {
            if let Some(original) = pending.current.lock().unwrap().clone() {
                let endpoint = self.inner.endpoint.clone();
                tokio::spawn(async move {
                    uac::send_cancel(endpoint, &original).await.ok();
                });
            }
        }
        Ok(())
    }

    /// Build a response for `request`, optionally overriding the reason
    /// phrase.
    pub fn create_response(
        &self,
        request: &Request,
        status: StatusCode,
        reason: Option<String>,
    ) -> Response {
        let mut resp = self.inner.endpoint.make_response(request, status, None);
        resp.reason_phrase = reason;
        resp
    }

    /// Hand a response to a server transaction.
    pub async fn send_response(&self, tx: &mut Transaction, response: Response) -> Result<()> {
        tx.respond(response).await
    }

    /// Look up an established (or early) dialog.
    pub fn find_dialog(&self, id: &DialogId) -> Option<Dialog> {
        self.inner.dialogs.read().unwrap().get(id).cloned()
    }
}

pub(crate) fn client_key(request: &Request) -> Result<crate::transaction::key::TransactionKey> {
    crate::transaction::key::TransactionKey::from_request(request, TransactionRole::Client)
}
