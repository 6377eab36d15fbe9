use super::{client_key, PendingRequest, RequestId, UacEvent, UacEventSender, UserAgentInner};
use crate::dialog::authenticate::{handle_client_authenticate, Credential};
use crate::message::{
    CSeq, Header, Method, NameAddr, Param, Request, Response, SipMessage, StatusCode,
    StatusCodeKind, Uri,
};
use crate::transaction::endpoint::EndpointInnerRef;
use crate::transaction::key::{TransactionKey, TransactionRole};
use crate::transaction::{make_branch, transaction::Transaction};
use crate::transport::SipAddr;
use crate::{Error, Result};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub(crate) struct RequestJob {
    pub id: RequestId,
    pub request: Request,
    pub sender: UacEventSender,
    pub credential: Option<Credential>,
    pub pending: Arc<PendingRequest>,
}

/// What one transaction attempt concluded, steering the target-set walk.
enum AttemptOutcome {
    /// Final answer for the caller.
    Delivered(Response),
    /// 408/503 or a transport error: the next resolved endpoint of the
    /// same URI may do better (RFC 3263 failover).
    NextCandidate(Option<Response>),
    /// Some other final: move on to the next target URI.
    NextTarget(Option<Response>),
    /// 3xx: these URIs go to the front of the target set.
    Redirected(Vec<Uri>, Option<Response>),
    /// 401/407 answered with fresh credentials: resubmit to the same
    /// target.
    AuthRetry(Request),
}

pub(crate) async fn run(ua: Arc<UserAgentInner>, mut job: RequestJob) {
    let id = job.id;
    let sender = job.sender.clone();
    let result = drive(&ua, &mut job).await;
    ua.detach_request(id);
    if let Ok(resp) = &result {
        if job.request.method == Method::Bye
            && resp.status_code.kind() == StatusCodeKind::Successful
        {
            ua.close_dialog(&job.request);
        }
    }
    sender.send(UacEvent::Completed(id, result)).ok();
}

/// Walk the target set: resolved endpoints inside, target URIs outside,
/// with redirects prepending and the digest retry re-queueing its target.
async fn drive(ua: &Arc<UserAgentInner>, job: &mut RequestJob) -> Result<Response> {
    let mut targets: VecDeque<Uri> = VecDeque::new();
    // A preloaded Route set takes precedence over the Request-URI as the
    // next hop (RFC 3261 section 8.1.2).
    match job.request.headers.routes().first() {
        Some(route) => targets.push_back(route.uri.clone()),
        None => targets.push_back(job.request.uri.clone()),
    }

    let mut last_final: Option<Response> = None;
    let mut auth_attempted = false;
    let mut attempted = false;

    'targets: while let Some(target) = targets.pop_front() {
        if job.pending.cancelled.load(Ordering::SeqCst) {
            break;
        }
        let target_addr = match SipAddr::try_from(&target) {
            Ok(addr) => addr,
            Err(e) => {
                debug!("skipping unusable target {}: {}", target, e);
                continue;
            }
        };
        let candidates = match ua
            .endpoint
            .transport_layer
            .resolver()
            .resolve(&target_addr.addr, target_addr.transport())
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                debug!("resolution of {} failed: {}", target, e);
                continue;
            }
        };

        for candidate in candidates {
            if job.pending.cancelled.load(Ordering::SeqCst) {
                break 'targets;
            }
            attempted = true;
            let request = prepare_attempt(&job.request, &target);
            job.pending.begin_attempt(&request);

            let key = client_key(&request)?;
            let mut tx = Transaction::new_client(key, request, ua.endpoint.clone(), None);
            tx.destination = Some(SipAddr {
                r#type: target_addr.r#type,
                addr: candidate.into(),
            });
            if let Err(e) = tx.send().await {
                warn!("sending to {} failed: {}", candidate, e);
                continue;
            }

            match attempt(ua, job, &mut tx, &mut auth_attempted).await? {
                AttemptOutcome::Delivered(resp) => return Ok(resp),
                AttemptOutcome::NextCandidate(resp) => {
                    last_final = resp.or(last_final);
                }
                AttemptOutcome::NextTarget(resp) => {
                    last_final = resp.or(last_final);
                    continue 'targets;
                }
                AttemptOutcome::Redirected(uris, resp) => {
                    info!("redirected to {} target(s)", uris.len());
                    last_final = resp.or(last_final);
                    for uri in uris.into_iter().rev() {
                        targets.push_front(uri);
                    }
                    continue 'targets;
                }
                AttemptOutcome::AuthRetry(request) => {
                    job.request = request;
                    targets.push_front(target.clone());
                    continue 'targets;
                }
            }
        }
    }

    if !attempted {
        return Err(Error::NoDestinations);
    }
    last_final.ok_or(Error::NoDestinations)
}

/// Drive one client transaction to its conclusion.
async fn attempt(
    ua: &Arc<UserAgentInner>,
    job: &mut RequestJob,
    tx: &mut Transaction,
    auth_attempted: &mut bool,
) -> Result<AttemptOutcome> {
    while let Some(msg) = tx.receive().await {
        let SipMessage::Response(resp) = msg else {
            continue;
        };
        match resp.status_code.kind() {
            StatusCodeKind::Provisional => {
                // A deferred CANCEL goes out at the first provisional
                // (RFC 3261 section 9.1).
                job.pending.provisional_seen.store(true, Ordering::SeqCst);
                if job.pending.cancelled.load(Ordering::SeqCst)
                    && !job.pending.cancel_sent.swap(true, Ordering::SeqCst)
                {
                    send_cancel(ua.endpoint.clone(), &tx.original).await.ok();
                }
                ua.note_dialog(&tx.original, &resp);
                job.sender
                    .send(UacEvent::Provisional(job.id, resp))
                    .ok();
            }
            StatusCodeKind::Successful => {
                ua.note_dialog(&tx.original, &resp);
                if tx.original.method == Method::Invite {
                    if let Err(e) = acknowledge_success(ua, &tx.original, &resp).await {
                        warn!("failed to ACK 2xx: {}", e);
                    }
                }
                return Ok(AttemptOutcome::Delivered(resp));
            }
            StatusCodeKind::Redirection => {
                let uris = redirect_targets(&resp);
                if uris.is_empty() {
                    return Ok(AttemptOutcome::NextTarget(Some(resp)));
                }
                return Ok(AttemptOutcome::Redirected(uris, Some(resp)));
            }
            _ => {
                return Ok(disposition_of_failure(job, tx, resp, auth_attempted));
            }
        }
    }
    // Terminated without a final response.
    Ok(AttemptOutcome::NextCandidate(None))
}

fn disposition_of_failure(
    job: &mut RequestJob,
    tx: &Transaction,
    resp: Response,
    auth_attempted: &mut bool,
) -> AttemptOutcome {
    match resp.status_code {
        StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired => {
            let Some(cred) = job.credential.clone() else {
                return AttemptOutcome::NextTarget(Some(resp));
            };
            if *auth_attempted {
                // A second challenge means the credentials are wrong;
                // looping would never converge.
                return AttemptOutcome::Delivered(resp);
            }
            *auth_attempted = true;
            let new_seq = match tx.original.headers.cseq_header() {
                Ok(cseq) => cseq.seq + 1,
                Err(_) => return AttemptOutcome::NextTarget(Some(resp)),
            };
            match handle_client_authenticate(new_seq, &tx.original, &resp, &cred) {
                Ok(request) => AttemptOutcome::AuthRetry(request),
                Err(e) => {
                    warn!("cannot answer challenge: {}", e);
                    AttemptOutcome::NextTarget(Some(resp))
                }
            }
        }
        StatusCode::RequestTimeout | StatusCode::ServiceUnavailable => {
            AttemptOutcome::NextCandidate(Some(resp))
        }
        StatusCode::RequestTerminated if job.pending.cancelled.load(Ordering::SeqCst) => {
            // The answer to our own CANCEL.
            AttemptOutcome::Delivered(resp)
        }
        _ => AttemptOutcome::NextTarget(Some(resp)),
    }
}

/// Fresh branch and the current target as Request-URI; everything else is
/// carried over.
fn prepare_attempt(request: &Request, target: &Uri) -> Request {
    let mut request = request.clone();
    if request.headers.routes().first().map(|r| &r.uri) != Some(target) {
        request.uri = target.clone();
    }
    if let Ok(via) = request.headers.via_header_mut() {
        let mut has_branch = false;
        for param in via.params.iter_mut() {
            if let Param::Branch(branch) = param {
                *branch = make_branch();
                has_branch = true;
            }
        }
        if !has_branch {
            via.params.push(Param::Branch(make_branch()));
        }
    }
    request
}

/// Contact URIs of a 3xx ordered by q-value descending; the sort is stable
/// so equal q keeps the response order.
fn redirect_targets(resp: &Response) -> Vec<Uri> {
    let mut contacts: Vec<&NameAddr> = resp.headers.contacts();
    contacts.sort_by(|a, b| {
        let qa = a.q().unwrap_or(1.0);
        let qb = b.q().unwrap_or(1.0);
        qb.partial_cmp(&qa).unwrap_or(std::cmp::Ordering::Equal)
    });
    contacts.into_iter().map(|c| c.uri.clone()).collect()
}

/// Build the CANCEL for an in-flight request per RFC 3261 section 9.1: the
/// same Request-URI, Call-ID, From, To, Route set and - crucially - the
/// same topmost Via branch, with CSeq carrying the original number and the
/// CANCEL method.
pub(crate) fn make_cancel(original: &Request) -> Result<Request> {
    let via = original.headers.via_header()?.clone();
    let seq = original.headers.cseq_header()?.seq;

    let mut headers = vec![
        Header::Via(via),
        Header::CallId(original.headers.call_id_header()?.to_string()),
        Header::From(original.headers.from_header()?.clone()),
        Header::To(original.headers.to_header()?.clone()),
        Header::CSeq(CSeq {
            seq,
            method: Method::Cancel,
        }),
        Header::MaxForwards(70),
    ];
    for route in original.headers.routes() {
        headers.push(Header::Route(route.clone()));
    }
    headers.push(Header::ContentLength(0));

    Ok(Request {
        method: Method::Cancel,
        uri: original.uri.clone(),
        version: original.version,
        headers: headers.into(),
        body: vec![],
    })
}

/// ACK a 2xx INVITE answer per RFC 3261 section 13.2.2.4: unlike the
/// non-2xx ACK the transaction layer emits, this one is a new transaction
/// with a fresh branch, aimed at the Contact with the captured route set.
async fn acknowledge_success(
    ua: &Arc<UserAgentInner>,
    original: &Request,
    resp: &Response,
) -> Result<()> {
    let target = resp
        .headers
        .contact_header()
        .map(|c| c.uri.clone())
        .unwrap_or_else(|| original.uri.clone());
    let via = ua.endpoint.get_via(None, None)?;

    let mut headers = vec![
        Header::Via(via),
        Header::CallId(original.headers.call_id_header()?.to_string()),
        Header::From(original.headers.from_header()?.clone()),
        Header::To(resp.headers.to_header()?.clone()),
        Header::CSeq(CSeq {
            seq: original.headers.cseq_header()?.seq,
            method: Method::Ack,
        }),
        Header::MaxForwards(70),
    ];
    let mut routes: Vec<NameAddr> = resp.headers.record_routes().into_iter().cloned().collect();
    routes.reverse();
    for route in routes {
        headers.push(Header::Route(route));
    }
    headers.push(Header::ContentLength(0));

    let ack = Request {
        method: Method::Ack,
        uri: target.clone(),
        version: original.version,
        headers: headers.into(),
        body: vec![],
    };

    let addr = SipAddr::try_from(&target)?;
    let msg = SipMessage::Request(ack);
    let len = msg.to_bytes().len();
    let (connection, destination) = ua.endpoint.transport_layer.lookup(&addr, len).await?;
    connection.send(msg, Some(&destination)).await
}

/// Send a CANCEL as its own non-INVITE client transaction and let it run
/// out in the background.
pub(crate) async fn send_cancel(endpoint: EndpointInnerRef, original: &Request) -> Result<()> {
    let cancel = make_cancel(original)?;
    let key = TransactionKey::from_request(&cancel, TransactionRole::Client)?;
    let mut tx = Transaction::new_client(key, cancel, endpoint, None);
    tx.send().await?;
    tokio::spawn(async move { while tx.receive().await.is_some() {} });
    Ok(())
}
