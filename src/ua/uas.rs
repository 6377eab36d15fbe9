use super::{HandleResult, UaCallback, UserAgentInner};
use crate::message::{
    Header, Method, Request, Response, SipMessage, StatusCode, StatusCodeKind,
};
use crate::transaction::{make_tag, transaction::Transaction};
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// Serve one inbound server transaction: run the RFC 3261 section 8.2
/// validation pipeline, dispatch to the application callback, then stay on
/// the transaction until it terminates so retransmissions and CANCEL are
/// handled.
pub(crate) async fn process(ua: Arc<UserAgentInner>, mut tx: Transaction) {
    let request = tx.original.clone();
    let Some(callback) = ua.pick_callback(&request) else {
        debug!("no callback claims {}, rejecting", request.method);
        tx.reply(StatusCode::NotImplemented).await.ok();
        return;
    };

    // The ACK for a 2xx arrives as its own server transaction; it never
    // gets a response, the callback only learns about it.
    if request.method == Method::Ack {
        callback.handle_request(&mut tx).await.ok();
        return;
    }

    if let Err(rejection) = validate(&ua, callback.as_ref(), &request) {
        respond_rejection(&mut tx, callback.as_ref(), rejection).await;
        return;
    }

    match callback.handle_request(&mut tx).await {
        Ok(HandleResult::Reply(mut response)) => {
            finalize_response(callback.as_ref(), &request, &mut response);
            if let Err(e) = tx.respond(response).await {
                warn!("failed to respond: {}", e);
            }
        }
        Ok(HandleResult::NoReply) => {}
        Err(e) => {
            warn!("handler failed for {}: {}", request.method, e);
            tx.reply(StatusCode::ServerInternalError).await.ok();
        }
    }

    // Absorb retransmissions and react to CANCEL until the FSM winds down.
    while let Some(msg) = tx.receive().await {
        if let SipMessage::Request(req) = msg {
            if req.method == Method::Cancel && !tx.is_terminated() {
                // The transaction already answered the CANCEL itself; the
                // original request dies with 487.
                tx.reply(StatusCode::RequestTerminated).await.ok();
            }
        }
    }
}

/// The ordered validation pipeline of RFC 3261 sections 8.2.1-8.2.2.3. The
/// first failing step decides the response; later steps never run.
pub(crate) fn validate(
    ua: &Arc<UserAgentInner>,
    callback: &dyn UaCallback,
    request: &Request,
) -> Result<()> {
    let method = &request.method;
    let skip_extension_checks = matches!(method, Method::Cancel | Method::Ack);

    if !skip_extension_checks && !callback.allow().contains(method) {
        return Err(Error::MethodNotAllowed(method.to_string()));
    }

    if callback.detect_loops() && ua.check_loop(request)? {
        return Err(Error::LoopDetected);
    }

    if !skip_extension_checks {
        let supported = callback.supported();
        let missing: Vec<String> = request
            .headers
            .require_tokens()
            .into_iter()
            .filter(|token| !supported.iter().any(|s| s.eq_ignore_ascii_case(token)))
            .collect();
        if !missing.is_empty() {
            return Err(Error::BadExtension(missing));
        }
    }
    Ok(())
}

async fn respond_rejection(tx: &mut Transaction, callback: &dyn UaCallback, rejection: Error) {
    let result = match rejection {
        Error::MethodNotAllowed(method) => {
            debug!("rejecting {} with 405", method);
            tx.reply_with(
                StatusCode::MethodNotAllowed,
                vec![Header::Allow(callback.allow())],
                None,
            )
            .await
        }
        Error::LoopDetected => {
            debug!("merged request detected, rejecting with 482");
            tx.reply(StatusCode::LoopDetected).await
        }
        Error::BadExtension(missing) => {
            debug!("unsupported extensions {:?}, rejecting with 420", missing);
            tx.reply_with(
                StatusCode::BadExtension,
                vec![Header::Unsupported(missing)],
                None,
            )
            .await
        }
        other => {
            warn!("validation failed: {}", other);
            tx.reply(StatusCode::ServerInternalError).await
        }
    };
    if let Err(e) = result {
        warn!("failed to send rejection: {}", e);
    }
}

/// Stamp the automatic response headers the application did not set
/// itself: Server, Allow, Supported, the To-tag on non-provisional
/// answers, and Record-Route echoed on a dialog-establishing 2xx.
fn finalize_response(callback: &dyn UaCallback, request: &Request, response: &mut Response) {
    if !response.headers.has("server") {
        response
            .headers
            .push(Header::Server(callback.server()));
    }
    if !response.headers.has("allow") {
        response.headers.push(Header::Allow(callback.allow()));
    }
    let supported = callback.supported();
    if !supported.is_empty() && !response.headers.has("supported") {
        response.headers.push(Header::Supported(supported));
    }

    if response.status_code.kind() != StatusCodeKind::Provisional {
        if let Ok(to) = response.headers.to_header_mut() {
            if to.tag().is_none() {
                to.set_tag(make_tag());
            }
        }
    }

    if request.method == Method::Invite
        && response.status_code.kind() == StatusCodeKind::Successful
        && response.headers.record_routes().is_empty()
    {
        for route in request.headers.record_routes() {
            response.headers.push(Header::RecordRoute(route.clone()));
        }
    }
}
