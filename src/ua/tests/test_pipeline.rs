use crate::message::{CSeq, Header, Method, Request, Version};
use crate::transaction::endpoint::EndpointBuilder;
use crate::transaction::transaction::Transaction;
use crate::ua::uas::validate;
use crate::ua::{HandleResult, UaCallback, UserAgent};
use crate::{Error, Result};

struct InviteOnly;

#[async_trait::async_trait]
impl UaCallback for InviteOnly {
    fn allow(&self) -> Vec<Method> {
        vec![Method::Invite, Method::Ack, Method::Cancel, Method::Bye]
    }

    async fn handle_request(&self, _tx: &mut Transaction) -> Result<HandleResult> {
        Ok(HandleResult::NoReply)
    }
}

fn request(method: Method, branch: &str, require: Option<&str>) -> Request {
    let mut headers = vec![
        Header::Via(
            format!("SIP/2.0/UDP client.example.com;branch={}", branch)
                .parse()
                .unwrap(),
        ),
        Header::CallId("pipeline-test".to_string()),
        Header::From("<sip:caller@example.com>;tag=ct".parse().unwrap()),
        Header::To("<sip:callee@example.net>".parse().unwrap()),
        Header::CSeq(CSeq {
            seq: 5,
            method: method.clone(),
        }),
    ];
    if let Some(token) = require {
        headers.push(Header::Require(vec![token.to_string()]));
    }
    Request {
        method,
        uri: "sip:callee@example.net".parse().unwrap(),
        version: Version::V2,
        headers: headers.into(),
        body: vec![],
    }
}

fn test_ua() -> UserAgent {
    let endpoint = EndpointBuilder::new().build();
    UserAgent::new(&endpoint)
}

#[test]
fn test_unlisted_method_is_rejected() {
    let ua = test_ua();
    let req = request(Method::Options, "z9hG4bKp1", None);
    let result = validate(&ua.inner, &InviteOnly, &req);
    assert!(matches!(result, Err(Error::MethodNotAllowed(_))));
}

#[test]
fn test_unsupported_require_lists_the_gap() {
    let ua = test_ua();
    let req = request(Method::Invite, "z9hG4bKp2", Some("foo"));
    match validate(&ua.inner, &InviteOnly, &req) {
        Err(Error::BadExtension(missing)) => assert_eq!(missing, vec!["foo".to_string()]),
        other => panic!("expected BadExtension, got {:?}", other.err()),
    }
}

#[test]
fn test_cancel_and_ack_bypass_extension_checks() {
    let ua = test_ua();
    // CANCEL with an unsupported Require must still pass.
    let cancel = request(Method::Cancel, "z9hG4bKp3", Some("foo"));
    assert!(validate(&ua.inner, &InviteOnly, &cancel).is_ok());

    let ack = request(Method::Ack, "z9hG4bKp4", Some("foo"));
    assert!(validate(&ua.inner, &InviteOnly, &ack).is_ok());
}

#[test]
fn test_merged_request_is_a_loop_retransmission_is_not() {
    let ua = test_ua();
    let first = request(Method::Invite, "z9hG4bKoriginal", None);
    assert!(validate(&ua.inner, &InviteOnly, &first).is_ok());

    // Same branch: a retransmission, not a loop.
    let retransmission = request(Method::Invite, "z9hG4bKoriginal", None);
    assert!(validate(&ua.inner, &InviteOnly, &retransmission).is_ok());

    // Same identifying fields through a different path: a merged request.
    let merged = request(Method::Invite, "z9hG4bKotherpath", None);
    assert!(matches!(
        validate(&ua.inner, &InviteOnly, &merged),
        Err(Error::LoopDetected)
    ));
}
