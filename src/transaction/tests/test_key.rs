use crate::message::{CSeq, Header, Method, Request, Response, StatusCode, Version};
use crate::transaction::key::{TransactionKey, TransactionRole};

fn request(method: Method, branch: &str) -> Request {
    Request {
        method: method.clone(),
        uri: "sip:bob@biloxi.com".parse().unwrap(),
        version: Version::V2,
        headers: vec![
            Header::Via(
                format!("SIP/2.0/UDP pc33.atlanta.com:5060;branch={}", branch)
                    .parse()
                    .unwrap(),
            ),
            Header::CallId("key-test".to_string()),
            Header::From("<sip:alice@atlanta.com>;tag=88sja8x".parse().unwrap()),
            Header::To("<sip:bob@biloxi.com>".parse().unwrap()),
            Header::CSeq(CSeq { seq: 1, method }),
        ]
        .into(),
        body: vec![],
    }
}

#[test]
fn test_ack_and_cancel_map_to_invite_server_key() {
    let invite = request(Method::Invite, "z9hG4bKnashds8");
    let ack = request(Method::Ack, "z9hG4bKnashds8");
    let cancel = request(Method::Cancel, "z9hG4bKnashds8");

    let invite_key = TransactionKey::from_request(&invite, TransactionRole::Server).unwrap();
    let ack_key = TransactionKey::from_request(&ack, TransactionRole::Server).unwrap();
    let cancel_key = TransactionKey::from_request(&cancel, TransactionRole::Server).unwrap();

    assert_eq!(invite_key, ack_key);
    assert_eq!(invite_key, cancel_key);
}

#[test]
fn test_cancel_client_transaction_is_distinct() {
    let invite = request(Method::Invite, "z9hG4bKnashds8");
    let cancel = request(Method::Cancel, "z9hG4bKnashds8");

    let invite_key = TransactionKey::from_request(&invite, TransactionRole::Client).unwrap();
    let cancel_key = TransactionKey::from_request(&cancel, TransactionRole::Client).unwrap();
    assert_ne!(invite_key, cancel_key);
    assert_eq!(cancel_key.method, Method::Cancel);
}

#[test]
fn test_response_matches_client_key() {
    let invite = request(Method::Invite, "z9hG4bKnashds8");
    let invite_key = TransactionKey::from_request(&invite, TransactionRole::Client).unwrap();

    let resp = Response {
        status_code: StatusCode::Ringing,
        reason_phrase: None,
        version: Version::V2,
        headers: invite.headers.clone(),
        body: vec![],
    };
    let resp_key = TransactionKey::from_response(&resp).unwrap();
    assert_eq!(invite_key, resp_key);
}

#[test]
fn test_branch_without_magic_cookie_is_rejected() {
    let req = request(Method::Invite, "1234abcd");
    assert!(TransactionKey::from_request(&req, TransactionRole::Server).is_err());
}
