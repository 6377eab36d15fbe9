use crate::dialog::{Dialog, DialogId, DialogState};
use crate::message::{
    CSeq, Header, Method, Request, Response, StatusCode, Version, Via,
};

fn invite() -> Request {
    Request {
        method: Method::Invite,
        uri: "sip:bob@biloxi.com".parse().unwrap(),
        version: Version::V2,
        headers: vec![
            Header::Via(
                "SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bKdialog"
                    .parse()
                    .unwrap(),
            ),
            Header::CallId("dialog-test".to_string()),
            Header::From("<sip:alice@atlanta.com>;tag=alice-tag".parse().unwrap()),
            Header::To("<sip:bob@biloxi.com>".parse().unwrap()),
            Header::CSeq(CSeq {
                seq: 41,
                method: Method::Invite,
            }),
            Header::Contact("<sip:alice@pc33.atlanta.com>".parse().unwrap()),
        ]
        .into(),
        body: vec![],
    }
}

fn ok_response(req: &Request) -> Response {
    Response {
        status_code: StatusCode::OK,
        reason_phrase: None,
        version: Version::V2,
        headers: vec![
            Header::Via(req.headers.via_header().unwrap().clone()),
            Header::CallId("dialog-test".to_string()),
            Header::From(req.headers.from_header().unwrap().clone()),
            Header::To("<sip:bob@biloxi.com>;tag=bob-tag".parse().unwrap()),
            Header::CSeq(req.headers.cseq_header().unwrap().clone()),
            Header::RecordRoute("<sip:p1.example.com;lr>".parse().unwrap()),
            Header::RecordRoute("<sip:p2.example.com;lr>".parse().unwrap()),
            Header::Contact("<sip:bob@192.0.2.4>".parse().unwrap()),
        ]
        .into(),
        body: vec![],
    }
}

#[test]
fn test_client_dialog_from_2xx() {
    let req = invite();
    let dialog = Dialog::from_client_response(&req, &ok_response(&req)).unwrap();

    assert_eq!(dialog.id.call_id, "dialog-test");
    assert_eq!(dialog.id.from_tag, "alice-tag");
    assert_eq!(dialog.id.to_tag, "bob-tag");
    assert_eq!(dialog.state, DialogState::Confirmed);
    assert_eq!(dialog.local_seq, 41);
    assert_eq!(dialog.remote_seq, 0);
    assert_eq!(dialog.remote_target, "sip:bob@192.0.2.4".parse().unwrap());

    // Record-Route is captured in reverse order on the client side.
    let hosts: Vec<String> = dialog
        .route_set
        .iter()
        .map(|r| r.uri.host_with_port.to_string())
        .collect();
    assert_eq!(hosts, vec!["p2.example.com", "p1.example.com"]);
}

#[test]
fn test_early_dialog_confirms() {
    let req = invite();
    let mut ringing = ok_response(&req);
    ringing.status_code = StatusCode::Ringing;
    let mut dialog = Dialog::from_client_response(&req, &ringing).unwrap();
    assert_eq!(dialog.state, DialogState::Early);
    assert!(!dialog.is_confirmed());

    dialog.confirm();
    assert!(dialog.is_confirmed());
}

#[test]
fn test_response_without_to_tag_establishes_nothing() {
    let req = invite();
    let mut resp = ok_response(&req);
    resp.headers
        .unique_push(Header::To("<sip:bob@biloxi.com>".parse().unwrap()));
    assert!(Dialog::from_client_response(&req, &resp).is_err());
}

#[test]
fn test_in_dialog_request_uses_route_set_and_cseq() {
    let req = invite();
    let mut dialog = Dialog::from_client_response(&req, &ok_response(&req)).unwrap();

    let via: Via = "SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bKbye"
        .parse()
        .unwrap();
    let bye = dialog.make_request(Method::Bye, via);

    assert_eq!(bye.method, Method::Bye);
    assert_eq!(bye.uri, dialog.remote_target);
    assert_eq!(bye.headers.cseq_header().unwrap().seq, 42);
    assert_eq!(
        bye.headers.from_header().unwrap().tag(),
        Some("alice-tag")
    );
    assert_eq!(bye.headers.to_header().unwrap().tag(), Some("bob-tag"));

    let route_hosts: Vec<String> = bye
        .headers
        .routes()
        .iter()
        .map(|r| r.uri.host_with_port.to_string())
        .collect();
    assert_eq!(route_hosts, vec!["p2.example.com", "p1.example.com"]);

    // CSeq keeps climbing.
    let second = dialog.make_request(
        Method::Info,
        "SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bKinfo"
            .parse()
            .unwrap(),
    );
    assert_eq!(second.headers.cseq_header().unwrap().seq, 43);
}

#[test]
fn test_remote_cseq_must_be_monotonic() {
    let req = invite();
    let mut dialog = Dialog::from_client_response(&req, &ok_response(&req)).unwrap();

    assert!(dialog.validate_remote_seq(10));
    assert!(!dialog.validate_remote_seq(10));
    assert!(!dialog.validate_remote_seq(9));
    assert!(dialog.validate_remote_seq(11));
}

#[test]
fn test_dialog_id_from_messages() {
    let req = invite();
    let id = DialogId::try_from(&req).unwrap();
    assert_eq!(id.call_id, "dialog-test");
    assert_eq!(id.from_tag, "alice-tag");
    assert_eq!(id.to_tag, "");

    let id = DialogId::try_from(&ok_response(&req)).unwrap();
    assert_eq!(id.to_tag, "bob-tag");
    assert_eq!(id.to_string(), "dialog-test-alice-tag-bob-tag");
}
