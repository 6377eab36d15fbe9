use crate::message::parser::parse_datagram;
use crate::message::{Method, SipMessage, StatusCode};
use crate::transport::stream::{SipCodec, SipCodecType};
use crate::Error;
use bytes::BytesMut;
use tokio_util::codec::Decoder;

fn invite_bytes() -> Vec<u8> {
    b"INVITE sip:bob@biloxi.com SIP/2.0\r\n\
Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds\r\n\
Max-Forwards: 70\r\n\
To: Bob <sip:bob@biloxi.com>\r\n\
From: Alice <sip:alice@atlanta.com>;tag=1928301774\r\n\
Call-ID: a84b4c76e66710@pc33.atlanta.com\r\n\
CSeq: 314159 INVITE\r\n\
Contact: <sip:alice@pc33.atlanta.com>\r\n\
Content-Type: application/sdp\r\n\
Content-Length: 4\r\n\
\r\n\
v=0\n"
        .to_vec()
}

#[test]
fn test_datagram_parse_and_format_are_inverse() {
    let bytes = invite_bytes();
    let msg = parse_datagram(&bytes).unwrap();
    let SipMessage::Request(req) = &msg else {
        panic!("expected a request");
    };
    assert_eq!(req.method, Method::Invite);
    assert_eq!(req.headers.cseq_header().unwrap().seq, 314159);
    assert_eq!(req.body, b"v=0\n");

    // Formatting reproduces the wire form byte for byte.
    assert_eq!(msg.to_bytes(), bytes);
}

#[test]
fn test_datagram_discards_bytes_beyond_content_length() {
    let mut bytes = invite_bytes();
    bytes.extend_from_slice(b"garbage after the body");
    let SipMessage::Request(req) = parse_datagram(&bytes).unwrap() else {
        panic!("expected a request");
    };
    assert_eq!(req.body, b"v=0\n");
}

#[test]
fn test_datagram_short_body_is_content_too_small() {
    let bytes = invite_bytes();
    // Cut into the body.
    let err = parse_datagram(&bytes[..bytes.len() - 2]).unwrap_err();
    match err {
        Error::BadRequest(msg) => assert!(msg.contains("content_too_small"), "{}", msg),
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_response_parse() {
    let bytes = b"SIP/2.0 180 Ringing\r\n\
Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds\r\n\
To: Bob <sip:bob@biloxi.com>;tag=a6c85cf\r\n\
From: Alice <sip:alice@atlanta.com>;tag=1928301774\r\n\
Call-ID: a84b4c76e66710@pc33.atlanta.com\r\n\
CSeq: 314159 INVITE\r\n\
Content-Length: 0\r\n\
\r\n";
    let SipMessage::Response(resp) = parse_datagram(bytes).unwrap() else {
        panic!("expected a response");
    };
    assert_eq!(resp.status_code, StatusCode::Ringing);
    assert_eq!(resp.reason(), "Ringing");
    assert_eq!(
        resp.headers.to_header().unwrap().tag(),
        Some("a6c85cf")
    );
}

#[test]
fn test_header_folding_joins_with_single_space() {
    let bytes = b"OPTIONS sip:bob@biloxi.com SIP/2.0\r\n\
Via: SIP/2.0/UDP host;branch=z9hG4bKx\r\n\
To: <sip:bob@biloxi.com>\r\n\
From: <sip:alice@atlanta.com>;tag=x\r\n\
Call-ID: folding-test\r\n\
CSeq: 1 OPTIONS\r\n\
Subject: first part   \r\n\
\tsecond part\r\n\
Content-Length: 0\r\n\
\r\n";
    let SipMessage::Request(req) = parse_datagram(bytes).unwrap() else {
        panic!("expected a request");
    };
    let subject = req
        .headers
        .iter()
        .find_map(|h| match h {
            crate::message::Header::Subject(s) => Some(s.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(subject, "first part second part");
}

#[test]
fn test_stream_codec_byte_at_a_time() {
    let bytes = invite_bytes();
    let mut codec = SipCodec::new();
    let mut buf = BytesMut::new();
    let mut messages = Vec::new();
    for b in &bytes {
        buf.extend_from_slice(&[*b]);
        while let Some(item) = codec.decode(&mut buf).unwrap() {
            messages.push(item);
        }
    }
    assert_eq!(messages.len(), 1);
    let SipCodecType::Message(SipMessage::Request(req)) = &messages[0] else {
        panic!("expected a request");
    };
    assert_eq!(req.method, Method::Invite);
    assert!(buf.is_empty());

    // The codec is back in its idle state: a second message decodes too.
    buf.extend_from_slice(&bytes);
    let item = codec.decode(&mut buf).unwrap();
    assert!(matches!(
        item,
        Some(SipCodecType::Message(SipMessage::Request(_)))
    ));
}

#[test]
fn test_stream_codec_absorbs_leading_crlf() {
    let mut codec = SipCodec::new();
    let mut buf = BytesMut::new();
    for _ in 0..3 {
        buf.extend_from_slice(b"\r\n");
        assert!(matches!(
            codec.decode(&mut buf),
            Ok(None) | Ok(Some(SipCodecType::KeepaliveRequest))
        ));
        assert!(buf.is_empty());
    }
    buf.extend_from_slice(&invite_bytes());
    let item = codec.decode(&mut buf).unwrap();
    assert!(matches!(
        item,
        Some(SipCodecType::Message(SipMessage::Request(_)))
    ));
}

#[test]
fn test_stream_codec_requires_content_length() {
    let bytes = b"OPTIONS sip:bob@biloxi.com SIP/2.0\r\n\
Via: SIP/2.0/UDP host;branch=z9hG4bKx\r\n\
To: <sip:bob@biloxi.com>\r\n\
From: <sip:alice@atlanta.com>;tag=x\r\n\
Call-ID: stream-no-cl\r\n\
CSeq: 1 OPTIONS\r\n\
\r\n";
    let mut codec = SipCodec::new();
    let mut buf = BytesMut::from(&bytes[..]);
    let err = codec.decode(&mut buf).unwrap_err();
    match err {
        Error::BadRequest(msg) => assert!(msg.contains("no_content_length"), "{}", msg),
        other => panic!("unexpected error: {}", other),
    }
}
