use crate::message::{
    parser::parse_datagram, Header, Method, NameAddr, SipMessage, StatusCode, Uri,
};
use crate::transaction::endpoint::{Endpoint, EndpointBuilder, EndpointOption};
use crate::transaction::key::{TransactionKey, TransactionRole};
use crate::transaction::transaction::Transaction;
use crate::transaction::make_tag;
use crate::transport::TransportLayer;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

async fn serve_endpoint(t1: Duration) -> Arc<Endpoint> {
    let token = CancellationToken::new();
    let transport_layer = TransportLayer::new(token.child_token());
    transport_layer
        .add_udp_listener("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let endpoint = Arc::new(
        EndpointBuilder::new()
            .with_user_agent("sipua-test")
            .with_cancel_token(token)
            .with_transport_layer(transport_layer)
            .with_option(EndpointOption::default().with_t1(t1))
            .build(),
    );
    let serve = endpoint.clone();
    tokio::spawn(async move { serve.serve().await });
    // Let the transport loops attach before traffic flows.
    tokio::time::sleep(Duration::from_millis(20)).await;
    endpoint
}

fn make_invite(endpoint: &Endpoint, callee: Uri) -> Transaction {
    let via = endpoint.inner.get_via(None, None).unwrap();
    let from = NameAddr::new("sip:alice@atlanta.com".parse().unwrap()).with_tag(make_tag());
    let to = NameAddr::new(callee.clone());
    let request = endpoint
        .inner
        .make_request(Method::Invite, callee, via, from, to, 1);
    let key = TransactionKey::from_request(&request, TransactionRole::Client).unwrap();
    Transaction::new_client(key, request, endpoint.inner.clone(), None)
}

async fn recv_with_timeout(socket: &UdpSocket) -> Option<(Vec<u8>, std::net::SocketAddr)> {
    let mut buf = vec![0u8; 65535];
    match tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf)).await {
        Ok(Ok((n, src))) => Some((buf[..n].to_vec(), src)),
        _ => None,
    }
}

#[tokio::test]
async fn test_invite_client_retransmits_and_acks_non_2xx() {
    let endpoint = serve_endpoint(Duration::from_millis(40)).await;
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let callee: Uri = format!("sip:bob@{}", peer.local_addr().unwrap())
        .parse()
        .unwrap();

    let mut tx = make_invite(&endpoint, callee);
    tx.send().await.unwrap();

    // The original send plus a Timer A retransmission, byte-identical.
    let (first, src) = recv_with_timeout(&peer).await.expect("initial INVITE");
    let (second, _) = recv_with_timeout(&peer).await.expect("retransmission");
    assert_eq!(first, second);

    // Answer with a 500; the transaction must deliver it and ACK on its
    // own.
    let SipMessage::Request(invite) = parse_datagram(&first).unwrap() else {
        panic!("expected INVITE");
    };
    let mut resp =
        endpoint
            .inner
            .make_response(&invite, StatusCode::ServerInternalError, None);
    resp.headers.to_header_mut().unwrap().set_tag("peer-tag".to_string());
    resp.headers.unique_push(Header::ContentLength(0));
    peer.send_to(&SipMessage::Response(resp).to_bytes(), src)
        .await
        .unwrap();

    let msg = tx.receive().await.expect("final response");
    let SipMessage::Response(final_resp) = msg else {
        panic!("expected a response");
    };
    assert_eq!(final_resp.status_code, StatusCode::ServerInternalError);

    // Drain datagrams until the ACK shows up (late INVITE retransmissions
    // may still be in flight).
    let invite_via = String::from_utf8(first.clone())
        .unwrap()
        .lines()
        .find(|l| l.starts_with("Via:"))
        .unwrap()
        .to_string();
    loop {
        let (data, _) = recv_with_timeout(&peer).await.expect("ACK");
        let text = String::from_utf8(data).unwrap();
        if text.starts_with("ACK ") {
            let ack_via = text
                .lines()
                .find(|l| l.starts_with("Via:"))
                .unwrap()
                .to_string();
            // RFC 3261 section 17.1.1.3: the ACK Via is the INVITE's
            // topmost Via, byte for byte.
            assert_eq!(ack_via, invite_via);
            break;
        }
    }
}

#[tokio::test]
async fn test_invite_client_times_out_with_408() {
    let endpoint = serve_endpoint(Duration::from_millis(10)).await;
    // A peer that never answers.
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let callee: Uri = format!("sip:bob@{}", peer.local_addr().unwrap())
        .parse()
        .unwrap();

    let mut tx = make_invite(&endpoint, callee);
    tx.send().await.unwrap();

    // Timer B fires at 64*T1 = 640ms.
    let msg = tokio::time::timeout(Duration::from_secs(3), tx.receive())
        .await
        .expect("timeout must be reported")
        .expect("a synthesized final");
    let SipMessage::Response(resp) = msg else {
        panic!("expected a response");
    };
    assert_eq!(resp.status_code, StatusCode::RequestTimeout);

    // And the transaction winds down.
    let end = tokio::time::timeout(Duration::from_secs(1), tx.receive())
        .await
        .expect("terminate must follow");
    assert!(end.is_none());
}

#[tokio::test]
async fn test_non_invite_server_reemits_final_without_tu() {
    let endpoint = serve_endpoint(Duration::from_millis(50)).await;
    let mut incoming = endpoint.incoming_transactions();

    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = endpoint
        .inner
        .transport_layer
        .first_listen_addr(None)
        .unwrap();
    let target_addr = target.get_socketaddr().unwrap();

    let options = b"OPTIONS sip:uas@example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:5099;branch=z9hG4bKretrans1\r\n\
Max-Forwards: 70\r\n\
To: <sip:uas@example.com>\r\n\
From: <sip:peer@example.com>;tag=ptag\r\n\
Call-ID: reemit-test\r\n\
CSeq: 7 OPTIONS\r\n\
Content-Length: 0\r\n\
\r\n";
    peer.send_to(options, target_addr).await.unwrap();

    let mut tx = tokio::time::timeout(Duration::from_secs(2), incoming.recv())
        .await
        .expect("server transaction")
        .expect("server transaction");
    tx.reply(StatusCode::OK).await.unwrap();

    let (first, _) = recv_with_timeout(&peer).await.expect("200 OK");
    assert!(first.starts_with(b"SIP/2.0 200"));

    // Keep the transaction alive, absorbing whatever else arrives.
    let absorb = tokio::spawn(async move { while tx.receive().await.is_some() {} });

    // A retransmitted request re-emits the stored final response without
    // reaching the TU again.
    peer.send_to(options, target_addr).await.unwrap();
    let (second, _) = recv_with_timeout(&peer).await.expect("re-emitted 200");
    assert_eq!(first, second);

    absorb.abort();
}
