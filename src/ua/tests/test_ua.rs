use crate::dialog::authenticate::Credential;
use crate::dialog::registration::Registration;
use crate::dialog::DialogId;
use crate::message::{
    Header, HostWithPort, Method, NameAddr, Param, Response, StatusCode, Transport, Uri,
};
use crate::transaction::endpoint::{Endpoint, EndpointBuilder};
use crate::transaction::transaction::Transaction;
use crate::transport::resolver::DnsResolver;
use crate::transport::TransportLayer;
use crate::ua::{HandleResult, UaCallback, UacEvent, UserAgent};
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio_util::sync::CancellationToken;

async fn serve_endpoint() -> Arc<Endpoint> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
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
            .build(),
    );
    endpoint
}

fn spawn_all(endpoint: &Arc<Endpoint>, ua: UserAgent) -> Arc<UserAgent> {
    let ua = Arc::new(ua);
    let e = endpoint.clone();
    tokio::spawn(async move { e.serve().await });
    let u = ua.clone();
    tokio::spawn(async move { u.serve().await });
    ua
}

fn listen_addr(endpoint: &Endpoint) -> HostWithPort {
    endpoint
        .inner
        .transport_layer
        .first_listen_addr(None)
        .unwrap()
        .addr
}

fn contact_for(endpoint: &Endpoint, user: &str) -> Uri {
    format!("sip:{}@{}", user, listen_addr(endpoint))
        .parse()
        .unwrap()
}

async fn next_event(rx: &mut UnboundedReceiver<UacEvent>) -> UacEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event expected")
        .expect("sender alive")
}

async fn final_response(rx: &mut UnboundedReceiver<UacEvent>) -> Result<Response> {
    loop {
        match next_event(rx).await {
            UacEvent::Provisional(..) => continue,
            UacEvent::Completed(_, result) => return result,
        }
    }
}

/// Records every dispatched request and answers INVITE with 180 then 200.
struct AnsweringMachine {
    seen: Mutex<Vec<String>>,
}

impl AnsweringMachine {
    fn new() -> Arc<Self> {
        Arc::new(AnsweringMachine {
            seen: Mutex::new(Vec::new()),
        })
    }

    fn record(&self, tx: &Transaction) {
        self.seen
            .lock()
            .unwrap()
            .push(tx.original.method.to_string());
    }
}

#[async_trait::async_trait]
impl UaCallback for AnsweringMachine {
    async fn handle_request(&self, tx: &mut Transaction) -> Result<HandleResult> {
        self.record(tx);
        match tx.original.method {
            Method::Invite => {
                tx.reply(StatusCode::Ringing).await?;
                tokio::time::sleep(Duration::from_millis(30)).await;
                let mut resp = tx.endpoint_inner.make_response(
                    &tx.original,
                    StatusCode::OK,
                    None,
                );
                let contact = format!(
                    "sip:bob@{}",
                    tx.endpoint_inner
                        .transport_layer
                        .first_listen_addr(None)
                        .unwrap()
                        .addr
                );
                resp.headers
                    .unique_push(Header::Contact(NameAddr::new(contact.parse()?)));
                resp.headers.unique_push(Header::ContentLength(0));
                Ok(HandleResult::Reply(resp))
            }
            Method::Ack => Ok(HandleResult::NoReply),
            _ => {
                let resp =
                    tx.endpoint_inner
                        .make_response(&tx.original, StatusCode::OK, None);
                Ok(HandleResult::Reply(resp))
            }
        }
    }
}

#[tokio::test]
async fn test_happy_invite_establishes_dialog_and_acks() {
    let bob_endpoint = serve_endpoint().await;
    let bob_cb = AnsweringMachine::new();
    let bob = UserAgent::new(&bob_endpoint);
    bob.attach_callback(bob_cb.clone());
    let _bob = spawn_all(&bob_endpoint, bob);

    let alice_endpoint = serve_endpoint().await;
    let alice = UserAgent::new(&alice_endpoint)
        .with_local_uri("sip:alice@atlanta.com".parse().unwrap())
        .with_contact(contact_for(&alice_endpoint, "alice"));
    let alice = spawn_all(&alice_endpoint, alice);
    tokio::time::sleep(Duration::from_millis(30)).await;

    let callee: Uri = format!("sip:bob@{}", listen_addr(&bob_endpoint))
        .parse()
        .unwrap();
    let request = alice.create_request(Method::Invite, callee).unwrap();
    let call_id = request.headers.call_id_header().unwrap().to_string();
    let from_tag = request
        .headers
        .from_header()
        .unwrap()
        .tag()
        .unwrap()
        .to_string();

    let (ev_tx, mut ev_rx) = unbounded_channel();
    alice.send_request(request, ev_tx).await.unwrap();

    let UacEvent::Provisional(_, ringing) = next_event(&mut ev_rx).await else {
        panic!("expected 180 before the final");
    };
    assert_eq!(ringing.status_code, StatusCode::Ringing);

    let UacEvent::Completed(_, result) = next_event(&mut ev_rx).await else {
        panic!("expected completion");
    };
    let ok = result.unwrap();
    assert_eq!(ok.status_code, StatusCode::OK);
    let to_tag = ok.headers.to_header().unwrap().tag().unwrap().to_string();
    assert!(!to_tag.is_empty());

    // The dialog is confirmed with the 200's Contact as remote target.
    let dialog = alice
        .find_dialog(&DialogId {
            call_id,
            from_tag,
            to_tag,
        })
        .expect("dialog must exist");
    assert!(dialog.is_confirmed());
    assert_eq!(
        dialog.remote_target,
        ok.headers.contact_header().unwrap().uri
    );

    // Bob eventually sees the ACK the UAC emitted for the 2xx.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let seen = bob_cb.seen.lock().unwrap().clone();
    assert!(seen.contains(&"ACK".to_string()), "seen: {:?}", seen);
}

#[tokio::test]
async fn test_uas_response_carries_server_not_user_agent() {
    let bob_endpoint = serve_endpoint().await;
    let bob = UserAgent::new(&bob_endpoint);
    bob.attach_callback(AnsweringMachine::new());
    let _bob = spawn_all(&bob_endpoint, bob);

    let alice_endpoint = serve_endpoint().await;
    let alice = UserAgent::new(&alice_endpoint)
        .with_local_uri("sip:alice@atlanta.com".parse().unwrap());
    let alice = spawn_all(&alice_endpoint, alice);
    tokio::time::sleep(Duration::from_millis(30)).await;

    let target: Uri = format!("sip:bob@{}", listen_addr(&bob_endpoint))
        .parse()
        .unwrap();
    let request = alice.create_request(Method::Options, target).unwrap();
    let (ev_tx, mut ev_rx) = unbounded_channel();
    alice.send_request(request, ev_tx).await.unwrap();

    let resp = final_response(&mut ev_rx).await.unwrap();
    assert_eq!(resp.status_code, StatusCode::OK);
    // Responses advertise their software with Server (RFC 3261 section
    // 20.35); User-Agent is request-only and must not leak onto replies.
    assert!(resp.headers.has("server"));
    assert!(!resp.headers.has("user-agent"));
}

/// Only INVITE is allowed; counts handler invocations.
struct PickyCallback {
    invocations: AtomicUsize,
}

#[async_trait::async_trait]
impl UaCallback for PickyCallback {
    fn allow(&self) -> Vec<Method> {
        vec![Method::Invite]
    }

    async fn handle_request(&self, tx: &mut Transaction) -> Result<HandleResult> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let resp = tx
            .endpoint_inner
            .make_response(&tx.original, StatusCode::OK, None);
        Ok(HandleResult::Reply(resp))
    }
}

#[tokio::test]
async fn test_uas_rejects_unlisted_method_with_405() {
    let bob_endpoint = serve_endpoint().await;
    let bob_cb = Arc::new(PickyCallback {
        invocations: AtomicUsize::new(0),
    });
    let bob = UserAgent::new(&bob_endpoint);
    bob.attach_callback(bob_cb.clone());
    let _bob = spawn_all(&bob_endpoint, bob);

    let alice_endpoint = serve_endpoint().await;
    let alice = UserAgent::new(&alice_endpoint)
        .with_local_uri("sip:alice@atlanta.com".parse().unwrap());
    let alice = spawn_all(&alice_endpoint, alice);
    tokio::time::sleep(Duration::from_millis(30)).await;

    let target: Uri = format!("sip:bob@{}", listen_addr(&bob_endpoint))
        .parse()
        .unwrap();
    let request = alice.create_request(Method::Options, target).unwrap();
    let (ev_tx, mut ev_rx) = unbounded_channel();
    alice.send_request(request, ev_tx).await.unwrap();

    let resp = final_response(&mut ev_rx).await.unwrap();
    assert_eq!(resp.status_code, StatusCode::MethodNotAllowed);
    let allow = resp
        .headers
        .iter()
        .find_map(|h| match h {
            Header::Allow(methods) => Some(methods.clone()),
            _ => None,
        })
        .expect("405 must carry Allow");
    assert_eq!(allow, vec![Method::Invite]);
    assert_eq!(bob_cb.invocations.load(Ordering::SeqCst), 0);
    // Pipeline-built rejections follow the same header rules as handler
    // replies.
    assert!(resp.headers.has("server"));
    assert!(!resp.headers.has("user-agent"));
}

#[tokio::test]
async fn test_uas_rejects_unknown_extension_with_420() {
    let bob_endpoint = serve_endpoint().await;
    let bob = UserAgent::new(&bob_endpoint);
    bob.attach_callback(AnsweringMachine::new());
    let _bob = spawn_all(&bob_endpoint, bob);

    let alice_endpoint = serve_endpoint().await;
    let alice = UserAgent::new(&alice_endpoint)
        .with_local_uri("sip:alice@atlanta.com".parse().unwrap());
    let alice = spawn_all(&alice_endpoint, alice);
    tokio::time::sleep(Duration::from_millis(30)).await;

    let target: Uri = format!("sip:bob@{}", listen_addr(&bob_endpoint))
        .parse()
        .unwrap();
    let mut request = alice.create_request(Method::Options, target).unwrap();
    request
        .headers
        .push(Header::Require(vec!["100rel".to_string()]));

    let (ev_tx, mut ev_rx) = unbounded_channel();
    alice.send_request(request, ev_tx).await.unwrap();

    let resp = final_response(&mut ev_rx).await.unwrap();
    assert_eq!(resp.status_code, StatusCode::BadExtension);
    let unsupported = resp
        .headers
        .iter()
        .find_map(|h| match h {
            Header::Unsupported(tokens) => Some(tokens.clone()),
            _ => None,
        })
        .expect("420 must carry Unsupported");
    assert_eq!(unsupported, vec!["100rel".to_string()]);
}

/// Redirects the initial target, then answers per user part: y is busy,
/// x succeeds.
struct RedirectingCallback {
    uri_order: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl UaCallback for RedirectingCallback {
    async fn handle_request(&self, tx: &mut Transaction) -> Result<HandleResult> {
        let user = tx
            .original
            .uri
            .auth
            .as_ref()
            .map(|a| a.user.clone())
            .unwrap_or_default();
        if tx.original.method == Method::Ack {
            return Ok(HandleResult::NoReply);
        }
        self.uri_order.lock().unwrap().push(user.clone());
        let endpoint = tx.endpoint_inner.clone();
        let here = endpoint.transport_layer.first_listen_addr(None).unwrap().addr;
        match user.as_str() {
            "first" => {
                let mut resp =
                    endpoint.make_response(&tx.original, StatusCode::MovedTemporarily, None);
                let mut low = NameAddr::new(format!("sip:x@{}", here).parse()?);
                low.params.push(Param::Q("0.6".to_string()));
                let mut high = NameAddr::new(format!("sip:y@{}", here).parse()?);
                high.params.push(Param::Q("0.9".to_string()));
                resp.headers.push(Header::Contact(low));
                resp.headers.push(Header::Contact(high));
                Ok(HandleResult::Reply(resp))
            }
            "y" => Ok(HandleResult::Reply(endpoint.make_response(
                &tx.original,
                StatusCode::BusyHere,
                None,
            ))),
            _ => {
                let mut resp = endpoint.make_response(&tx.original, StatusCode::OK, None);
                resp.headers.unique_push(Header::Contact(NameAddr::new(
                    format!("sip:x@{}", here).parse()?,
                )));
                Ok(HandleResult::Reply(resp))
            }
        }
    }
}

#[tokio::test]
async fn test_redirect_follows_q_value_order() {
    let bob_endpoint = serve_endpoint().await;
    let bob_cb = Arc::new(RedirectingCallback {
        uri_order: Mutex::new(Vec::new()),
    });
    let bob = UserAgent::new(&bob_endpoint);
    bob.attach_callback(bob_cb.clone());
    let _bob = spawn_all(&bob_endpoint, bob);

    let alice_endpoint = serve_endpoint().await;
    let alice = UserAgent::new(&alice_endpoint)
        .with_local_uri("sip:alice@atlanta.com".parse().unwrap())
        .with_contact(contact_for(&alice_endpoint, "alice"));
    let alice = spawn_all(&alice_endpoint, alice);
    tokio::time::sleep(Duration::from_millis(30)).await;

    let target: Uri = format!("sip:first@{}", listen_addr(&bob_endpoint))
        .parse()
        .unwrap();
    let request = alice.create_request(Method::Invite, target).unwrap();
    let (ev_tx, mut ev_rx) = unbounded_channel();
    alice.send_request(request, ev_tx).await.unwrap();

    let resp = final_response(&mut ev_rx).await.unwrap();
    assert_eq!(resp.status_code, StatusCode::OK);

    // The 302's q=0.9 contact is tried before the q=0.6 one.
    let order = bob_cb.uri_order.lock().unwrap().clone();
    assert_eq!(order, vec!["first", "y", "x"]);
}

/// A registrar that challenges once and verifies the digest answer.
struct Registrar {
    realm: String,
    nonce: String,
    password: String,
    registers: AtomicUsize,
}

#[async_trait::async_trait]
impl UaCallback for Registrar {
    fn allow(&self) -> Vec<Method> {
        vec![Method::Register]
    }

    async fn handle_request(&self, tx: &mut Transaction) -> Result<HandleResult> {
        self.registers.fetch_add(1, Ordering::SeqCst);
        let endpoint = tx.endpoint_inner.clone();
        let auth = tx.original.headers.iter().find_map(|h| match h {
            Header::Authorization(auth) => Some(auth.clone()),
            _ => None,
        });
        let Some(auth) = auth else {
            let mut resp =
                endpoint.make_response(&tx.original, StatusCode::Unauthorized, None);
            resp.headers.push(Header::WwwAuthenticate(
                format!(
                    "Digest realm=\"{}\", nonce=\"{}\", qop=\"auth\"",
                    self.realm, self.nonce
                )
                .parse()?,
            ));
            return Ok(HandleResult::Reply(resp));
        };

        let username = auth.get("username").unwrap_or_default();
        let uri = auth.get("uri").unwrap_or_default();
        let cnonce = auth.get("cnonce").unwrap_or_default();
        let nc = auth.get("nc").unwrap_or_default();
        let ha1 = format!(
            "{:x}",
            md5::compute(format!("{}:{}:{}", username, self.realm, self.password))
        );
        let ha2 = format!("{:x}", md5::compute(format!("REGISTER:{}", uri)));
        let expected = format!(
            "{:x}",
            md5::compute(format!(
                "{}:{}:{}:{}:auth:{}",
                ha1, self.nonce, nc, cnonce, ha2
            ))
        );
        let status = if auth.get("response") == Some(expected.as_str()) {
            StatusCode::OK
        } else {
            StatusCode::Forbidden
        };
        Ok(HandleResult::Reply(
            endpoint.make_response(&tx.original, status, None),
        ))
    }
}

#[tokio::test]
async fn test_digest_challenge_is_answered_on_retry() {
    let bob_endpoint = serve_endpoint().await;
    let registrar = Arc::new(Registrar {
        realm: "biloxi.com".to_string(),
        nonce: "dcd98b7102dd2f0e".to_string(),
        password: "secretword".to_string(),
        registers: AtomicUsize::new(0),
    });
    let bob = UserAgent::new(&bob_endpoint);
    bob.attach_callback(registrar.clone());
    let _bob = spawn_all(&bob_endpoint, bob);

    let alice_endpoint = serve_endpoint().await;
    let alice = UserAgent::new(&alice_endpoint)
        .with_local_uri("sip:alice@biloxi.com".parse().unwrap())
        .with_credential(Credential {
            username: "alice".to_string(),
            password: "secretword".to_string(),
            realm: None,
        });
    let alice = spawn_all(&alice_endpoint, alice);
    tokio::time::sleep(Duration::from_millis(30)).await;

    let target: Uri = format!("sip:{}", listen_addr(&bob_endpoint)).parse().unwrap();
    let request = alice.create_request(Method::Register, target).unwrap();
    let (ev_tx, mut ev_rx) = unbounded_channel();
    alice.send_request(request, ev_tx).await.unwrap();

    let resp = final_response(&mut ev_rx).await.unwrap();
    assert_eq!(resp.status_code, StatusCode::OK);
    assert_eq!(registrar.registers.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_registration_client_follows_challenge() {
    let bob_endpoint = serve_endpoint().await;
    let registrar = Arc::new(Registrar {
        realm: "biloxi.com".to_string(),
        nonce: "4a8b2c9d0e".to_string(),
        password: "secretword".to_string(),
        registers: AtomicUsize::new(0),
    });
    let bob = UserAgent::new(&bob_endpoint);
    bob.attach_callback(registrar.clone());
    let _bob = spawn_all(&bob_endpoint, bob);

    let alice_endpoint = serve_endpoint().await;
    let e = alice_endpoint.clone();
    tokio::spawn(async move { e.serve().await });
    tokio::time::sleep(Duration::from_millis(30)).await;

    let mut registration = Registration::new(
        alice_endpoint.inner.clone(),
        Some(Credential {
            username: "alice".to_string(),
            password: "secretword".to_string(),
            realm: None,
        }),
    );
    let resp = registration
        .register(&listen_addr(&bob_endpoint).to_string())
        .await
        .unwrap();
    assert_eq!(resp.status_code, StatusCode::OK);
    assert_eq!(registrar.registers.load(Ordering::SeqCst), 2);
}

/// Rings forever; the caller is expected to CANCEL.
struct NeverAnswers;

#[async_trait::async_trait]
impl UaCallback for NeverAnswers {
    async fn handle_request(&self, tx: &mut Transaction) -> Result<HandleResult> {
        if tx.original.method == Method::Invite {
            tx.reply(StatusCode::Ringing).await?;
        }
        Ok(HandleResult::NoReply)
    }
}

#[tokio::test]
async fn test_cancel_after_provisional_yields_487() {
    let bob_endpoint = serve_endpoint().await;
    let bob = UserAgent::new(&bob_endpoint);
    bob.attach_callback(Arc::new(NeverAnswers));
    let _bob = spawn_all(&bob_endpoint, bob);

    let alice_endpoint = serve_endpoint().await;
    let alice = UserAgent::new(&alice_endpoint)
        .with_local_uri("sip:alice@atlanta.com".parse().unwrap())
        .with_contact(contact_for(&alice_endpoint, "alice"));
    let alice = spawn_all(&alice_endpoint, alice);
    tokio::time::sleep(Duration::from_millis(30)).await;

    let target: Uri = format!("sip:bob@{}", listen_addr(&bob_endpoint))
        .parse()
        .unwrap();
    let request = alice.create_request(Method::Invite, target).unwrap();
    let (ev_tx, mut ev_rx) = unbounded_channel();
    let id = alice.send_request(request, ev_tx).await.unwrap();

    // Wait for ringing, then cancel.
    loop {
        if let UacEvent::Provisional(_, resp) = next_event(&mut ev_rx).await {
            if resp.status_code == StatusCode::Ringing {
                break;
            }
        }
    }
    alice.cancel_request(id).unwrap();
    // Cancelling twice is harmless.
    alice.cancel_request(id).unwrap();

    let resp = final_response(&mut ev_rx).await.unwrap();
    assert_eq!(resp.status_code, StatusCode::RequestTerminated);
}

#[tokio::test]
async fn test_cancel_of_unknown_request_reports_no_request() {
    let endpoint = serve_endpoint().await;
    let ua = UserAgent::new(&endpoint);
    assert!(matches!(ua.cancel_request(424242), Err(Error::NoRequest)));
}

struct NoAddresses;

#[async_trait::async_trait]
impl DnsResolver for NoAddresses {
    async fn resolve(
        &self,
        _addr: &HostWithPort,
        _transport: Transport,
    ) -> Result<Vec<SocketAddr>> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_empty_target_set_fails_synchronously() {
    let endpoint = serve_endpoint().await;
    endpoint
        .inner
        .transport_layer
        .set_resolver(Arc::new(NoAddresses));
    let ua = UserAgent::new(&endpoint);

    let request = ua
        .create_request(Method::Options, "sip:nobody@example.invalid".parse().unwrap())
        .unwrap();
    let (ev_tx, _ev_rx) = unbounded_channel();
    let result = ua.send_request(request, ev_tx).await;
    assert!(matches!(result, Err(Error::NoDestinations)));
}
