use super::authenticate::{handle_client_authenticate, Credential};
use crate::message::{
    Header, HostWithPort, Method, NameAddr, Response, Scheme, SipMessage, StatusCode, Uri,
    UserInfo,
};
use crate::transaction::{
    endpoint::EndpointInnerRef,
    key::{TransactionKey, TransactionRole},
    make_tag,
    transaction::Transaction,
};
use crate::{Error, Result};
use tracing::{debug, info};

/// REGISTER client: binds a contact at a registrar, answering digest
/// challenges and learning the public address the registrar observed
/// (`received`/`rport` on our Via) for NAT traversal.
///
/// Not thread-safe; drive one instance from one task and re-register before
/// `expires()` runs out.
pub struct Registration {
    pub last_seq: u32,
    pub endpoint: EndpointInnerRef,
    pub credential: Option<Credential>,
    pub contact: Option<NameAddr>,
    pub allow: Vec<Method>,
    /// Public address discovered from the registrar's Via stamping.
    pub public_address: Option<HostWithPort>,
}

impl Registration {
    pub fn new(endpoint: EndpointInnerRef, credential: Option<Credential>) -> Self {
        Self {
            last_seq: 0,
            endpoint,
            credential,
            contact: None,
            allow: vec![
                Method::Invite,
                Method::Ack,
                Method::Cancel,
                Method::Bye,
                Method::Options,
            ],
            public_address: None,
        }
    }

    pub fn discovered_public_address(&self) -> Option<HostWithPort> {
        self.public_address.clone()
    }

    /// Seconds until the registrar expires this binding, from the Contact
    /// expires parameter of the last 200, defaulting to 50.
    pub fn expires(&self) -> u32 {
        self.contact
            .as_ref()
            .and_then(|c| c.expires())
            .unwrap_or(50)
    }

    fn make_contact(&self, user: Option<&str>) -> NameAddr {
        if let Some(contact) = &self.contact {
            return contact.clone();
        }
        let host_with_port = self.public_address.clone().unwrap_or_else(|| {
            self.endpoint
                .transport_layer
                .first_listen_addr(None)
                .map(|addr| addr.addr)
                .unwrap_or(HostWithPort {
                    host: crate::message::Host::Domain("invalid.invalid".to_string()),
                    port: None,
                })
        });
        NameAddr::new(Uri {
            scheme: Some(Scheme::Sip),
            auth: user.map(|user| UserInfo {
                user: user.to_string(),
                password: None,
            }),
            host_with_port,
            params: vec![],
            headers: vec![],
        })
    }

    /// Register with `server`, following one digest challenge when
    /// credentials are present. Returns the registrar's final response.
    pub async fn register(&mut self, server: &str) -> Result<Response> {
        self.last_seq += 1;

        let recipient: Uri = format!("sip:{}", server).parse()?;
        let mut to_uri = recipient.clone();
        if let Some(cred) = &self.credential {
            to_uri.auth = Some(UserInfo {
                user: cred.username.clone(),
                password: None,
            });
        }
        let to = NameAddr::new(to_uri.clone());
        let from = NameAddr::new(to_uri).with_tag(make_tag());
        let contact = self.make_contact(self.credential.as_ref().map(|c| c.username.as_str()));

        let via = self.endpoint.get_via(None, None)?;
        let mut request = self.endpoint.make_request(
            Method::Register,
            recipient,
            via,
            from,
            to,
            self.last_seq,
        );
        request.headers.unique_push(Header::Contact(contact));
        request.headers.unique_push(Header::Allow(self.allow.clone()));

        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, request, self.endpoint.clone(), None);
        tx.send().await?;
        let mut auth_sent = false;

        while let Some(msg) = tx.receive().await {
            let SipMessage::Response(resp) = msg else {
                break;
            };
            match resp.status_code {
                code if code.is_provisional() => continue,
                StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired => {
                    self.note_public_address(&resp);
                    if auth_sent {
                        debug!("challenge repeated after credentials were sent");
                        return Ok(resp);
                    }
                    let Some(cred) = self.credential.clone() else {
                        debug!("{} without credential", resp.status_code);
                        return Ok(resp);
                    };
                    self.last_seq += 1;
                    let request =
                        handle_client_authenticate(self.last_seq, &tx.original, &resp, &cred)?;
                    let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
                    tx = Transaction::new_client(key, request, self.endpoint.clone(), None);
                    tx.send().await?;
                    auth_sent = true;
                }
                StatusCode::OK => {
                    self.note_public_address(&resp);
                    if let Some(contact) = resp.headers.contact_header() {
                        self.contact = Some(contact.clone());
                    }
                    info!("registration done: {}", resp.status_code);
                    return Ok(resp);
                }
                _ => {
                    info!("registration done: {}", resp.status_code);
                    return Ok(resp);
                }
            }
        }
        Err(Error::Error(
            "registration transaction terminated without a final response".to_string(),
        ))
    }

    /// Track the address the registrar saw us at; a change invalidates the
    /// cached contact so the next cycle advertises the public address.
    fn note_public_address(&mut self, resp: &Response) {
        let received = resp.via_received();
        if received.is_some() && self.public_address != received {
            info!(
                "discovered public address: {:?} -> {:?}",
                self.public_address, received
            );
            self.public_address = received;
            self.contact = None;
        }
    }
}
