use crate::message::{Auth, AuthScheme, CSeq, Header, Param, Request, Response, StatusCode};
use crate::transaction::make_branch;
use crate::{Error, Result};
use rand::Rng;

/// Username and password for digest authentication. The realm is optional;
/// when absent the challenge's realm is used.
#[derive(Debug, Clone, Default)]
pub struct Credential {
    pub username: String,
    pub password: String,
    pub realm: Option<String>,
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

fn make_cnonce() -> String {
    let mut rng = rand::rng();
    (0..16)
        .map(|_| std::char::from_digit(rng.random_range(0..16), 16).unwrap())
        .collect()
}

/// Compute the RFC 2617 digest response for a challenge. Supports plain
/// MD5 and qop=auth; auth-int would need the body hash and is not offered
/// by the servers this stack talks to.
fn digest_response(
    cred: &Credential,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
    qop_auth: bool,
    cnonce: &str,
    nc: &str,
) -> String {
    let ha1 = md5_hex(&format!("{}:{}:{}", cred.username, realm, cred.password));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));
    if qop_auth {
        md5_hex(&format!(
            "{}:{}:{}:{}:auth:{}",
            ha1, nonce, nc, cnonce, ha2
        ))
    } else {
        md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2))
    }
}

/// Answer a 401/407 challenge: compute the digest over the challenge in the
/// response and return the request to resubmit, with a fresh branch and the
/// CSeq bumped to `new_seq` so it forms a new transaction.
pub fn handle_client_authenticate(
    new_seq: u32,
    original: &Request,
    resp: &Response,
    cred: &Credential,
) -> Result<Request> {
    let proxy = resp.status_code == StatusCode::ProxyAuthenticationRequired;
    let challenge = if proxy {
        resp.headers.proxy_authenticate()
    } else {
        resp.headers.www_authenticate()
    }
    .ok_or_else(|| Error::BadResponse("challenge without authenticate header".to_string()))?;

    if challenge.scheme != AuthScheme::Digest {
        return Err(Error::BadResponse(format!(
            "unsupported auth scheme: {}",
            challenge.scheme
        )));
    }
    let realm = cred
        .realm
        .as_deref()
        .or_else(|| challenge.get("realm"))
        .unwrap_or_default()
        .to_string();
    let nonce = challenge
        .get("nonce")
        .ok_or_else(|| Error::BadResponse("challenge without nonce".to_string()))?
        .to_string();
    let qop_auth = challenge.qop_auth();

    let uri = original.uri.to_string();
    let cnonce = make_cnonce();
    let nc = "00000001";
    let response_hash = digest_response(
        cred,
        &realm,
        &nonce,
        original.method.as_str(),
        &uri,
        qop_auth,
        &cnonce,
        nc,
    );

    let mut params = vec![
        ("username".to_string(), cred.username.clone()),
        ("realm".to_string(), realm),
        ("nonce".to_string(), nonce),
        ("uri".to_string(), uri),
        ("response".to_string(), response_hash),
        ("algorithm".to_string(), "MD5".to_string()),
    ];
    if qop_auth {
        params.push(("qop".to_string(), "auth".to_string()));
        params.push(("cnonce".to_string(), cnonce));
        params.push(("nc".to_string(), nc.to_string()));
    }
    if let Some(opaque) = challenge.get("opaque") {
        params.push(("opaque".to_string(), opaque.to_string()));
    }
    let credentials = Auth::digest(params);

    let mut request = original.clone();
    if proxy {
        request
            .headers
            .unique_push(Header::ProxyAuthorization(credentials));
    } else {
        request.headers.unique_push(Header::Authorization(credentials));
    }

    // The retry is a new transaction: new branch, next CSeq.
    let method = request.method.clone();
    request.headers.unique_push(Header::CSeq(CSeq {
        seq: new_seq,
        method,
    }));
    let via = request.headers.via_header_mut()?;
    for param in via.params.iter_mut() {
        if let Param::Branch(branch) = param {
            *branch = make_branch();
        }
    }
    Ok(request)
}
