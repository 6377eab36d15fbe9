use super::{endpoint::EndpointInner, make_call_id};
use crate::message::{
    CSeq, Header, Method, NameAddr, Request, Response, StatusCode, Uri, Version, Via,
};
use crate::Result;

impl EndpointInner {
    /// Construct an outgoing request with the RFC 3261 section 8.1.1
    /// mandatory header set.
    ///
    /// Headers are stamped in the conventional order: Via (topmost first),
    /// Call-ID, From, To, CSeq, Max-Forwards, User-Agent. The caller adds
    /// Contact, Route and body-related headers afterwards.
    pub fn make_request(
        &self,
        method: Method,
        req_uri: Uri,
        via: Via,
        from: NameAddr,
        to: NameAddr,
        seq: u32,
    ) -> Request {
        let headers = vec![
            Header::Via(via),
            Header::CallId(make_call_id(self.option.callid_suffix.as_deref())),
            Header::From(from),
            Header::To(to),
            Header::CSeq(CSeq { seq, method: method.clone() }),
            Header::MaxForwards(self.option.max_forwards),
            Header::UserAgent(self.user_agent.clone()),
        ];
        Request {
            method,
            uri: req_uri,
            headers: headers.into(),
            body: vec![],
            version: Version::V2,
        }
    }

    /// Construct a response to `req` per RFC 3261 section 8.2.6: Via,
    /// Call-ID, From, To and CSeq are carried over verbatim, everything else
    /// is the responder's business. Responses identify their software with
    /// Server (section 20.35); User-Agent belongs to requests only.
    pub fn make_response(
        &self,
        req: &Request,
        status_code: StatusCode,
        body: Option<Vec<u8>>,
    ) -> Response {
        let mut headers = req.headers.clone();
        headers.retain(|h| {
            matches!(
                h,
                Header::Via(_)
                    | Header::CallId(_)
                    | Header::From(_)
                    | Header::To(_)
                    | Header::CSeq(_)
            )
        });
        headers.unique_push(Header::Server(self.user_agent.clone()));
        Response {
            status_code,
            reason_phrase: None,
            version: req.version,
            headers,
            body: body.unwrap_or_default(),
        }
    }

    /// Construct the ACK for a non-2xx final response per RFC 3261 section
    /// 17.1.1.3.
    ///
    /// The ACK reuses the INVITE's Request-URI, Call-ID, From, CSeq number
    /// (with the method rewritten) and Route set; its single Via is the
    /// INVITE's topmost Via byte-for-byte, and To is taken from the response
    /// so the ACK carries the tag the peer assigned.
    pub fn make_ack(&self, original: &Request, response: &Response) -> Result<Request> {
        let via = original.headers.via_header()?.clone();
        let from = original.headers.from_header()?.clone();
        let to = response.headers.to_header()?.clone();
        let call_id = original.headers.call_id_header()?.to_string();
        let seq = original.headers.cseq_header()?.seq;

        let mut headers = vec![
            Header::Via(via),
            Header::CallId(call_id),
            Header::From(from),
            Header::To(to),
            Header::CSeq(CSeq {
                seq,
                method: Method::Ack,
            }),
            Header::MaxForwards(self.option.max_forwards),
        ];
        for route in original.headers.routes() {
            headers.push(Header::Route(route.clone()));
        }
        headers.push(Header::ContentLength(0));

        Ok(Request {
            method: Method::Ack,
            uri: original.uri.clone(),
            headers: headers.into(),
            body: vec![],
            version: original.version,
        })
    }
}
