use super::endpoint::EndpointInnerRef;
use super::key::TransactionKey;
use super::{make_tag, TransactionState, TransactionTimer, TransactionType};
use crate::message::{Header, Method, Request, Response, SipMessage, StatusCode, StatusCodeKind};
use crate::transport::{SipAddr, SipConnection};
use crate::{Error, Result};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

pub type TransactionEventReceiver = UnboundedReceiver<TransactionEvent>;
pub type TransactionEventSender = UnboundedSender<TransactionEvent>;

/// Events driving a transaction state machine.
///
/// * `Received` - a message from the wire was demultiplexed to this
///   transaction
/// * `Timer` - one of the RFC 3261 timers fired
/// * `Respond` - the TU asks a server transaction to send a response
/// * `Failure` - a locally synthesized final (timeout or transport error)
///   reported to the TU without driving the FSM
/// * `Terminate` - the transaction is done and the TU should drop it
pub enum TransactionEvent {
    Received(SipMessage, Option<SipConnection>),
    Timer(TransactionTimer),
    Respond(Response),
    Failure(Response),
    Terminate,
}

/// One RFC 3261 transaction: a client or server state machine owning its
/// retransmission timers and its half of the TU event channel.
///
/// The four machine types share this struct; the type tag picks the state
/// chart. Timer slots are named by function - `timer_retransmit` holds
/// A/E/G, `timer_timeout` holds B/F/H, `timer_linger` holds D/I/J/K -
/// because at most one of each family is ever pending.
pub struct Transaction {
    pub transaction_type: TransactionType,
    pub key: TransactionKey,
    pub original: Request,
    pub destination: Option<SipAddr>,
    pub state: TransactionState,
    pub endpoint_inner: EndpointInnerRef,
    pub connection: Option<SipConnection>,
    pub last_response: Option<Response>,
    pub last_ack: Option<Request>,
    pub tu_receiver: TransactionEventReceiver,
    pub tu_sender: TransactionEventSender,
    timer_retransmit: Option<u64>,
    timer_timeout: Option<u64>,
    timer_linger: Option<u64>,
    timer_trying: Option<u64>,
    is_cleaned_up: bool,
}

impl Transaction {
    fn new(
        transaction_type: TransactionType,
        key: TransactionKey,
        original: Request,
        connection: Option<SipConnection>,
        endpoint_inner: EndpointInnerRef,
    ) -> Self {
        let (tu_sender, tu_receiver) = unbounded_channel();
        let state = match transaction_type {
            TransactionType::ClientInvite | TransactionType::ClientNonInvite => {
                TransactionState::Calling
            }
            TransactionType::ServerInvite => TransactionState::Proceeding,
            TransactionType::ServerNonInvite => TransactionState::Trying,
        };
        info!("transaction created {:?} {}", transaction_type, key);
        let tx = Self {
            transaction_type,
            endpoint_inner,
            connection,
            key,
            original,
            destination: None,
            state,
            last_response: None,
            last_ack: None,
            timer_retransmit: None,
            timer_timeout: None,
            timer_linger: None,
            timer_trying: None,
            tu_receiver,
            tu_sender,
            is_cleaned_up: false,
        };
        tx.endpoint_inner
            .attach_transaction(&tx.key, tx.tu_sender.clone());
        tx
    }

    pub fn new_client(
        key: TransactionKey,
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let tx_type = match original.method {
            Method::Invite => TransactionType::ClientInvite,
            _ => TransactionType::ClientNonInvite,
        };
        Transaction::new(tx_type, key, original, connection, endpoint_inner)
    }

    pub fn new_server(
        key: TransactionKey,
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let tx_type = match original.method {
            Method::Invite | Method::Ack => TransactionType::ServerInvite,
            _ => TransactionType::ServerNonInvite,
        };
        Transaction::new(tx_type, key, original, connection, endpoint_inner)
    }

    fn is_reliable(&self) -> bool {
        self.connection
            .as_ref()
            .map(|c| c.is_reliable())
            .unwrap_or(false)
    }

    /// Arm the 100 Trying deadline on a fresh INVITE server transaction.
    pub fn schedule_trying_deadline(&mut self) {
        let id = self.endpoint_inner.timers.timeout(
            self.endpoint_inner.option.trying_interval,
            TransactionTimer::TimerTrying(self.key.clone()),
        );
        self.timer_trying.replace(id);
    }

    /// Send the request of a client transaction and start the appropriate
    /// timers.
    pub async fn send(&mut self) -> Result<()> {
        match self.transaction_type {
            TransactionType::ClientInvite | TransactionType::ClientNonInvite => {}
            _ => {
                return Err(Error::TransactionError(
                    "send is only valid for client transactions".to_string(),
                    self.key.clone(),
                ));
            }
        }

        let content_length = Header::ContentLength(self.original.body().len() as u32);
        self.original.headers.unique_push(content_length);

        if self.connection.is_none() {
            let target = match &self.destination {
                Some(addr) => addr.clone(),
                None => SipAddr::try_from(&self.original.uri)?,
            };
            let msg_len = SipMessage::Request(self.original.clone()).to_bytes().len();
            let (connection, resolved_addr) = self
                .endpoint_inner
                .transport_layer
                .lookup(&target, msg_len)
                .await?;
            // UDP needs the resolved destination kept around for every
            // retransmission.
            if !connection.is_reliable() {
                self.destination.replace(resolved_addr);
            }
            self.connection.replace(connection);
        }

        let connection = self.connection.as_ref().ok_or(Error::TransactionError(
            "no connection found".to_string(),
            self.key.clone(),
        ))?;
        connection
            .send(self.original.clone().into(), self.destination.as_ref())
            .await?;

        match self.transaction_type {
            TransactionType::ClientInvite => {
                // Stay in Calling; arm Timer A (unreliable only) and Timer B.
                if !self.is_reliable() {
                    let t1 = self.endpoint_inner.option.t1;
                    self.timer_retransmit.replace(self.endpoint_inner.timers.timeout(
                        t1,
                        TransactionTimer::TimerA(self.key.clone(), t1),
                    ));
                }
                self.timer_timeout.replace(self.endpoint_inner.timers.timeout(
                    self.endpoint_inner.option.t1x64,
                    TransactionTimer::TimerB(self.key.clone()),
                ));
                Ok(())
            }
            _ => self.transition(TransactionState::Trying).map(|_| ()),
        }
    }

    /// Build and send a response on a server transaction, stamping a To-tag
    /// on non-provisional answers when the request carried none.
    pub async fn reply_with(
        &mut self,
        status_code: StatusCode,
        headers: Vec<Header>,
        body: Option<Vec<u8>>,
    ) -> Result<()> {
        if status_code.kind() != StatusCodeKind::Provisional {
            let to = self.original.headers.to_header()?;
            if to.tag().is_none() {
                let tagged = to.clone().with_tag(make_tag());
                self.original.headers.unique_push(Header::To(tagged));
            }
        }
        let mut resp = self
            .endpoint_inner
            .make_response(&self.original, status_code, body);
        for header in headers {
            resp.headers.unique_push(header);
        }
        self.respond(resp).await
    }

    /// Quick reply with only a status code.
    pub async fn reply(&mut self, status_code: StatusCode) -> Result<()> {
        self.reply_with(status_code, vec![], None).await
    }

    pub async fn send_trying(&mut self) -> Result<()> {
        let response = self
            .endpoint_inner
            .make_response(&self.original, StatusCode::Trying, None);
        self.respond(response).await
    }

    /// Send a response from the TU through a server transaction.
    pub async fn respond(&mut self, response: Response) -> Result<()> {
        match self.transaction_type {
            TransactionType::ServerInvite | TransactionType::ServerNonInvite => {}
            _ => {
                return Err(Error::TransactionError(
                    "respond is only valid for server transactions".to_string(),
                    self.key.clone(),
                ));
            }
        }

        let new_state = match response.status_code.kind() {
            StatusCodeKind::Provisional => TransactionState::Proceeding,
            StatusCodeKind::Successful if self.transaction_type == TransactionType::ServerInvite => {
                // 2xx retransmission is the TU's business (RFC 3261
                // section 13.3.1.4); the transaction ends here.
                TransactionState::Terminated
            }
            _ => TransactionState::Completed,
        };
        self.can_transition(&new_state)?;

        let connection = self.connection.as_ref().ok_or(Error::TransactionError(
            "no connection found".to_string(),
            self.key.clone(),
        ))?;
        debug!("responding {} {}", response.status_code, self.key);
        connection
            .send(response.clone().into(), self.destination.as_ref())
            .await?;
        self.last_response.replace(response);
        self.transition(new_state).map(|_| ())
    }

    fn can_transition(&self, target: &TransactionState) -> Result<()> {
        use TransactionState::*;
        match (&self.state, target) {
            (&Calling, &Trying)
            | (&Calling, &Proceeding)
            | (&Calling, &Completed)
            | (&Calling, &Terminated)
            | (&Trying, &Proceeding)
            | (&Trying, &Completed)
            | (&Trying, &Terminated)
            | (&Proceeding, &Proceeding) // provisional retransmission
            | (&Proceeding, &Completed)
            | (&Proceeding, &Confirmed)
            | (&Proceeding, &Terminated)
            | (&Completed, &Confirmed)
            | (&Completed, &Terminated)
            | (&Confirmed, &Terminated) => Ok(()),
            _ => Err(Error::TransactionError(
                format!("invalid transition from {:?} to {:?}", self.state, target),
                self.key.clone(),
            )),
        }
    }

    /// Pull the next message for the TU, running the state machine
    /// underneath. Returns `None` once the transaction terminates.
    pub async fn receive(&mut self) -> Option<SipMessage> {
        while let Some(event) = self.tu_receiver.recv().await {
            match event {
                TransactionEvent::Received(msg, connection) => {
                    if let Some(msg) = match msg {
                        SipMessage::Request(req) => self.on_received_request(req, connection).await,
                        SipMessage::Response(resp) => self.on_received_response(resp).await,
                    } {
                        return Some(msg);
                    }
                }
                TransactionEvent::Timer(t) => {
                    self.on_timer(t).await.ok();
                }
                TransactionEvent::Respond(response) => {
                    self.respond(response).await.ok();
                }
                TransactionEvent::Failure(response) => {
                    return Some(SipMessage::Response(response));
                }
                TransactionEvent::Terminate => {
                    debug!("received terminate event {}", self.key);
                    return None;
                }
            }
        }
        None
    }

    pub fn is_terminated(&self) -> bool {
        self.state == TransactionState::Terminated
    }
}

impl Transaction {
    /// Report a locally synthesized final to the TU, then terminate. Used
    /// for Timer B/F/H expiry (408) and transport errors (503) so the UAC
    /// core sees them on the same path as their network-born cousins.
    fn fail_with(&mut self, status_code: StatusCode) -> Result<()> {
        let response = self
            .endpoint_inner
            .make_response(&self.original, status_code, None);
        self.tu_sender
            .send(TransactionEvent::Failure(response))
            .map_err(|e| Error::TransactionError(e.to_string(), self.key.clone()))?;
        self.transition(TransactionState::Terminated).map(|_| ())
    }

    async fn on_received_request(
        &mut self,
        req: Request,
        connection: Option<SipConnection>,
    ) -> Option<SipMessage> {
        match self.transaction_type {
            TransactionType::ClientInvite | TransactionType::ClientNonInvite => return None,
            _ => {}
        }

        if self.connection.is_none() && connection.is_some() {
            self.connection = connection;
        }

        if req.method == Method::Cancel {
            match self.state {
                TransactionState::Trying | TransactionState::Proceeding => {
                    // Answer the CANCEL itself, then let the TU abort the
                    // original request.
                    if let Some(connection) = &self.connection {
                        let resp = self
                            .endpoint_inner
                            .make_response(&req, StatusCode::OK, None);
                        connection
                            .send(resp.into(), self.destination.as_ref())
                            .await
                            .ok();
                    }
                    return Some(req.into());
                }
                _ => {
                    if let Some(connection) = &self.connection {
                        let resp = self.endpoint_inner.make_response(
                            &req,
                            StatusCode::CallTransactionDoesNotExist,
                            None,
                        );
                        connection
                            .send(resp.into(), self.destination.as_ref())
                            .await
                            .ok();
                    }
                    return None;
                }
            }
        }

        match self.state {
            TransactionState::Trying => {
                // Retransmission before any response: absorb.
                None
            }
            TransactionState::Proceeding | TransactionState::Completed => {
                if req.method == Method::Ack && self.state == TransactionState::Completed {
                    self.transition(TransactionState::Confirmed).ok();
                    return None;
                }
                // Retransmitted request: re-emit the last response without
                // re-entering the TU.
                if let Some(last_response) = self.last_response.clone() {
                    if let Some(connection) = &self.connection {
                        connection
                            .send(last_response.into(), self.destination.as_ref())
                            .await
                            .ok();
                    }
                }
                None
            }
            _ => None,
        }
    }

    async fn on_received_response(&mut self, resp: Response) -> Option<SipMessage> {
        match self.transaction_type {
            TransactionType::ServerInvite | TransactionType::ServerNonInvite => return None,
            _ => {}
        }

        match resp.status_code.kind() {
            StatusCodeKind::Provisional => {
                if self.state == TransactionState::Calling
                    || self.state == TransactionState::Trying
                    || self.state == TransactionState::Proceeding
                {
                    self.transition(TransactionState::Proceeding).ok()?;
                    self.last_response.replace(resp.clone());
                    return Some(SipMessage::Response(resp));
                }
                None
            }
            StatusCodeKind::Successful => match self.state {
                TransactionState::Calling | TransactionState::Trying
                | TransactionState::Proceeding => {
                    let target = if self.transaction_type == TransactionType::ClientInvite {
                        // The TU acknowledges a 2xx itself, outside this
                        // transaction.
                        TransactionState::Terminated
                    } else {
                        TransactionState::Completed
                    };
                    self.last_response.replace(resp.clone());
                    self.transition(target).ok();
                    Some(SipMessage::Response(resp))
                }
                _ => None,
            },
            _ => match self.state {
                TransactionState::Calling | TransactionState::Trying
                | TransactionState::Proceeding => {
                    if self.transaction_type == TransactionType::ClientInvite {
                        self.ack_final_response(&resp).await.ok();
                    }
                    self.last_response.replace(resp.clone());
                    self.transition(TransactionState::Completed).ok();
                    Some(SipMessage::Response(resp))
                }
                TransactionState::Completed => {
                    // Duplicate final: re-ACK and absorb.
                    if let Some(ack) = self.last_ack.clone() {
                        if let Some(connection) = &self.connection {
                            connection
                                .send(ack.into(), self.destination.as_ref())
                                .await
                                .ok();
                        }
                    }
                    None
                }
                _ => None,
            },
        }
    }

    /// Automatic ACK for a non-2xx final per RFC 3261 section 17.1.1.3.
    async fn ack_final_response(&mut self, resp: &Response) -> Result<()> {
        let ack = self.endpoint_inner.make_ack(&self.original, resp)?;
        let connection = self.connection.as_ref().ok_or(Error::TransactionError(
            "no connection found".to_string(),
            self.key.clone(),
        ))?;
        connection
            .send(ack.clone().into(), self.destination.as_ref())
            .await?;
        self.last_ack.replace(ack);
        Ok(())
    }

    async fn on_timer(&mut self, timer: TransactionTimer) -> Result<()> {
        match timer {
            TransactionTimer::TimerA(key, duration) => {
                if self.state == TransactionState::Calling {
                    self.retransmit_original().await?;
                    // Timer A doubles without bound until Timer B ends the
                    // transaction.
                    let duration = (duration * 2).min(self.endpoint_inner.option.t1x64);
                    let id = self
                        .endpoint_inner
                        .timers
                        .timeout(duration, TransactionTimer::TimerA(key, duration));
                    self.timer_retransmit.replace(id);
                }
            }
            TransactionTimer::TimerE(key, duration) => {
                if matches!(
                    self.state,
                    TransactionState::Trying | TransactionState::Proceeding
                ) {
                    self.retransmit_original().await?;
                    let duration = (duration * 2).min(self.endpoint_inner.option.t2);
                    let id = self
                        .endpoint_inner
                        .timers
                        .timeout(duration, TransactionTimer::TimerE(key, duration));
                    self.timer_retransmit.replace(id);
                }
            }
            TransactionTimer::TimerB(_) | TransactionTimer::TimerF(_) => {
                if matches!(
                    self.state,
                    TransactionState::Calling
                        | TransactionState::Trying
                        | TransactionState::Proceeding
                ) {
                    self.fail_with(StatusCode::RequestTimeout)?;
                }
            }
            TransactionTimer::TimerG(key, duration) => {
                if self.state == TransactionState::Completed {
                    if let Some(last_response) = self.last_response.clone() {
                        if let Some(connection) = &self.connection {
                            connection
                                .send(last_response.into(), self.destination.as_ref())
                                .await?;
                        }
                    }
                    let duration = (duration * 2).min(self.endpoint_inner.option.t2);
                    let id = self
                        .endpoint_inner
                        .timers
                        .timeout(duration, TransactionTimer::TimerG(key, duration));
                    self.timer_retransmit.replace(id);
                }
            }
            TransactionTimer::TimerH(_) => {
                if self.state == TransactionState::Completed {
                    // No ACK ever arrived.
                    self.fail_with(StatusCode::RequestTimeout)?;
                }
            }
            TransactionTimer::TimerD(_)
            | TransactionTimer::TimerI(_)
            | TransactionTimer::TimerJ(_)
            | TransactionTimer::TimerK(_) => {
                self.transition(TransactionState::Terminated)?;
            }
            TransactionTimer::TimerTrying(_) => {
                if self.transaction_type == TransactionType::ServerInvite
                    && self.state == TransactionState::Proceeding
                    && self.last_response.is_none()
                {
                    self.send_trying().await?;
                }
            }
        }
        Ok(())
    }

    async fn retransmit_original(&mut self) -> Result<()> {
        let Some(connection) = self.connection.clone() else {
            return Ok(());
        };
        if let Err(e) = connection
            .send(self.original.clone().into(), self.destination.as_ref())
            .await
        {
            debug!("retransmission failed {}: {}", self.key, e);
            self.fail_with(StatusCode::ServiceUnavailable)?;
        }
        Ok(())
    }

    /// Durations for the wait states: the RFC value on unreliable
    /// transports, zero on reliable ones.
    fn linger_duration(&self, unreliable: std::time::Duration) -> std::time::Duration {
        if self.is_reliable() {
            std::time::Duration::ZERO
        } else {
            unreliable
        }
    }

    fn transition(&mut self, state: TransactionState) -> Result<TransactionState> {
        if self.state == state {
            return Ok(self.state);
        }
        let timers = &self.endpoint_inner.timers;
        match state {
            TransactionState::Calling => {
                // Nothing transitions back into Calling.
            }
            TransactionState::Trying => {
                // Non-INVITE client just sent its request: Timer E
                // (unreliable only) and Timer F.
                if !self.is_reliable() {
                    let t1 = self.endpoint_inner.option.t1;
                    self.timer_retransmit.replace(
                        timers.timeout(t1, TransactionTimer::TimerE(self.key.clone(), t1)),
                    );
                }
                self.timer_timeout.replace(timers.timeout(
                    self.endpoint_inner.option.t1x64,
                    TransactionTimer::TimerF(self.key.clone()),
                ));
            }
            TransactionState::Proceeding => {
                if self.transaction_type == TransactionType::ClientInvite {
                    // A provisional arrived: stop retransmitting, keep
                    // Timer B running.
                    self.timer_retransmit.take().map(|id| timers.cancel(id));
                }
            }
            TransactionState::Completed => {
                self.timer_retransmit.take().map(|id| timers.cancel(id));
                self.timer_timeout.take().map(|id| timers.cancel(id));
                match self.transaction_type {
                    TransactionType::ClientInvite => {
                        let d = self.linger_duration(self.endpoint_inner.option.t1x64);
                        self.timer_linger
                            .replace(timers.timeout(d, TransactionTimer::TimerD(self.key.clone())));
                    }
                    TransactionType::ClientNonInvite => {
                        let d = self.linger_duration(self.endpoint_inner.option.t4);
                        self.timer_linger
                            .replace(timers.timeout(d, TransactionTimer::TimerK(self.key.clone())));
                    }
                    TransactionType::ServerInvite => {
                        self.timer_trying.take().map(|id| timers.cancel(id));
                        if !self.is_reliable() {
                            let t1 = self.endpoint_inner.option.t1;
                            self.timer_retransmit.replace(
                                timers.timeout(t1, TransactionTimer::TimerG(self.key.clone(), t1)),
                            );
                        }
                        self.timer_timeout.replace(timers.timeout(
                            self.endpoint_inner.option.t1x64,
                            TransactionTimer::TimerH(self.key.clone()),
                        ));
                    }
                    TransactionType::ServerNonInvite => {
                        let d = self.linger_duration(self.endpoint_inner.option.t1x64);
                        self.timer_linger
                            .replace(timers.timeout(d, TransactionTimer::TimerJ(self.key.clone())));
                    }
                }
            }
            TransactionState::Confirmed => {
                self.timer_retransmit.take().map(|id| timers.cancel(id));
                self.timer_timeout.take().map(|id| timers.cancel(id));
                let d = self.linger_duration(self.endpoint_inner.option.t4);
                self.timer_linger
                    .replace(timers.timeout(d, TransactionTimer::TimerI(self.key.clone())));
            }
            TransactionState::Terminated => {
                self.cleanup();
                self.tu_sender.send(TransactionEvent::Terminate).ok();
            }
        }
        debug!("transition {}: {:?} -> {:?}", self.key, self.state, state);
        self.state = state;
        Ok(self.state)
    }

    fn cleanup_timer(&mut self) {
        let timers = &self.endpoint_inner.timers;
        self.timer_retransmit.take().map(|id| timers.cancel(id));
        self.timer_timeout.take().map(|id| timers.cancel(id));
        self.timer_linger.take().map(|id| timers.cancel(id));
        self.timer_trying.take().map(|id| timers.cancel(id));
    }

    fn cleanup(&mut self) {
        if self.is_cleaned_up {
            return;
        }
        self.is_cleaned_up = true;
        self.cleanup_timer();
        self.endpoint_inner.detach_transaction(&self.key);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.cleanup();
        debug!("transaction dropped: {}", self.key);
    }
}
