use super::key::{TransactionKey, TransactionRole};
use super::timer::Timer;
use super::transaction::{Transaction, TransactionEvent, TransactionEventSender};
use super::{make_branch, TransactionTimer};
use crate::message::{Method, Param, SipMessage, StatusCode, Transport, Version, Via};
use crate::transport::{SipAddr, TransportEvent, TransportLayer, TransportReceiver};
use crate::{Error, Result};
use get_if_addrs::get_if_addrs;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Protocol tuning knobs, all defaulted per RFC 3261.
#[derive(Debug, Clone)]
pub struct EndpointOption {
    /// RTT estimate; the base of every retransmission schedule.
    pub t1: Duration,
    /// Maximum retransmission interval for non-INVITE requests and INVITE
    /// responses.
    pub t2: Duration,
    /// Maximum time a message stays in the network.
    pub t4: Duration,
    /// 64*T1, the overall transaction timeout.
    pub t1x64: Duration,
    /// Timer wheel polling granularity.
    pub timer_interval: Duration,
    /// How long the TU gets before an INVITE server transaction answers
    /// 100 Trying on its own.
    pub trying_interval: Duration,
    pub max_forwards: u32,
    pub udp_mtu_threshold: usize,
    /// Optional `@host` suffix for generated Call-IDs.
    pub callid_suffix: Option<String>,
}

impl Default for EndpointOption {
    fn default() -> Self {
        let t1 = Duration::from_millis(500);
        EndpointOption {
            t1,
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            t1x64: t1 * 64,
            timer_interval: Duration::from_millis(20),
            trying_interval: Duration::from_millis(200),
            max_forwards: 70,
            udp_mtu_threshold: crate::transport::transport_layer::DEFAULT_UDP_MTU_THRESHOLD,
            callid_suffix: None,
        }
    }
}

impl EndpointOption {
    /// Derive t1x64 after changing t1, keeping the timers consistent.
    pub fn with_t1(mut self, t1: Duration) -> Self {
        self.t1 = t1;
        self.t1x64 = t1 * 64;
        self
    }
}

pub type TransactionReceiver = UnboundedReceiver<Transaction>;
pub type TransactionSender = UnboundedSender<Transaction>;

pub struct EndpointInner {
    pub user_agent: String,
    pub option: EndpointOption,
    pub timers: Timer<TransactionTimer>,
    pub transport_layer: TransportLayer,
    pub cancel_token: CancellationToken,
    transactions: RwLock<HashMap<TransactionKey, TransactionEventSender>>,
    /// Where unmatched inbound requests become new server transactions.
    incoming_sender: RwLock<Option<TransactionSender>>,
}

pub type EndpointInnerRef = Arc<EndpointInner>;

impl EndpointInner {
    pub fn attach_transaction(&self, key: &TransactionKey, sender: TransactionEventSender) {
        self.transactions
            .write()
            .unwrap()
            .insert(key.clone(), sender);
    }

    pub fn detach_transaction(&self, key: &TransactionKey) {
        self.transactions.write().unwrap().remove(key);
    }

    fn find_transaction(&self, key: &TransactionKey) -> Option<TransactionEventSender> {
        self.transactions.read().unwrap().get(key).cloned()
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.read().unwrap().len()
    }

    /// Build the topmost Via for an outgoing request. The sent-by is the
    /// given local address, the first transport listen, or the first
    /// non-loopback interface as a last resort; rport is always requested.
    pub fn get_via(&self, addr: Option<SipAddr>, branch: Option<String>) -> Result<Via> {
        let addr = match addr.or_else(|| self.transport_layer.first_listen_addr(None)) {
            Some(addr) => addr,
            None => SipAddr {
                r#type: Some(Transport::Udp),
                addr: Self::first_non_loopback_interface()?.into(),
            },
        };
        Ok(Via {
            version: Version::V2,
            transport: addr.transport(),
            sent_by: addr.addr,
            params: vec![
                Param::Branch(branch.unwrap_or_else(make_branch)),
                Param::Rport(None),
            ],
        })
    }

    fn first_non_loopback_interface() -> Result<IpAddr> {
        get_if_addrs()?
            .iter()
            .find(|i| !i.is_loopback())
            .map(|i| match i.addr {
                get_if_addrs::IfAddr::V4(ref addr) => Ok(IpAddr::V4(addr.ip)),
                _ => Err(Error::Error("no IPv4 address found".to_string())),
            })
            .unwrap_or(Err(Error::Error("no usable interface found".to_string())))
    }

    /// Main event loop body: transport events in, timer firings out to
    /// their transactions.
    async fn process(inner: &Arc<Self>, mut receiver: TransportReceiver) {
        let mut ticker = tokio::time::interval(inner.option.timer_interval);
        loop {
            tokio::select! {
                event = receiver.recv() => {
                    match event {
                        Some(TransportEvent::Incoming(msg, connection, source)) => {
                            if let Err(e) = Self::on_incoming(inner, msg, connection, source).await {
                                warn!("error handling incoming message: {}", e);
                            }
                        }
                        Some(TransportEvent::New(addr)) => {
                            debug!("new connection: {}", addr);
                        }
                        Some(TransportEvent::Closed(addr)) => {
                            debug!("connection closed: {}", addr);
                            inner.transport_layer.remove_connection(&addr);
                        }
                        None => return,
                    }
                }
                _ = ticker.tick() => {
                    for timer in inner.timers.poll(Instant::now()) {
                        if let Some(sender) = inner.find_transaction(timer.key()) {
                            sender.send(TransactionEvent::Timer(timer)).ok();
                        }
                    }
                }
            }
        }
    }

    async fn on_incoming(
        inner: &Arc<Self>,
        msg: SipMessage,
        connection: crate::transport::SipConnection,
        source: SipAddr,
    ) -> Result<()> {
        match msg {
            SipMessage::Request(req) => {
                let key = TransactionKey::from_request(&req, TransactionRole::Server)?;
                if let Some(sender) = inner.find_transaction(&key) {
                    sender
                        .send(TransactionEvent::Received(
                            SipMessage::Request(req),
                            Some(connection),
                        ))
                        .ok();
                    return Ok(());
                }

                // A CANCEL that matches nothing gets 481 straight from the
                // transaction layer (RFC 3261 section 9.2).
                if req.method == Method::Cancel {
                    let resp =
                        inner.make_response(&req, StatusCode::CallTransactionDoesNotExist, None);
                    connection.send(resp.into(), Some(&source)).await?;
                    return Ok(());
                }

                let incoming = inner.incoming_sender.read().unwrap().clone();
                match incoming {
                    Some(incoming) => {
                        let is_invite = req.method == Method::Invite;
                        let mut tx =
                            Transaction::new_server(key.clone(), req, inner.clone(), Some(connection));
                        tx.destination = Some(source);
                        if is_invite {
                            tx.schedule_trying_deadline();
                        }
                        incoming.send(tx).map_err(|e| {
                            Error::TransactionError(e.to_string(), key)
                        })?;
                    }
                    None => {
                        info!("no transaction user attached, dropping {}", req.method);
                        if req.method != Method::Ack {
                            let resp =
                                inner.make_response(&req, StatusCode::ServiceUnavailable, None);
                            connection.send(resp.into(), Some(&source)).await?;
                        }
                    }
                }
                Ok(())
            }
            SipMessage::Response(resp) => {
                let key = TransactionKey::from_response(&resp)?;
                match inner.find_transaction(&key) {
                    Some(sender) => {
                        sender
                            .send(TransactionEvent::Received(
                                SipMessage::Response(resp),
                                Some(connection),
                            ))
                            .ok();
                    }
                    None => {
                        // Stray responses are dropped per RFC 3261 section
                        // 18.1.2.
                        debug!("response matches no transaction: {}", key);
                    }
                }
                Ok(())
            }
        }
    }
}

/// The transaction-layer endpoint: owns the demux table, the timer wheel
/// and the transport layer, and turns unmatched inbound requests into new
/// server transactions for the UA layer.
pub struct Endpoint {
    pub inner: EndpointInnerRef,
}

impl Endpoint {
    /// Run the endpoint until the cancel token fires. Consumes the current
    /// task; spawn it or select on it.
    pub async fn serve(&self) {
        let (sender, receiver) = unbounded_channel();
        if let Err(e) = self.inner.transport_layer.serve(sender.clone()).await {
            warn!("transport layer failed to start: {}", e);
            return;
        }
        let inner = self.inner.clone();
        tokio::select! {
            _ = inner.cancel_token.cancelled() => {
                info!("endpoint cancelled");
            }
            _ = EndpointInner::process(&inner, receiver) => {}
        }
    }

    pub fn shutdown(&self) {
        self.inner.cancel_token.cancel();
    }

    /// The stream of new server transactions. Single consumer; the UA layer
    /// takes it once at startup.
    pub fn incoming_transactions(&self) -> TransactionReceiver {
        let (sender, receiver) = unbounded_channel();
        self.inner.incoming_sender.write().unwrap().replace(sender);
        receiver
    }
}

#[derive(Default)]
pub struct EndpointBuilder {
    user_agent: String,
    option: Option<EndpointOption>,
    cancel_token: Option<CancellationToken>,
    transport_layer: Option<TransportLayer>,
}

impl EndpointBuilder {
    pub fn new() -> Self {
        EndpointBuilder {
            user_agent: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            ..Default::default()
        }
    }

    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = user_agent.to_string();
        self
    }

    pub fn with_option(mut self, option: EndpointOption) -> Self {
        self.option = Some(option);
        self
    }

    pub fn with_cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = Some(cancel_token);
        self
    }

    pub fn with_transport_layer(mut self, transport_layer: TransportLayer) -> Self {
        self.transport_layer = Some(transport_layer);
        self
    }

    pub fn build(self) -> Endpoint {
        let cancel_token = self.cancel_token.unwrap_or_default();
        let transport_layer = self
            .transport_layer
            .unwrap_or_else(|| TransportLayer::new(cancel_token.child_token()));
        let option = self.option.unwrap_or_default();
        transport_layer.set_udp_mtu_threshold(option.udp_mtu_threshold);
        Endpoint {
            inner: Arc::new(EndpointInner {
                user_agent: self.user_agent,
                option,
                timers: Timer::new(),
                transport_layer,
                cancel_token,
                transactions: RwLock::new(HashMap::new()),
                incoming_sender: RwLock::new(None),
            }),
        }
    }
}
