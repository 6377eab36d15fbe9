use crate::{
    message::{
        parser::{self, StartLine},
        Headers, SipMessage,
    },
    transport::{
        connection::{KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE},
        SipAddr, SipConnection, TransportEvent, TransportSender,
    },
    Error, Result,
};
use bytes::{Buf, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};
use tokio_util::codec::Decoder;
use tracing::{debug, error, info};

pub(super) const MAX_SIP_MESSAGE_SIZE: usize = 65535;

/// Framing state for one stream connection.
///
/// `Before` absorbs the CRLF padding RFC 3261 allows between messages,
/// `Headers` scans for the CRLF CRLF boundary, `Body` waits for
/// Content-Length bytes. The scan offset backs up three bytes so a boundary
/// split across two reads is still found.
enum FramerState {
    Before,
    Headers {
        scanned: usize,
    },
    Body {
        start_line: StartLine,
        headers: Headers,
        content_length: usize,
    },
}

pub struct SipCodec {
    state: FramerState,
}

impl SipCodec {
    pub fn new() -> Self {
        Self {
            state: FramerState::Before,
        }
    }
}

impl Default for SipCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub enum SipCodecType {
    Message(SipMessage),
    KeepaliveRequest,
}

impl Decoder for SipCodec {
    type Item = SipCodecType;
    type Error = crate::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match &mut self.state {
                FramerState::Before => {
                    if src.len() >= KEEPALIVE_REQUEST.len()
                        && &src[..KEEPALIVE_REQUEST.len()] == KEEPALIVE_REQUEST
                    {
                        src.advance(KEEPALIVE_REQUEST.len());
                        return Ok(Some(SipCodecType::KeepaliveRequest));
                    }
                    // Lone CRLFs before the start line are padding.
                    let skip = src
                        .iter()
                        .take_while(|b| **b == b'\r' || **b == b'\n')
                        .count();
                    if skip > 0 {
                        src.advance(skip);
                    }
                    if src.is_empty() {
                        return Ok(None);
                    }
                    self.state = FramerState::Headers { scanned: 0 };
                }
                FramerState::Headers { scanned } => {
                    let from = scanned.saturating_sub(3);
                    match parser::find_header_end(src, from) {
                        None => {
                            if src.len() > MAX_SIP_MESSAGE_SIZE {
                                return Err(Error::BadRequest(
                                    "message exceeds maximum size".to_string(),
                                ));
                            }
                            *scanned = src.len();
                            return Ok(None);
                        }
                        Some(head_end) => {
                            let head = std::str::from_utf8(&src[..head_end]).map_err(|_| {
                                Error::BadRequest("header section is not valid UTF-8".to_string())
                            })?;
                            let (first_line, block) = match head.split_once('\n') {
                                Some((line, block)) => (line.trim_end_matches('\r'), block),
                                None => (head, ""),
                            };
                            let start_line = parser::parse_start_line(first_line)?;
                            let headers = parser::parse_header_block(block)?;
                            // Stream framing has no datagram boundary to fall
                            // back on: Content-Length is mandatory.
                            let content_length = match headers.content_length() {
                                Some(len) => len as usize,
                                None => {
                                    return Err(match &start_line {
                                        StartLine::Request { .. } => {
                                            Error::BadRequest("no_content_length".to_string())
                                        }
                                        StartLine::Response { .. } => {
                                            Error::BadResponse("no_content_length".to_string())
                                        }
                                    });
                                }
                            };
                            src.advance(head_end);
                            self.state = FramerState::Body {
                                start_line,
                                headers,
                                content_length,
                            };
                        }
                    }
                }
                FramerState::Body {
                    start_line,
                    headers,
                    content_length,
                } => {
                    if src.len() < *content_length {
                        return Ok(None);
                    }
                    let body = src.split_to(*content_length).to_vec();
                    let msg =
                        parser::build_message(start_line.clone(), std::mem::take(headers), body);
                    self.state = FramerState::Before;
                    return Ok(Some(SipCodecType::Message(msg)));
                }
            }
        }
    }
}

pub struct StreamConnectionInner<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub local_addr: SipAddr,
    pub remote_addr: SipAddr,
    pub read_half: Mutex<Option<R>>,
    pub write_half: Mutex<W>,
}

impl<R, W> StreamConnectionInner<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(local_addr: SipAddr, remote_addr: SipAddr, read_half: R, write_half: W) -> Self {
        Self {
            local_addr,
            remote_addr,
            read_half: Mutex::new(Some(read_half)),
            write_half: Mutex::new(write_half),
        }
    }

    pub async fn send_message(&self, msg: SipMessage) -> Result<()> {
        self.send_raw(&msg.to_bytes()).await
    }

    pub async fn send_raw(&self, data: &[u8]) -> Result<()> {
        let mut lock = self.write_half.lock().await;
        lock.write_all(data).await?;
        lock.flush().await?;
        Ok(())
    }

    /// Read loop: reassemble messages with `SipCodec`, stamp the source on
    /// the topmost Via and hand them to the endpoint. A framing error is
    /// fatal for the connection.
    pub async fn serve_loop(
        &self,
        sender: TransportSender,
        connection: SipConnection,
    ) -> Result<()> {
        let mut read_half = match self.read_half.lock().await.take() {
            Some(read_half) => read_half,
            None => {
                error!("connection already being served: {}", self.remote_addr);
                return Ok(());
            }
        };

        let remote_addr = self.remote_addr.clone();
        let mut codec = SipCodec::new();
        let mut buffer = BytesMut::with_capacity(MAX_SIP_MESSAGE_SIZE);
        let mut read_buf = vec![0u8; 8192];

        loop {
            use tokio::io::AsyncReadExt;
            match read_half.read(&mut read_buf).await {
                Ok(0) => {
                    info!("connection closed: {}", remote_addr);
                    break;
                }
                Ok(n) => {
                    buffer.extend_from_slice(&read_buf[..n]);
                    loop {
                        match codec.decode(&mut buffer) {
                            Ok(Some(SipCodecType::Message(msg))) => {
                                debug!("received message from {}: {}", remote_addr, msg);
                                let remote_socket_addr = remote_addr.get_socketaddr()?;
                                let msg = SipConnection::update_msg_received(
                                    msg,
                                    remote_socket_addr,
                                    remote_addr.transport(),
                                )?;
                                sender.send(TransportEvent::Incoming(
                                    msg,
                                    connection.clone(),
                                    remote_addr.clone(),
                                ))?;
                            }
                            Ok(Some(SipCodecType::KeepaliveRequest)) => {
                                self.send_raw(KEEPALIVE_RESPONSE).await?;
                            }
                            Ok(None) => break,
                            Err(e) => {
                                error!("framing error from {}: {}", remote_addr, e);
                                sender
                                    .send(TransportEvent::Closed(remote_addr.clone()))
                                    .ok();
                                return Err(e);
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("error reading from {}: {}", remote_addr, e);
                    break;
                }
            }
        }
        sender.send(TransportEvent::Closed(remote_addr)).ok();
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        let mut write_half = self.write_half.lock().await;
        write_half.shutdown().await?;
        Ok(())
    }
}

/// Behavior shared by the concrete stream transports.
#[async_trait::async_trait]
pub trait StreamConnection: Send + Sync + 'static {
    fn get_addr(&self) -> &SipAddr;
    async fn send_message(&self, msg: SipMessage) -> Result<()>;
    async fn send_raw(&self, data: &[u8]) -> Result<()>;
    async fn serve_loop(&self, sender: TransportSender) -> Result<()>;
    async fn close(&self) -> Result<()>;
}
