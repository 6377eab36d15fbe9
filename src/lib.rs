//! A SIP User Agent library implementing the RFC 3261 signaling stack.
//!
//! The crate is layered the way the RFC describes the protocol:
//!
//! * [`message`] - the wire codec: methods, status codes, URIs, typed headers
//!   and message framing
//! * [`transport`] - UDP/TCP/TLS connections, stream framing state and the
//!   connection cache
//! * [`transaction`] - the four RFC 3261 transaction state machines with
//!   their retransmission timers, plus the [`transaction::endpoint::Endpoint`]
//!   that demultiplexes inbound traffic
//! * [`dialog`] - dialog identification and CSeq/route-set bookkeeping
//! * [`ua`] - the UAC/UAS cores driving request and response workflows on
//!   behalf of an application callback
//!
//! A minimal user agent builds an endpoint, attaches a transport layer and
//! hands incoming server transactions to a [`ua::UserAgent`]:
//!
//! ```rust,no_run
//! use sipua::transaction::endpoint::EndpointBuilder;
//! use sipua::transport::TransportLayer;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> sipua::Result<()> {
//! let token = CancellationToken::new();
//! let transport_layer = TransportLayer::new(token.child_token());
//! transport_layer
//!     .add_udp_listener("127.0.0.1:5060".parse().unwrap())
//!     .await?;
//! let endpoint = EndpointBuilder::new()
//!     .with_user_agent("sipua/0.1")
//!     .with_cancel_token(token)
//!     .with_transport_layer(transport_layer)
//!     .build();
//! endpoint.serve().await;
//! # Ok(())
//! # }
//! ```

pub mod dialog;
pub mod error;
pub mod message;
pub mod transaction;
pub mod transport;
pub mod ua;

pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;
