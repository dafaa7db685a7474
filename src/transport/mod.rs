//! Transport seam between the connection state machine and the network.
//!
//! A `Connector` opens one persistent event channel to the server and hands
//! back a `Link`: a bounded outbound queue of client events plus an inbound
//! stream of server events and lifecycle notifications. Dropping the `Link`
//! closes the transport.

pub mod websocket;

#[cfg(test)]
pub(crate) mod mock;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::{ClientEvent, Envelope, ProtocolError};

pub use websocket::WsConnector;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Transport closed")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Something the transport observed on the inbound side
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A named event from the server
    Event(Envelope),
    /// Non-fatal problem (server `error` event, undecodable frame)
    Error(Option<String>),
    /// The transport is gone; nothing else will arrive
    Closed(Option<String>),
}

/// An open transport
pub struct Link {
    pub outbound: mpsc::Sender<ClientEvent>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

pub trait Connector: Send + Sync + 'static {
    /// Open a transport to `url`. `queue` bounds the outbound channel.
    fn connect(&self, url: &str, queue: usize) -> BoxFuture<'static, Result<Link, TransportError>>;
}

/// Human readable reason for a lifecycle log line
pub fn describe_reason(reason: Option<&str>) -> &str {
    reason.filter(|r| !r.is_empty()).unwrap_or("no reason received.")
}
