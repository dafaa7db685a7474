//! Camera frame streaming client.
//!
//! A [`StreamingConnection`] owns one persistent WebSocket to an image
//! server, optionally authenticates with a username/password handshake, and
//! forwards JPEG frames best-effort while `Ready`. Transport loss is retried
//! on a fixed budget; outcomes are observed through state snapshots and auth
//! listeners.
//!
//! ```rust,no_run
//! use camstream::{ConnectionConfig, ConnectionOptions, StreamingConnection, WsConnector};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let conn = StreamingConnection::new(WsConnector::default(), ConnectionOptions::default());
//! conn.configure(ConnectionConfig::new("10.0.0.5", 9000).with_credentials("user", "secret"))?;
//! let _listener = conn.register_listener(|accepted: bool| println!("authenticated: {}", accepted));
//! conn.connect();
//!
//! // From the capture thread, at its own cadence:
//! conn.send_frame(vec![0xFF, 0xD8, 0xFF, 0xD9]);
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod server;
pub mod transport;

pub use config::{ConfigError, ConnectionConfig, ConnectionOptions, Credentials, ReconnectPolicy};
pub use connection::{AuthListener, ConnectionState, FrameStats, ListenerHandle, StreamingConnection};
pub use transport::{Connector, TransportError, WsConnector};
