use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use super::{Connector, Link, LinkEvent, TransportError};
use crate::protocol::{self, ClientEvent, ErrorEvent, WireMessage};

/// WebSocket transport built on tokio-tungstenite
#[derive(Debug, Clone)]
pub struct WsConnector {
    /// Ping period; the link is declared lost if no pong arrives within `pong_timeout`
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

impl Connector for WsConnector {
    fn connect(&self, url: &str, queue: usize) -> BoxFuture<'static, Result<Link, TransportError>> {
        let url = url.to_string();
        let ping_interval = self.ping_interval;
        let pong_timeout = self.pong_timeout;
        async move {
            debug!("🔌 Opening WebSocket to {}", url);
            let (ws_stream, response) = connect_async(url.as_str())
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            info!("✅ WebSocket connected to {} (status {})", url, response.status());

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientEvent>(queue.max(1));
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<LinkEvent>();
            let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();

            // Receiver task
            let inbound_recv = inbound_tx.clone();
            tokio::spawn(async move {
                while let Some(msg) = ws_receiver.next().await {
                    match msg {
                        Ok(WsMessage::Text(text)) => match protocol::decode_server_event(&text) {
                            Ok(envelope) if envelope.event == protocol::ERROR => {
                                let reason = envelope.payload::<ErrorEvent>().ok().and_then(|e| e.reason);
                                let _ = inbound_recv.send(LinkEvent::Error(reason));
                            }
                            Ok(envelope) => {
                                let _ = inbound_recv.send(LinkEvent::Event(envelope));
                            }
                            Err(e) => {
                                let _ = inbound_recv.send(LinkEvent::Error(Some(e.to_string())));
                            }
                        },
                        Ok(WsMessage::Binary(data)) => {
                            trace!("Ignoring {} byte binary frame from server", data.len());
                        }
                        Ok(WsMessage::Pong(_)) => {
                            let _ = pong_tx.send(());
                        }
                        Ok(WsMessage::Close(frame)) => {
                            let reason = frame.map(|f| f.reason.to_string());
                            let _ = inbound_recv.send(LinkEvent::Closed(reason));
                            return;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            let _ = inbound_recv.send(LinkEvent::Closed(Some(e.to_string())));
                            return;
                        }
                    }
                }
                let _ = inbound_recv.send(LinkEvent::Closed(Some("Receiver stream ended".to_string())));
            });

            // Sender task: drains the outbound queue and keeps the link alive with pings.
            // Ends (closing the socket) once every outbound sender is dropped.
            tokio::spawn(async move {
                let mut ping_interval = tokio::time::interval(ping_interval);
                ping_interval.tick().await;
                let mut pending_pong = false;
                let mut pong_deadline = tokio::time::Instant::now();

                loop {
                    tokio::select! {
                        _ = tokio::time::sleep_until(pong_deadline), if pending_pong => {
                            let _ = inbound_tx.send(LinkEvent::Closed(Some("Pong timeout".to_string())));
                            break;
                        }
                        _ = ping_interval.tick() => {
                            if pending_pong {
                                // Previous ping still unanswered; keep its deadline
                                continue;
                            }
                            if ws_sender.send(WsMessage::Ping(vec![])).await.is_err() {
                                let _ = inbound_tx.send(LinkEvent::Closed(Some("Failed to send ping".to_string())));
                                break;
                            }
                            pending_pong = true;
                            pong_deadline = tokio::time::Instant::now() + pong_timeout;
                        }
                        Some(_) = pong_rx.recv() => {
                            pending_pong = false;
                        }
                        outgoing = outbound_rx.recv() => {
                            let Some(event) = outgoing else {
                                let _ = ws_sender.close().await;
                                debug!("🔚 WebSocket closed by client");
                                break;
                            };
                            let name = event.name();
                            let frame = match event.encode() {
                                Ok(WireMessage::Text(text)) => WsMessage::Text(text),
                                Ok(WireMessage::Binary(data)) => WsMessage::Binary(data),
                                Err(e) => {
                                    warn!("⚠️ Could not encode {} event: {}", name, e);
                                    continue;
                                }
                            };
                            if ws_sender.send(frame).await.is_err() {
                                let _ = inbound_tx.send(LinkEvent::Closed(Some("Send failed".to_string())));
                                break;
                            }
                        }
                    }
                }
            });

            Ok(Link {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, ConnectionOptions, ReconnectPolicy};
    use crate::connection::{ConnectionState, StreamingConnection};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_unanswered_pings_close_an_idle_link() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Upgrade, then never read so no pong is ever written
            let _ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            std::future::pending::<()>().await;
        });

        let connector = WsConnector {
            ping_interval: Duration::from_millis(100),
            pong_timeout: Duration::from_millis(200),
        };
        let mut link = connector.connect(&format!("ws://{}/", addr), 4).await.unwrap();

        let event = timeout(Duration::from_secs(5), link.inbound.recv()).await.unwrap();
        assert_eq!(event, Some(LinkEvent::Closed(Some("Pong timeout".to_string()))));
    }

    #[tokio::test]
    async fn test_stalled_upgrade_counts_as_failed_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            // Accept TCP but never answer the HTTP upgrade
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let options = ConnectionOptions {
            connect_timeout: Duration::from_millis(200),
            reconnect: ReconnectPolicy {
                max_retries: 1,
                delay: Duration::from_millis(50),
            },
            ..ConnectionOptions::default()
        };
        let conn = StreamingConnection::new(WsConnector::default(), options);
        conn.configure(ConnectionConfig::new("127.0.0.1", port)).unwrap();
        let mut states = conn.watch_state();
        conn.connect();

        let state = timeout(
            Duration::from_secs(5),
            states.wait_for(|s| matches!(s, ConnectionState::Failed(_))),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert_eq!(state, ConnectionState::Failed("Connect failed: timed out".to_string()));
    }
}
