use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};

use crate::config::Credentials;
use crate::protocol::{self, AuthResult, ClientEvent, ErrorEvent, WireMessage};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: String,
    /// When set, clients must authenticate with these before frames are accepted
    pub credentials: Option<Credentials>,
    /// Directory to write received frames into
    pub save_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: format!("0.0.0.0:{}", crate::config::DEFAULT_PORT),
            credentials: None,
            save_dir: None,
        }
    }
}

/// Counters shared by all client connections
#[derive(Debug, Default)]
pub struct ServerStats {
    clients: AtomicU64,
    frames: AtomicU64,
    bytes: AtomicU64,
    auth_accepted: AtomicU64,
    auth_rejected: AtomicU64,
    frames_refused: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub clients: u64,
    pub frames: u64,
    pub bytes: u64,
    pub auth_accepted: u64,
    pub auth_rejected: u64,
    /// Frames received from clients that had not authenticated
    pub frames_refused: u64,
}

impl ServerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            clients: self.clients.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            auth_accepted: self.auth_accepted.load(Ordering::Relaxed),
            auth_rejected: self.auth_rejected.load(Ordering::Relaxed),
            frames_refused: self.frames_refused.load(Ordering::Relaxed),
        }
    }
}

/// Receiving end of a camera stream
/// - Answers `authenticate` on the reply event the client asked for
/// - Counts every `receiveImage` frame and optionally writes it to disk
pub struct ImageServer {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    stats: Arc<ServerStats>,
}

impl ImageServer {
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.addr)
            .await
            .with_context(|| format!("Failed to bind {}", config.addr))?;
        if let Some(dir) = &config.save_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(Self {
            listener,
            config: Arc::new(config),
            stats: Arc::new(ServerStats::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        self.stats.clone()
    }

    pub async fn run(self) -> Result<()> {
        info!("🖼️  Image server listening on {}", self.local_addr()?);
        if self.config.credentials.is_some() {
            info!("🔒 Clients must authenticate");
        }

        loop {
            let (stream, peer) = self.listener.accept().await?;

            let config = self.config.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, config, stats).await {
                    let err_str = e.to_string();
                    // Non-WebSocket connections (scanners, health checks) are not worth an error
                    if !err_str.contains("Connection: upgrade") && !err_str.contains("protocol error") {
                        error!("❌ Connection error from {}: {}", peer, e);
                    }
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<ServerConfig>,
    stats: Arc<ServerStats>,
) -> Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    stats.clients.fetch_add(1, Ordering::Relaxed);
    info!("🆕 Client connected: {}", peer);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<WireMessage>();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let frame = match msg {
                WireMessage::Text(text) => WsMessage::Text(text),
                WireMessage::Binary(data) => WsMessage::Binary(data),
            };
            if ws_sender.send(frame).await.is_err() {
                break;
            }
        }
    });

    let mut authenticated = config.credentials.is_none();
    let mut seq: u64 = 0;

    while let Some(msg) = ws_receiver.next().await {
        let wire = match msg {
            Ok(WsMessage::Binary(data)) => WireMessage::Binary(data),
            Ok(WsMessage::Text(text)) => WireMessage::Text(text),
            Ok(WsMessage::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        match ClientEvent::decode(wire) {
            Ok(ClientEvent::Image(jpeg)) => {
                if !authenticated {
                    stats.frames_refused.fetch_add(1, Ordering::Relaxed);
                    debug!("Ignoring {} byte frame from unauthenticated {}", jpeg.len(), peer);
                    continue;
                }
                stats.frames.fetch_add(1, Ordering::Relaxed);
                stats.bytes.fetch_add(jpeg.len() as u64, Ordering::Relaxed);
                debug!("📥 Frame {} from {}: {} bytes", seq, peer, jpeg.len());
                if let Some(dir) = &config.save_dir {
                    let path = dir.join(frame_file_name(&peer, seq));
                    if let Err(e) = tokio::fs::write(&path, &jpeg).await {
                        warn!("⚠️ Could not save {}: {}", path.display(), e);
                    }
                }
                seq += 1;
            }
            Ok(ClientEvent::Authenticate(req)) => {
                let accepted = match &config.credentials {
                    Some(expected) => expected.username == req.username && expected.password() == req.password,
                    None => true,
                };
                if accepted {
                    stats.auth_accepted.fetch_add(1, Ordering::Relaxed);
                    info!("🔓 {} authenticated as {}", peer, req.username);
                } else {
                    stats.auth_rejected.fetch_add(1, Ordering::Relaxed);
                    warn!("🔒 {} failed to authenticate as {}", peer, req.username);
                }
                authenticated = accepted;
                let reply = AuthResult {
                    accepted,
                    token: req.token,
                };
                tx.send(protocol::encode_server_event(&req.reply_event, &reply)?)?;
            }
            Err(e) => {
                warn!("⚠️ Bad event from {}: {}", peer, e);
                let event = ErrorEvent {
                    reason: Some(e.to_string()),
                };
                tx.send(protocol::encode_server_event(protocol::ERROR, &event)?)?;
            }
        }
    }

    info!("🔌 Client disconnected: {} ({} frames)", peer, seq);
    send_task.abort();
    Ok(())
}

fn frame_file_name(peer: &SocketAddr, seq: u64) -> String {
    let client: String = peer
        .to_string()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}-{:06}.jpg", client, seq)
}

pub async fn start_server(config: ServerConfig) -> Result<()> {
    let server = ImageServer::bind(config).await?;
    server.run().await
}
