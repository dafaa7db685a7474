mod cli;

use anyhow::{Context, Result};
use camstream::capture::{CaptureSettings, FrameCapture, JPEG_QUALITY};
use camstream::server::{self, ServerConfig};
use camstream::{ConnectionConfig, ConnectionOptions, ConnectionState, Credentials, StreamingConnection, WsConnector};
use cli::{Cli, Commands};
use log::{info, warn};
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse_args();

    match cli.command {
        Commands::Stream {
            host,
            port,
            user,
            password,
            secure,
            fps,
            width,
            height,
            duration,
        } => {
            let port = ConnectionConfig::parse_port(&port)?;
            let mut config = ConnectionConfig::new(host, port).with_secure(secure);
            if let Some(user) = user {
                let password = match password {
                    Some(p) => p,
                    None => rpassword::prompt_password(format!("Password for {}: ", user))?,
                };
                config = config.with_credentials(user, password);
            }
            let settings = CaptureSettings {
                width,
                height,
                upload_hz: fps,
                quality: JPEG_QUALITY,
                ..CaptureSettings::default()
            };
            stream(config, settings, duration.map(Duration::from_secs)).await?;
        }
        Commands::Serve {
            addr,
            user,
            password,
            save,
        } => {
            let credentials = match (user, password) {
                (Some(user), Some(password)) => Some(Credentials::new(user, password)),
                _ => None,
            };
            server::start_server(ServerConfig {
                addr,
                credentials,
                save_dir: save,
            })
            .await?;
        }
    }

    Ok(())
}

async fn stream(config: ConnectionConfig, settings: CaptureSettings, duration: Option<Duration>) -> Result<()> {
    let conn = StreamingConnection::new(WsConnector::default(), ConnectionOptions::default());
    conn.configure(config).context("Invalid server settings")?;

    let (auth_tx, mut auth_rx) = mpsc::unbounded_channel::<bool>();
    let _listener = conn.register_listener(move |accepted: bool| {
        let _ = auth_tx.send(accepted);
    });
    let mut states = conn.watch_state();

    conn.connect();
    let mut capture = FrameCapture::start(conn.clone(), settings)?;

    let deadline = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Interrupted");
                break Ok(());
            }
            _ = &mut deadline => {
                break Ok(());
            }
            Some(accepted) = auth_rx.recv() => {
                if !accepted {
                    break Err(anyhow::anyhow!("Authentication failed"));
                }
                info!("🎥 Streaming started");
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let state = states.borrow_and_update().clone();
                info!("📶 Connection {}", state);
                if let ConnectionState::Failed(reason) = state {
                    break Err(anyhow::anyhow!("Could not reach server: {}", reason));
                }
            }
        }
    };

    capture.stop();
    conn.disconnect();
    let stats = conn.stats();
    if stats.queued == 0 {
        warn!("⚠️ No frames were sent");
    }
    info!("📊 {} frames sent, {} dropped", stats.queued, stats.dropped);
    outcome
}
