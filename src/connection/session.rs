//! Supervisor task behind one `connect()` call.

use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use super::{ConnectionState, Inner};
use crate::config::ConnectionConfig;
use crate::protocol::{self, AuthResult, AuthenticateRequest, ClientEvent, AUTH_REPLY};
use crate::transport::{describe_reason, Link, LinkEvent, TransportError};

/// How a single transport session ended
enum LinkOutcome {
    /// Nothing more to do: rejected, timed out, or superseded
    Stopped,
    /// Transport lost; eligible for an automatic retry
    Lost { reason: String, was_ready: bool },
}

enum Handshake {
    Accepted,
    Rejected,
    Lost(Option<String>),
}

pub(super) struct Session {
    inner: Arc<Inner>,
    generation: u64,
    token: CancellationToken,
    config: ConnectionConfig,
}

impl Session {
    pub(super) fn new(inner: Arc<Inner>, generation: u64, token: CancellationToken, config: ConnectionConfig) -> Self {
        Self {
            inner,
            generation,
            token,
            config,
        }
    }

    pub(super) async fn run(self) {
        let token = self.token.clone();
        tokio::select! {
            _ = token.cancelled() => debug!("Session {} cancelled", self.generation),
            _ = self.supervise() => {}
        }
    }

    /// Connect, handshake, stream; retry on transport loss within the budget
    async fn supervise(&self) {
        let policy = self.inner.options.reconnect;
        let url = self.config.url();
        let mut retries = 0u32;

        loop {
            let attempt = timeout(
                self.inner.options.connect_timeout,
                self.inner.connector.connect(&url, self.inner.options.frame_queue),
            )
            .await
            .unwrap_or_else(|_| Err(TransportError::Connect("timed out".to_string())));
            let outcome = match attempt {
                Ok(link) => self.run_link(link).await,
                Err(e) => {
                    let reason = e.to_string();
                    warn!("❌ Error while trying to connect: {}", reason);
                    LinkOutcome::Lost {
                        reason,
                        was_ready: false,
                    }
                }
            };

            let LinkOutcome::Lost { reason, was_ready } = outcome else {
                return;
            };
            if was_ready {
                retries = 0;
            }
            if retries >= policy.max_retries {
                warn!("❌ Reconnection failed after {} retries: {}", retries, reason);
                self.fail(reason);
                return;
            }
            retries += 1;
            if !self.transition(ConnectionState::Reconnecting) {
                return;
            }
            info!(
                "🔄 Reconnecting to the server (attempt {}/{}) in {:?}...",
                retries, policy.max_retries, policy.delay
            );
            sleep(policy.delay).await;
        }
    }

    async fn run_link(&self, link: Link) -> LinkOutcome {
        let Link { outbound, mut inbound } = link;
        info!("✅ Connected to the server");

        if let Some(creds) = &self.config.credentials {
            if !self.transition(ConnectionState::Authenticating) {
                return LinkOutcome::Stopped;
            }
            let token = protocol::generate_token();
            let request = AuthenticateRequest {
                username: creds.username.clone(),
                password: creds.password().to_string(),
                reply_event: AUTH_REPLY.to_string(),
                token: Some(token.clone()),
            };
            debug!("📤 Sending authenticate as {}", creds.username);
            if outbound.send(ClientEvent::Authenticate(request)).await.is_err() {
                return LinkOutcome::Lost {
                    reason: "Transport closed before authenticate".to_string(),
                    was_ready: false,
                };
            }

            let handshake = match timeout(self.inner.options.auth_timeout, await_auth_reply(&mut inbound, &token)).await
            {
                Ok(handshake) => handshake,
                Err(_) => {
                    warn!(
                        "⏰ No authentication reply within {:?}, treating as rejected",
                        self.inner.options.auth_timeout
                    );
                    Handshake::Rejected
                }
            };
            match handshake {
                Handshake::Accepted => {
                    info!("🔓 Authentication accepted");
                    if !self.become_ready(outbound, true) {
                        return LinkOutcome::Stopped;
                    }
                }
                Handshake::Rejected => {
                    warn!("🔒 Authentication rejected");
                    self.reject();
                    return LinkOutcome::Stopped;
                }
                Handshake::Lost(reason) => {
                    let reason = describe_reason(reason.as_deref()).to_string();
                    warn!("❌ Disconnected during authentication: {}", reason);
                    return LinkOutcome::Lost {
                        reason,
                        was_ready: false,
                    };
                }
            }
        } else if !self.become_ready(outbound, false) {
            return LinkOutcome::Stopped;
        }

        loop {
            match inbound.recv().await {
                Some(LinkEvent::Event(envelope)) => {
                    debug!("Ignoring server event {:?}", envelope.event);
                }
                Some(LinkEvent::Error(reason)) => {
                    warn!(
                        "⚠️ Something went wrong with the last event: {}",
                        describe_reason(reason.as_deref())
                    );
                }
                Some(LinkEvent::Closed(reason)) => {
                    let reason = describe_reason(reason.as_deref()).to_string();
                    warn!("🔌 Disconnected from the server: {}", reason);
                    return LinkOutcome::Lost {
                        reason,
                        was_ready: true,
                    };
                }
                None => {
                    warn!("🔌 Disconnected from the server: {}", describe_reason(None));
                    return LinkOutcome::Lost {
                        reason: describe_reason(None).to_string(),
                        was_ready: true,
                    };
                }
            }
        }
    }

    /// Apply `state` unless this session has been superseded
    fn transition(&self, state: ConnectionState) -> bool {
        let mut shared = self.inner.lock();
        if shared.generation != self.generation {
            return false;
        }
        self.inner.set_state(&mut shared, state);
        true
    }

    fn become_ready(&self, outbound: mpsc::Sender<ClientEvent>, authenticated: bool) -> bool {
        let mut shared = self.inner.lock();
        if shared.generation != self.generation {
            return false;
        }
        shared.outbound = Some(outbound);
        self.inner.set_state(&mut shared, ConnectionState::Ready);
        drop(shared);
        if authenticated {
            self.inner.notify(self.generation, true);
        }
        true
    }

    fn reject(&self) {
        let mut shared = self.inner.lock();
        if shared.generation != self.generation {
            return;
        }
        shared.session = None;
        self.inner.set_state(&mut shared, ConnectionState::Idle);
        drop(shared);
        self.inner.notify(self.generation, false);
    }

    fn fail(&self, reason: String) {
        let mut shared = self.inner.lock();
        if shared.generation != self.generation {
            return;
        }
        shared.session = None;
        self.inner.set_state(&mut shared, ConnectionState::Failed(reason));
    }
}

async fn await_auth_reply(inbound: &mut mpsc::UnboundedReceiver<LinkEvent>, token: &str) -> Handshake {
    loop {
        match inbound.recv().await {
            Some(LinkEvent::Event(envelope)) if envelope.event == AUTH_REPLY => {
                match envelope.payload::<AuthResult>() {
                    Ok(result) if result.answers(token) => {
                        return if result.accepted {
                            Handshake::Accepted
                        } else {
                            Handshake::Rejected
                        };
                    }
                    Ok(_) => debug!("Ignoring reply to an earlier handshake"),
                    Err(e) => warn!("⚠️ {}", e),
                }
            }
            Some(LinkEvent::Event(envelope)) => {
                debug!("Ignoring {:?} while authenticating", envelope.event);
            }
            Some(LinkEvent::Error(reason)) => {
                warn!(
                    "⚠️ Something went wrong with the last event: {}",
                    describe_reason(reason.as_deref())
                );
            }
            Some(LinkEvent::Closed(reason)) => return Handshake::Lost(reason),
            None => return Handshake::Lost(None),
        }
    }
}
