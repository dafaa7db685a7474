//! The streaming connection: one long-lived handle owning the transport to
//! the image server.
//!
//! All state transitions and listener calls happen under a single mutex;
//! network work runs on a supervisor task spawned by `connect()`. Callers
//! never wait on the network: outcomes are observable through `state()`,
//! `watch_state()` and registered auth listeners.

mod session;


use log::{debug, info, trace, warn};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, ConnectionConfig, ConnectionOptions};
use crate::protocol::ClientEvent;
use crate::transport::Connector;
use session::Session;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Unconfigured,
    /// Configured, transport closed
    Idle,
    Connecting,
    Authenticating,
    /// Frames are being accepted
    Ready,
    Reconnecting,
    Failed(String),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Unconfigured => write!(f, "unconfigured"),
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Authenticating => write!(f, "authenticating"),
            ConnectionState::Ready => write!(f, "ready"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

/// Observer of authentication outcomes.
///
/// Never fires after `disconnect()`, `configure()` or the listener's own
/// unregistration has returned. A listener may call back into the
/// connection, for example to `connect()` again after a rejection.
pub trait AuthListener: Send + Sync + 'static {
    fn on_auth_result(&self, accepted: bool);
}

impl<F> AuthListener for F
where
    F: Fn(bool) + Send + Sync + 'static,
{
    fn on_auth_result(&self, accepted: bool) {
        self(accepted)
    }
}

/// Frame counters since the connection was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Handed to the transport
    pub queued: u64,
    /// Discarded: not ready, or the transport queue was full
    pub dropped: u64,
}

struct Shared {
    config: Option<ConnectionConfig>,
    state: ConnectionState,
    /// Bumped on every teardown; a session whose generation is stale is ignored
    generation: u64,
    session: Option<CancellationToken>,
    /// Present only while `Ready`
    outbound: Option<mpsc::Sender<ClientEvent>>,
    listeners: Vec<(u64, Arc<dyn AuthListener>)>,
    next_listener_id: u64,
    /// Thread currently running listeners, if any
    dispatching: Option<ThreadId>,
}

struct Inner {
    shared: Mutex<Shared>,
    /// Held while listeners run
    dispatch: Mutex<()>,
    state_tx: watch::Sender<ConnectionState>,
    connector: Arc<dyn Connector>,
    options: ConnectionOptions,
    runtime: Handle,
    frames_queued: AtomicU64,
    frames_dropped: AtomicU64,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, shared: &mut Shared, state: ConnectionState) {
        if shared.state == state {
            return;
        }
        if state != ConnectionState::Ready {
            shared.outbound = None;
        }
        debug!("🔀 Connection state: {} -> {}", shared.state, state);
        shared.state = state.clone();
        self.state_tx.send_replace(state);
    }

    /// Cancel the running session (if any) and invalidate its generation
    fn teardown(&self, shared: &mut Shared) {
        if let Some(token) = shared.session.take() {
            token.cancel();
        }
        shared.outbound = None;
        shared.generation += 1;
    }

    /// Deliver an auth result for `generation`, unless it has been torn down
    fn notify(&self, generation: u64, accepted: bool) {
        let _dispatch = self.dispatch.lock().unwrap_or_else(PoisonError::into_inner);
        let listeners: Vec<Arc<dyn AuthListener>> = {
            let mut shared = self.lock();
            if shared.generation != generation {
                return;
            }
            shared.dispatching = Some(thread::current().id());
            shared.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in &listeners {
            listener.on_auth_result(accepted);
        }
        self.lock().dispatching = None;
    }

    /// Release the state lock and wait for in-flight listener calls to finish.
    /// Returns at once when called from a listener.
    fn settle(&self, shared: MutexGuard<'_, Shared>) {
        let reentrant = shared.dispatching == Some(thread::current().id());
        drop(shared);
        if !reentrant {
            drop(self.dispatch.lock().unwrap_or_else(PoisonError::into_inner));
        }
    }
}

/// Handle to the process-wide streaming connection.
///
/// Cheap to clone; every clone drives the same state machine. Create one at
/// the application root and pass it to whoever needs it.
#[derive(Clone)]
pub struct StreamingConnection {
    inner: Arc<Inner>,
}

impl StreamingConnection {
    /// Create an unconfigured connection bound to the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn new(connector: impl Connector, options: ConnectionOptions) -> Self {
        Self::with_runtime(connector, options, Handle::current())
    }

    pub fn with_runtime(connector: impl Connector, options: ConnectionOptions, runtime: Handle) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Unconfigured);
        Self {
            inner: Arc::new(Inner {
                shared: Mutex::new(Shared {
                    config: None,
                    state: ConnectionState::Unconfigured,
                    generation: 0,
                    session: None,
                    outbound: None,
                    listeners: Vec::new(),
                    next_listener_id: 0,
                    dispatching: None,
                }),
                dispatch: Mutex::new(()),
                state_tx,
                connector: Arc::new(connector),
                options,
                runtime,
                frames_queued: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Validate and store a server config. Any existing transport is closed
    /// first; no network I/O is started.
    pub fn configure(&self, config: ConnectionConfig) -> Result<(), ConfigError> {
        config.validate()?;

        let mut shared = self.inner.lock();
        if shared.session.is_some() {
            info!("🔄 Reconfiguring: closing existing transport");
        }
        self.inner.teardown(&mut shared);
        info!(
            "⚙️  Configured for {} ({})",
            config.url(),
            if config.credentials.is_some() {
                "with credentials"
            } else {
                "anonymous"
            }
        );
        shared.config = Some(config);
        self.inner.set_state(&mut shared, ConnectionState::Idle);
        self.inner.settle(shared);
        Ok(())
    }

    /// Start connecting in the background. No-op while a connection attempt
    /// is already in flight or established, or before `configure`.
    pub fn connect(&self) {
        let mut shared = self.inner.lock();
        match shared.state {
            ConnectionState::Unconfigured => {
                warn!("⚠️ Cannot connect: connection is not configured");
                return;
            }
            ConnectionState::Connecting | ConnectionState::Authenticating | ConnectionState::Ready => {
                debug!("connect() ignored while {}", shared.state);
                return;
            }
            ConnectionState::Idle | ConnectionState::Reconnecting | ConnectionState::Failed(_) => {}
        }
        let Some(config) = shared.config.clone() else {
            warn!("⚠️ Cannot connect: connection is not configured");
            return;
        };

        self.inner.teardown(&mut shared);
        let token = CancellationToken::new();
        shared.session = Some(token.clone());
        self.inner.set_state(&mut shared, ConnectionState::Connecting);
        info!("📡 Connecting to {}", config.url());

        let session = Session::new(Arc::clone(&self.inner), shared.generation, token, config);
        drop(shared);
        self.inner.runtime.spawn(session.run());
    }

    /// Best-effort, non-blocking send of one encoded frame. Dropped silently
    /// unless the connection is `Ready` and the transport has room.
    pub fn send_frame(&self, frame: Vec<u8>) {
        let shared = self.inner.lock();
        let queued = match (&shared.state, &shared.outbound) {
            (ConnectionState::Ready, Some(outbound)) => {
                let len = frame.len();
                match outbound.try_send(ClientEvent::Image(frame)) {
                    Ok(()) => {
                        trace!("📤 Queued {} byte frame", len);
                        true
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        trace!("Transport busy, dropping {} byte frame", len);
                        false
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        trace!("Transport closed, dropping {} byte frame", len);
                        false
                    }
                }
            }
            (state, _) => {
                trace!("Not ready ({}), dropping frame", state);
                false
            }
        };
        drop(shared);

        if queued {
            self.inner.frames_queued.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Close the transport, cancel pending retries and any handshake in
    /// flight, and go back to `Idle`. The config is kept.
    pub fn disconnect(&self) {
        let mut shared = self.inner.lock();
        if shared.session.is_none()
            && matches!(shared.state, ConnectionState::Idle | ConnectionState::Unconfigured)
        {
            return;
        }
        self.inner.teardown(&mut shared);
        if shared.config.is_some() {
            self.inner.set_state(&mut shared, ConnectionState::Idle);
        }
        self.inner.settle(shared);
        info!("🔌 Disconnected");
    }

    /// Subscribe to authentication results. The subscription lasts until the
    /// returned handle is dropped or unregistered.
    #[must_use = "dropping the handle unregisters the listener"]
    pub fn register_listener(&self, listener: impl AuthListener) -> ListenerHandle {
        let mut shared = self.inner.lock();
        let id = shared.next_listener_id;
        shared.next_listener_id += 1;
        shared.listeners.push((id, Arc::new(listener)));
        ListenerHandle {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Drop every registered listener
    pub fn unregister_listeners(&self) {
        let mut shared = self.inner.lock();
        shared.listeners.clear();
        self.inner.settle(shared);
    }

    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    /// Snapshot of the current state
    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    /// Receiver that sees every subsequent state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn config(&self) -> Option<ConnectionConfig> {
        self.inner.lock().config.clone()
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            queued: self.inner.frames_queued.load(Ordering::Relaxed),
            dropped: self.inner.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Registration of one `AuthListener`
pub struct ListenerHandle {
    id: u64,
    inner: Weak<Inner>,
}

impl ListenerHandle {
    pub fn unregister(self) {
        // Drop does the work
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut shared = inner.lock();
            shared.listeners.retain(|(id, _)| *id != self.id);
            inner.settle(shared);
        }
    }
}
