//! Scripted in-memory connector for exercising the state machine.

use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::{Connector, Link, LinkEvent, TransportError};
use crate::protocol::{ClientEvent, Envelope, AUTH_REPLY};

/// What the next connect attempt does
#[derive(Debug, Clone)]
pub enum Step {
    Accept,
    Refuse(String),
    /// Never completes
    Hang,
}

/// Server side of an accepted mock link
pub struct MockPeer {
    pub sent: mpsc::Receiver<ClientEvent>,
    pub events: mpsc::UnboundedSender<LinkEvent>,
}

impl MockPeer {
    pub fn reply_auth(&self, accepted: bool) {
        let data = serde_json::json!({ "accepted": accepted });
        let _ = self.events.send(LinkEvent::Event(Envelope::new(AUTH_REPLY, data)));
    }

    pub fn drop_connection(&self, reason: &str) {
        let _ = self.events.send(LinkEvent::Closed(Some(reason.to_string())));
    }

    /// Everything the client has queued so far
    pub fn drain(&mut self) -> Vec<ClientEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.sent.try_recv() {
            out.push(event);
        }
        out
    }
}

#[derive(Clone)]
pub struct MockConnector {
    script: Arc<Mutex<VecDeque<Step>>>,
    /// Used once the script runs out
    fallback: Arc<Mutex<Step>>,
    attempts: Arc<AtomicUsize>,
    urls: Arc<Mutex<Vec<String>>>,
    peer_tx: mpsc::UnboundedSender<MockPeer>,
}

impl MockConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MockPeer>) {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let connector = Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            fallback: Arc::new(Mutex::new(Step::Accept)),
            attempts: Arc::new(AtomicUsize::new(0)),
            urls: Arc::new(Mutex::new(Vec::new())),
            peer_tx,
        };
        (connector, peer_rx)
    }

    pub fn push(&self, step: Step) {
        self.script.lock().unwrap().push_back(step);
    }

    pub fn set_fallback(&self, step: Step) {
        *self.fallback.lock().unwrap() = step;
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

impl Connector for MockConnector {
    fn connect(&self, url: &str, queue: usize) -> BoxFuture<'static, Result<Link, TransportError>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_string());
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.lock().unwrap().clone());

        match step {
            Step::Accept => {
                let (outbound, sent) = mpsc::channel(queue.max(1));
                let (events, inbound) = mpsc::unbounded_channel();
                let _ = self.peer_tx.send(MockPeer { sent, events });
                future::ready(Ok(Link { outbound, inbound })).boxed()
            }
            Step::Refuse(reason) => future::ready(Err(TransportError::Connect(reason))).boxed(),
            Step::Hang => future::pending::<Result<Link, TransportError>>().boxed(),
        }
    }
}
