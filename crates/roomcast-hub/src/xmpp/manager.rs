//! Connection manager for the single upstream protocol connection.
//!
//! Lifecycle per attempt is strictly linear: disconnected -> connecting ->
//! connected. There is no backoff in this layer; reconnection policy belongs
//! to the caller (the hub service drives it from context heartbeats).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use roomcast_core::protocol::stanza::Element;
use roomcast_core::provider::StorageProvider;
use roomcast_core::{Result, RoomcastError};

/// Storage key for the last credentials that produced a working connection.
const WORKING_CREDENTIALS_KEY: &str = "xmpp:working-credentials";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub jid: String,
    pub password: String,
    pub resource: String,
}

/// What a live session reports upward.
#[derive(Debug)]
pub enum SessionEvent {
    Stanza(Element),
    Closed,
}

/// One established connection: a send half plus its event stream.
pub struct XmppSession {
    pub outbound: mpsc::Sender<Element>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// One connection attempt. The concrete socket/TLS/bind machinery lives
/// outside this crate; tests and the demo plug in loopback transports.
#[async_trait]
pub trait XmppTransport: Send + Sync {
    async fn connect(&self, creds: &Credentials) -> Result<XmppSession>;
}

/// Read-only traffic counters for diagnostics.
#[derive(Debug, Default)]
pub struct TrafficStats {
    connects: AtomicU64,
    stanzas_in: AtomicU64,
    stanzas_out: AtomicU64,
}

impl TrafficStats {
    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            connects: self.connects.load(Ordering::Relaxed),
            stanzas_in: self.stanzas_in.load(Ordering::Relaxed),
            stanzas_out: self.stanzas_out.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficSnapshot {
    pub connects: u64,
    pub stanzas_in: u64,
    pub stanzas_out: u64,
}

/// Events surfaced to the application layer.
#[derive(Debug)]
pub enum XmppEvent {
    Online,
    Stanza(Element),
    Offline,
}

/// Anything that accepts outbound stanzas (the manager, or a test double).
#[async_trait]
pub trait StanzaSink: Send + Sync {
    async fn send_stanza(&self, stanza: Element);
}

enum XmppCmd {
    Send(Element),
    EnsureConnected,
    Stop,
}

/// Cloneable handle to the connection actor.
#[derive(Clone)]
pub struct XmppConnectionManager {
    cmd_tx: mpsc::UnboundedSender<XmppCmd>,
    stats: Arc<TrafficStats>,
}

impl XmppConnectionManager {
    pub fn start(
        transport: Arc<dyn XmppTransport>,
        creds: Credentials,
        storage: Arc<dyn StorageProvider>,
        events_tx: mpsc::UnboundedSender<XmppEvent>,
    ) -> Self {
        let stats = Arc::new(TrafficStats::default());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let actor = XmppActor {
            transport,
            creds,
            storage,
            stats: Arc::clone(&stats),
            events_tx,
            cmd_rx,
            state: LinkState::Disconnected,
            queue: VecDeque::new(),
            session_events: None,
            connect_rx: None,
        };
        tokio::spawn(actor.run());

        Self { cmd_tx, stats }
    }

    /// Queue or send one stanza. Connection presence (no destination) is
    /// dropped rather than queued while disconnected; a fresh connection
    /// announces itself anyway.
    pub fn send(&self, stanza: Element) {
        let _ = self.cmd_tx.send(XmppCmd::Send(stanza));
    }

    /// Kick off a connection attempt if currently disconnected.
    pub fn ensure_connected(&self) {
        let _ = self.cmd_tx.send(XmppCmd::EnsureConnected);
    }

    pub fn stop(&self) {
        let _ = self.cmd_tx.send(XmppCmd::Stop);
    }

    pub fn stats(&self) -> TrafficSnapshot {
        self.stats.snapshot()
    }
}

#[async_trait]
impl StanzaSink for XmppConnectionManager {
    async fn send_stanza(&self, stanza: Element) {
        self.send(stanza);
    }
}

enum LinkState {
    Disconnected,
    Connecting,
    Connected(mpsc::Sender<Element>),
}

struct XmppActor {
    transport: Arc<dyn XmppTransport>,
    creds: Credentials,
    storage: Arc<dyn StorageProvider>,
    stats: Arc<TrafficStats>,
    events_tx: mpsc::UnboundedSender<XmppEvent>,
    cmd_rx: mpsc::UnboundedReceiver<XmppCmd>,
    state: LinkState,
    queue: VecDeque<Element>,
    session_events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    connect_rx: Option<oneshot::Receiver<Result<XmppSession>>>,
}

async fn recv_session(events: &mut Option<mpsc::UnboundedReceiver<SessionEvent>>) -> Option<SessionEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_connect(
    rx: &mut Option<oneshot::Receiver<Result<XmppSession>>>,
) -> Result<XmppSession> {
    match rx {
        Some(r) => match r.await {
            Ok(res) => res,
            Err(_) => Err(RoomcastError::Internal("connect task dropped".into())),
        },
        None => std::future::pending().await,
    }
}

impl XmppActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(XmppCmd::Send(st)) => self.on_send(st).await,
                    Some(XmppCmd::EnsureConnected) => self.ensure(),
                    Some(XmppCmd::Stop) | None => break,
                },
                res = recv_connect(&mut self.connect_rx) => {
                    self.connect_rx = None;
                    self.on_connect_result(res).await;
                }
                ev = recv_session(&mut self.session_events) => self.on_session_event(ev),
            }
        }
    }

    async fn on_send(&mut self, stanza: Element) {
        match &self.state {
            LinkState::Connected(outbound) => {
                if outbound.send(stanza).await.is_ok() {
                    self.stats.stanzas_out.fetch_add(1, Ordering::Relaxed);
                } else {
                    warn!("session send half closed; dropping session");
                    self.drop_session(true);
                }
            }
            _ => {
                if is_connection_presence(&stanza) {
                    debug!("not connected; connection presence dropped");
                } else {
                    self.queue.push_back(stanza);
                }
            }
        }
    }

    fn ensure(&mut self) {
        if !matches!(self.state, LinkState::Disconnected) {
            return;
        }
        self.state = LinkState::Connecting;
        debug!(jid = %self.creds.jid, "connecting upstream");

        let (tx, rx) = oneshot::channel();
        self.connect_rx = Some(rx);
        let transport = Arc::clone(&self.transport);
        let creds = self.creds.clone();
        tokio::spawn(async move {
            let _ = tx.send(transport.connect(&creds).await);
        });
    }

    async fn on_connect_result(&mut self, res: Result<XmppSession>) {
        match res {
            Ok(session) => {
                info!(jid = %self.creds.jid, "upstream connected");
                self.stats.connects.fetch_add(1, Ordering::Relaxed);
                self.session_events = Some(session.events);
                self.state = LinkState::Connected(session.outbound.clone());

                // these credentials are known to work now
                match serde_json::to_string(&self.creds) {
                    Ok(s) => self.storage.put(WORKING_CREDENTIALS_KEY, &s),
                    Err(e) => warn!(error = %e, "credential persist failed"),
                }

                // drain the offline queue in order
                while let Some(st) = self.queue.pop_front() {
                    if session.outbound.send(st).await.is_ok() {
                        self.stats.stanzas_out.fetch_add(1, Ordering::Relaxed);
                    } else {
                        // online was never announced for this session
                        warn!("session died during queue flush");
                        self.drop_session(false);
                        return;
                    }
                }

                let _ = self.events_tx.send(XmppEvent::Online);
            }
            Err(e) => {
                warn!(error = %e, "connect attempt failed");
                self.state = LinkState::Disconnected;
            }
        }
    }

    fn on_session_event(&mut self, ev: Option<SessionEvent>) {
        match ev {
            Some(SessionEvent::Stanza(st)) => {
                self.stats.stanzas_in.fetch_add(1, Ordering::Relaxed);
                let _ = self.events_tx.send(XmppEvent::Stanza(st));
            }
            Some(SessionEvent::Closed) | None => {
                debug!("upstream session closed");
                self.drop_session(true);
            }
        }
    }

    fn drop_session(&mut self, notify: bool) {
        let was_connected = matches!(self.state, LinkState::Connected(_));
        self.state = LinkState::Disconnected;
        self.session_events = None;
        if notify && was_connected {
            let _ = self.events_tx.send(XmppEvent::Offline);
        }
    }
}

fn is_connection_presence(st: &Element) -> bool {
    st.is_presence() && st.to_jid().is_none()
}
