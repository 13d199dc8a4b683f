//! Upstream connection manager: offline queueing, connection-presence drop,
//! flush order, counters, and credential persistence.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time;

use roomcast_core::protocol::stanza::{self, Element};
use roomcast_core::provider::{MemoryStorage, StorageProvider};
use roomcast_core::{Result, RoomcastError};
use roomcast_hub::xmpp::{
    Credentials, SessionEvent, XmppConnectionManager, XmppEvent, XmppSession, XmppTransport,
};

#[derive(Default, Clone)]
struct TestTransport {
    outbound: Arc<Mutex<Vec<Element>>>,
    taps: Arc<Mutex<Vec<mpsc::UnboundedSender<SessionEvent>>>>,
    fail: Arc<AtomicBool>,
}

impl TestTransport {
    fn inject(&self, ev: SessionEvent) {
        let taps = self.taps.lock().unwrap();
        taps.last().unwrap().send(ev).unwrap();
    }

    fn sent_names(&self) -> Vec<String> {
        self.outbound
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.to_jid().unwrap_or("<none>").to_string())
            .collect()
    }
}

#[async_trait]
impl XmppTransport for TestTransport {
    async fn connect(&self, _creds: &Credentials) -> Result<XmppSession> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(RoomcastError::NotConnected);
        }
        let (out_tx, mut out_rx) = mpsc::channel::<Element>(64);
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        self.taps.lock().unwrap().push(ev_tx);
        let log = Arc::clone(&self.outbound);
        tokio::spawn(async move {
            while let Some(st) = out_rx.recv().await {
                log.lock().unwrap().push(st);
            }
        });
        Ok(XmppSession {
            outbound: out_tx,
            events: ev_rx,
        })
    }
}

fn creds() -> Credentials {
    Credentials {
        jid: "hub@example.org".into(),
        password: "secret".into(),
        resource: "roomcast".into(),
    }
}

struct Fixture {
    manager: XmppConnectionManager,
    transport: TestTransport,
    storage: Arc<MemoryStorage>,
    events: mpsc::UnboundedReceiver<XmppEvent>,
}

fn fixture() -> Fixture {
    let transport = TestTransport::default();
    let storage = Arc::new(MemoryStorage::new());
    let (events_tx, events) = mpsc::unbounded_channel();
    let manager = XmppConnectionManager::start(
        Arc::new(transport.clone()),
        creds(),
        Arc::clone(&storage) as Arc<dyn StorageProvider>,
        events_tx,
    );
    Fixture {
        manager,
        transport,
        storage,
        events,
    }
}

async fn settle() {
    time::sleep(Duration::from_millis(10)).await;
}

fn addressed(to: &str) -> Element {
    Element::new("presence").attr("to", to)
}

#[tokio::test(start_paused = true)]
async fn offline_queue_flushes_in_order_and_drops_connection_presence() {
    let mut f = fixture();

    f.manager.send(addressed("a@muc.example.org/n"));
    f.manager.send(stanza::connection_presence());
    f.manager.send(addressed("b@muc.example.org/n"));
    settle().await;
    assert!(f.transport.outbound.lock().unwrap().is_empty());

    f.manager.ensure_connected();
    settle().await;

    assert_eq!(
        f.transport.sent_names(),
        ["a@muc.example.org/n", "b@muc.example.org/n"],
        "queued stanzas flush FIFO; connection presence is dropped, not queued"
    );
    assert!(matches!(f.events.recv().await, Some(XmppEvent::Online)));

    let snap = f.manager.stats();
    assert_eq!(snap.connects, 1);
    assert_eq!(snap.stanzas_out, 2);
}

#[tokio::test(start_paused = true)]
async fn working_credentials_are_persisted_on_connect() {
    let f = fixture();
    f.manager.ensure_connected();
    settle().await;

    let saved = f.storage.get("xmpp:working-credentials").unwrap();
    assert!(saved.contains("hub@example.org"));
}

#[tokio::test(start_paused = true)]
async fn inbound_stanzas_are_counted_and_forwarded_verbatim() {
    let mut f = fixture();
    f.manager.ensure_connected();
    settle().await;
    assert!(matches!(f.events.recv().await, Some(XmppEvent::Online)));

    let st = Element::new("presence").attr("from", "plaza@muc.example.org/bob");
    f.transport.inject(SessionEvent::Stanza(st.clone()));
    settle().await;

    match f.events.recv().await {
        Some(XmppEvent::Stanza(got)) => assert_eq!(got, st),
        other => panic!("expected stanza event, got {other:?}"),
    }
    assert_eq!(f.manager.stats().stanzas_in, 1);
}

#[tokio::test(start_paused = true)]
async fn session_close_reports_offline_and_reconnect_is_callers_call() {
    let mut f = fixture();
    f.manager.ensure_connected();
    settle().await;
    assert!(matches!(f.events.recv().await, Some(XmppEvent::Online)));

    f.transport.inject(SessionEvent::Closed);
    settle().await;
    assert!(matches!(f.events.recv().await, Some(XmppEvent::Offline)));

    // no backoff loop in this layer: one connect so far
    time::sleep(Duration::from_secs(5)).await;
    assert_eq!(f.manager.stats().connects, 1);

    f.manager.ensure_connected();
    settle().await;
    assert_eq!(f.manager.stats().connects, 2);
}

#[tokio::test(start_paused = true)]
async fn failed_attempt_returns_to_disconnected() {
    let mut f = fixture();
    f.transport.fail.store(true, Ordering::Relaxed);
    f.manager.ensure_connected();
    settle().await;
    assert_eq!(f.manager.stats().connects, 0);

    f.transport.fail.store(false, Ordering::Relaxed);
    f.manager.ensure_connected();
    settle().await;
    assert!(matches!(f.events.recv().await, Some(XmppEvent::Online)));
    assert_eq!(f.manager.stats().connects, 1);
}
