//! Full-stack flow: a tab publishes presence over the link, the hub enters
//! the room upstream, and the server's acknowledgement fans back out to the
//! tab.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time;

use roomcast_core::protocol::request::{Request, Response, TabPresenceIntent};
use roomcast_core::protocol::stanza::Element;
use roomcast_core::provider::{ConfigProvider, MemoryStorage, StaticConfig};
use roomcast_core::Result;
use roomcast_hub::xmpp::{Credentials, SessionEvent, XmppSession, XmppTransport};
use roomcast_hub::HubService;
use roomcast_link::channel::inprocess::InProcessSwitch;
use roomcast_link::client::{ClientCommunicator, RequestHandler};

const ROOM: &str = "plaza@muc.example.org";

/// Chat server double: acknowledges every addressed presence by echoing it
/// back as an occupant announcement.
#[derive(Default)]
struct EchoServer;

#[async_trait]
impl XmppTransport for EchoServer {
    async fn connect(&self, _creds: &Credentials) -> Result<XmppSession> {
        let (out_tx, mut out_rx) = mpsc::channel::<Element>(64);
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(st) = out_rx.recv().await {
                if !st.is_presence() {
                    continue;
                }
                let Some(to) = st.to_jid() else { continue };
                let mut echo = Element::new("presence").attr("from", to);
                if st.stanza_type() == Some("unavailable") {
                    echo = echo.attr("type", "unavailable");
                }
                if ev_tx.send(SessionEvent::Stanza(echo)).is_err() {
                    return;
                }
            }
        });
        Ok(XmppSession {
            outbound: out_tx,
            events: ev_rx,
        })
    }
}

#[derive(Default, Clone)]
struct CollectingTab {
    updates: Arc<Mutex<Vec<Request>>>,
}

#[async_trait]
impl RequestHandler for CollectingTab {
    async fn handle(&self, request: Request) -> Result<Response> {
        self.updates.lock().unwrap().push(request);
        Ok(Response::success())
    }
}

#[tokio::test(start_paused = true)]
async fn presence_roundtrip_through_the_whole_stack() {
    let config: Arc<dyn ConfigProvider> =
        Arc::new(StaticConfig::new().set("room.debounce_available_ms", "10"));
    let storage = Arc::new(MemoryStorage::new());

    let (switch, accepts) = InProcessSwitch::new();
    let (_service, _comm) = HubService::start(
        accepts,
        Arc::new(EchoServer),
        Arc::clone(&config),
        storage,
    );

    let tab = CollectingTab::default();
    let client = ClientCommunicator::start(
        Arc::new(switch.provider("tab-1")),
        Arc::new(tab.clone()),
        config.as_ref(),
    );

    let resp = client
        .send_request(Request::PublishPresence {
            room: ROOM.into(),
            nick: "alice".into(),
            intent: TabPresenceIntent {
                updated_ms: 1,
                available: true,
                show: None,
                status: Some("browsing".into()),
                badge: None,
            },
        })
        .await;
    assert!(resp.ok);

    // debounced enter -> echo -> confirmation -> fanout back to the tab
    time::sleep(Duration::from_millis(200)).await;

    let updates = tab.updates.lock().unwrap().clone();
    let own = updates.iter().find_map(|r| match r {
        Request::ParticipantUpdate { room, stanza } if room == ROOM => stanza.from_jid().map(str::to_string),
        _ => None,
    });
    assert_eq!(
        own.as_deref(),
        Some(format!("{ROOM}/alice").as_str()),
        "tab must see its own confirmed occupant presence"
    );

    // diagnostics travel the same link
    let stats = client.send_request(Request::Stats).await;
    assert!(stats.ok);
    let data = stats.data.unwrap();
    assert!(data["connects"].as_u64().unwrap() >= 1);
    assert!(data["stanzasOut"].as_u64().unwrap() >= 1);
}
