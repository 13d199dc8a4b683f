//! roomcast hub demo.
//!
//! Runs the full stack in one process: an in-process switch stands in for
//! the browser messaging substrate, a loopback transport stands in for the
//! real chat server, and two simulated tabs share one room.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, EnvFilter};

use roomcast_core::protocol::frame::now_ms;
use roomcast_core::protocol::request::{Request, Response, TabPresenceIntent};
use roomcast_core::protocol::stanza::Element;
use roomcast_core::provider::{ConfigProvider, MemoryStorage, StaticConfig};
use roomcast_core::Result;

use roomcast_hub::xmpp::{Credentials, SessionEvent, XmppSession, XmppTransport};
use roomcast_hub::HubService;
use roomcast_link::channel::inprocess::InProcessSwitch;
use roomcast_link::client::{ClientCommunicator, RequestHandler};

/// Fake chat server: echoes every addressed presence back as an occupant
/// announcement, the way a MUC acknowledges an enter.
#[derive(Default)]
struct LoopbackServer;

#[async_trait]
impl XmppTransport for LoopbackServer {
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
            let _ = ev_tx.send(SessionEvent::Closed);
        });
        Ok(XmppSession {
            outbound: out_tx,
            events: ev_rx,
        })
    }
}

struct LoggingTab {
    name: &'static str,
}

#[async_trait]
impl RequestHandler for LoggingTab {
    async fn handle(&self, request: Request) -> Result<Response> {
        if let Request::ParticipantUpdate { room, stanza } = &request {
            tracing::info!(tab = self.name, %room, stanza = %stanza.to_xml(), "participant update");
        }
        Ok(Response::success())
    }
}

#[tokio::main]
async fn main() {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config: Arc<dyn ConfigProvider> = match roomcast_hub::config::load_from_file("roomcast.yaml")
    {
        Ok(cfg) => Arc::new(cfg),
        Err(_) => Arc::new(StaticConfig::new()),
    };
    let storage = Arc::new(MemoryStorage::new());

    let (switch, accepts) = InProcessSwitch::new();
    let (_service, _comm) = HubService::start(
        accepts,
        Arc::new(LoopbackServer),
        Arc::clone(&config),
        storage,
    );

    let room = "plaza@muc.example.org".to_string();
    let mut clients = Vec::new();
    for (tab, show) in [("tab-1", None), ("tab-2", Some("away"))] {
        let client = ClientCommunicator::start(
            Arc::new(switch.provider(tab)),
            Arc::new(LoggingTab { name: tab }),
            config.as_ref(),
        );
        let intent = TabPresenceIntent {
            updated_ms: now_ms(),
            available: true,
            show: show.map(str::to_string),
            status: Some(format!("hello from {tab}")),
            badge: None,
        };
        let resp = client
            .send_request(Request::PublishPresence {
                room: room.clone(),
                nick: "alice".into(),
                intent,
            })
            .await;
        tracing::info!(tab, ok = resp.ok, "presence published");
        clients.push(client);
    }

    // let the debounced enter and the loopback echo play out
    tokio::time::sleep(Duration::from_secs(2)).await;

    if let Some(client) = clients.first() {
        let stats = client.send_request(Request::Stats).await;
        tracing::info!(data = ?stats.data, "upstream traffic");
        let _ = client
            .send_request(Request::LeaveRoom { room: room.clone() })
            .await;
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    tracing::info!("demo done");
}
