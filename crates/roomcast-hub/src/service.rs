//! Hub application glue.
//!
//! Implements the communicator's request handler (the hub side of the link
//! protocol), answers version queries, and routes upstream events into the
//! presence layer. Context heartbeats double as the reconnect driver for
//! the upstream connection, which deliberately carries no retry policy of
//! its own.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use roomcast_core::protocol::request::{Request, Response};
use roomcast_core::protocol::stanza::{self, ns, Element};
use roomcast_core::provider::{ConfigProvider, StorageProvider};
use roomcast_core::{Result, RoomcastError};
use roomcast_link::channel::{AcceptStream, ContextId};
use roomcast_link::server::{ContextRequestHandler, ServerCommunicator};

use crate::presence::{RoomPresenceManager, TabFanout};
use crate::xmpp::{Credentials, XmppConnectionManager, XmppEvent, XmppTransport};

/// Fanout seam bound to the hub communicator once both halves exist.
#[derive(Clone, Default)]
struct LateBoundFanout(Arc<OnceLock<ServerCommunicator>>);

impl LateBoundFanout {
    fn bind(&self, comm: ServerCommunicator) {
        let _ = self.0.set(comm);
    }
}

#[async_trait]
impl TabFanout for LateBoundFanout {
    async fn send_to_tab(&self, ctx: &ContextId, request: Request) {
        if let Some(comm) = self.0.get() {
            let _ = comm.send_request(ctx, request).await;
        }
    }

    async fn send_to_tabs(&self, ctxs: Vec<ContextId>, request: Request) {
        if let Some(comm) = self.0.get() {
            comm.broadcast(ctxs, request).await;
        }
    }
}

/// The hub application.
#[derive(Clone)]
pub struct HubService {
    presence: RoomPresenceManager,
    xmpp: XmppConnectionManager,
    client_name: String,
    client_version: String,
}

impl HubService {
    /// Wire the full hub stack: communicator, presence manager, upstream
    /// connection. Returns the service plus the communicator handle.
    pub fn start(
        accepts: AcceptStream,
        transport: Arc<dyn XmppTransport>,
        config: Arc<dyn ConfigProvider>,
        storage: Arc<dyn StorageProvider>,
    ) -> (HubService, ServerCommunicator) {
        let creds = Credentials {
            jid: config.get_str("xmpp.jid", "hub@example.org"),
            password: config.get_str("xmpp.password", ""),
            resource: config.get_str("xmpp.resource", "roomcast"),
        };

        let (xmpp_events_tx, xmpp_events_rx) = mpsc::unbounded_channel();
        let xmpp =
            XmppConnectionManager::start(transport, creds, Arc::clone(&storage), xmpp_events_tx);

        let fanout = LateBoundFanout::default();
        let presence = RoomPresenceManager::start(
            Arc::clone(&config),
            storage,
            Arc::new(xmpp.clone()),
            Arc::new(fanout.clone()),
        );

        let service = HubService {
            presence,
            xmpp,
            client_name: config.get_str("client.name", "roomcast"),
            client_version: config.get_str("client.version", env!("CARGO_PKG_VERSION")),
        };

        let comm = ServerCommunicator::start(accepts, Arc::new(service.clone()), config.as_ref());
        fanout.bind(comm.clone());

        tokio::spawn(Self::pump_events(service.clone(), xmpp_events_rx));
        service.xmpp.ensure_connected();

        (service, comm)
    }

    async fn pump_events(service: HubService, mut events: mpsc::UnboundedReceiver<XmppEvent>) {
        while let Some(ev) = events.recv().await {
            match ev {
                XmppEvent::Online => {
                    info!("upstream online");
                    service.presence.on_online();
                }
                XmppEvent::Offline => warn!("upstream connection lost"),
                XmppEvent::Stanza(st) => service.on_stanza(st),
            }
        }
    }

    fn on_stanza(&self, st: Element) {
        if st.is_presence() {
            self.presence.on_server_stanza(st);
        } else if st.is_iq() && st.stanza_type() == Some("get") {
            if st.find_child_ns("query", ns::IQ_VERSION).is_some() {
                let from = st.from_jid().unwrap_or_default();
                let id = st.get_attr("id").unwrap_or_default();
                self.xmpp.send(stanza::iq_version_result(
                    from,
                    id,
                    &self.client_name,
                    &self.client_version,
                ));
            } else {
                debug!("unsupported iq ignored");
            }
        } else {
            debug!(stanza = %st.name, "unhandled stanza");
        }
    }
}

#[async_trait]
impl ContextRequestHandler for HubService {
    async fn handle(&self, ctx: &ContextId, request: Request) -> Result<Response> {
        match request {
            Request::Ping => Ok(Response::success()),
            Request::PublishPresence { room, nick, intent } => {
                self.presence.publish(ctx.clone(), room, nick, intent);
                Ok(Response::success())
            }
            Request::LeaveRoom { room } => {
                self.presence.leave(ctx.clone(), room);
                Ok(Response::success())
            }
            Request::Stats => {
                let snapshot = self.xmpp.stats();
                let data = serde_json::to_value(snapshot)
                    .map_err(|e| RoomcastError::Internal(e.to_string()))?;
                Ok(Response::with_data(data))
            }
            Request::ParticipantUpdate { .. } => Err(RoomcastError::BadRequest(
                "participantUpdate is hub-originated".into(),
            )),
        }
    }

    fn on_heartbeat(&self, ctx: &ContextId) {
        debug!(%ctx, "context heartbeat");
        self.xmpp.ensure_connected();
    }

    fn on_forget(&self, ctx: &ContextId) {
        self.presence.drop_tab(ctx.clone());
    }
}
