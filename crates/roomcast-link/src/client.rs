//! Tab-side communicator.
//!
//! Owns at most one live channel to the hub. The channel is rotated on a
//! fixed interval regardless of health, which bounds the blast radius of a
//! single channel going silently stale; a keepalive ping keeps traffic
//! flowing through idle periods so the hub can detect a truly dead channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use roomcast_core::protocol::frame::{Frame, RequestEnvelope, RequestIdSource, ResponseEnvelope};
use roomcast_core::protocol::request::{Request, Response};
use roomcast_core::provider::ConfigProvider;
use roomcast_core::Result;

use crate::channel::{ChannelEvent, ChannelEvents, ClientChannelProvider, MessageChannel};
use crate::codec;

/// Handler for hub-initiated requests arriving at this tab.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Request) -> Result<Response>;
}

enum ClientCmd {
    Post(RequestEnvelope),
    PostResponse(ResponseEnvelope),
    Stop,
}

/// One per content context.
#[derive(Clone)]
pub struct ClientCommunicator {
    cmd_tx: mpsc::Sender<ClientCmd>,
    pending: Arc<DashMap<u64, oneshot::Sender<Response>>>,
    ids: Arc<RequestIdSource>,
    default_timeout: Duration,
}

impl ClientCommunicator {
    pub fn start(
        provider: Arc<dyn ClientChannelProvider>,
        handler: Arc<dyn RequestHandler>,
        config: &dyn ConfigProvider,
    ) -> Self {
        let pending: Arc<DashMap<u64, oneshot::Sender<Response>>> = Arc::new(DashMap::new());
        let ids = Arc::new(RequestIdSource::new());
        let (cmd_tx, cmd_rx) = mpsc::channel(256);

        let actor = ClientActor {
            provider,
            handler,
            pending: Arc::clone(&pending),
            ids: Arc::clone(&ids),
            response_ids: RequestIdSource::new(),
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
            channel: None,
            events: None,
            keepalive_at: None,
            rotate_every: config.get_secs("client.rotate_interval_secs", 10),
            keepalive_every: config.get_secs("client.keepalive_interval_secs", 30),
            reopen_delay: config.get_millis("client.reopen_delay_ms", 500),
        };
        tokio::spawn(actor.run());

        Self {
            cmd_tx,
            pending,
            ids,
            default_timeout: config.get_secs("client.request_timeout_secs", 15),
        }
    }

    /// Send one request to the hub. Resolves exactly once: with the hub's
    /// response, a synthetic timeout, or a synthetic cancel if the
    /// communicator stops. Completes via timeout even when no channel ever
    /// connects.
    pub async fn send_request(&self, request: Request) -> Response {
        self.send_request_with_timeout(request, self.default_timeout)
            .await
    }

    pub async fn send_request_with_timeout(&self, request: Request, timeout: Duration) -> Response {
        let id = self.ids.next();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let env = RequestEnvelope::new(id, request);
        if self.cmd_tx.send(ClientCmd::Post(env)).await.is_err() {
            self.pending.remove(&id);
            return Response::canceled();
        }

        match time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => Response::canceled(),
            Err(_) => {
                self.pending.remove(&id);
                Response::timeout()
            }
        }
    }

    /// Stop the loop. Every pending call resolves with a canceled error.
    pub fn stop(&self) {
        let _ = self.cmd_tx.try_send(ClientCmd::Stop);
    }
}

struct ClientActor {
    provider: Arc<dyn ClientChannelProvider>,
    handler: Arc<dyn RequestHandler>,
    pending: Arc<DashMap<u64, oneshot::Sender<Response>>>,
    ids: Arc<RequestIdSource>,
    response_ids: RequestIdSource,
    cmd_tx: mpsc::Sender<ClientCmd>,
    cmd_rx: mpsc::Receiver<ClientCmd>,
    channel: Option<Arc<dyn MessageChannel>>,
    events: Option<ChannelEvents>,
    keepalive_at: Option<Instant>,
    rotate_every: Duration,
    keepalive_every: Duration,
    reopen_delay: Duration,
}

async fn next_event(events: &mut Option<ChannelEvents>) -> Option<ChannelEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(t) => time::sleep_until(t).await,
        None => std::future::pending().await,
    }
}

impl ClientActor {
    async fn run(mut self) {
        let mut rotate = time::interval_at(Instant::now() + self.rotate_every, self.rotate_every);
        rotate.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        // the keepalive clock belongs to the communicator, not to any one
        // channel: it survives rotation and reconnects
        self.keepalive_at = Some(Instant::now() + self.keepalive_every);

        loop {
            if self.channel.is_none() {
                match self.provider.open().await {
                    Ok((ch, events)) => {
                        debug!("channel opened");
                        self.channel = Some(ch);
                        self.events = Some(events);
                    }
                    Err(e) => {
                        warn!(error = %e, "channel open failed");
                        time::sleep(self.reopen_delay).await;
                        continue;
                    }
                }
            }

            tokio::select! {
                ev = next_event(&mut self.events) => match ev {
                    Some(ChannelEvent::Message(bytes)) => self.on_message(bytes).await,
                    Some(ChannelEvent::Disconnected) | None => {
                        debug!("channel disconnected");
                        self.drop_channel();
                        time::sleep(self.reopen_delay).await;
                    }
                },
                _ = rotate.tick() => {
                    // unconditional: a healthy channel is rotated too
                    debug!("rotating channel");
                    if let Some(ch) = self.channel.take() {
                        ch.disconnect();
                    }
                    self.events = None;
                }
                _ = sleep_until_opt(self.keepalive_at) => {
                    self.keepalive_at = None;
                    self.send_keepalive().await;
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(ClientCmd::Post(env)) => self.post_frame(Frame::Request(env)).await,
                    Some(ClientCmd::PostResponse(env)) => self.post_frame(Frame::Response(env)).await,
                    Some(ClientCmd::Stop) | None => break,
                },
            }
        }

        if let Some(ch) = self.channel.take() {
            ch.disconnect();
        }
        // dropping the resolvers resolves every waiting caller with cancel
        self.pending.clear();
    }

    async fn on_message(&mut self, bytes: Bytes) {
        // inbound traffic arms the keepalive unless one is already scheduled,
        // so idle periods still produce detectable traffic
        if self.keepalive_at.is_none() {
            self.keepalive_at = Some(Instant::now() + self.keepalive_every);
        }

        match codec::decode(&bytes) {
            Ok(Frame::Response(env)) => {
                if let Some((_, tx)) = self.pending.remove(&env.request_id) {
                    let _ = tx.send(env.response);
                } else {
                    debug!(request_id = env.request_id, "response no longer awaited; ignored");
                }
            }
            Ok(Frame::Request(env)) => self.dispatch_request(env),
            Err(e) => warn!(error = %e, "dropping undecodable frame"),
        }
    }

    fn dispatch_request(&self, env: RequestEnvelope) {
        let handler = Arc::clone(&self.handler);
        let cmd_tx = self.cmd_tx.clone();
        let response_id = self.response_ids.next();
        tokio::spawn(async move {
            let response = match handler.handle(env.request).await {
                Ok(r) => r,
                Err(e) => Response::failure(e.status(), e.to_string()),
            };
            let envelope = ResponseEnvelope {
                response_id,
                request_id: env.request_id,
                response,
            };
            let _ = cmd_tx.send(ClientCmd::PostResponse(envelope)).await;
        });
    }

    async fn send_keepalive(&mut self) {
        // no pending entry: the hub's answer resolves nothing and is ignored
        let env = RequestEnvelope::new(self.ids.next(), Request::Ping);
        self.post_frame(Frame::Request(env)).await;
    }

    async fn post_frame(&mut self, frame: Frame) {
        let Some(ch) = self.channel.as_ref() else {
            debug!("no channel; frame dropped (caller resolves via timeout)");
            return;
        };
        match codec::encode(&frame) {
            Ok(bytes) => {
                if let Err(e) = ch.post(bytes).await {
                    // not requeued: the timeout logic above this layer is what
                    // surfaces the loss to the caller
                    warn!(error = %e, "post failed; frame dropped");
                }
            }
            Err(e) => warn!(error = %e, "frame encode failed"),
        }
    }

    fn drop_channel(&mut self) {
        self.channel = None;
        self.events = None;
    }
}
