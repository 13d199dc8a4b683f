//! Hub-side communicator: one instance multiplexes every tab context.
//!
//! Each context gets fully independent bookkeeping: a generation-tagged
//! current channel, the immediately-previous channel kept only to drain
//! in-flight frames across a handover, queues for frames that cannot be sent
//! yet, and an awaited-response map. The timeout sweep guarantees that no
//! caller is ever left unresolved, and forgetting a context resolves
//! everything it still owes with synthetic errors.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use roomcast_core::protocol::frame::{Frame, RequestEnvelope, RequestIdSource, ResponseEnvelope};
use roomcast_core::protocol::request::{Request, Response};
use roomcast_core::provider::ConfigProvider;
use roomcast_core::Result;

use crate::channel::{AcceptStream, AcceptedChannel, ChannelEvent, ContextId, MessageChannel};
use crate::codec;

/// Housekeeping cadence for the timeout sweep.
const SWEEP_TICK: Duration = Duration::from_millis(250);

/// Application hooks: request handling plus context lifecycle signals.
#[async_trait]
pub trait ContextRequestHandler: Send + Sync {
    async fn handle(&self, ctx: &ContextId, request: Request) -> Result<Response>;

    /// Rate-limited liveness signal, fired when a context's channel arrives.
    fn on_heartbeat(&self, _ctx: &ContextId) {}

    /// A context was explicitly forgotten (tab closed).
    fn on_forget(&self, _ctx: &ContextId) {}
}

enum ServerCmd {
    SendRequest {
        ctx: ContextId,
        request: Request,
        timeout: Duration,
        reply: oneshot::Sender<Response>,
    },
    PostResponse {
        ctx: ContextId,
        envelope: ResponseEnvelope,
    },
    Forget {
        ctx: ContextId,
    },
    Stop,
}

/// Cloneable handle to the hub communicator.
#[derive(Clone)]
pub struct ServerCommunicator {
    cmd_tx: mpsc::Sender<ServerCmd>,
    default_timeout: Duration,
}

impl ServerCommunicator {
    pub fn start(
        accepts: AcceptStream,
        handler: Arc<dyn ContextRequestHandler>,
        config: &dyn ConfigProvider,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let actor = ServerActor {
            handler,
            contexts: HashMap::new(),
            ids: Arc::new(RequestIdSource::new()),
            response_ids: Arc::new(RequestIdSource::new()),
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
            accepts: Some(accepts),
            events_tx,
            events_rx,
            response_linger: config.get_secs("server.response_linger_secs", 15),
            heartbeat_gap: config.get_secs("server.heartbeat_interval_secs", 60) / 2,
        };
        tokio::spawn(actor.run());

        Self {
            cmd_tx,
            default_timeout: config.get_secs("server.request_timeout_secs", 15),
        }
    }

    /// Send one request to a specific context. Resolves exactly once; the
    /// timeout clock runs from this call, not from when a channel shows up.
    pub async fn send_request(&self, ctx: &ContextId, request: Request) -> Response {
        self.send_request_with_timeout(ctx, request, self.default_timeout)
            .await
    }

    pub async fn send_request_with_timeout(
        &self,
        ctx: &ContextId,
        request: Request,
        timeout: Duration,
    ) -> Response {
        let (reply, rx) = oneshot::channel();
        let cmd = ServerCmd::SendRequest {
            ctx: ctx.clone(),
            request,
            timeout,
            reply,
        };
        if self.cmd_tx.send(cmd).await.is_err() {
            return Response::canceled();
        }
        match rx.await {
            Ok(response) => response,
            Err(_) => Response::canceled(),
        }
    }

    /// Send the same request to many contexts concurrently; responses are
    /// awaited and discarded.
    pub async fn broadcast(&self, ctxs: impl IntoIterator<Item = ContextId>, request: Request) {
        let mut futs = FuturesUnordered::new();
        for ctx in ctxs {
            let comm = self.clone();
            let req = request.clone();
            futs.push(async move {
                let _ = comm.send_request(&ctx, req).await;
            });
        }
        while futs.next().await.is_some() {}
    }

    /// Drop everything known about a context (tab closed). Every queued or
    /// outstanding item resolves with a synthetic error first.
    pub async fn forget_context(&self, ctx: &ContextId) {
        let _ = self.cmd_tx.send(ServerCmd::Forget { ctx: ctx.clone() }).await;
    }

    pub fn stop(&self) {
        let _ = self.cmd_tx.try_send(ServerCmd::Stop);
    }
}

struct BoundChannel {
    generation: u64,
    channel: Arc<dyn MessageChannel>,
}

struct QueuedRequest {
    envelope: RequestEnvelope,
    send_deadline: Instant,
}

struct QueuedResponse {
    envelope: ResponseEnvelope,
    send_deadline: Instant,
}

struct AwaitedResponse {
    reply: oneshot::Sender<Response>,
    deadline: Instant,
}

struct ContextRecord {
    /// Bumped on every accepted channel; channels are tagged with the value
    /// active at acceptance time.
    generation: u64,
    current: Option<BoundChannel>,
    /// Strictly older than `current`; kept only to drain in-flight frames
    /// across a handover, never targeted by new sends.
    previous: Option<BoundChannel>,
    unsent_requests: VecDeque<QueuedRequest>,
    unsent_responses: VecDeque<QueuedResponse>,
    awaited: HashMap<u64, AwaitedResponse>,
    next_heartbeat: Instant,
}

impl ContextRecord {
    fn new() -> Self {
        Self {
            generation: 0,
            current: None,
            previous: None,
            unsent_requests: VecDeque::new(),
            unsent_responses: VecDeque::new(),
            awaited: HashMap::new(),
            next_heartbeat: Instant::now(),
        }
    }

    fn has_unsent(&self) -> bool {
        !self.unsent_requests.is_empty() || !self.unsent_responses.is_empty()
    }
}

struct ServerActor {
    handler: Arc<dyn ContextRequestHandler>,
    contexts: HashMap<ContextId, ContextRecord>,
    ids: Arc<RequestIdSource>,
    response_ids: Arc<RequestIdSource>,
    cmd_tx: mpsc::Sender<ServerCmd>,
    cmd_rx: mpsc::Receiver<ServerCmd>,
    accepts: Option<AcceptStream>,
    events_tx: mpsc::UnboundedSender<(ContextId, u64, ChannelEvent)>,
    events_rx: mpsc::UnboundedReceiver<(ContextId, u64, ChannelEvent)>,
    response_linger: Duration,
    heartbeat_gap: Duration,
}

async fn next_accept(accepts: &mut Option<AcceptStream>) -> Option<AcceptedChannel> {
    match accepts {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl ServerActor {
    async fn run(mut self) {
        let mut sweep = time::interval(SWEEP_TICK);
        sweep.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                accepted = next_accept(&mut self.accepts) => match accepted {
                    Some(a) => self.on_accept(a).await,
                    // substrate gone; keep serving so outstanding calls resolve
                    None => self.accepts = None,
                },
                ev = self.events_rx.recv() => {
                    if let Some((ctx, generation, ev)) = ev {
                        self.on_event(ctx, generation, ev).await;
                    }
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(ServerCmd::SendRequest { ctx, request, timeout, reply }) => {
                        self.on_send_request(ctx, request, timeout, reply).await;
                    }
                    Some(ServerCmd::PostResponse { ctx, envelope }) => {
                        self.on_post_response(ctx, envelope).await;
                    }
                    Some(ServerCmd::Forget { ctx }) => self.on_forget(&ctx),
                    Some(ServerCmd::Stop) | None => break,
                },
                _ = sweep.tick() => self.on_tick().await,
            }
        }

        self.shutdown();
    }

    async fn on_accept(&mut self, a: AcceptedChannel) {
        let rec = self
            .contexts
            .entry(a.context_id.clone())
            .or_insert_with(ContextRecord::new);
        rec.generation += 1;
        let generation = rec.generation;

        // the channel two handovers back is not worth draining any more
        if let Some(old) = rec.previous.take() {
            old.channel.disconnect();
        }
        rec.previous = rec.current.take();
        rec.current = Some(BoundChannel {
            generation,
            channel: Arc::clone(&a.channel),
        });
        debug!(ctx = %a.context_id, generation, "channel accepted");

        // pump this channel's events into the shared stream, tagged with the
        // generation so a stale disconnect cannot clobber a newer channel
        let ctx = a.context_id.clone();
        let events_tx = self.events_tx.clone();
        let mut events = a.events;
        tokio::spawn(async move {
            while let Some(ev) = events.recv().await {
                let disconnect = matches!(ev, ChannelEvent::Disconnected);
                if events_tx.send((ctx.clone(), generation, ev)).is_err() {
                    return;
                }
                if disconnect {
                    return;
                }
            }
            let _ = events_tx.send((ctx, generation, ChannelEvent::Disconnected));
        });

        self.flush(&a.context_id).await;

        let now = Instant::now();
        if let Some(rec) = self.contexts.get_mut(&a.context_id) {
            if now >= rec.next_heartbeat {
                rec.next_heartbeat = now + self.heartbeat_gap;
                self.handler.on_heartbeat(&a.context_id);
            }
        }
    }

    async fn on_event(&mut self, ctx: ContextId, generation: u64, ev: ChannelEvent) {
        match ev {
            ChannelEvent::Message(bytes) => self.on_message(ctx, bytes).await,
            ChannelEvent::Disconnected => {
                let Some(rec) = self.contexts.get_mut(&ctx) else {
                    return;
                };
                if rec
                    .current
                    .as_ref()
                    .is_some_and(|b| b.generation == generation)
                {
                    rec.current = None;
                    debug!(%ctx, generation, "current channel disconnected");
                } else if rec
                    .previous
                    .as_ref()
                    .is_some_and(|b| b.generation == generation)
                {
                    // drained previous channel is discarded on its own disconnect
                    rec.previous = None;
                }
            }
        }
    }

    async fn on_message(&mut self, ctx: ContextId, bytes: Bytes) {
        match codec::decode(&bytes) {
            Ok(Frame::Response(env)) => {
                let Some(rec) = self.contexts.get_mut(&ctx) else {
                    return;
                };
                // correlation is by requestId alone: a late frame from a
                // superseded channel still resolves, a duplicate is ignored
                if let Some(aw) = rec.awaited.remove(&env.request_id) {
                    let _ = aw.reply.send(env.response);
                } else {
                    debug!(%ctx, request_id = env.request_id, "response no longer awaited; ignored");
                }
            }
            Ok(Frame::Request(env)) => {
                let handler = Arc::clone(&self.handler);
                let cmd_tx = self.cmd_tx.clone();
                let response_id = self.response_ids.next();
                tokio::spawn(async move {
                    // a handler failure still produces a response; the caller
                    // is never left waiting on an application error
                    let response = match handler.handle(&ctx, env.request).await {
                        Ok(r) => r,
                        Err(e) => Response::failure(e.status(), e.to_string()),
                    };
                    let envelope = ResponseEnvelope {
                        response_id,
                        request_id: env.request_id,
                        response,
                    };
                    let _ = cmd_tx.send(ServerCmd::PostResponse { ctx, envelope }).await;
                });
            }
            Err(e) => warn!(%ctx, error = %e, "dropping undecodable frame"),
        }
    }

    async fn on_send_request(
        &mut self,
        ctx: ContextId,
        request: Request,
        timeout: Duration,
        reply: oneshot::Sender<Response>,
    ) {
        let now = Instant::now();
        let deadline = now + timeout;
        let id = self.ids.next();

        let rec = self
            .contexts
            .entry(ctx.clone())
            .or_insert_with(ContextRecord::new);
        rec.awaited.insert(id, AwaitedResponse { reply, deadline });
        rec.unsent_requests.push_back(QueuedRequest {
            envelope: RequestEnvelope::new(id, request),
            send_deadline: deadline,
        });

        if rec.current.is_some() {
            self.flush(&ctx).await;
        }
    }

    async fn on_post_response(&mut self, ctx: ContextId, envelope: ResponseEnvelope) {
        let Some(rec) = self.contexts.get_mut(&ctx) else {
            debug!(%ctx, "context forgotten; response dropped");
            return;
        };
        rec.unsent_responses.push_back(QueuedResponse {
            envelope,
            send_deadline: Instant::now() + self.response_linger,
        });
        self.flush(&ctx).await;
    }

    fn on_forget(&mut self, ctx: &ContextId) {
        let Some(mut rec) = self.contexts.remove(ctx) else {
            return;
        };
        Self::sweep_record(ctx, &mut rec, Instant::now(), true);
        if let Some(b) = rec.current.take() {
            b.channel.disconnect();
        }
        if let Some(b) = rec.previous.take() {
            b.channel.disconnect();
        }
        debug!(%ctx, "context forgotten");
        self.handler.on_forget(ctx);
    }

    async fn on_tick(&mut self) {
        let ctxs: Vec<ContextId> = self.contexts.keys().cloned().collect();
        for ctx in ctxs {
            let flushable = self
                .contexts
                .get(&ctx)
                .is_some_and(|r| r.current.is_some() && r.has_unsent());
            if flushable {
                self.flush(&ctx).await;
            } else {
                self.sweep_context(&ctx, false);
            }
        }
    }

    /// Sweep, then drain unsent frames onto the current channel.
    async fn flush(&mut self, ctx: &ContextId) {
        self.sweep_context(ctx, false);

        let Some(rec) = self.contexts.get_mut(ctx) else {
            return;
        };
        let Some(bound) = rec.current.as_ref() else {
            return;
        };
        let channel = Arc::clone(&bound.channel);
        let responses: Vec<QueuedResponse> = rec.unsent_responses.drain(..).collect();
        let requests: Vec<QueuedRequest> = rec.unsent_requests.drain(..).collect();

        for q in responses {
            Self::post_frame(&channel, Frame::Response(q.envelope)).await;
        }
        for q in requests {
            Self::post_frame(&channel, Frame::Request(q.envelope)).await;
        }
    }

    async fn post_frame(channel: &Arc<dyn MessageChannel>, frame: Frame) {
        match codec::encode(&frame) {
            Ok(bytes) => {
                if let Err(e) = channel.post(bytes).await {
                    // not requeued: the sweep/timeout logic surfaces the loss
                    warn!(error = %e, "post failed; frame dropped");
                }
            }
            Err(e) => warn!(error = %e, "frame encode failed"),
        }
    }

    fn sweep_context(&mut self, ctx: &ContextId, force: bool) {
        if let Some(rec) = self.contexts.get_mut(ctx) {
            Self::sweep_record(ctx, rec, Instant::now(), force);
        }
    }

    /// Discard stale unsent frames and resolve stale awaited entries. With
    /// `force`, deadlines are ignored and everything resolves as canceled.
    fn sweep_record(ctx: &ContextId, rec: &mut ContextRecord, now: Instant, force: bool) {
        let mut keep = VecDeque::with_capacity(rec.unsent_requests.len());
        for q in rec.unsent_requests.drain(..) {
            if force || q.send_deadline <= now {
                debug!(%ctx, request_id = q.envelope.request_id, "unsent request discarded");
                if let Some(aw) = rec.awaited.remove(&q.envelope.request_id) {
                    let resp = if force {
                        Response::canceled()
                    } else {
                        Response::timeout()
                    };
                    let _ = aw.reply.send(resp);
                }
            } else {
                keep.push_back(q);
            }
        }
        rec.unsent_requests = keep;

        rec.unsent_responses
            .retain(|q| !force && q.send_deadline > now);

        let expired: Vec<u64> = rec
            .awaited
            .iter()
            .filter(|(_, aw)| force || aw.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(aw) = rec.awaited.remove(&id) {
                let resp = if force {
                    Response::canceled()
                } else {
                    Response::timeout()
                };
                let _ = aw.reply.send(resp);
            }
        }
    }

    fn shutdown(&mut self) {
        let now = Instant::now();
        for (ctx, mut rec) in self.contexts.drain() {
            Self::sweep_record(&ctx, &mut rec, now, true);
            if let Some(b) = rec.current.take() {
                b.channel.disconnect();
            }
            if let Some(b) = rec.previous.take() {
                b.channel.disconnect();
            }
        }
    }
}
