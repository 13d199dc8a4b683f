//! Per-room presence state machine.
//!
//! Merges the presence wishes of every tab subscribed to a room, negotiates
//! a unique nickname with the chat server, and keeps the tabs fed with the
//! room's participant roster. Two independent failure modes are handled:
//! an explicit nickname conflict (presence error 409, retried with numeric
//! suffixes) and a silently ignored enter attempt (watchdog falls back to
//! the last nickname known to have worked).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use roomcast_core::protocol::request::{Request, TabPresenceIntent};
use roomcast_core::protocol::stanza::{self, bare_jid, jid_resource, ns, Element};
use roomcast_core::provider::{ConfigProvider, StorageProvider};
use roomcast_link::channel::ContextId;

use crate::presence::merge::{merge_intents, EffectivePresence, PresenceCategory};
use crate::xmpp::StanzaSink;

/// Delivers fanned-out requests to subscribed tabs.
#[async_trait]
pub trait TabFanout: Send + Sync {
    async fn send_to_tab(&self, ctx: &ContextId, request: Request);

    /// Deliver one request to many tabs; implementations may parallelize.
    async fn send_to_tabs(&self, ctxs: Vec<ContextId>, request: Request) {
        for ctx in ctxs {
            self.send_to_tab(&ctx, request.clone()).await;
        }
    }
}

fn nick_key(room: &str) -> String {
    format!("room:{room}:nick")
}

enum RoomCmd {
    Publish {
        ctx: ContextId,
        room: String,
        nick: String,
        intent: TabPresenceIntent,
    },
    Leave {
        ctx: ContextId,
        room: String,
    },
    DropTab {
        ctx: ContextId,
    },
    ServerStanza(Element),
    Online,
}

/// Cloneable handle to the presence actor.
#[derive(Clone)]
pub struct RoomPresenceManager {
    cmd_tx: mpsc::UnboundedSender<RoomCmd>,
}

impl RoomPresenceManager {
    pub fn start(
        config: Arc<dyn ConfigProvider>,
        storage: Arc<dyn StorageProvider>,
        sink: Arc<dyn StanzaSink>,
        fanout: Arc<dyn TabFanout>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let actor = RoomActor {
            tun: RoomTunables::from_config(config.as_ref()),
            storage,
            sink,
            fanout,
            rooms: HashMap::new(),
            cmd_rx,
        };
        tokio::spawn(actor.run());
        Self { cmd_tx }
    }

    /// A tab announced (or refreshed) its wish for a room. An unavailable
    /// wish withdraws the tab.
    pub fn publish(&self, ctx: ContextId, room: String, nick: String, intent: TabPresenceIntent) {
        let _ = self.cmd_tx.send(RoomCmd::Publish {
            ctx,
            room,
            nick,
            intent,
        });
    }

    pub fn leave(&self, ctx: ContextId, room: String) {
        let _ = self.cmd_tx.send(RoomCmd::Leave { ctx, room });
    }

    /// A tab is gone (closed or forgotten); withdraw it from every room.
    pub fn drop_tab(&self, ctx: ContextId) {
        let _ = self.cmd_tx.send(RoomCmd::DropTab { ctx });
    }

    /// Inbound presence from the chat server.
    pub fn on_server_stanza(&self, stanza: Element) {
        let _ = self.cmd_tx.send(RoomCmd::ServerStanza(stanza));
    }

    /// The upstream connection (re)connected; every subscribed room must
    /// re-enter.
    pub fn on_online(&self) {
        let _ = self.cmd_tx.send(RoomCmd::Online);
    }
}

struct RoomTunables {
    retry_max: u32,
    watchdog: Duration,
    debounce_available: Duration,
    debounce_away: Duration,
    debounce_unavailable: Duration,
    identity_src: Option<String>,
    identity_digest: Option<String>,
}

impl RoomTunables {
    fn from_config(config: &dyn ConfigProvider) -> Self {
        Self {
            retry_max: config.get_u32("room.enter_retry_max", 4),
            watchdog: config.get_millis("room.enter_watchdog_ms", 30_000),
            debounce_available: config.get_millis("room.debounce_available_ms", 200),
            debounce_away: config.get_millis("room.debounce_away_ms", 5_000),
            debounce_unavailable: config.get_millis("room.debounce_unavailable_ms", 2_000),
            identity_src: config.get_raw("identity.src"),
            identity_digest: config.get_raw("identity.digest"),
        }
    }

    fn debounce(&self, category: PresenceCategory) -> Duration {
        match category {
            PresenceCategory::Available => self.debounce_available,
            PresenceCategory::Away => self.debounce_away,
            PresenceCategory::Unavailable => self.debounce_unavailable,
        }
    }
}

enum NickState {
    None,
    Pending { nick: String, retries: u32 },
    Confirmed { nick: String },
}

impl NickState {
    fn active_nick(&self) -> Option<&str> {
        match self {
            NickState::None => None,
            NickState::Pending { nick, .. } | NickState::Confirmed { nick } => Some(nick),
        }
    }
}

struct RoomState {
    room: String,
    desired_nick: String,
    nick: NickState,
    /// Set when the watchdog already switched to the known-good nickname;
    /// a second silent ignore gives up instead of looping.
    fallback_used: bool,
    tabs: HashMap<ContextId, TabPresenceIntent>,
    participants: HashMap<String, Element>,
    /// Debounce deadline, anchored at the first schedule of the current
    /// burst; later mutations do not move it.
    send_at: Option<Instant>,
    watchdog_at: Option<Instant>,
    sends_available: u64,
    sends_away: u64,
    sends_unavailable: u64,
}

impl RoomState {
    fn new(room: String, desired_nick: String) -> Self {
        Self {
            room,
            desired_nick,
            nick: NickState::None,
            fallback_used: false,
            tabs: HashMap::new(),
            participants: HashMap::new(),
            send_at: None,
            watchdog_at: None,
            sends_available: 0,
            sends_away: 0,
            sends_unavailable: 0,
        }
    }
}

struct RoomActor {
    tun: RoomTunables,
    storage: Arc<dyn StorageProvider>,
    sink: Arc<dyn StanzaSink>,
    fanout: Arc<dyn TabFanout>,
    rooms: HashMap<String, RoomState>,
    cmd_rx: mpsc::UnboundedReceiver<RoomCmd>,
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(t) => time::sleep_until(t).await,
        None => std::future::pending().await,
    }
}

impl RoomActor {
    async fn run(mut self) {
        loop {
            let next = self.next_deadline();
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.on_cmd(cmd).await,
                    None => break,
                },
                _ = sleep_until_opt(next) => self.fire_due().await,
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.rooms
            .values()
            .flat_map(|r| [r.send_at, r.watchdog_at])
            .flatten()
            .min()
    }

    async fn on_cmd(&mut self, cmd: RoomCmd) {
        match cmd {
            RoomCmd::Publish {
                ctx,
                room,
                nick,
                intent,
            } => self.on_publish(ctx, room, nick, intent),
            RoomCmd::Leave { ctx, room } => {
                if let Some(rec) = self.rooms.get_mut(&room) {
                    if rec.tabs.remove(&ctx).is_some() {
                        debug!(%ctx, %room, "tab left room");
                        self.schedule_send(&room);
                    }
                }
            }
            RoomCmd::DropTab { ctx } => {
                let affected: Vec<String> = self
                    .rooms
                    .values_mut()
                    .filter_map(|r| r.tabs.remove(&ctx).map(|_| r.room.clone()))
                    .collect();
                for room in affected {
                    debug!(%ctx, %room, "tab dropped from room");
                    self.schedule_send(&room);
                }
            }
            RoomCmd::ServerStanza(st) => self.on_server_stanza(st).await,
            RoomCmd::Online => self.on_online(),
        }
    }

    fn on_publish(&mut self, ctx: ContextId, room: String, nick: String, intent: TabPresenceIntent) {
        let rec = self
            .rooms
            .entry(room.clone())
            .or_insert_with(|| RoomState::new(room.clone(), nick.clone()));
        rec.desired_nick = nick;

        let newly_subscribed = !rec.tabs.contains_key(&ctx);
        if intent.available {
            rec.tabs.insert(ctx.clone(), intent);
            if newly_subscribed {
                // a fresh subscriber gets the full roster before live updates
                let snapshot: Vec<Element> = rec.participants.values().cloned().collect();
                if !snapshot.is_empty() {
                    let fanout = Arc::clone(&self.fanout);
                    let room = room.clone();
                    tokio::spawn(async move {
                        for st in snapshot {
                            fanout
                                .send_to_tab(
                                    &ctx,
                                    Request::ParticipantUpdate {
                                        room: room.clone(),
                                        stanza: st,
                                    },
                                )
                                .await;
                        }
                    });
                }
            }
        } else {
            // an unavailable wish withdraws the tab
            rec.tabs.remove(&ctx);
        }

        self.schedule_send(&room);
    }

    /// Schedule (or leave scheduled) the debounced send for a room. The
    /// deadline is computed from the first schedule in the burst, so a storm
    /// of rapid updates collapses into one send bounded by the original
    /// delay.
    fn schedule_send(&mut self, room: &str) {
        let Some(rec) = self.rooms.get_mut(room) else {
            return;
        };
        if rec.send_at.is_some() {
            return;
        }
        let category = merge_intents(rec.tabs.values())
            .map(|p| p.category())
            .unwrap_or(PresenceCategory::Unavailable);
        rec.send_at = Some(Instant::now() + self.tun.debounce(category));
    }

    async fn fire_due(&mut self) {
        let now = Instant::now();

        let due_sends: Vec<String> = self
            .rooms
            .values()
            .filter(|r| r.send_at.is_some_and(|t| t <= now))
            .map(|r| r.room.clone())
            .collect();
        for room in due_sends {
            if let Some(rec) = self.rooms.get_mut(&room) {
                rec.send_at = None;
            }
            self.send_presence(&room).await;
        }

        let due_watchdogs: Vec<String> = self
            .rooms
            .values()
            .filter(|r| r.watchdog_at.is_some_and(|t| t <= now))
            .map(|r| r.room.clone())
            .collect();
        for room in due_watchdogs {
            if let Some(rec) = self.rooms.get_mut(&room) {
                rec.watchdog_at = None;
            }
            self.on_watchdog(&room).await;
        }
    }

    /// Send the room's merged presence, negotiating a nickname first if
    /// none is active yet. With no subscribers left the room is departed
    /// and its state dropped.
    async fn send_presence(&mut self, room: &str) {
        let Some(rec) = self.rooms.get_mut(room) else {
            return;
        };

        let Some(merged) = merge_intents(rec.tabs.values()) else {
            let farewell = rec.nick.active_nick().map(|nick| {
                rec.sends_unavailable += 1;
                stanza::presence_unavailable(&format!("{}/{}", rec.room, nick))
            });
            debug!(
                %room,
                sent_available = rec.sends_available,
                sent_away = rec.sends_away,
                sent_unavailable = rec.sends_unavailable,
                "no subscribers left; dropping room"
            );
            self.rooms.remove(room);
            if let Some(st) = farewell {
                let sink = Arc::clone(&self.sink);
                sink.send_stanza(st).await;
            }
            return;
        };

        let nick = match &rec.nick {
            NickState::Confirmed { nick } | NickState::Pending { nick, .. } => nick.clone(),
            NickState::None => {
                let nick = rec.desired_nick.clone();
                info!(%room, %nick, "entering room");
                rec.nick = NickState::Pending {
                    nick: nick.clone(),
                    retries: 0,
                };
                rec.watchdog_at = Some(Instant::now() + self.tun.watchdog);
                nick
            }
        };

        match merged.category() {
            PresenceCategory::Available => rec.sends_available += 1,
            PresenceCategory::Away => rec.sends_away += 1,
            PresenceCategory::Unavailable => rec.sends_unavailable += 1,
        }

        let st = Self::build_presence(&self.tun, &rec.room, &merged, &nick);
        let sink = Arc::clone(&self.sink);
        sink.send_stanza(st).await;
    }

    fn build_presence(
        tun: &RoomTunables,
        room: &str,
        merged: &EffectivePresence,
        nick: &str,
    ) -> Element {
        let mut st = stanza::presence_to(&format!("{room}/{nick}"));
        if let Some(show) = &merged.show {
            st = st.child(Element::new("show").text(show));
        }
        if let Some(status) = &merged.status {
            st = st.child(Element::new("status").text(status));
        }

        let mut props = Element::new("x")
            .attr("xmlns", ns::VP_PROPS)
            .attr("nickname", nick);
        if let Some(badge) = &merged.badge {
            props = props.attr("badge", badge);
        }
        st = st.child(props);

        if let Some(src) = &tun.identity_src {
            let mut identity = Element::new("x")
                .attr("xmlns", ns::USER_IDENTITY)
                .attr("src", src);
            if let Some(digest) = &tun.identity_digest {
                identity = identity.attr("digest", digest);
            }
            st = st.child(identity);
        }
        st
    }

    async fn on_server_stanza(&mut self, st: Element) {
        let Some(from) = st.from_jid().map(str::to_string) else {
            return;
        };
        let room_key = bare_jid(&from).to_string();

        if st.is_conflict_error() {
            self.on_conflict(&room_key).await;
            return;
        }
        if st.stanza_type() == Some("error") {
            warn!(room = %room_key, code = ?st.error_code(), "error presence ignored");
            return;
        }

        let Some(rec) = self.rooms.get_mut(&room_key) else {
            debug!(room = %room_key, "presence for unknown room ignored");
            return;
        };
        let Some(resource) = jid_resource(&from).map(str::to_string) else {
            return;
        };

        let unavailable = st.stanza_type() == Some("unavailable");
        if unavailable {
            rec.participants.remove(&resource);
            if rec.nick.active_nick() == Some(resource.as_str()) {
                warn!(room = %room_key, nick = %resource, "own presence withdrawn by server");
                rec.nick = NickState::None;
                rec.watchdog_at = None;
            }
        } else {
            rec.participants.insert(resource.clone(), st.clone());
            if let NickState::Pending { nick, .. } = &rec.nick {
                if *nick == resource {
                    info!(room = %room_key, nick = %resource, "nickname confirmed");
                    self.storage.put(&nick_key(&room_key), &resource);
                    rec.nick = NickState::Confirmed {
                        nick: resource.clone(),
                    };
                    rec.watchdog_at = None;
                    rec.fallback_used = false;
                }
            }
        }

        // verbatim fanout to every subscribed tab
        let tabs: Vec<ContextId> = rec.tabs.keys().cloned().collect();
        if !tabs.is_empty() {
            let fanout = Arc::clone(&self.fanout);
            let request = Request::ParticipantUpdate {
                room: room_key.clone(),
                stanza: st,
            };
            tokio::spawn(async move {
                fanout.send_to_tabs(tabs, request).await;
            });
        }
    }

    /// Nickname rejected by the server (409): append a numeric suffix and
    /// resend immediately, up to the retry budget.
    async fn on_conflict(&mut self, room: &str) {
        let Some(rec) = self.rooms.get_mut(room) else {
            return;
        };
        let NickState::Pending { nick, retries } = &rec.nick else {
            debug!(%room, "conflict outside negotiation ignored");
            return;
        };
        let rejected = nick.clone();
        let retries = retries + 1;

        if retries >= self.tun.retry_max {
            warn!(%room, nick = %rejected, retries, "nickname retries exhausted; room left unentered");
            rec.nick = NickState::None;
            rec.watchdog_at = None;
            return;
        }

        let base = if rec.fallback_used {
            self.storage
                .get(&nick_key(room))
                .unwrap_or_else(|| rec.desired_nick.clone())
        } else {
            rec.desired_nick.clone()
        };
        let next = format!("{base}_{retries}");
        info!(%room, rejected = %rejected, next = %next, "nickname conflict; retrying");
        rec.nick = NickState::Pending {
            nick: next,
            retries,
        };
        rec.watchdog_at = Some(Instant::now() + self.tun.watchdog);
        self.send_presence(room).await;
    }

    /// The enter attempt got no acknowledging presence at all. Fall back to
    /// the last nickname known to have worked, exactly once.
    async fn on_watchdog(&mut self, room: &str) {
        let Some(rec) = self.rooms.get_mut(room) else {
            return;
        };
        let NickState::Pending { nick, .. } = &rec.nick else {
            return;
        };
        let ignored = nick.clone();

        let known_good = self.storage.get(&nick_key(room));
        match known_good {
            Some(good) if !rec.fallback_used && good != ignored => {
                warn!(%room, nick = %ignored, fallback = %good, "enter silently ignored; retrying with known-good nickname");
                rec.fallback_used = true;
                rec.nick = NickState::Pending {
                    nick: good,
                    retries: 0,
                };
                rec.watchdog_at = Some(Instant::now() + self.tun.watchdog);
                self.send_presence(room).await;
            }
            _ => {
                warn!(%room, nick = %ignored, "enter silently ignored; giving up until next presence change");
                rec.nick = NickState::None;
            }
        }
    }

    /// Upstream (re)connected: every subscribed room starts over.
    fn on_online(&mut self) {
        let rooms: Vec<String> = self
            .rooms
            .values_mut()
            .filter(|rec| !rec.tabs.is_empty())
            .map(|rec| {
                rec.nick = NickState::None;
                rec.fallback_used = false;
                rec.watchdog_at = None;
                rec.participants.clear();
                rec.room.clone()
            })
            .collect();
        for room in rooms {
            debug!(%room, "re-entering after reconnect");
            self.schedule_send(&room);
        }
    }
}
