//! Room presence state machine properties: debounce coalescing, nickname
//! conflict retry, silent-ignore fallback, roster replay, and teardown.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time;

use roomcast_core::protocol::request::{Request, TabPresenceIntent};
use roomcast_core::protocol::stanza::Element;
use roomcast_core::provider::{MemoryStorage, StaticConfig, StorageProvider};
use roomcast_hub::presence::{RoomPresenceManager, TabFanout};
use roomcast_hub::xmpp::StanzaSink;
use roomcast_link::channel::ContextId;

const ROOM: &str = "plaza@muc.example.org";

#[derive(Default, Clone)]
struct RecordingSink {
    sent: Arc<Mutex<Vec<Element>>>,
}

impl RecordingSink {
    fn to_jids(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|s| s.to_jid().map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl StanzaSink for RecordingSink {
    async fn send_stanza(&self, stanza: Element) {
        self.sent.lock().unwrap().push(stanza);
    }
}

#[derive(Default, Clone)]
struct RecordingFanout {
    sent: Arc<Mutex<Vec<(ContextId, Request)>>>,
}

#[async_trait]
impl TabFanout for RecordingFanout {
    async fn send_to_tab(&self, ctx: &ContextId, request: Request) {
        self.sent.lock().unwrap().push((ctx.clone(), request));
    }
}

fn intent(updated_ms: u64, show: Option<&str>) -> TabPresenceIntent {
    TabPresenceIntent {
        updated_ms,
        available: true,
        show: show.map(str::to_string),
        status: None,
        badge: None,
    }
}

struct Fixture {
    manager: RoomPresenceManager,
    sink: RecordingSink,
    fanout: RecordingFanout,
    storage: Arc<MemoryStorage>,
}

fn fixture(cfg: StaticConfig) -> Fixture {
    let sink = RecordingSink::default();
    let fanout = RecordingFanout::default();
    let storage = Arc::new(MemoryStorage::new());
    let manager = RoomPresenceManager::start(
        Arc::new(cfg),
        Arc::clone(&storage) as Arc<dyn StorageProvider>,
        Arc::new(sink.clone()),
        Arc::new(fanout.clone()),
    );
    Fixture {
        manager,
        sink,
        fanout,
        storage,
    }
}

/// Occupant presence as the chat server would announce it.
fn occupant(resource: &str) -> Element {
    Element::new("presence").attr("from", format!("{ROOM}/{resource}"))
}

fn conflict(resource: &str) -> Element {
    Element::new("presence")
        .attr("from", format!("{ROOM}/{resource}"))
        .attr("type", "error")
        .child(Element::new("error").attr("code", "409"))
}

async fn settle() {
    time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn debounce_coalesces_burst_into_one_send() {
    let f = fixture(
        StaticConfig::new()
            .set("room.debounce_away_ms", "200")
            .set("room.debounce_available_ms", "100"),
    );

    // tab A goes away at t=0; the away deadline anchors the burst
    f.manager.publish(
        "tab-a".into(),
        ROOM.into(),
        "alice".into(),
        intent(1, Some("away")),
    );
    time::sleep(Duration::from_millis(50)).await;

    // tab B turns available mid-burst; the deadline must not move
    f.manager
        .publish("tab-b".into(), ROOM.into(), "alice".into(), intent(2, None));

    time::sleep(Duration::from_millis(100)).await;
    assert!(
        f.sink.sent.lock().unwrap().is_empty(),
        "nothing may be sent before the anchored deadline"
    );

    time::sleep(Duration::from_millis(60)).await;
    let sent = f.sink.sent.lock().unwrap();
    assert_eq!(sent.len(), 1, "burst must collapse into exactly one stanza");
    assert!(
        sent[0].find_child("show").is_none(),
        "merged presence must reflect the non-away tab"
    );
}

#[tokio::test(start_paused = true)]
async fn nickname_conflicts_retry_with_numeric_suffixes() {
    let f = fixture(StaticConfig::new().set("room.debounce_available_ms", "10"));

    f.manager
        .publish("tab-a".into(), ROOM.into(), "alice".into(), intent(1, None));
    time::sleep(Duration::from_millis(30)).await;
    assert_eq!(f.sink.to_jids(), [format!("{ROOM}/alice")]);

    for (rejected, expected_next) in [
        ("alice", "alice_1"),
        ("alice_1", "alice_2"),
        ("alice_2", "alice_3"),
    ] {
        f.manager.on_server_stanza(conflict(rejected));
        settle().await;
        assert_eq!(
            f.sink.to_jids().last().unwrap(),
            &format!("{ROOM}/{expected_next}"),
            "rejection of {rejected} must resend as {expected_next}"
        );
    }

    // 4th rejection with max-retries 4: abandoned, no further auto-retry
    let before = f.sink.sent.lock().unwrap().len();
    f.manager.on_server_stanza(conflict("alice_3"));
    settle().await;
    time::sleep(Duration::from_secs(5)).await;
    assert_eq!(
        f.sink.sent.lock().unwrap().len(),
        before,
        "retries exhausted; nothing more may be sent"
    );
}

#[tokio::test(start_paused = true)]
async fn silently_ignored_enter_falls_back_to_known_good_nick_once() {
    let f = fixture(
        StaticConfig::new()
            .set("room.debounce_available_ms", "10")
            .set("room.enter_watchdog_ms", "1000"),
    );
    f.storage.put(&format!("room:{ROOM}:nick"), "alice");

    f.manager
        .publish("tab-a".into(), ROOM.into(), "newbie".into(), intent(1, None));
    time::sleep(Duration::from_millis(30)).await;
    assert_eq!(f.sink.to_jids(), [format!("{ROOM}/newbie")]);

    // no acknowledging presence at all: watchdog fires, fallback once
    time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(
        f.sink.to_jids(),
        [format!("{ROOM}/newbie"), format!("{ROOM}/alice")],
        "exactly one automatic re-attempt with the known-good nickname"
    );

    // the fallback attempt is ignored too: give up, no loop
    time::sleep(Duration::from_millis(2000)).await;
    assert_eq!(f.sink.sent.lock().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn confirmation_persists_nick_and_roster_is_replayed_to_new_tabs() {
    let f = fixture(StaticConfig::new().set("room.debounce_available_ms", "10"));

    f.manager
        .publish("tab-a".into(), ROOM.into(), "alice".into(), intent(1, None));
    time::sleep(Duration::from_millis(30)).await;

    // server acknowledges our nick, then announces another occupant
    f.manager.on_server_stanza(occupant("alice"));
    f.manager.on_server_stanza(occupant("bob"));
    settle().await;

    assert_eq!(
        f.storage.get(&format!("room:{ROOM}:nick")).as_deref(),
        Some("alice"),
        "confirmed nickname must be persisted"
    );

    // live updates reached the subscribed tab
    let live: Vec<ContextId> = f
        .fanout
        .sent
        .lock()
        .unwrap()
        .iter()
        .map(|(ctx, _)| ctx.clone())
        .collect();
    assert!(live.iter().all(|c| c == "tab-a"));
    assert_eq!(live.len(), 2);

    // a late subscriber gets the full roster replayed
    f.manager
        .publish("tab-b".into(), ROOM.into(), "alice".into(), intent(2, None));
    settle().await;

    let replayed: Vec<String> = f
        .fanout
        .sent
        .lock()
        .unwrap()
        .iter()
        .filter(|(ctx, _)| ctx == "tab-b")
        .filter_map(|(_, req)| match req {
            Request::ParticipantUpdate { stanza, .. } => {
                stanza.from_jid().map(str::to_string)
            }
            _ => None,
        })
        .collect();
    assert_eq!(replayed.len(), 2, "both known occupants must be replayed");
    assert!(replayed.contains(&format!("{ROOM}/alice")));
    assert!(replayed.contains(&format!("{ROOM}/bob")));
}

#[tokio::test(start_paused = true)]
async fn last_tab_leaving_departs_the_room() {
    let f = fixture(
        StaticConfig::new()
            .set("room.debounce_available_ms", "10")
            .set("room.debounce_unavailable_ms", "50"),
    );

    f.manager
        .publish("tab-a".into(), ROOM.into(), "alice".into(), intent(1, None));
    time::sleep(Duration::from_millis(30)).await;
    f.manager.on_server_stanza(occupant("alice"));
    settle().await;

    f.manager.drop_tab("tab-a".into());
    time::sleep(Duration::from_millis(80)).await;

    let sent = f.sink.sent.lock().unwrap();
    let last = sent.last().unwrap();
    assert_eq!(last.stanza_type(), Some("unavailable"));
    assert_eq!(last.to_jid(), Some(format!("{ROOM}/alice").as_str()));
}

#[tokio::test(start_paused = true)]
async fn reconnect_reenters_subscribed_rooms() {
    let f = fixture(StaticConfig::new().set("room.debounce_available_ms", "10"));

    f.manager
        .publish("tab-a".into(), ROOM.into(), "alice".into(), intent(1, None));
    time::sleep(Duration::from_millis(30)).await;
    f.manager.on_server_stanza(occupant("alice"));
    settle().await;
    let before = f.sink.sent.lock().unwrap().len();

    f.manager.on_online();
    time::sleep(Duration::from_millis(30)).await;

    let sent = f.sink.sent.lock().unwrap();
    assert_eq!(sent.len(), before + 1, "reconnect must re-enter the room");
    assert_eq!(
        sent.last().unwrap().to_jid(),
        Some(format!("{ROOM}/alice").as_str())
    );
}
