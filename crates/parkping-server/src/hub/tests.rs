use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use parkping_shared::constants::{ALARM_PULSE_BUDGET, AUDIO_PLACEHOLDER};
use parkping_shared::protocol::{
    Ack, AdminActionKind, AdminActionRequest, AuthenticateRequest, ChannelRequest, ClientEvent,
    ClientFrame, DashboardEntry, DeleteSelfRequest, SendAudioRequest, SendChatRequest, ServerEvent,
};
use parkping_shared::types::{AccountId, ChannelId, MessageKind, Role};

use super::{spawn_hub, Hub, HubCommand};
use crate::alarm::AlarmPulse;
use crate::config::{HubConfig, SnapshotPolicy};
use crate::presence::{ConnectionId, Group, Outbound};
use crate::push::{PushKind, RecordingPush};

const ADMIN_SECRET: &str = "test-admin-secret";

struct Client {
    conn: ConnectionId,
    rx: mpsc::UnboundedReceiver<Outbound>,
}

impl Client {
    fn drain(&mut self) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            out.push(item);
        }
        out
    }

    fn events(&mut self) -> Vec<ServerEvent> {
        self.drain()
            .into_iter()
            .filter_map(|item| match item {
                Outbound::Event(event) => Some(event),
                Outbound::Close(_) => None,
            })
            .collect()
    }

    fn acks(&mut self) -> Vec<Ack> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ServerEvent::Ack(ack) => Some(ack),
                _ => None,
            })
            .collect()
    }

    fn last_ack(&mut self) -> Ack {
        self.acks().pop().expect("no ack received")
    }
}

fn config(policy: SnapshotPolicy) -> HubConfig {
    HubConfig {
        admin_id: "admin".to_string(),
        admin_secret: ADMIN_SECRET.to_string(),
        pulse_interval: Duration::from_secs(5),
        snapshot_policy: policy,
    }
}

fn hub() -> (Hub, RecordingPush, mpsc::UnboundedReceiver<AlarmPulse>) {
    let push = RecordingPush::default();
    let (hub, pulses) = Hub::new(config(SnapshotPolicy::Full), Arc::new(push.clone()));
    (hub, push, pulses)
}

fn connect(hub: &mut Hub) -> Client {
    let (tx, rx) = mpsc::unbounded_channel();
    let conn = Uuid::new_v4();
    hub.handle(HubCommand::Connect { conn, tx });
    Client { conn, rx }
}

fn send(hub: &mut Hub, client: &Client, event: ClientEvent) {
    hub.handle(HubCommand::Inbound {
        conn: client.conn,
        frame: ClientFrame {
            request_id: Some(1),
            event,
        },
    });
}

fn login(hub: &mut Hub, client: &mut Client, id: &str, secret: &str, token: Option<&str>) -> Ack {
    send(
        hub,
        client,
        ClientEvent::Authenticate(AuthenticateRequest {
            id: AccountId::from(id),
            secret: secret.to_string(),
            device_token: token.map(str::to_string),
        }),
    );
    client.last_ack()
}

fn channel_req(account: &str, channel: &str) -> ChannelRequest {
    ChannelRequest {
        account_id: AccountId::from(account),
        channel_id: ChannelId::from(channel),
    }
}

/// Log in and register one channel, draining everything received.
fn owner(hub: &mut Hub, id: &str, channel: &str) -> Client {
    let mut client = connect(hub);
    assert!(login(hub, &mut client, id, "pw", Some(&format!("tok-{id}"))).success);
    send(hub, &client, ClientEvent::RegisterChannel(channel_req(id, channel)));
    assert!(client.last_ack().success);
    client.drain();
    client
}

fn chat(channel: &str, sender: &str, text: &str) -> ClientEvent {
    ClientEvent::SendChat(SendChatRequest {
        channel_id: ChannelId::from(channel),
        sender_id: sender.to_string(),
        text: text.to_string(),
    })
}

fn admin_action(secret: &str, target: &str, action: AdminActionKind) -> ClientEvent {
    ClientEvent::AdminAction(AdminActionRequest {
        admin_secret: secret.to_string(),
        target_id: AccountId::from(target),
        action,
    })
}

fn car() -> ChannelId {
    ChannelId::from("car-9")
}

fn ann() -> AccountId {
    AccountId::from("ann")
}

fn current_pulse(hub: &Hub) -> AlarmPulse {
    AlarmPulse {
        channel_id: car(),
        generation: hub.alarms.get(&car()).expect("alarm not live").generation,
    }
}

// ---------------------------------------------------------------------------
// Account registry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_register_then_authenticate() {
    let (mut hub, _push, _pulses) = hub();
    let mut first = connect(&mut hub);
    let mut second = connect(&mut hub);

    let ack = login(&mut hub, &mut first, "ann", "pw", None);
    assert!(ack.success);
    assert_eq!(ack.role, Some(Role::Owner));
    assert_eq!(ack.dashboard, Some(Vec::new()));

    assert!(login(&mut hub, &mut second, "ann", "pw", None).success);

    let ack = login(&mut hub, &mut second, "ann", "wrong", None);
    assert!(!ack.success);
    assert_eq!(ack.message.as_deref(), Some("Wrong secret for this id"));
}

#[tokio::test]
async fn test_admin_login() {
    let (mut hub, _push, _pulses) = hub();
    let mut admin = connect(&mut hub);

    let ack = login(&mut hub, &mut admin, "admin", "guess", None);
    assert!(!ack.success);

    send(
        &mut hub,
        &admin,
        ClientEvent::Authenticate(AuthenticateRequest {
            id: AccountId::from("admin"),
            secret: ADMIN_SECRET.to_string(),
            device_token: None,
        }),
    );
    let events = admin.events();
    assert!(events
        .iter()
        .any(|e| matches!(e, ServerEvent::AdminSnapshot(_))));
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::Ack(ack) if ack.success && ack.role == Some(Role::Admin)
    )));

    // The admin identity never lands in the account store.
    assert_eq!(hub.accounts.len(), 0);
}

#[tokio::test]
async fn test_new_registration_notifies_admins() {
    let (mut hub, _push, _pulses) = hub();
    let mut admin = connect(&mut hub);
    assert!(login(&mut hub, &mut admin, "admin", ADMIN_SECRET, None).success);
    admin.drain();

    let mut ann_client = connect(&mut hub);
    login(&mut hub, &mut ann_client, "ann", "pw", None);

    let snapshot = admin
        .events()
        .into_iter()
        .find_map(|e| match e {
            ServerEvent::AdminSnapshot(s) => Some(s),
            _ => None,
        })
        .expect("no snapshot");
    assert_eq!(snapshot.summary.accounts, 1);
    let accounts = snapshot.accounts.expect("full snapshot");
    assert_eq!(accounts[0].id, ann());
    assert!(accounts[0].online);
}

#[tokio::test]
async fn test_summary_policy_hides_accounts() {
    let push = RecordingPush::default();
    let (mut hub, _pulses) = Hub::new(config(SnapshotPolicy::Summary), Arc::new(push));
    let mut admin = connect(&mut hub);
    login(&mut hub, &mut admin, "admin", ADMIN_SECRET, None);
    owner(&mut hub, "ann", "car-9");

    send(&mut hub, &admin, ClientEvent::AdminRefresh);
    let snapshot = admin
        .events()
        .into_iter()
        .rev()
        .find_map(|e| match e {
            ServerEvent::AdminSnapshot(s) => Some(s),
            _ => None,
        })
        .expect("no snapshot");
    assert!(snapshot.accounts.is_none());
    assert_eq!(snapshot.summary.accounts, 1);
    assert_eq!(snapshot.summary.channels, 1);
}

#[tokio::test]
async fn test_admin_refresh_requires_admin_role() {
    let (mut hub, _push, _pulses) = hub();
    let mut client = owner(&mut hub, "ann", "car-9");

    send(&mut hub, &client, ClientEvent::AdminRefresh);
    let ack = client.last_ack();
    assert!(!ack.success);
    assert_eq!(ack.message.as_deref(), Some("Unauthorized"));
}

// ---------------------------------------------------------------------------
// Channel registry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_register_channel_is_idempotent() {
    let (mut hub, _push, _pulses) = hub();
    let mut client = owner(&mut hub, "ann", "car-9");

    send(&mut hub, &client, ClientEvent::RegisterChannel(channel_req("ann", "car-9")));
    send(&mut hub, &client, ClientEvent::RegisterChannel(channel_req("ann", "van-2")));
    let dashboard = client.last_ack().dashboard.expect("dashboard");

    let ids: Vec<&str> = dashboard.iter().map(|e| e.channel_id.as_str()).collect();
    assert_eq!(ids, vec!["car-9", "van-2"]);
    assert_eq!(hub.channels.get(&car()).unwrap().owners(), &[ann()]);
}

#[tokio::test]
async fn test_register_requires_matching_session() {
    let (mut hub, _push, _pulses) = hub();
    let mut anonymous = connect(&mut hub);

    send(&mut hub, &anonymous, ClientEvent::RegisterChannel(channel_req("ann", "car-9")));
    assert!(!anonymous.last_ack().success);
    assert!(!hub.channels.contains(&car()));
}

#[tokio::test]
async fn test_focus_by_non_owner_is_noop() {
    let (mut hub, _push, _pulses) = hub();
    owner(&mut hub, "ann", "car-9");
    let mut bob = owner(&mut hub, "bob", "van-2");

    send(&mut hub, &bob, ClientEvent::FocusChannel(channel_req("bob", "car-9")));
    let events = bob.events();
    assert!(!events
        .iter()
        .any(|e| matches!(e, ServerEvent::HistorySync(_))));
    assert!(!hub
        .presence
        .is_member(&bob.conn, &Group::Channel(car())));
}

#[tokio::test]
async fn test_focus_reset_notifies_every_owner() {
    let (mut hub, _push, _pulses) = hub();
    let mut ann_client = owner(&mut hub, "ann", "car-9");
    let mut bob_client = owner(&mut hub, "bob", "car-9");
    let stranger = connect(&mut hub);

    send(&mut hub, &stranger, chat("car-9", "stranger", "hello"));
    for client in [&mut ann_client, &mut bob_client] {
        assert!(client.events().contains(&ServerEvent::DashboardUpdate(
            DashboardEntry {
                channel_id: car(),
                unread: 1,
            }
        )));
    }

    send(&mut hub, &ann_client, ClientEvent::FocusChannel(channel_req("ann", "car-9")));
    assert_eq!(hub.channels.get(&car()).unwrap().unread(), 0);
    assert!(bob_client.events().contains(&ServerEvent::DashboardUpdate(
        DashboardEntry {
            channel_id: car(),
            unread: 0,
        }
    )));
}

// ---------------------------------------------------------------------------
// Message router
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_offline_owner_gets_queued_message_once() {
    let (mut hub, push, _pulses) = hub();
    let ann_client = owner(&mut hub, "ann", "car-9");
    hub.handle(HubCommand::Disconnect {
        conn: ann_client.conn,
    });

    let mut stranger = connect(&mut hub);
    send(&mut hub, &stranger, chat("car-9", "stranger", "where are you"));
    assert!(stranger.last_ack().success);

    assert_eq!(hub.channels.get(&car()).unwrap().pending_len(&ann()), 1);
    let sent = push.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, PushKind::Chat);
    assert_eq!(sent[0].device_token, "tok-ann");
    assert_eq!(sent[0].body, "stranger: where are you");

    let mut back = connect(&mut hub);
    login(&mut hub, &mut back, "ann", "pw", None);
    back.drain();
    send(&mut hub, &back, ClientEvent::FocusChannel(channel_req("ann", "car-9")));

    let events = back.events();
    let replayed: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::ChatReceived(m) => Some(m.text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(replayed, vec!["where are you"]);
    assert_eq!(hub.channels.get(&car()).unwrap().pending_len(&ann()), 0);

    // A second focus replays nothing.
    send(&mut hub, &back, ClientEvent::FocusChannel(channel_req("ann", "car-9")));
    assert!(!back
        .events()
        .iter()
        .any(|e| matches!(e, ServerEvent::ChatReceived(_))));
}

#[tokio::test]
async fn test_pending_replay_keeps_insertion_order() {
    let (mut hub, _push, _pulses) = hub();
    let ann_client = owner(&mut hub, "ann", "car-9");
    hub.handle(HubCommand::Disconnect {
        conn: ann_client.conn,
    });

    let stranger = connect(&mut hub);
    send(&mut hub, &stranger, chat("car-9", "stranger", "one"));
    send(
        &mut hub,
        &stranger,
        ClientEvent::SendAudio(SendAudioRequest {
            channel_id: car(),
            sender_id: "stranger".to_string(),
            audio_payload: "UklGRg==".to_string(),
        }),
    );
    send(&mut hub, &stranger, chat("car-9", "stranger", "three"));

    let mut back = connect(&mut hub);
    login(&mut hub, &mut back, "ann", "pw", None);
    send(&mut hub, &back, ClientEvent::FocusChannel(channel_req("ann", "car-9")));

    let order: Vec<String> = back
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ServerEvent::ChatReceived(m) => Some(m.text),
            ServerEvent::AudioReceived(m) => Some(m.audio_payload),
            _ => None,
        })
        .collect();
    assert_eq!(order, vec!["one", "UklGRg==", "three"]);
}

#[tokio::test]
async fn test_present_recipient_gets_direct_relay_without_push() {
    let (mut hub, push, _pulses) = hub();
    let mut ann_client = owner(&mut hub, "ann", "car-9");
    send(&mut hub, &ann_client, ClientEvent::FocusChannel(channel_req("ann", "car-9")));
    ann_client.drain();

    let stranger = connect(&mut hub);
    send(&mut hub, &stranger, chat("car-9", "stranger", "your lights are on"));

    let events = ann_client.events();
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::ChatReceived(m) if m.text == "your lights are on"
    )));
    assert!(push.sent().is_empty());

    let channel = hub.channels.get(&car()).unwrap();
    assert_eq!(channel.pending_len(&ann()), 0);
    assert_eq!(channel.history_len(), 1);
    assert_eq!(channel.unread(), 1);
}

#[tokio::test]
async fn test_owner_reply_reaches_stranger() {
    let (mut hub, push, _pulses) = hub();
    let ann_client = owner(&mut hub, "ann", "car-9");
    let mut stranger = connect(&mut hub);
    send(&mut hub, &stranger, ClientEvent::TriggerAlert(car()));
    stranger.drain();

    send(&mut hub, &ann_client, chat("car-9", "ann", "coming"));
    assert!(stranger.events().iter().any(|e| matches!(
        e,
        ServerEvent::ChatReceived(m) if m.text == "coming"
    )));
    assert_eq!(push.count(PushKind::Chat), 0);
}

#[tokio::test]
async fn test_audio_history_is_stripped() {
    let (mut hub, push, _pulses) = hub();
    let ann_client = owner(&mut hub, "ann", "car-9");
    hub.handle(HubCommand::Disconnect {
        conn: ann_client.conn,
    });

    let stranger = connect(&mut hub);
    send(
        &mut hub,
        &stranger,
        ClientEvent::SendAudio(SendAudioRequest {
            channel_id: car(),
            sender_id: "stranger".to_string(),
            audio_payload: "bG9uZyBhdWRpbw==".to_string(),
        }),
    );

    let history = hub.channels.get(&car()).unwrap().history();
    assert_eq!(history[0].kind, MessageKind::Audio);
    assert_eq!(history[0].content, AUDIO_PLACEHOLDER);

    let sent = push.sent();
    assert_eq!(sent[0].kind, PushKind::Audio);
    assert!(!sent[0].body.contains("bG9uZyBhdWRpbw=="));
}

#[tokio::test]
async fn test_chat_to_unknown_channel_fails() {
    let (mut hub, push, _pulses) = hub();
    let mut stranger = connect(&mut hub);

    send(&mut hub, &stranger, chat("nowhere", "stranger", "hi"));
    let ack = stranger.last_ack();
    assert!(!ack.success);
    assert_eq!(ack.message.as_deref(), Some("Not found: nowhere"));
    assert!(push.sent().is_empty());
}

fn chats(client: &mut Client) -> Vec<String> {
    client
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ServerEvent::ChatReceived(m) => Some(m.text),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_strangers_never_count_as_presence() {
    let (mut hub, push, _pulses) = hub();
    let ann_client = owner(&mut hub, "ann", "car-9");
    hub.handle(HubCommand::Disconnect {
        conn: ann_client.conn,
    });

    let mut first = connect(&mut hub);
    let mut second = connect(&mut hub);
    send(&mut hub, &first, chat("car-9", "stranger", "hello"));
    send(&mut hub, &second, ClientEvent::TriggerAlert(car()));
    send(&mut hub, &second, chat("car-9", "stranger", "your car is on fire"));

    assert_eq!(hub.channels.get(&car()).unwrap().pending_len(&ann()), 2);
    assert_eq!(push.count(PushKind::Chat), 2);
    assert!(chats(&mut first).is_empty());
    assert!(chats(&mut second).is_empty());

    // The owner's reply reaches every stranger who wrote in.
    let mut back = connect(&mut hub);
    login(&mut hub, &mut back, "ann", "pw", None);
    send(&mut hub, &back, chat("car-9", "ann", "on my way"));
    assert_eq!(chats(&mut first), vec!["on my way"]);
    assert_eq!(chats(&mut second), vec!["on my way"]);
}

#[tokio::test]
async fn test_switching_identity_leaves_channel_presence() {
    let (mut hub, push, _pulses) = hub();
    let mut shared = owner(&mut hub, "ann", "car-9");
    send(&mut hub, &shared, ClientEvent::FocusChannel(channel_req("ann", "car-9")));
    assert!(login(&mut hub, &mut shared, "bob", "pw", None).success);
    shared.drain();

    let stranger = connect(&mut hub);
    send(&mut hub, &stranger, chat("car-9", "stranger", "anyone there?"));

    assert!(chats(&mut shared).is_empty());
    assert!(!hub
        .presence
        .is_member(&shared.conn, &Group::Channel(car())));
    assert_eq!(hub.channels.get(&car()).unwrap().pending_len(&ann()), 1);
    assert_eq!(push.count(PushKind::Chat), 1);
}

#[tokio::test]
async fn test_blur_ends_direct_relay() {
    let (mut hub, push, _pulses) = hub();
    let mut ann_client = owner(&mut hub, "ann", "car-9");
    let bob_client = owner(&mut hub, "bob", "car-9");
    hub.handle(HubCommand::Disconnect {
        conn: bob_client.conn,
    });
    send(&mut hub, &ann_client, ClientEvent::FocusChannel(channel_req("ann", "car-9")));
    ann_client.drain();

    let stranger = connect(&mut hub);
    send(&mut hub, &stranger, chat("car-9", "stranger", "one"));
    assert_eq!(chats(&mut ann_client), vec!["one"]);
    assert_eq!(hub.channels.get(&car()).unwrap().pending_len(&AccountId::from("bob")), 0);

    send(&mut hub, &ann_client, ClientEvent::BlurChannel(channel_req("ann", "car-9")));
    assert!(ann_client.last_ack().success);
    send(&mut hub, &stranger, chat("car-9", "stranger", "two"));

    assert!(chats(&mut ann_client).is_empty());
    assert_eq!(hub.channels.get(&car()).unwrap().pending_len(&AccountId::from("bob")), 1);
    let sent = push.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].device_token, "tok-bob");
}

#[tokio::test]
async fn test_blur_requires_matching_session() {
    let (mut hub, _push, _pulses) = hub();
    let mut stranger = connect(&mut hub);

    send(&mut hub, &stranger, ClientEvent::BlurChannel(channel_req("ann", "car-9")));
    assert_eq!(stranger.last_ack().message.as_deref(), Some("Unauthorized"));
}

// ---------------------------------------------------------------------------
// Alarm escalation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_back_to_back_triggers_start_one_alarm() {
    let (mut hub, _push, _pulses) = hub();
    let mut ann_client = owner(&mut hub, "ann", "car-9");
    let stranger = connect(&mut hub);

    send(&mut hub, &stranger, ClientEvent::TriggerAlert(car()));
    let generation = current_pulse(&hub).generation;
    send(&mut hub, &stranger, ClientEvent::TriggerAlert(car()));

    assert_eq!(hub.alarms.live_count(), 1);
    assert_eq!(current_pulse(&hub).generation, generation);
    assert_eq!(hub.channels.get(&car()).unwrap().unread(), 1);

    let updates = ann_client
        .events()
        .into_iter()
        .filter(|e| matches!(e, ServerEvent::DashboardUpdate(_)))
        .count();
    assert_eq!(updates, 1);
}

#[tokio::test]
async fn test_alert_rings_present_connections() {
    let (mut hub, _push, _pulses) = hub();
    let mut ann_client = owner(&mut hub, "ann", "car-9");
    send(&mut hub, &ann_client, ClientEvent::FocusChannel(channel_req("ann", "car-9")));
    ann_client.drain();

    let mut stranger = connect(&mut hub);
    send(&mut hub, &stranger, ClientEvent::TriggerAlert(car()));

    assert!(ann_client
        .events()
        .iter()
        .any(|e| matches!(e, ServerEvent::Ring(r) if r.channel_id == car())));
    assert!(!stranger
        .events()
        .iter()
        .any(|e| matches!(e, ServerEvent::Ring(_))));
}

#[tokio::test]
async fn test_trigger_for_unknown_channel_is_noop() {
    let (mut hub, push, _pulses) = hub();
    let mut stranger = connect(&mut hub);

    send(&mut hub, &stranger, ClientEvent::TriggerAlert(car()));
    assert_eq!(hub.alarms.live_count(), 0);
    assert!(stranger.drain().is_empty());
    assert!(push.sent().is_empty());
}

#[tokio::test]
async fn test_pulses_exhaust_budget() {
    let (mut hub, push, _pulses) = hub();
    owner(&mut hub, "ann", "car-9");
    let stranger = connect(&mut hub);
    send(&mut hub, &stranger, ClientEvent::TriggerAlert(car()));
    let pulse = current_pulse(&hub);

    for _ in 0..ALARM_PULSE_BUDGET {
        hub.alarm_pulse(&pulse);
    }
    assert_eq!(push.count(PushKind::Alert), ALARM_PULSE_BUDGET as usize);
    assert!(!hub.alarms.is_live(&car()));

    // A sixteenth tick finds nothing to do.
    hub.alarm_pulse(&pulse);
    assert_eq!(push.count(PushKind::Alert), ALARM_PULSE_BUDGET as usize);
}

#[tokio::test]
async fn test_pulse_skips_owners_without_token() {
    let (mut hub, push, _pulses) = hub();
    owner(&mut hub, "ann", "car-9");
    let mut bob = connect(&mut hub);
    login(&mut hub, &mut bob, "bob", "pw", None);
    send(&mut hub, &bob, ClientEvent::RegisterChannel(channel_req("bob", "car-9")));

    let stranger = connect(&mut hub);
    send(&mut hub, &stranger, ClientEvent::TriggerAlert(car()));
    hub.alarm_pulse(&current_pulse(&hub));

    let sent = push.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].device_token, "tok-ann");
}

#[tokio::test]
async fn test_focus_acknowledges_even_when_racing_last_pulse() {
    let (mut hub, push, _pulses) = hub();
    let ann_client = owner(&mut hub, "ann", "car-9");
    let stranger = connect(&mut hub);
    send(&mut hub, &stranger, ClientEvent::TriggerAlert(car()));
    let pulse = current_pulse(&hub);

    for _ in 0..ALARM_PULSE_BUDGET - 1 {
        hub.alarm_pulse(&pulse);
    }
    send(&mut hub, &ann_client, ClientEvent::FocusChannel(channel_req("ann", "car-9")));
    assert!(!hub.alarms.is_live(&car()));

    // The fifteenth tick was already queued when the owner answered.
    hub.alarm_pulse(&pulse);
    assert!(!hub.alarms.is_live(&car()));
    assert_eq!(
        push.count(PushKind::Alert),
        (ALARM_PULSE_BUDGET - 1) as usize
    );

    // A new alert starts again from zero.
    send(&mut hub, &stranger, ClientEvent::TriggerAlert(car()));
    assert_eq!(hub.alarms.get(&car()).unwrap().pulse_count, 0);
}

#[tokio::test]
async fn test_sole_owner_login_acknowledges_alarm() {
    let (mut hub, _push, _pulses) = hub();
    let ann_client = owner(&mut hub, "ann", "car-9");
    hub.handle(HubCommand::Disconnect {
        conn: ann_client.conn,
    });
    let stranger = connect(&mut hub);
    send(&mut hub, &stranger, ClientEvent::TriggerAlert(car()));
    assert!(hub.alarms.is_live(&car()));

    let mut back = connect(&mut hub);
    login(&mut hub, &mut back, "ann", "pw", None);
    assert!(!hub.alarms.is_live(&car()));
}

#[tokio::test]
async fn test_shared_channel_login_keeps_alarm() {
    let (mut hub, _push, _pulses) = hub();
    owner(&mut hub, "ann", "car-9");
    owner(&mut hub, "bob", "car-9");
    let stranger = connect(&mut hub);
    send(&mut hub, &stranger, ClientEvent::TriggerAlert(car()));

    let mut again = connect(&mut hub);
    login(&mut hub, &mut again, "ann", "pw", None);
    assert!(hub.alarms.is_live(&car()));
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_alarm_stops_after_budget() {
    let push = RecordingPush::default();
    let (hub, pulses) = Hub::new(config(SnapshotPolicy::Full), Arc::new(push.clone()));
    let handle = spawn_hub(hub, pulses);

    let (ann_tx, _ann_rx) = mpsc::unbounded_channel();
    let ann_conn = Uuid::new_v4();
    handle
        .send(HubCommand::Connect {
            conn: ann_conn,
            tx: ann_tx,
        })
        .await;
    for event in [
        ClientEvent::Authenticate(AuthenticateRequest {
            id: ann(),
            secret: "pw".to_string(),
            device_token: Some("tok-ann".to_string()),
        }),
        ClientEvent::RegisterChannel(channel_req("ann", "car-9")),
    ] {
        handle
            .send(HubCommand::Inbound {
                conn: ann_conn,
                frame: ClientFrame {
                    request_id: None,
                    event,
                },
            })
            .await;
    }
    handle.send(HubCommand::Disconnect { conn: ann_conn }).await;

    let (stranger_tx, _stranger_rx) = mpsc::unbounded_channel();
    let stranger = Uuid::new_v4();
    handle
        .send(HubCommand::Connect {
            conn: stranger,
            tx: stranger_tx,
        })
        .await;
    handle
        .send(HubCommand::Inbound {
            conn: stranger,
            frame: ClientFrame {
                request_id: None,
                event: ClientEvent::TriggerAlert(car()),
            },
        })
        .await;

    tokio::time::sleep(Duration::from_secs(5 * 3) + Duration::from_millis(500)).await;
    assert_eq!(push.count(PushKind::Alert), 3);
    assert_eq!(handle.stats().await.unwrap().active_alarms, 1);

    tokio::time::sleep(Duration::from_secs(5 * 20)).await;
    assert_eq!(push.count(PushKind::Alert), ALARM_PULSE_BUDGET as usize);
    assert_eq!(handle.stats().await.unwrap().active_alarms, 0);
}

// ---------------------------------------------------------------------------
// Deletion and moderation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_deleting_only_owner_destroys_channel_and_alarm() {
    let (mut hub, push, _pulses) = hub();
    let mut ann_client = owner(&mut hub, "ann", "car-9");
    let stranger = connect(&mut hub);
    send(&mut hub, &stranger, ClientEvent::TriggerAlert(car()));
    let pulse = current_pulse(&hub);
    ann_client.drain();

    send(
        &mut hub,
        &ann_client,
        ClientEvent::DeleteSelf(DeleteSelfRequest {
            id: ann(),
            secret: "pw".to_string(),
        }),
    );

    let received = ann_client.drain();
    assert!(matches!(
        received.first(),
        Some(Outbound::Event(ServerEvent::Ack(ack))) if ack.success
    ));
    assert!(matches!(received.last(), Some(Outbound::Close(_))));

    assert!(!hub.channels.contains(&car()));
    assert!(hub.accounts.get(&ann()).is_none());
    assert_eq!(hub.alarms.live_count(), 0);

    // A pulse already in flight finds nothing.
    hub.alarm_pulse(&pulse);
    assert!(push.sent().is_empty());
}

#[tokio::test]
async fn test_delete_self_rejects_wrong_secret() {
    let (mut hub, _push, _pulses) = hub();
    let mut ann_client = owner(&mut hub, "ann", "car-9");

    send(
        &mut hub,
        &ann_client,
        ClientEvent::DeleteSelf(DeleteSelfRequest {
            id: ann(),
            secret: "nope".to_string(),
        }),
    );
    assert!(!ann_client.last_ack().success);
    assert!(hub.accounts.get(&ann()).is_some());
}

#[tokio::test]
async fn test_deleting_one_of_two_owners_keeps_channel() {
    let (mut hub, _push, _pulses) = hub();
    let ann_client = owner(&mut hub, "ann", "car-9");
    let bob_client = owner(&mut hub, "bob", "car-9");
    hub.handle(HubCommand::Disconnect {
        conn: ann_client.conn,
    });
    hub.handle(HubCommand::Disconnect {
        conn: bob_client.conn,
    });
    let stranger = connect(&mut hub);
    send(&mut hub, &stranger, chat("car-9", "stranger", "hello"));

    let mut admin = connect(&mut hub);
    login(&mut hub, &mut admin, "admin", ADMIN_SECRET, None);
    send(&mut hub, &admin, admin_action(ADMIN_SECRET, "ann", AdminActionKind::Delete));
    assert!(admin.last_ack().success);

    let channel = hub.channels.get(&car()).expect("channel survives");
    assert_eq!(channel.owners(), &[AccountId::from("bob")]);
    assert_eq!(channel.pending_len(&ann()), 0);
    assert_eq!(channel.pending_len(&AccountId::from("bob")), 1);
}

#[tokio::test]
async fn test_admin_action_errors() {
    let (mut hub, _push, _pulses) = hub();
    owner(&mut hub, "ann", "car-9");
    let mut admin = connect(&mut hub);

    send(&mut hub, &admin, admin_action("wrong", "ann", AdminActionKind::Block));
    assert_eq!(admin.last_ack().message.as_deref(), Some("Unauthorized"));

    send(&mut hub, &admin, admin_action(ADMIN_SECRET, "ghost", AdminActionKind::Delete));
    assert_eq!(admin.last_ack().message.as_deref(), Some("Not found: ghost"));
    assert!(!hub.accounts.get(&ann()).unwrap().blocked);
}

#[tokio::test]
async fn test_block_toggle_kicks_and_restores() {
    let (mut hub, _push, _pulses) = hub();
    let mut ann_client = owner(&mut hub, "ann", "car-9");
    let mut admin = connect(&mut hub);
    login(&mut hub, &mut admin, "admin", ADMIN_SECRET, None);
    admin.drain();

    send(&mut hub, &admin, admin_action(ADMIN_SECRET, "ann", AdminActionKind::Block));
    assert!(admin.events().iter().any(|e| matches!(
        e,
        ServerEvent::AdminSnapshot(s) if s.summary.blocked == 1
    )));
    assert!(matches!(ann_client.drain().last(), Some(Outbound::Close(_))));

    // Frames still in flight from the kicked socket are dropped.
    send(&mut hub, &ann_client, ClientEvent::FocusChannel(channel_req("ann", "car-9")));
    assert!(ann_client.drain().is_empty());

    let mut retry = connect(&mut hub);
    let ack = login(&mut hub, &mut retry, "ann", "pw", None);
    assert_eq!(
        ack.message.as_deref(),
        Some("This id has been blocked by an administrator")
    );

    send(&mut hub, &admin, admin_action(ADMIN_SECRET, "ann", AdminActionKind::Block));
    assert!(login(&mut hub, &mut retry, "ann", "pw", None).success);
}
