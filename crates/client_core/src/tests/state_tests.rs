use super::*;
use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{ConversationKind, MembershipState, MessageKind, Role},
    protocol::MessagePayload,
};

const ME: UserId = UserId(1);
const BOB: UserId = UserId(2);
const HOME: ConversationId = ConversationId(10);
const WORK: ConversationId = ConversationId(11);

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0)
        .single()
        .expect("time")
}

fn summary(id: ConversationId, activity: i64) -> ConversationSummary {
    ConversationSummary {
        conversation_id: id,
        kind: ConversationKind::Private,
        title: "bob".into(),
        description: None,
        peer_id: Some(BOB),
        role: Role::Member,
        state: MembershipState::Accepted,
        last_message: None,
        last_activity_at: at(activity),
        unread_count: 0,
    }
}

fn delivered(id: i64, conversation_id: ConversationId, sender: UserId, sent: i64) -> ServerEvent {
    ServerEvent::MessageDelivered {
        message: MessagePayload {
            message_id: MessageId(id),
            conversation_id,
            sender_id: sender,
            sender_name: None,
            content: "hello".into(),
            kind: MessageKind::Text,
            reply_to_id: None,
            sent_at: at(sent),
        },
    }
}

fn state() -> ChatState {
    let mut state = ChatState::new(ME);
    state.replace_conversations(vec![summary(HOME, 10), summary(WORK, 20)], Vec::new());
    state
}

#[test]
fn delivery_to_background_conversation_bumps_and_counts_unread() {
    let mut state = state();
    state.open_conversation(WORK);

    let events = state.apply_server_event(delivered(1, HOME, BOB, 30));
    assert_eq!(events, vec![ClientEvent::ConversationsUpdated]);

    let first = &state.conversations().entries()[0];
    assert_eq!(first.conversation_id, HOME);
    assert_eq!(first.unread_count, 1);
    assert!(state
        .open_timeline()
        .is_some_and(|timeline| timeline.messages().is_empty()));
}

#[test]
fn delivery_to_open_conversation_lands_in_timeline_once() {
    let mut state = state();
    state.open_conversation(HOME);

    let events = state.apply_server_event(delivered(1, HOME, BOB, 30));
    assert!(events.contains(&ClientEvent::TimelineUpdated {
        conversation_id: HOME
    }));
    let again = state.apply_server_event(delivered(1, HOME, BOB, 30));
    assert!(!again.contains(&ClientEvent::TimelineUpdated {
        conversation_id: HOME
    }));

    assert_eq!(state.open_timeline().map(|t| t.messages().len()), Some(1));
    assert_eq!(state.conversations().get(HOME).map(|c| c.unread_count), Some(0));
}

#[test]
fn unknown_conversation_marks_list_stale() {
    let mut state = state();
    let events = state.apply_server_event(ServerEvent::ConversationActivity {
        conversation_id: ConversationId(99),
        message_id: MessageId(5),
        sender_id: BOB,
        last_activity_at: at(40),
    });
    assert_eq!(events, vec![ClientEvent::ConversationsStale]);
}

#[test]
fn pages_for_a_closed_conversation_are_discarded() {
    let mut state = state();
    assert_eq!(state.open_conversation(HOME), None);
    assert_eq!(state.open_conversation(WORK), Some(HOME));

    let page = MessagePage {
        messages: Vec::new(),
        has_more: false,
    };
    assert!(!state.apply_page(HOME, page.clone()));
    assert!(state.apply_page(WORK, page));
    assert_eq!(state.open_conversation_id(), Some(WORK));
}

#[test]
fn ack_settles_pending_echo() {
    let mut state = state();
    state.open_conversation(HOME);
    assert!(state.add_pending(
        HOME,
        PendingEcho {
            client_ref: "ref-1".into(),
            content: "hello".into(),
            kind: MessageKind::Text,
            reply_to_id: None,
            created_at: at(29),
            failed: false,
        },
    ));

    let events = state.apply_server_event(ServerEvent::MessageAccepted {
        client_ref: "ref-1".into(),
        conversation_id: HOME,
        message_id: MessageId(7),
        sent_at: at(30),
    });
    assert_eq!(
        events,
        vec![
            ClientEvent::MessageConfirmed {
                client_ref: "ref-1".into(),
                message_id: MessageId(7)
            },
            ClientEvent::TimelineUpdated {
                conversation_id: HOME
            },
        ]
    );
    state.apply_server_event(delivered(7, HOME, ME, 30));
    let timeline = state.open_timeline().expect("open");
    assert!(timeline.pending().is_empty());
    assert_eq!(timeline.messages().len(), 1);
}

#[test]
fn typing_tracks_users_and_clears_on_message() {
    let mut state = state();
    state.open_conversation(HOME);

    let started = ServerEvent::TypingStarted {
        conversation_id: HOME,
        user_id: BOB,
    };
    assert_eq!(
        state.apply_server_event(started.clone()),
        vec![ClientEvent::TypingUpdated {
            conversation_id: HOME,
            user_ids: vec![BOB]
        }]
    );
    assert!(state.apply_server_event(started).is_empty());

    let events = state.apply_server_event(delivered(3, HOME, BOB, 40));
    assert_eq!(
        events[0],
        ClientEvent::TypingUpdated {
            conversation_id: HOME,
            user_ids: Vec::new()
        }
    );
    assert!(state.typing_in(HOME).is_empty());
}

#[test]
fn own_read_status_clears_unread_and_cursor_is_monotonic() {
    let mut state = state();
    state.apply_server_event(delivered(4, HOME, BOB, 30));
    assert_eq!(state.conversations().get(HOME).map(|c| c.unread_count), Some(1));

    let read = |message_id| ServerEvent::ReadStatus {
        conversation_id: HOME,
        user_id: ME,
        message_id: MessageId(message_id),
        read_at: at(50),
    };
    let events = state.apply_server_event(read(4));
    assert!(events.contains(&ClientEvent::ConversationsUpdated));
    assert_eq!(state.conversations().get(HOME).map(|c| c.unread_count), Some(0));

    state.apply_server_event(read(2));
    assert_eq!(state.read_cursor_of(HOME, ME), Some(MessageId(4)));
}

#[test]
fn presence_follows_snapshot_and_transitions() {
    let mut state = ChatState::default();
    state.apply_server_event(ServerEvent::Ready {
        user: PresenceEntry {
            user_id: ME,
            display_name: "me".into(),
            status: PresenceStatus::Online,
        },
        online: vec![PresenceEntry {
            user_id: BOB,
            display_name: "bob".into(),
            status: PresenceStatus::Away,
        }],
    });
    assert_eq!(state.own_user_id(), Some(ME));
    assert_eq!(state.presence_of(BOB), PresenceStatus::Away);

    state.apply_server_event(ServerEvent::PresenceOffline {
        user_id: BOB,
        last_seen: at(60),
    });
    assert_eq!(state.presence_of(BOB), PresenceStatus::Offline);

    state.apply_server_event(ServerEvent::PresenceStatusChanged {
        user_id: ME,
        status: PresenceStatus::Busy,
    });
    assert_eq!(state.user().map(|u| u.status), Some(PresenceStatus::Busy));
}

#[test]
fn removed_conversation_closes_timeline() {
    let mut state = state();
    state.open_conversation(HOME);
    let events = state.apply_server_event(ServerEvent::ConversationRemoved {
        conversation_id: HOME,
    });
    assert_eq!(
        events[0],
        ClientEvent::ConversationRemoved {
            conversation_id: HOME
        }
    );
    assert_eq!(state.open_conversation_id(), None);
    assert!(state.conversations().get(HOME).is_none());
}

#[test]
fn status_change_for_a_user_missing_from_the_snapshot_shows_them() {
    let mut state = ChatState::default();
    state.apply_server_event(ServerEvent::Ready {
        user: PresenceEntry {
            user_id: ME,
            display_name: "me".into(),
            status: PresenceStatus::Online,
        },
        online: Vec::new(),
    });
    assert_eq!(state.presence_of(BOB), PresenceStatus::Offline);

    let events = state.apply_server_event(ServerEvent::PresenceStatusChanged {
        user_id: BOB,
        status: PresenceStatus::Online,
    });
    assert_eq!(
        events,
        vec![ClientEvent::PresenceUpdated {
            user_id: BOB,
            status: PresenceStatus::Online
        }]
    );
    assert_eq!(state.presence_of(BOB), PresenceStatus::Online);

    state.apply_server_event(ServerEvent::PresenceStatusChanged {
        user_id: BOB,
        status: PresenceStatus::Offline,
    });
    assert_eq!(state.presence_of(BOB), PresenceStatus::Offline);
}
