use super::*;
use chrono::TimeZone;

const ME: UserId = UserId(1);
const PEER: UserId = UserId(2);
const ROOM: ConversationId = ConversationId(10);

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0)
        .single()
        .expect("time")
}

fn message(id: i64, sender: UserId, content: &str, sent: i64) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(id),
        conversation_id: ROOM,
        sender_id: sender,
        sender_name: None,
        content: content.into(),
        kind: MessageKind::Text,
        reply_to_id: None,
        sent_at: at(sent),
    }
}

fn echo(client_ref: &str, content: &str, created: i64) -> PendingEcho {
    PendingEcho {
        client_ref: client_ref.into(),
        content: content.into(),
        kind: MessageKind::Text,
        reply_to_id: None,
        created_at: at(created),
        failed: false,
    }
}

fn ids(timeline: &MessageTimeline) -> Vec<i64> {
    timeline.messages().iter().map(|m| m.message_id.0).collect()
}

#[test]
fn duplicate_ids_are_dropped() {
    let mut timeline = MessageTimeline::new(ROOM, ME);
    assert!(timeline.insert(message(5, PEER, "a", 5)));
    assert!(!timeline.insert(message(5, PEER, "a", 5)));
    assert_eq!(ids(&timeline), vec![5]);
}

#[test]
fn messages_from_other_conversations_are_ignored() {
    let mut timeline = MessageTimeline::new(ROOM, ME);
    let mut stray = message(5, PEER, "a", 5);
    stray.conversation_id = ConversationId(11);
    assert!(!timeline.insert(stray));
    assert!(timeline.messages().is_empty());
}

#[test]
fn older_pages_prepend_without_duplicates() {
    let mut timeline = MessageTimeline::new(ROOM, ME);
    let added = timeline.apply_page(MessagePage {
        messages: vec![message(4, PEER, "d", 4), message(5, PEER, "e", 5)],
        has_more: true,
    });
    assert_eq!(added, 2);

    assert_eq!(timeline.begin_load_older(), Some(MessageId(4)));
    assert!(timeline.is_loading_older());
    assert_eq!(timeline.begin_load_older(), None);

    let added = timeline.apply_page(MessagePage {
        messages: vec![
            message(2, PEER, "b", 2),
            message(3, PEER, "c", 3),
            message(4, PEER, "d", 4),
        ],
        has_more: false,
    });
    assert_eq!(added, 2);
    assert_eq!(ids(&timeline), vec![2, 3, 4, 5]);
    assert!(!timeline.is_loading_older());
    assert!(!timeline.has_more());
    assert_eq!(timeline.begin_load_older(), None);
}

#[test]
fn same_second_messages_order_by_id() {
    let mut timeline = MessageTimeline::new(ROOM, ME);
    timeline.insert(message(9, PEER, "later id", 7));
    timeline.insert(message(8, PEER, "earlier id", 7));
    timeline.insert(message(3, PEER, "earliest", 1));
    assert_eq!(ids(&timeline), vec![3, 8, 9]);
    assert_eq!(timeline.newest_id(), Some(MessageId(9)));
}

#[test]
fn acknowledgement_settles_exact_echo() {
    let mut timeline = MessageTimeline::new(ROOM, ME);
    timeline.add_pending(echo("a", "same", 0));
    timeline.add_pending(echo("b", "same", 1));

    assert!(timeline.acknowledge("b", MessageId(20)));
    assert_eq!(timeline.pending().len(), 1);
    assert_eq!(timeline.pending()[0].client_ref, "a");

    // The broadcast copy of "b" must not also consume "a".
    assert!(timeline.insert(message(20, ME, "same", 1)));
    assert_eq!(timeline.pending().len(), 1);
    assert_eq!(timeline.pending()[0].client_ref, "a");
}

#[test]
fn broadcast_without_ack_settles_oldest_matching_echo() {
    let mut timeline = MessageTimeline::new(ROOM, ME);
    timeline.add_pending(echo("a", "hi", 0));
    timeline.add_pending(echo("b", "hi", 2));
    timeline.add_pending(echo("c", "other", 2));

    assert!(timeline.insert(message(30, ME, "hi", 3)));
    let remaining: Vec<&str> = timeline
        .pending()
        .iter()
        .map(|e| e.client_ref.as_str())
        .collect();
    assert_eq!(remaining, vec!["b", "c"]);

    assert!(!timeline.acknowledge("a", MessageId(30)));
}

#[test]
fn heuristic_respects_window_sender_and_failures() {
    let mut timeline = MessageTimeline::new(ROOM, ME);
    timeline.add_pending(echo("old", "hi", 0));
    timeline.add_pending(echo("failed", "hi", 20));
    assert!(timeline.mark_failed("failed"));

    timeline.insert(message(40, PEER, "hi", 1));
    assert_eq!(timeline.pending().len(), 2);

    timeline.insert(message(41, ME, "hi", 25));
    assert_eq!(timeline.pending().len(), 2);
}
