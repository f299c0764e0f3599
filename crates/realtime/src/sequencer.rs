//! Per-conversation serialization of accepted events.
//!
//! Holding a [`RoomTurn`] means no other task can persist or broadcast into the
//! same conversation, so every subscriber observes one total order.

use std::sync::Arc;

use dashmap::DashMap;
use shared::domain::ConversationId;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct RoomSequencer {
    turns: Arc<DashMap<ConversationId, Arc<Mutex<()>>>>,
}

impl RoomSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn turn(&self, conversation_id: ConversationId) -> RoomTurn {
        let lock = Arc::clone(
            self.turns
                .entry(conversation_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let guard = lock.lock_owned().await;
        RoomTurn {
            conversation_id,
            guard: Some(guard),
            turns: Arc::clone(&self.turns),
        }
    }

    pub fn active_rooms(&self) -> usize {
        self.turns.len()
    }
}

pub struct RoomTurn {
    conversation_id: ConversationId,
    guard: Option<OwnedMutexGuard<()>>,
    turns: Arc<DashMap<ConversationId, Arc<Mutex<()>>>>,
}

impl RoomTurn {
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }
}

impl Drop for RoomTurn {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map still references the lock: nobody holds or waits for it.
        self.turns
            .remove_if(&self.conversation_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn turns_are_exclusive_per_conversation() {
        let sequencer = Arc::new(RoomSequencer::new());
        let first = sequencer.turn(ConversationId(1)).await;

        let other_room = tokio::time::timeout(
            Duration::from_millis(50),
            sequencer.turn(ConversationId(2)),
        )
        .await;
        assert!(other_room.is_ok());

        let contender = {
            let sequencer = Arc::clone(&sequencer);
            tokio::spawn(async move { sequencer.turn(ConversationId(1)).await.conversation_id() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(first);
        assert_eq!(contender.await.expect("join"), ConversationId(1));
    }

    #[tokio::test]
    async fn idle_turns_are_released() {
        let sequencer = RoomSequencer::new();
        drop(sequencer.turn(ConversationId(1)).await);
        assert_eq!(sequencer.active_rooms(), 0);
    }
}
