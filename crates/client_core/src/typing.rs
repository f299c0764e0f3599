use std::time::Duration;

use shared::{domain::ConversationId, protocol::ClientRequest};
use tokio::time::Instant;

pub const TYPING_IDLE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingCommand {
    Start(ConversationId),
    Stop(ConversationId),
}

impl TypingCommand {
    pub fn into_request(self) -> ClientRequest {
        match self {
            Self::Start(conversation_id) => ClientRequest::TypingStart { conversation_id },
            Self::Stop(conversation_id) => ClientRequest::TypingStop { conversation_id },
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveTyping {
    conversation_id: ConversationId,
    last_input: Instant,
    last_start_sent: Instant,
}

/// Turns keystrokes into start/stop signals. A start is repeated while the
/// user keeps typing so the server-side timeout never fires mid-sentence.
#[derive(Debug, Clone)]
pub struct TypingDebouncer {
    idle_timeout: Duration,
    active: Option<ActiveTyping>,
}

impl Default for TypingDebouncer {
    fn default() -> Self {
        Self::new(TYPING_IDLE_TIMEOUT)
    }
}

impl TypingDebouncer {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            active: None,
        }
    }

    pub fn is_typing(&self) -> bool {
        self.active.is_some()
    }

    pub fn input(&mut self, conversation_id: ConversationId, now: Instant) -> Vec<TypingCommand> {
        let mut commands = Vec::new();
        match self.active.as_mut() {
            Some(active) if active.conversation_id == conversation_id => {
                active.last_input = now;
                if now.duration_since(active.last_start_sent) >= self.idle_timeout / 2 {
                    active.last_start_sent = now;
                    commands.push(TypingCommand::Start(conversation_id));
                }
                return commands;
            }
            Some(active) => commands.push(TypingCommand::Stop(active.conversation_id)),
            None => {}
        }
        self.active = Some(ActiveTyping {
            conversation_id,
            last_input: now,
            last_start_sent: now,
        });
        commands.push(TypingCommand::Start(conversation_id));
        commands
    }

    /// Emits the stop once input has been idle for the timeout.
    pub fn tick(&mut self, now: Instant) -> Option<TypingCommand> {
        let active = self.active?;
        if now.duration_since(active.last_input) < self.idle_timeout {
            return None;
        }
        self.active = None;
        Some(TypingCommand::Stop(active.conversation_id))
    }

    pub fn cancel(&mut self) -> Option<TypingCommand> {
        self.active
            .take()
            .map(|active| TypingCommand::Stop(active.conversation_id))
    }

    /// The server clears typing on submit, so no stop is sent.
    pub fn message_sent(&mut self, conversation_id: ConversationId) {
        if self
            .active
            .is_some_and(|active| active.conversation_id == conversation_id)
        {
            self.active = None;
        }
    }
}
