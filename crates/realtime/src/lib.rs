pub mod auth;
pub mod connection;
pub mod error;
pub mod hub;
pub mod presence;
pub mod read_state;
pub mod rooms;
pub mod sequencer;
pub mod store;
pub mod typing;

pub use auth::SessionAuthenticator;
pub use connection::{ConnectionHandle, Identity};
pub use error::RealtimeError;
pub use hub::{ChatHub, HubConfig, MessageDraft, MAX_MESSAGE_CHARS};
pub use store::{Account, ChatStore};
