// Parley conversation engine
// Library half of the crate; the binary is a terminal host for it.
pub mod config;
pub mod conversation;
pub mod models;

pub use conversation::{Conversation, ConversationError, EngineEvent};
pub use models::*;
