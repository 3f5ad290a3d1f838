pub mod conversation_id;
pub mod domain;
pub mod error;
pub mod protocol;

pub use conversation_id::{ConversationId, InvalidFormat};
