//! Emergency triage: watches group chats and alerts a recipient when a
//! message looks like an emergency.

pub mod channels;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod store;
