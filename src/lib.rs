pub mod agent;
pub mod format;
pub mod handlers;
pub mod program;
pub mod services;

// Re-export the shell-facing surface for convenient access
pub use agent::dialogue_loop::{AgentConfig, Conversation, ConversationBuilder};
pub use agent::types::UserInput;
