pub mod app_state;
pub mod capabilities;
pub mod chat_manager;
pub mod config;
pub mod conversation;
pub mod error;
pub mod events;
pub mod models;
pub mod prompts;
pub mod protocol;
pub mod router;
pub mod stream_parser; // Thinking and tool-call tag parsing for raw streams
pub mod token_accountant;
pub mod tool_execution;
pub mod tools;
