//! bridgegate library
//!
//! A real-time WebSocket gateway in front of a local messaging bridge:
//! authenticated clients query chats and messages, send messages and
//! reactions, and stream attachments in chunks.

pub mod bridge;
pub mod cli;
pub mod config;
pub mod gateway;
pub mod logging;
