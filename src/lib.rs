//! Chat relay: copies or forwards messages between chats according to
//! admin-defined forwarders, and keeps edits, replies, pins and deletes in
//! step with the copies.

pub mod config;
pub mod correlation;
pub mod error;
pub mod pipeline;
pub mod platform;
pub mod relay;
pub mod rules;
