// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Durable store for users, conversations, and messages.
//!
//! Single-process, single-writer: one [`Storage`] handle exists per process
//! and serializes all writes through its inner connection. Calls are
//! synchronous from the caller's perspective; async layers above call them
//! directly (every operation is a handful of row touches).
//!
//! The message `content` column holds the serialized [`MessageContent`]
//! sum type; the discriminant is mirrored into the `type` column so merge
//! paths can filter without deserializing.

mod conversations;
mod db;
mod error;
pub mod legacy;
mod messages;
mod migrations;
mod types;
mod users;

pub use db::Storage;
pub use error::StorageError;
pub use users::SYSTEM_USER_ID;
pub use types::{
    Conversation, ConversationExtra, ConversationKind, ConversationStatus, ConversationUpdate,
    MessageContent, MessageStatus, Page, Position, StoredMessage, TipsKind, ToolGroupItem,
};

pub type Result<T> = std::result::Result<T, StorageError>;
