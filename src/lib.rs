//! Storage layer for the Chronicler archive bot.
//!
//! Chronicler keeps a Discord guild's messages, members and channels in an
//! archive and answers the bot's queries over it. Storage runs in one of
//! three modes: an embedded libSQL file, a remote REST store, or both at
//! once with remote-first reads and fan-out writes. [`connect_from_config`]
//! resolves the configured mode into an [`ArchiveDb`] the rest of the bot
//! programs against through the store traits.

pub mod config;
pub mod db;
pub mod error;

pub use config::{ArchiveConfig, ConfigError, StorageMode};
pub use db::{
    ArchiveDb, ArchiveStore, Attachment, ChannelRecord, ChannelStore, MemberRecord, MemberStore,
    MessageRecord, MessageStore, QuerySurface, ResultRow, SummaryStore, Translation,
    connect_from_config,
};
pub use error::DatabaseError;
