//! 记忆层：对话历史与会话状态持久化

pub mod async_persistence;
pub mod conversation;
pub mod persistence;

#[cfg(feature = "async-sqlite")]
pub use async_persistence::SqliteStateStorage;
pub use conversation::{
    ConversationMessage, MessageMetadata, MessageSource, NewMessage, Role, MAX_HISTORY,
};
pub use persistence::{
    DefaultProfileLoader, InMemoryStateStorage, JsonFileStateStorage, ProfileLoader,
    StateStorageAdapter, StaticProfileLoader,
};
