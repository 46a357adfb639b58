//! 会话状态持久化
//!
//! StateStorageAdapter 是唯一的持久化契约（load / save / delete），存储层是会话状态的权威来源；
//! 提供内存实现与「每会话一个 JSON 文件」实现。用户画像通过 ProfileLoader 加载。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::{ConversationState, StorageError, UserProfile};

/// 会话状态存储接口
#[async_trait]
pub trait StateStorageAdapter: Send + Sync {
    async fn load_state(&self, session_id: &str) -> Result<Option<ConversationState>, StorageError>;

    async fn save_state(&self, state: &ConversationState) -> Result<(), StorageError>;

    async fn delete_state(&self, session_id: &str) -> Result<(), StorageError>;
}

/// 内存存储（进程内，测试与单实例部署）
#[derive(Debug, Default)]
pub struct InMemoryStateStorage {
    states: RwLock<HashMap<String, ConversationState>>,
}

impl InMemoryStateStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.states.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.states.read().await.is_empty()
    }
}

#[async_trait]
impl StateStorageAdapter for InMemoryStateStorage {
    async fn load_state(&self, session_id: &str) -> Result<Option<ConversationState>, StorageError> {
        Ok(self.states.read().await.get(session_id).cloned())
    }

    async fn save_state(&self, state: &ConversationState) -> Result<(), StorageError> {
        self.states
            .write()
            .await
            .insert(state.session_id.clone(), state.clone());
        Ok(())
    }

    async fn delete_state(&self, session_id: &str) -> Result<(), StorageError> {
        self.states.write().await.remove(session_id);
        Ok(())
    }
}

/// 文件存储：`<dir>/<编码后的 session_id>.json`，先写临时文件再 rename，避免读到半截内容
#[derive(Debug, Clone)]
pub struct JsonFileStateStorage {
    dir: PathBuf,
}

impl JsonFileStateStorage {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// 会话 id 编码为文件名：[A-Za-z0-9_-] 原样保留，其余字节写作 %XX。
    /// '%' 本身也被编码，不同 id 不会落到同一个文件，也无法逃出目录
    fn path_for(&self, session_id: &str) -> PathBuf {
        let mut name = String::with_capacity(session_id.len());
        for b in session_id.bytes() {
            if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
                name.push(b as char);
            } else {
                name.push_str(&format!("%{b:02X}"));
            }
        }
        self.dir.join(format!("{name}.json"))
    }
}

#[async_trait]
impl StateStorageAdapter for JsonFileStateStorage {
    async fn load_state(&self, session_id: &str) -> Result<Option<ConversationState>, StorageError> {
        let path = self.path_for(session_id);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state: ConversationState = serde_json::from_str(&data)?;
        if state.session_id != session_id {
            tracing::warn!(
                requested = %session_id,
                stored = %state.session_id,
                path = %path.display(),
                "state file belongs to another session, ignoring"
            );
            return Ok(None);
        }
        Ok(Some(state))
    }

    async fn save_state(&self, state: &ConversationState) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&state.session_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(state)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete_state(&self, session_id: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path_for(session_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// 用户画像加载接口
#[async_trait]
pub trait ProfileLoader: Send + Sync {
    async fn load_profile(&self, user_id: &str) -> Result<Option<UserProfile>, StorageError>;
}

/// 不加载任何画像，新会话使用默认画像
#[derive(Debug, Default, Clone)]
pub struct DefaultProfileLoader;

#[async_trait]
impl ProfileLoader for DefaultProfileLoader {
    async fn load_profile(&self, _user_id: &str) -> Result<Option<UserProfile>, StorageError> {
        Ok(None)
    }
}

/// 固定映射的画像加载器
#[derive(Debug, Default, Clone)]
pub struct StaticProfileLoader {
    profiles: HashMap<String, UserProfile>,
}

impl StaticProfileLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(mut self, user_id: impl Into<String>, profile: UserProfile) -> Self {
        self.profiles.insert(user_id.into(), profile);
        self
    }
}

#[async_trait]
impl ProfileLoader for StaticProfileLoader {
    async fn load_profile(&self, user_id: &str) -> Result<Option<UserProfile>, StorageError> {
        Ok(self.profiles.get(user_id).cloned())
    }
}
