//! 异步 SQLite 会话状态存储（sqlx）
//!
//! 整个 ConversationState 以 JSON 存一行，另存 user_id / version / updated_at 便于排查。
//! 需要启用 `async-sqlite` feature。

#[cfg(feature = "async-sqlite")]
mod sqlx_impl {
    use std::path::Path;

    use async_trait::async_trait;
    use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
    use sqlx::Row;

    use crate::core::{ConversationState, StorageError};
    use crate::memory::StateStorageAdapter;

    fn backend(e: sqlx::Error) -> StorageError {
        StorageError::Backend(e.to_string())
    }

    pub struct SqliteStateStorage {
        pool: SqlitePool,
    }

    impl SqliteStateStorage {
        pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, StorageError> {
            let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect(&db_url)
                .await
                .map_err(backend)?;
            let storage = Self { pool };
            storage.init_tables().await?;
            Ok(storage)
        }

        /// 从连接池创建（表需已存在或随后调用 init_tables）
        pub fn from_pool(pool: SqlitePool) -> Self {
            Self { pool }
        }

        pub async fn init_tables(&self) -> Result<(), StorageError> {
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS conversation_states (
                    session_id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    state TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )",
            )
            .execute(&self.pool)
            .await
            .map_err(backend)?;
            Ok(())
        }
    }

    #[async_trait]
    impl StateStorageAdapter for SqliteStateStorage {
        async fn load_state(&self, session_id: &str) -> Result<Option<ConversationState>, StorageError> {
            let row = sqlx::query("SELECT state FROM conversation_states WHERE session_id = ?")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
            match row {
                Some(row) => {
                    let raw: String = row.try_get("state").map_err(backend)?;
                    Ok(Some(serde_json::from_str(&raw)?))
                }
                None => Ok(None),
            }
        }

        async fn save_state(&self, state: &ConversationState) -> Result<(), StorageError> {
            let raw = serde_json::to_string(state)?;
            sqlx::query(
                "INSERT OR REPLACE INTO conversation_states (session_id, user_id, version, state, updated_at)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&state.session_id)
            .bind(&state.user_id)
            .bind(state.metadata.version as i64)
            .bind(raw)
            .bind(state.metadata.last_updated.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
            Ok(())
        }

        async fn delete_state(&self, session_id: &str) -> Result<(), StorageError> {
            sqlx::query("DELETE FROM conversation_states WHERE session_id = ?")
                .bind(session_id)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::UserProfile;

        #[tokio::test]
        async fn test_sqlite_round_trip() {
            let dir = tempfile::tempdir().unwrap();
            let store = SqliteStateStorage::new(dir.path().join("state.db")).await.unwrap();
            let mut state = ConversationState::new("s1", "u1", UserProfile::default());
            store.save_state(&state).await.unwrap();
            state.touch();
            store.save_state(&state).await.unwrap();
            let loaded = store.load_state("s1").await.unwrap().unwrap();
            assert_eq!(loaded.metadata.version, 2);
            store.delete_state("s1").await.unwrap();
            assert!(store.load_state("s1").await.unwrap().is_none());
        }
    }
}

#[cfg(feature = "async-sqlite")]
pub use sqlx_impl::SqliteStateStorage;
