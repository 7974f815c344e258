//! SurrealDB-backed TaskSignStore implementation
//!
//! Uses `schema::TaskSignRow` for persistence, converting to/from
//! [`TaskSign`] at the boundary. The unique `(task_id, dependency_id)` index
//! backs the one-sign-per-pair contract.

use async_trait::async_trait;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::handle;
use crate::model::{ProjectId, TaskId, TaskSign};
use crate::schema::TaskSignRow;
use crate::storage_traits::{StorageResult, TaskSignStore};

/// SurrealDB-backed implementation of [`TaskSignStore`].
pub struct SurrealTaskSignStore {
    db: Surreal<Any>,
}

impl SurrealTaskSignStore {
    /// Wrap an already-initialised connection.
    pub fn new(db: Surreal<Any>) -> Self {
        Self { db }
    }

    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        let db = handle::connect_in_memory().await?;
        info!("SurrealTaskSignStore connected (in-memory)");
        Ok(Self { db })
    }

    /// Create from environment variables (see [`handle::connect_from_env`]).
    pub async fn from_env() -> crate::Result<Self> {
        let db = handle::connect_from_env().await?;
        Ok(Self { db })
    }
}

#[async_trait]
impl TaskSignStore for SurrealTaskSignStore {
    async fn find(
        &self,
        dependency_id: ProjectId,
        task_id: TaskId,
    ) -> StorageResult<Option<TaskSign>> {
        let mut res = self
            .db
            .query("SELECT * FROM task_signs WHERE task_id = $tid AND dependency_id = $did LIMIT 1")
            .bind(("tid", task_id.0))
            .bind(("did", dependency_id.0))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<TaskSignRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(rows.into_iter().next().map(TaskSign::from))
    }

    async fn insert(&self, sign: TaskSign) -> StorageResult<()> {
        if self.find(sign.dependency_id, sign.task_id).await?.is_some() {
            return Err(StorageError::DuplicateTaskSign {
                task_id: sign.task_id,
                dependency_id: sign.dependency_id,
            });
        }

        debug!(
            task_id = %sign.task_id,
            dependency_id = %sign.dependency_id,
            sha = %sign.sha_git,
            "recording task sign"
        );

        let task_id = sign.task_id;
        let dependency_id = sign.dependency_id;
        let row = TaskSignRow::from(sign);

        let _created: Option<TaskSignRow> = self
            .db
            .create("task_signs")
            .content(row)
            .await
            .map_err(|e| {
                // Lost a race against another writer on the unique index.
                if e.to_string().contains("already contains") {
                    StorageError::DuplicateTaskSign {
                        task_id,
                        dependency_id,
                    }
                } else {
                    StorageError::Backend(e.to_string())
                }
            })?;

        Ok(())
    }

    async fn list_by_task(&self, task_id: TaskId) -> StorageResult<Vec<TaskSign>> {
        let mut res = self
            .db
            .query("SELECT * FROM task_signs WHERE task_id = $tid ORDER BY dependency_id ASC")
            .bind(("tid", task_id.0))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<TaskSignRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(rows.into_iter().map(TaskSign::from).collect())
    }
}
