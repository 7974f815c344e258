//! SurrealDB row types.
//!
//! Rows use plain integers and strings; conversion to the domain records in
//! [`crate::model`] happens at the store boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{ProjectId, TaskId, TaskSign};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Row of the `task_signs` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSignRow {
    /// SurrealDB record ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub task_id: i64,
    pub dependency_id: i64,
    pub sha_git: String,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
}

impl From<TaskSign> for TaskSignRow {
    fn from(sign: TaskSign) -> Self {
        TaskSignRow {
            id: None,
            task_id: sign.task_id.0,
            dependency_id: sign.dependency_id.0,
            sha_git: sign.sha_git,
            created_at: sign.created_at,
        }
    }
}

impl From<TaskSignRow> for TaskSign {
    fn from(row: TaskSignRow) -> Self {
        TaskSign {
            task_id: TaskId(row.task_id),
            dependency_id: ProjectId(row.dependency_id),
            sha_git: row.sha_git,
            created_at: row.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_conversion_keeps_fields() {
        let sign = TaskSign::new(TaskId(5), ProjectId(9), "deadbeef");
        let row = TaskSignRow::from(sign.clone());
        assert!(row.id.is_none());
        assert_eq!(row.task_id, 5);
        assert_eq!(row.dependency_id, 9);

        let back = TaskSign::from(row);
        assert_eq!(back, sign);
    }
}
