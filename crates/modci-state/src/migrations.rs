//! SurrealDB schema migrations and initialization

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all modci tables in SurrealDB
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing modci SurrealDB schema");

    init_task_signs_table(db).await?;

    info!("modci schema initialization complete");
    Ok(())
}

/// Initialize `task_signs` table with constraints and indexes
///
/// Schema:
/// ```text
/// TABLE task_signs {
///   task_id:        INT
///   dependency_id:  INT
///   sha_git:        STRING
///   created_at:     DATETIME
/// }
/// ```
///
/// Constraints:
/// - `(task_id, dependency_id)` is unique (one provenance row per pair)
/// - rows are never updated or deleted
async fn init_task_signs_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing task_signs table");

    let sql = r#"
        DEFINE TABLE task_signs AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX idx_task_dependency ON TABLE task_signs COLUMNS task_id, dependency_id UNIQUE;

        DEFINE INDEX idx_task_id ON TABLE task_signs COLUMNS task_id;
    "#;

    db.query(sql)
        .await
        .map_err(|e| crate::StateError::SchemaSetup(e.to_string()))?;
    info!("task_signs table initialized");
    Ok(())
}
