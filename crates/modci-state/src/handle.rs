//! SurrealDB connection setup
//!
//! Resolves where provenance is persisted:
//! 1. SurrealDB cloud/remote via `SURREALDB_ENDPOINT` + credentials
//! 2. Any engine URL via `SURREALDB_URL`
//! 3. Local `surrealkv://` persistence under `.modci/db`

use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::info;

use crate::error::StateError;
use crate::migrations;
use crate::Result;

const DEFAULT_NAMESPACE: &str = "modci";
const DEFAULT_DATABASE: &str = "main";
const LOCAL_DB_PATH: &str = ".modci/db";

/// Configuration for an authenticated SurrealDB connection
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// WebSocket endpoint URL (e.g., "wss://xxx.aws-use1.surrealdb.cloud")
    pub endpoint: String,
    pub username: String,
    pub password: String,
    /// Namespace (default: "modci")
    pub namespace: String,
    /// Database name (default: "main")
    pub database: String,
    /// Whether this is a root user (true) or database user (false)
    pub is_root: bool,
}

impl CloudConfig {
    /// Create a new configuration for a database user
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            is_root: false,
        }
    }

    /// Set whether this is a root user
    pub fn with_root(mut self, is_root: bool) -> Self {
        self.is_root = is_root;
        self
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - SURREALDB_ENDPOINT (required)
    /// - SURREALDB_USERNAME (required)
    /// - SURREALDB_PASSWORD (required)
    /// - SURREALDB_NAMESPACE (optional, default: "modci")
    /// - SURREALDB_DATABASE (optional, default: "main")
    /// - SURREALDB_ROOT (optional, default: "false")
    pub fn from_env() -> std::result::Result<Self, String> {
        let endpoint =
            std::env::var("SURREALDB_ENDPOINT").map_err(|_| "SURREALDB_ENDPOINT not set")?;
        let username =
            std::env::var("SURREALDB_USERNAME").map_err(|_| "SURREALDB_USERNAME not set")?;
        let password =
            std::env::var("SURREALDB_PASSWORD").map_err(|_| "SURREALDB_PASSWORD not set")?;
        let namespace = std::env::var("SURREALDB_NAMESPACE")
            .unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string());
        let database =
            std::env::var("SURREALDB_DATABASE").unwrap_or_else(|_| DEFAULT_DATABASE.to_string());
        let is_root = std::env::var("SURREALDB_ROOT")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(false);

        Ok(Self {
            endpoint,
            username,
            password,
            namespace,
            database,
            is_root,
        })
    }
}

/// Connect to an in-memory engine and initialise the schema.
pub async fn connect_in_memory() -> Result<Surreal<Any>> {
    open_url("mem://").await
}

/// Connect using the environment chain documented at module level.
pub async fn connect_from_env() -> Result<Surreal<Any>> {
    if let Ok(config) = CloudConfig::from_env() {
        return connect_cloud(&config).await;
    }

    if let Ok(url) = std::env::var("SURREALDB_URL") {
        let db = open_url(&url).await?;
        info!(%url, "SurrealDB connected");
        return Ok(db);
    }

    std::fs::create_dir_all(LOCAL_DB_PATH).map_err(|e| {
        StateError::Connection(format!("cannot create {LOCAL_DB_PATH}: {e}"))
    })?;
    let url = format!("surrealkv://{LOCAL_DB_PATH}");
    info!(%url, "no remote SurrealDB configured, using local persistence");
    open_url(&url).await
}

/// Unauthenticated engine URL, default namespace and database.
async fn open_url(url: &str) -> Result<Surreal<Any>> {
    let db = surrealdb::engine::any::connect(url)
        .await
        .map_err(|e| StateError::Connection(format!("{url}: {e}")))?;
    select_and_migrate(db, DEFAULT_NAMESPACE, DEFAULT_DATABASE).await
}

async fn connect_cloud(config: &CloudConfig) -> Result<Surreal<Any>> {
    let db = surrealdb::engine::any::connect(&config.endpoint)
        .await
        .map_err(|e| StateError::Connection(format!("{}: {e}", config.endpoint)))?;

    let signed_in = if config.is_root {
        db.signin(Root {
            username: &config.username,
            password: &config.password,
        })
        .await
    } else {
        db.signin(Database {
            namespace: &config.namespace,
            database: &config.database,
            username: &config.username,
            password: &config.password,
        })
        .await
    };
    signed_in.map_err(|e| {
        StateError::Connection(format!("sign-in as {} failed: {e}", config.username))
    })?;

    let db = select_and_migrate(db, &config.namespace, &config.database).await?;
    info!(endpoint = %config.endpoint, "SurrealDB connected (cloud)");
    Ok(db)
}

async fn select_and_migrate(
    db: Surreal<Any>,
    namespace: &str,
    database: &str,
) -> Result<Surreal<Any>> {
    db.use_ns(namespace)
        .use_db(database)
        .await
        .map_err(|e| StateError::Connection(e.to_string()))?;
    migrations::init_schema(&db).await?;
    Ok(db)
}
