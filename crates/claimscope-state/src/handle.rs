//! SurrealDB connection setup
//!
//! Resolves where the store lives and opens an initialized connection.
//! Supports in-memory, local file (`surrealkv://`), explicit URL and
//! authenticated cloud (WebSocket) targets.

use std::path::PathBuf;

use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::{info, instrument};

use crate::error::StateError;
use crate::migrations;
use crate::Result;

/// Namespace used unless configured otherwise
pub const DEFAULT_NAMESPACE: &str = "claimscope";
/// Database used unless configured otherwise
pub const DEFAULT_DATABASE: &str = "main";
/// Local persistence directory used when nothing else is configured
pub const DEFAULT_LOCAL_DIR: &str = ".claimscope/db";

/// Configuration for an authenticated SurrealDB connection
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// WebSocket endpoint URL (e.g., "wss://xxx.aws-use1.surrealdb.cloud")
    pub endpoint: String,
    pub username: String,
    pub password: String,
    /// Namespace (default: "claimscope")
    pub namespace: String,
    /// Database name (default: "main")
    pub database: String,
    /// Whether this is a root user (true) or database user (false)
    pub is_root: bool,
}

impl CloudConfig {
    /// Create a new cloud configuration for a database user
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

    /// Create from environment variables
    ///
    /// Reads:
    /// - SURREALDB_ENDPOINT (required)
    /// - SURREALDB_USERNAME (required)
    /// - SURREALDB_PASSWORD (required)
    /// - SURREALDB_NAMESPACE (optional, default: "claimscope")
    /// - SURREALDB_DATABASE (optional, default: "main")
    /// - SURREALDB_ROOT (optional, default: "false") - set to "true" for root users
    pub fn from_env() -> std::result::Result<Self, String> {
        let endpoint =
            std::env::var("SURREALDB_ENDPOINT").map_err(|_| "SURREALDB_ENDPOINT not set")?;
        let username =
            std::env::var("SURREALDB_USERNAME").map_err(|_| "SURREALDB_USERNAME not set")?;
        let password =
            std::env::var("SURREALDB_PASSWORD").map_err(|_| "SURREALDB_PASSWORD not set")?;
        let namespace =
            std::env::var("SURREALDB_NAMESPACE").unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string());
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

/// Where the store lives.
#[derive(Debug, Clone)]
pub enum StoreTarget {
    /// Volatile `mem://` database
    Memory,
    /// Any URL understood by `surrealdb::engine::any`
    Url(String),
    /// `surrealkv://` directory on local disk
    Local(PathBuf),
    /// Authenticated remote endpoint
    Cloud(CloudConfig),
}

impl StoreTarget {
    /// Resolve the target from the environment.
    ///
    /// If SURREALDB_ENDPOINT (plus credentials) is set, connects to cloud.
    /// If SURREALDB_URL is set, connects to that URL.
    /// Otherwise, falls back to local persistence in `.claimscope/db`.
    pub fn from_env() -> Self {
        if let Ok(config) = CloudConfig::from_env() {
            return StoreTarget::Cloud(config);
        }
        if let Ok(url) = std::env::var("SURREALDB_URL") {
            return StoreTarget::Url(url);
        }
        StoreTarget::Local(PathBuf::from(DEFAULT_LOCAL_DIR))
    }

    /// Parse a CLI-style target: `mem://`, `surrealkv://<dir>`, any other URL.
    pub fn parse(s: &str) -> Self {
        if s == "mem://" || s == "memory" {
            StoreTarget::Memory
        } else if let Some(dir) = s.strip_prefix("surrealkv://") {
            StoreTarget::Local(PathBuf::from(dir))
        } else {
            StoreTarget::Url(s.to_string())
        }
    }
}

impl std::fmt::Display for StoreTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreTarget::Memory => write!(f, "mem://"),
            StoreTarget::Url(url) => write!(f, "{url}"),
            StoreTarget::Local(dir) => write!(f, "surrealkv://{}", dir.display()),
            StoreTarget::Cloud(config) => write!(f, "{}", config.endpoint),
        }
    }
}

/// Open a connection to `target`, select the namespace/database and run
/// schema initialization.
#[instrument(skip_all, fields(target = %target))]
pub async fn connect(target: &StoreTarget) -> Result<Surreal<Any>> {
    let db = match target {
        StoreTarget::Memory => open("mem://", DEFAULT_NAMESPACE, DEFAULT_DATABASE).await?,
        StoreTarget::Url(url) => open(url, DEFAULT_NAMESPACE, DEFAULT_DATABASE).await?,
        StoreTarget::Local(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| {
                StateError::Connection(format!(
                    "Failed to create database directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
            let url = format!("surrealkv://{}", dir.display());
            open(&url, DEFAULT_NAMESPACE, DEFAULT_DATABASE).await?
        }
        StoreTarget::Cloud(config) => connect_cloud(config).await?,
    };

    migrations::init_schema(&db).await?;
    info!("SurrealDB connected and schema initialized");
    Ok(db)
}

async fn open(url: &str, namespace: &str, database: &str) -> Result<Surreal<Any>> {
    let db = surrealdb::engine::any::connect(url)
        .await
        .map_err(|e| StateError::Connection(format!("Failed to connect to {}: {}", url, e)))?;

    db.use_ns(namespace)
        .use_db(database)
        .await
        .map_err(|e| StateError::Connection(e.to_string()))?;
    Ok(db)
}

async fn connect_cloud(config: &CloudConfig) -> Result<Surreal<Any>> {
    info!("Connecting to SurrealDB Cloud (root={})", config.is_root);

    let db = surrealdb::engine::any::connect(&config.endpoint)
        .await
        .map_err(|e| {
            StateError::Connection(format!("Failed to connect to {}: {}", config.endpoint, e))
        })?;

    if config.is_root {
        db.signin(Root {
            username: &config.username,
            password: &config.password,
        })
        .await
        .map_err(|e| StateError::Connection(format!("Root authentication failed: {}", e)))?;
    } else {
        db.signin(Database {
            namespace: &config.namespace,
            database: &config.database,
            username: &config.username,
            password: &config.password,
        })
        .await
        .map_err(|e| StateError::Connection(format!("Database authentication failed: {}", e)))?;
    }

    db.use_ns(&config.namespace)
        .use_db(&config.database)
        .await
        .map_err(|e| {
            StateError::Connection(format!("Failed to select namespace/database: {}", e))
        })?;
    Ok(db)
}
