//! Low-level `turso` connection handling and schema migrations. Mirrors the
//! teacher's own migration-table approach (`MIGRATIONS`, `schema_version`):
//! ordered, idempotent, one function per version, applied in sequence.
//!
//! Unlike the teacher, the opened [`Database`] is not kept in a process-wide
//! static: per §9's design note on global mutable state, it is returned to
//! the caller (`main.rs`) and threaded explicitly into [`crate::store::Store`]
//! so tests can open as many independent databases as they like.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use tracing::info;
use turso::{Builder, Connection, Database};

use crate::error::HubError;

type MigrationFn =
    fn(&Connection) -> Pin<Box<dyn Future<Output = Result<(), HubError>> + Send + '_>>;

struct Migration {
    version: i64,
    description: &'static str,
    migrate: MigrationFn,
}

static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "initial schema: hubs, proxies, servers, users, cookie_tokens, api_tokens",
    migrate: migrate_v1,
}];

async fn get_schema_version(conn: &Connection) -> Result<i64, HubError> {
    let mut rows = conn
        .query("SELECT version FROM schema_version LIMIT 1", ())
        .await?;
    let version = rows
        .next()
        .await
        .ok()
        .flatten()
        .and_then(|r| r.get::<i64>(0).ok())
        .unwrap_or(0);
    Ok(version)
}

async fn set_schema_version(conn: &Connection, version: i64) -> Result<(), HubError> {
    conn.execute("DELETE FROM schema_version", ()).await?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?)",
        (version,),
    )
    .await?;
    Ok(())
}

async fn run_migrations(conn: &Connection) -> Result<(), HubError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        (),
    )
    .await?;

    let mut current = get_schema_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current {
            info!(
                "Running migration v{}: {}",
                migration.version, migration.description
            );
            (migration.migrate)(conn).await?;
            set_schema_version(conn, migration.version).await?;
            current = migration.version;
        }
    }

    Ok(())
}

fn migrate_v1(
    conn: &Connection,
) -> Pin<Box<dyn Future<Output = Result<(), HubError>> + Send + '_>> {
    Box::pin(async move {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS servers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ip TEXT NOT NULL,
                port INTEGER NOT NULL,
                proto TEXT NOT NULL,
                base_url TEXT NOT NULL,
                cookie_name TEXT NOT NULL,
                cookie_secret BLOB NOT NULL
            )
            "#,
            (),
        )
        .await?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS hubs (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                server_id INTEGER NOT NULL REFERENCES servers(id)
            )
            "#,
            (),
        )
        .await?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS proxies (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                public_server_id INTEGER NOT NULL REFERENCES servers(id),
                api_server_id INTEGER NOT NULL REFERENCES servers(id),
                auth_token TEXT NOT NULL
            )
            "#,
            (),
        )
        .await?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                server_id INTEGER REFERENCES servers(id),
                state TEXT NOT NULL DEFAULT '{}'
            )
            "#,
            (),
        )
        .await?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS cookie_tokens (
                token TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE
            )
            "#,
            (),
        )
        .await?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS api_tokens (
                token TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE
            )
            "#,
            (),
        )
        .await?;

        Ok(())
    })
}

/// Open (creating if necessary) the database at `path` and run all pending
/// migrations, returning the opened handle for the caller to hold.
pub async fn open(path: &Path) -> Result<Database, HubError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .map_err(|e| HubError::StoreError(format!("failed to create DB directory: {e}")))?;
    }

    let path_str = path.to_str().unwrap_or("hub.db");
    let db = Builder::new_local(path_str)
        .build()
        .await
        .map_err(|e| HubError::StoreError(format!("failed to open database: {e}")))?;

    let conn = db
        .connect()
        .map_err(|e| HubError::StoreError(format!("failed to connect: {e}")))?;

    conn.execute("PRAGMA foreign_keys = ON", ()).await?;
    run_migrations(&conn).await?;

    info!("Database initialized at {}", path_str);
    Ok(db)
}

/// Get a fresh connection with foreign-key enforcement on. Callers never hold
/// a connection across an `.await` boundary outside of its own query/execute
/// calls, so there's no long-lived transaction to leak.
pub async fn conn(db: &Database) -> Result<Connection, HubError> {
    let conn = db
        .connect()
        .map_err(|e| HubError::StoreError(format!("failed to get connection: {e}")))?;
    conn.execute("PRAGMA foreign_keys = ON", ()).await?;
    Ok(conn)
}
