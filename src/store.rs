//! Typed CRUD over the schema `db.rs` migrates into place. Mirrors the
//! teacher's `ModelsStore`/`ClientKeysStore` shape: a thin struct wrapping a
//! connection source, one method per query, row extraction inline rather
//! than behind a derive.

use turso::Database;

use crate::db;
use crate::error::HubError;
use crate::model::{ApiToken, CookieToken, Hub, NewServer, Proxy, Server, User};

#[derive(Clone)]
pub struct Store {
    database: std::sync::Arc<Database>,
}

impl Store {
    pub fn new(database: std::sync::Arc<Database>) -> Self {
        Self { database }
    }

    async fn conn(&self) -> Result<turso::Connection, HubError> {
        db::conn(&self.database).await
    }

    async fn insert_server(&self, conn: &turso::Connection, s: &NewServer) -> Result<i64, HubError> {
        conn.execute(
            "INSERT INTO servers (ip, port, proto, base_url, cookie_name, cookie_secret) VALUES (?, ?, ?, ?, ?, ?)",
            (
                s.ip.as_str(),
                s.port as i64,
                s.proto.as_str(),
                s.base_url.as_str(),
                s.cookie_name.as_str(),
                s.cookie_secret.clone(),
            ),
        )
        .await?;

        let mut rows = conn.query("SELECT last_insert_rowid()", ()).await?;
        let id = rows
            .next()
            .await
            .ok()
            .flatten()
            .and_then(|r| r.get::<i64>(0).ok())
            .ok_or_else(|| HubError::StoreError("failed to read inserted server id".into()))?;
        Ok(id)
    }

    async fn get_server(&self, conn: &turso::Connection, id: i64) -> Result<Server, HubError> {
        let mut rows = conn
            .query(
                "SELECT id, ip, port, proto, base_url, cookie_name, cookie_secret FROM servers WHERE id = ?",
                (id,),
            )
            .await?;
        let row = rows.next().await?.ok_or(HubError::NotFound)?;
        Ok(Server {
            id: row.get::<i64>(0)?,
            ip: row.get::<String>(1)?,
            port: row.get::<i64>(2)? as u16,
            proto: row.get::<String>(3)?,
            base_url: row.get::<String>(4)?,
            cookie_name: row.get::<String>(5)?,
            cookie_secret: row.get::<Vec<u8>>(6)?,
        })
    }

    /// Looks a user up by name, creating a fresh (serverless) row on first
    /// sight. Mirrors the lazy-creation behavior described in the original
    /// handler: a user who has only ever authenticated has no `Server` row
    /// until something spawns one for them.
    pub async fn get_or_create_user(&self, name: &str) -> Result<User, HubError> {
        if let Some(user) = self.find_user(name).await? {
            return Ok(user);
        }

        let conn = self.conn().await?;
        conn.execute(
            "INSERT OR IGNORE INTO users (name, server_id, state) VALUES (?, NULL, '{}')",
            (name,),
        )
        .await?;

        self.find_user(name)
            .await?
            .ok_or_else(|| HubError::StoreError(format!("user {name} vanished after insert")))
    }

    pub async fn find_user(&self, name: &str) -> Result<Option<User>, HubError> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT id, name, server_id, state FROM users WHERE name = ?",
                (name,),
            )
            .await?;
        match rows.next().await? {
            Some(row) => {
                let state_text: String = row.get::<String>(3)?;
                let state = serde_json::from_str(&state_text)
                    .map_err(|e| HubError::StoreError(format!("corrupt user.state JSON: {e}")))?;
                Ok(Some(User {
                    id: row.get::<i64>(0)?,
                    name: row.get::<String>(1)?,
                    server_id: row.get::<Option<i64>>(2)?,
                    state,
                }))
            }
            None => Ok(None),
        }
    }

    pub async fn get_user_by_id(&self, id: i64) -> Result<User, HubError> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT id, name, server_id, state FROM users WHERE id = ?",
                (id,),
            )
            .await?;
        let row = rows.next().await?.ok_or(HubError::NotFound)?;
        let state_text: String = row.get::<String>(3)?;
        let state = serde_json::from_str(&state_text)
            .map_err(|e| HubError::StoreError(format!("corrupt user.state JSON: {e}")))?;
        Ok(User {
            id: row.get::<i64>(0)?,
            name: row.get::<String>(1)?,
            server_id: row.get::<Option<i64>>(2)?,
            state,
        })
    }

    /// Assigns a user's active `Server`, inserting the row first. The caller
    /// is expected to have populated the server's real `port`/`ip` after the
    /// spawner reported them (see `SpawnController`).
    pub async fn set_user_server(&self, user_id: i64, server: &NewServer) -> Result<Server, HubError> {
        let conn = self.conn().await?;
        let server_id = self.insert_server(&conn, server).await?;
        conn.execute(
            "UPDATE users SET server_id = ? WHERE id = ?",
            (server_id, user_id),
        )
        .await?;
        self.get_server(&conn, server_id).await
    }

    /// Clears a user's server pointer and deletes the stale `Server` row in
    /// the same step, rather than leaving it for a separate sweep: the row
    /// has no other owner once the pointer is gone.
    pub async fn clear_user_server(&self, user_id: i64) -> Result<(), HubError> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query("SELECT server_id FROM users WHERE id = ?", (user_id,))
            .await?;
        let server_id = rows
            .next()
            .await?
            .and_then(|r| r.get::<Option<i64>>(0).ok().flatten());

        conn.execute(
            "UPDATE users SET server_id = NULL WHERE id = ?",
            (user_id,),
        )
        .await?;

        if let Some(server_id) = server_id {
            conn.execute("DELETE FROM servers WHERE id = ?", (server_id,))
                .await?;
        }
        Ok(())
    }

    pub async fn set_user_state(&self, user_id: i64, state: &serde_json::Value) -> Result<(), HubError> {
        let conn = self.conn().await?;
        let text = serde_json::to_string(state)
            .map_err(|e| HubError::StoreError(format!("failed to serialize user state: {e}")))?;
        conn.execute(
            "UPDATE users SET state = ? WHERE id = ?",
            (text, user_id),
        )
        .await?;
        Ok(())
    }

    pub async fn get_user_server(&self, user: &User) -> Result<Option<Server>, HubError> {
        match user.server_id {
            Some(id) => {
                let conn = self.conn().await?;
                Ok(Some(self.get_server(&conn, id).await?))
            }
            None => Ok(None),
        }
    }

    pub async fn mint_cookie_token(&self, user_id: i64) -> Result<String, HubError> {
        let token = crate::mint::TokenMint::mint();
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO cookie_tokens (token, user_id) VALUES (?, ?)",
            (token.as_str(), user_id),
        )
        .await?;
        Ok(token)
    }

    /// Scans every live cookie token and compares it against the presented
    /// one with `TokenMint::constant_time_equal`, rather than letting SQLite
    /// short-circuit on a `WHERE token = ?` equality, so a wrong guess takes
    /// the same time regardless of how many characters matched.
    pub async fn find_cookie_token(&self, token: &str) -> Result<Option<CookieToken>, HubError> {
        let conn = self.conn().await?;
        let mut rows = conn.query("SELECT token, user_id FROM cookie_tokens", ()).await?;
        while let Some(row) = rows.next().await? {
            let candidate: String = row.get::<String>(0)?;
            if crate::mint::TokenMint::constant_time_equal(&candidate, token) {
                return Ok(Some(CookieToken {
                    token: candidate,
                    user_id: row.get::<i64>(1)?,
                }));
            }
        }
        Ok(None)
    }

    pub async fn mint_api_token(&self, user_id: i64) -> Result<String, HubError> {
        let token = crate::mint::TokenMint::mint();
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO api_tokens (token, user_id) VALUES (?, ?)",
            (token.as_str(), user_id),
        )
        .await?;
        Ok(token)
    }

    pub async fn find_api_token(&self, token: &str) -> Result<Option<ApiToken>, HubError> {
        let conn = self.conn().await?;
        let mut rows = conn.query("SELECT token, user_id FROM api_tokens", ()).await?;
        while let Some(row) = rows.next().await? {
            let candidate: String = row.get::<String>(0)?;
            if crate::mint::TokenMint::constant_time_equal(&candidate, token) {
                return Ok(Some(ApiToken {
                    token: candidate,
                    user_id: row.get::<i64>(1)?,
                }));
            }
        }
        Ok(None)
    }

    /// Drops every `APIToken` owned by a user. Unlike cookie tokens (which
    /// may be left to become unreachable, §3), a spawn's API token must not
    /// outlive the spawn it authenticates — §4.6 requires it dropped on
    /// teardown, failure, and replacement.
    pub async fn clear_api_tokens(&self, user_id: i64) -> Result<(), HubError> {
        let conn = self.conn().await?;
        conn.execute("DELETE FROM api_tokens WHERE user_id = ?", (user_id,))
            .await?;
        Ok(())
    }

    pub async fn get_hub(&self) -> Result<Option<Hub>, HubError> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query("SELECT server_id FROM hubs WHERE id = 1", ())
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let server_id = row.get::<i64>(0)?;
        let server = self.get_server(&conn, server_id).await?;
        Ok(Some(Hub { server }))
    }

    pub async fn put_hub(&self, server: &NewServer) -> Result<Hub, HubError> {
        let conn = self.conn().await?;
        let server_id = self.insert_server(&conn, server).await?;
        conn.execute(
            "INSERT INTO hubs (id, server_id) VALUES (1, ?) ON CONFLICT(id) DO UPDATE SET server_id = excluded.server_id",
            (server_id,),
        )
        .await?;
        let server = self.get_server(&conn, server_id).await?;
        Ok(Hub { server })
    }

    pub async fn get_proxy(&self) -> Result<Option<Proxy>, HubError> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT public_server_id, api_server_id, auth_token FROM proxies WHERE id = 1",
                (),
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let public_server_id = row.get::<i64>(0)?;
        let api_server_id = row.get::<i64>(1)?;
        let auth_token = row.get::<String>(2)?;
        let public_server = self.get_server(&conn, public_server_id).await?;
        let api_server = self.get_server(&conn, api_server_id).await?;
        Ok(Some(Proxy {
            public_server,
            api_server,
            auth_token,
        }))
    }

    pub async fn put_proxy(
        &self,
        public_server: &NewServer,
        api_server: &NewServer,
        auth_token: &str,
    ) -> Result<Proxy, HubError> {
        let conn = self.conn().await?;
        let public_id = self.insert_server(&conn, public_server).await?;
        let api_id = self.insert_server(&conn, api_server).await?;
        conn.execute(
            "INSERT INTO proxies (id, public_server_id, api_server_id, auth_token) VALUES (1, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET public_server_id = excluded.public_server_id, \
             api_server_id = excluded.api_server_id, auth_token = excluded.auth_token",
            (public_id, api_id, auth_token),
        )
        .await?;
        let public_server = self.get_server(&conn, public_id).await?;
        let api_server = self.get_server(&conn, api_id).await?;
        Ok(Proxy {
            public_server,
            api_server,
            auth_token: auth_token.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn test_store() -> Store {
        let path = tempfile::NamedTempFile::new()
            .unwrap()
            .path()
            .to_path_buf();
        let database = db::open(&path).await.unwrap();
        Store::new(Arc::new(database))
    }

    #[tokio::test]
    async fn creates_user_lazily_and_is_idempotent() {
        let store = test_store().await;
        let a = store.get_or_create_user("alice").await.unwrap();
        let b = store.get_or_create_user("alice").await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.server_id, None);
    }

    #[tokio::test]
    async fn assigning_and_clearing_server_round_trips() {
        let store = test_store().await;
        let user = store.get_or_create_user("bob").await.unwrap();

        let mut new_server = NewServer::default();
        new_server.port = 9001;
        let server = store.set_user_server(user.id, &new_server).await.unwrap();
        assert_eq!(server.port, 9001);

        let reloaded = store.get_user_by_id(user.id).await.unwrap();
        assert_eq!(reloaded.server_id, Some(server.id));

        store.clear_user_server(user.id).await.unwrap();
        let cleared = store.get_user_by_id(user.id).await.unwrap();
        assert_eq!(cleared.server_id, None);
        assert!(store.get_user_server(&cleared).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cookie_and_api_tokens_resolve_back_to_user() {
        let store = test_store().await;
        let user = store.get_or_create_user("carol").await.unwrap();

        let cookie = store.mint_cookie_token(user.id).await.unwrap();
        let found = store.find_cookie_token(&cookie).await.unwrap().unwrap();
        assert_eq!(found.user_id, user.id);

        let api = store.mint_api_token(user.id).await.unwrap();
        let found = store.find_api_token(&api).await.unwrap().unwrap();
        assert_eq!(found.user_id, user.id);

        assert!(store.find_cookie_token("nonexistent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clearing_api_tokens_drops_every_token_for_the_user() {
        let store = test_store().await;
        let user = store.get_or_create_user("erin").await.unwrap();
        let other = store.get_or_create_user("frank").await.unwrap();

        let first = store.mint_api_token(user.id).await.unwrap();
        let second = store.mint_api_token(user.id).await.unwrap();
        let others = store.mint_api_token(other.id).await.unwrap();

        store.clear_api_tokens(user.id).await.unwrap();

        assert!(store.find_api_token(&first).await.unwrap().is_none());
        assert!(store.find_api_token(&second).await.unwrap().is_none());
        assert!(store.find_api_token(&others).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn hub_and_proxy_singletons_overwrite_in_place() {
        let store = test_store().await;
        assert!(store.get_hub().await.unwrap().is_none());

        let hub = store.put_hub(&NewServer::default()).await.unwrap();
        assert_eq!(hub.server.port, 0);

        let mut replacement = NewServer::default();
        replacement.port = 8001;
        let hub = store.put_hub(&replacement).await.unwrap();
        assert_eq!(hub.server.port, 8001);
        assert_eq!(store.get_hub().await.unwrap().unwrap().server.port, 8001);
    }
}
