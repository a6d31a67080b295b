//! The data model (§3): Server, Hub, Proxy, User, CookieToken, APIToken.
//!
//! These are plain row structs returned by [`crate::store::Store`]. Derivation
//! rules (cookie names, base URLs, the hub's API URL) live here as methods so
//! the invariants in §3 have exactly one implementation.

use serde::{Deserialize, Serialize};

/// One reachable HTTP endpoint: either the Hub itself, a user's single-user
/// server, or one of the Proxy's two endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: i64,
    pub ip: String,
    pub port: u16,
    pub proto: String,
    pub base_url: String,
    pub cookie_name: String,
    /// Opaque bytes, never serialized to a client-facing response.
    #[serde(skip_serializing)]
    pub cookie_secret: Vec<u8>,
}

impl Server {
    pub fn url(&self) -> String {
        format!("{}://{}:{}{}", self.proto, self.ip, self.port, self.base_url)
    }

    /// "ip:port", the form the Proxy and the readiness probe want.
    pub fn host(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Derive the per-user server record from the Hub's own server (§3
    /// invariants: cookie_name, cookie_secret, base_url derivation rules).
    pub fn derive_for_user(hub_server: &Server, user_name: &str) -> NewServer {
        NewServer {
            ip: "localhost".to_string(),
            port: 0,
            proto: "http".to_string(),
            base_url: format!(
                "{}/user/{}",
                hub_server.base_url.trim_end_matches('/'),
                user_name
            ),
            cookie_name: format!("{}-{}", hub_server.cookie_name, user_name),
            cookie_secret: hub_server.cookie_secret.clone(),
        }
    }
}

/// A [`Server`] row not yet persisted (no id, port not yet known — the
/// spawner picks it and the controller patches it in before `INSERT`).
#[derive(Debug, Clone)]
pub struct NewServer {
    pub ip: String,
    pub port: u16,
    pub proto: String,
    pub base_url: String,
    pub cookie_name: String,
    pub cookie_secret: Vec<u8>,
}

impl Default for NewServer {
    /// §8 scenario 1: `new Server()` defaults.
    fn default() -> Self {
        Self {
            ip: "localhost".to_string(),
            port: 0,
            proto: "http".to_string(),
            base_url: "/".to_string(),
            cookie_name: crate::mint::TokenMint::short_identifier(),
            cookie_secret: crate::mint::TokenMint::random_bytes(64),
        }
    }
}

/// Singleton per deployment: owns the Hub's own `Server` row.
#[derive(Debug, Clone)]
pub struct Hub {
    pub server: Server,
}

impl Hub {
    pub fn api_url(&self) -> String {
        format!("{}api", self.server.url())
    }
}

/// Singleton per deployment: the routing front-end's two endpoints plus the
/// control-plane auth token.
#[derive(Debug, Clone)]
pub struct Proxy {
    pub public_server: Server,
    pub api_server: Server,
    pub auth_token: String,
}

/// The central aggregate (§3). `server` and `spawner` are non-null
/// simultaneously, never independently (see `SpawnController`, which is the
/// only writer of both).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub server_id: Option<i64>,
    /// Spawner-defined opaque snapshot (§4.3 `get_state`), stored as JSON.
    pub state: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieToken {
    pub token: String,
    pub user_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiToken {
    pub token: String,
    pub user_id: i64,
}
