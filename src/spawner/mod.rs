//! §4.3: the per-user process lifecycle interface plus the one reference
//! backend. Each live `User` owns at most one `Spawner` instance at a time,
//! created fresh by the [`crate::spawn_controller::SpawnController`].

pub mod local_process;
pub mod readiness;

use async_trait::async_trait;

use crate::error::HubError;

pub use local_process::LocalProcessSpawner;

/// Configuration recognized by the reference backend (§4.3).
#[derive(Debug, Clone)]
pub struct SpawnerConfig {
    /// argv template; `{port}` is substituted with the chosen port.
    pub cmd: Vec<String>,
    pub env: std::collections::HashMap<String, String>,
    pub ip: String,
    /// `None` means "pick an ephemeral port".
    pub port: Option<u16>,
    /// Budget for the post-launch readiness probe (§4.6 step 5).
    pub spawn_timeout: std::time::Duration,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            cmd: Vec::new(),
            env: std::collections::HashMap::new(),
            ip: String::new(),
            port: None,
            spawn_timeout: crate::constants::DEFAULT_SPAWN_TIMEOUT,
        }
    }
}

#[async_trait]
pub trait Spawner: Send + Sync {
    /// Completes once the process is launched and its listen endpoint is
    /// resolvable. May suspend arbitrarily long.
    async fn start(&mut self) -> Result<(), HubError>;

    /// Completes after the process has exited. Idempotent.
    async fn stop(&mut self) -> Result<(), HubError>;

    /// `None` means still running; `Some(status)` means terminated.
    async fn poll(&mut self) -> Result<Option<i32>, HubError>;

    /// Opaque snapshot sufficient to reason about the process later.
    fn get_state(&self) -> serde_json::Value;

    /// "ip:port" the proxy should route to.
    fn host(&self) -> String;
}
