//! The one reference [`Spawner`](super::Spawner) backend: launches the
//! user's process as a plain OS child via `tokio::process::Command`, the
//! same primitive the rest of the pack reaches for whenever it shells out.

use std::net::TcpListener;

use async_trait::async_trait;
use serde_json::json;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use super::{Spawner, SpawnerConfig};
use crate::constants::SPAWN_STOP_GRACE;
use crate::error::HubError;
use crate::model::{Hub, User};

pub struct LocalProcessSpawner {
    user_name: String,
    hub_api_url: String,
    hub_base_url: String,
    api_token: String,
    config: SpawnerConfig,
    ip: String,
    port: u16,
    child: Option<Child>,
}

impl LocalProcessSpawner {
    pub fn new(user: &User, hub: &Hub, api_token: String, config: SpawnerConfig) -> Self {
        let ip = if config.ip.is_empty() {
            "127.0.0.1".to_string()
        } else {
            config.ip.clone()
        };

        Self {
            user_name: user.name.clone(),
            hub_api_url: hub.api_url(),
            hub_base_url: hub.server.base_url.clone(),
            api_token,
            config,
            ip,
            port: 0,
            child: None,
        }
    }

    fn pick_port(&self) -> Result<u16, HubError> {
        if let Some(port) = self.config.port {
            return Ok(port);
        }
        let listener = TcpListener::bind("127.0.0.1:0")
            .map_err(|e| HubError::SpawnFailed(format!("failed to reserve a port: {e}")))?;
        Ok(listener
            .local_addr()
            .map_err(|e| HubError::SpawnFailed(format!("failed to read reserved port: {e}")))?
            .port())
    }
}

#[async_trait]
impl Spawner for LocalProcessSpawner {
    async fn start(&mut self) -> Result<(), HubError> {
        if self.config.cmd.is_empty() {
            return Err(HubError::SpawnFailed(
                "spawner config has no argv template".to_string(),
            ));
        }

        self.port = self.pick_port()?;

        let argv: Vec<String> = self
            .config
            .cmd
            .iter()
            .map(|arg| arg.replace("{port}", &self.port.to_string()))
            .collect();

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.env("HUB_API_TOKEN", &self.api_token);
        cmd.env("HUB_API_URL", &self.hub_api_url);
        cmd.env("HUB_BASE_URL", &self.hub_base_url);
        for (k, v) in &self.config.env {
            cmd.env(k, v);
        }

        let child = cmd
            .spawn()
            .map_err(|e| HubError::SpawnFailed(format!("failed to launch {}: {e}", argv[0])))?;

        info!(user = %self.user_name, pid = child.id(), "spawned single-user server process");
        self.child = Some(child);

        super::readiness::wait_for_server(&self.ip, self.port, self.config.spawn_timeout).await
    }

    async fn stop(&mut self) -> Result<(), HubError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        if let Some(pid) = child.id() {
            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }

        match tokio::time::timeout(SPAWN_STOP_GRACE, child.wait()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(user = %self.user_name, error = %e, "error waiting on child exit"),
            Err(_) => {
                warn!(user = %self.user_name, "process did not exit within grace period, killing");
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }
        Ok(())
    }

    async fn poll(&mut self) -> Result<Option<i32>, HubError> {
        let Some(child) = self.child.as_mut() else {
            return Ok(Some(-1));
        };
        match child.try_wait() {
            Ok(Some(status)) => Ok(Some(status.code().unwrap_or(-1))),
            Ok(None) => Ok(None),
            Err(e) => Err(HubError::SpawnFailed(format!("poll failed: {e}"))),
        }
    }

    fn get_state(&self) -> serde_json::Value {
        json!({ "pid": self.child.as_ref().and_then(|c| c.id()) })
    }

    fn host(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}
