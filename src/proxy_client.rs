//! §4.4: the Hub's control-plane client to the Proxy's `api_server`. One
//! shared `reqwest::Client`, explicit header construction, explicit
//! status-code check rather than `error_for_status()` so the error text can
//! carry the response body — the same shape as the teacher's own outbound
//! request path in `routes::openai`.

use reqwest::Client;
use serde_json::json;
use tracing::warn;

use crate::error::HubError;

pub struct ProxyClient {
    http: Client,
    api_url: String,
    auth_token: String,
}

impl ProxyClient {
    pub fn new(http: Client, api_url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            http,
            api_url: api_url.into(),
            auth_token: auth_token.into(),
        }
    }

    fn route_url(&self, user_base_url: &str) -> String {
        format!(
            "{}{}",
            self.api_url.trim_end_matches('/'),
            user_base_url
        )
    }

    /// Registers a route so the proxy forwards `user_base_url` to
    /// `target_host`. Retried once on failure per §4.6's spawn step.
    pub async fn register(&self, user_base_url: &str, target_host: &str, user: &str) -> Result<(), HubError> {
        let body = json!({ "target": format!("http://{target_host}"), "user": user });

        match self.try_register(user_base_url, &body).await {
            Ok(()) => Ok(()),
            Err(first_err) => {
                warn!(error = %first_err, "proxy register failed, retrying once");
                self.try_register(user_base_url, &body).await
            }
        }
    }

    async fn try_register(&self, user_base_url: &str, body: &serde_json::Value) -> Result<(), HubError> {
        let response = self
            .http
            .post(self.route_url(user_base_url))
            .header("Authorization", format!("token {}", self.auth_token))
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(HubError::ProxyError(format!(
                "register {status}: {text}"
            )));
        }
        Ok(())
    }

    /// Unregisters a route. Not retried: a stale route self-heals on the
    /// next successful register, so failures here are logged and swallowed
    /// by the caller.
    pub async fn unregister(&self, user_base_url: &str) -> Result<(), HubError> {
        let response = self
            .http
            .delete(self.route_url(user_base_url))
            .header("Authorization", format!("token {}", self.auth_token))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(HubError::ProxyError(format!(
                "unregister {status}: {text}"
            )));
        }
        Ok(())
    }
}
