//! Reference [`Authenticator`]: checks credentials against the host's PAM
//! stack. `pam`'s client is blocking FFI, so every call is offloaded to
//! `spawn_blocking`, the same move the rest of the pack uses for blocking
//! work inside an async handler.

use async_trait::async_trait;
use pam::Client;

use super::authenticator::{Authenticator, Credential};

pub struct PamAuthenticator {
    service: String,
}

impl PamAuthenticator {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

#[async_trait]
impl Authenticator for PamAuthenticator {
    async fn authenticate(&self, credential: &Credential) -> Option<String> {
        // The reference PAM backend inherits a long-standing quirk of its
        // underlying library: non-ASCII usernames or passwords are rejected
        // outright rather than passed to PAM.
        if !credential.username.is_ascii() || !credential.password.is_ascii() {
            return None;
        }

        let service = self.service.clone();
        let username = credential.username.clone();
        let password = credential.password.clone();

        let result = tokio::task::spawn_blocking(move || {
            let mut client = Client::with_password(&service).ok()?;
            client
                .conversation_mut()
                .set_credentials(&username, &password);
            client.authenticate().ok()?;
            Some(username)
        })
        .await
        .ok()
        .flatten();

        result
    }
}
