//! The pluggable credential check (§4.2). One reference backend
//! ([`crate::auth::pam_backend::PamAuthenticator`]) ships with the crate; a
//! deployment swaps in its own by implementing this trait.

use async_trait::async_trait;

/// A username/password pair presented to `POST /login`.
#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Returns the canonical username on success. Authenticators are free to
    /// normalize case or whitespace; a `None` means "reject", not "error" —
    /// callers never distinguish *why* a credential failed (§4.2, §7).
    async fn authenticate(&self, credential: &Credential) -> Option<String>;
}
