//! §4.5: identifying the user behind a request, and the login/logout cookie
//! dance. Built on `axum-extra`'s `CookieJar`, the same builder-style cookie
//! handling `Ciran0-Klyja/backend/src/auth.rs` uses for its session cookie.

use async_trait::async_trait;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite};

use crate::error::HubError;
use crate::mint::TokenMint;
use crate::model::User;
use crate::store::Store;

#[derive(Clone)]
pub struct SessionManager {
    store: Store,
    hub_cookie_name: String,
    hub_base_url: String,
}

impl SessionManager {
    pub fn new(store: Store, hub_cookie_name: impl Into<String>, hub_base_url: impl Into<String>) -> Self {
        Self {
            store,
            hub_cookie_name: hub_cookie_name.into(),
            hub_base_url: hub_base_url.into(),
        }
    }

    fn bearer_token(headers: &axum::http::HeaderMap) -> Option<String> {
        let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
        value.strip_prefix("token ").map(|t| t.trim().to_string())
    }

    /// Resolves a request strictly via its bearer API token, ignoring any
    /// cookie present. Used by the authorizations endpoint (§4.7), which
    /// single-user servers call with their own API token — a browser cookie
    /// must never substitute for it there.
    pub async fn resolve_bearer(&self, headers: &axum::http::HeaderMap) -> Result<Option<User>, HubError> {
        let Some(token) = Self::bearer_token(headers) else {
            return Ok(None);
        };
        match self.store.find_api_token(&token).await? {
            Some(api_token) => Ok(Some(self.store.get_user_by_id(api_token.user_id).await?)),
            None => Ok(None),
        }
    }

    /// The §4.5 resolution order: bearer token, then Hub cookie, then
    /// anonymous. Returns the resolved user and, when a stale Hub cookie was
    /// found, an updated jar with it cleared.
    pub async fn resolve(
        &self,
        headers: &axum::http::HeaderMap,
        jar: &CookieJar,
    ) -> Result<(Option<User>, Option<CookieJar>), HubError> {
        if let Some(token) = Self::bearer_token(headers)
            && let Some(api_token) = self.store.find_api_token(&token).await?
        {
            let user = self.store.get_user_by_id(api_token.user_id).await?;
            return Ok((Some(user), None));
        }

        let Some(cookie) = jar.get(&self.hub_cookie_name) else {
            return Ok((None, None));
        };

        match self.store.find_cookie_token(cookie.value()).await? {
            Some(token) => {
                let user = self.store.get_user_by_id(token.user_id).await?;
                Ok((Some(user), None))
            }
            None => Ok((None, Some(jar.clone().remove(self.hub_cookie_name.clone())))),
        }
    }

    /// Whether the jar's Hub cookie (if any) names a live `CookieToken` —
    /// not merely whether a cookie by that name is present (§4.5: "no
    /// *valid* Hub cookie").
    pub async fn has_valid_hub_cookie(&self, jar: &CookieJar) -> Result<bool, HubError> {
        let Some(cookie) = jar.get(&self.hub_cookie_name) else {
            return Ok(false);
        };
        Ok(self.store.find_cookie_token(cookie.value()).await?.is_some())
    }

    /// On successful login: mint (and persist) a server-scoped cookie token
    /// if the user has a running server, and a Hub-scoped one if the caller
    /// doesn't already present a valid Hub cookie.
    pub async fn set_login_cookie(
        &self,
        user: &User,
        jar: CookieJar,
        has_valid_hub_cookie: bool,
    ) -> Result<CookieJar, HubError> {
        let mut jar = jar;

        if let Some(server) = self.store.get_user_server(user).await? {
            let token = self.store.mint_cookie_token(user.id).await?;
            let cookie = Cookie::build((server.cookie_name.clone(), token))
                .path(server.base_url.clone())
                .http_only(true)
                .same_site(SameSite::Lax)
                .build();
            jar = jar.add(cookie);
        }

        if !has_valid_hub_cookie {
            let token = self.store.mint_cookie_token(user.id).await?;
            let cookie = Cookie::build((self.hub_cookie_name.clone(), token))
                .path(self.hub_base_url.clone())
                .http_only(true)
                .same_site(SameSite::Lax)
                .build();
            jar = jar.add(cookie);
        }

        Ok(jar)
    }

    /// On logout: clear the user-scoped cookie (if the user has a server)
    /// and always clear the Hub-scoped cookie. The underlying CookieToken
    /// rows are left in place; they simply become unreachable.
    pub async fn clear_login_cookie(&self, user: Option<&User>, jar: CookieJar) -> Result<CookieJar, HubError> {
        let mut jar = jar;

        if let Some(user) = user
            && let Some(server) = self.store.get_user_server(user).await?
        {
            jar = jar.remove(Cookie::from(server.cookie_name));
        }

        jar = jar.remove(Cookie::from(self.hub_cookie_name.clone()));
        Ok(jar)
    }
}

/// Wraps `SessionManager::resolve` as an extractor: routes that accept
/// anonymous visitors pull this in instead of repeating the header/cookie
/// dance themselves.
pub struct ResolvedUser(pub Option<User>);

#[async_trait]
impl<S> FromRequestParts<S> for ResolvedUser
where
    SessionManager: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = HubError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let session = SessionManager::from_ref(state);
        let jar = CookieJar::from_request_parts(parts, state)
            .await
            .unwrap_or_default();
        let (user, _) = session.resolve(&parts.headers, &jar).await?;
        Ok(ResolvedUser(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn test_session() -> SessionManager {
        let path = tempfile::NamedTempFile::new().unwrap().path().to_path_buf();
        let database = crate::db::open(&path).await.unwrap();
        let store = Store::new(Arc::new(database));
        SessionManager::new(store, "hub-token", "/")
    }

    #[tokio::test]
    async fn bearer_token_resolves_owning_user() {
        let session = test_session().await;
        let user = session.store.get_or_create_user("dave").await.unwrap();
        let api_token = session.store.mint_api_token(user.id).await.unwrap();

        let mut headers = axum::http::HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("token {api_token}").parse().unwrap(),
        );

        let (resolved, _) = session.resolve(&headers, &CookieJar::new()).await.unwrap();
        assert_eq!(resolved.unwrap().name, "dave");
    }

    #[tokio::test]
    async fn unknown_hub_cookie_clears_itself() {
        let session = test_session().await;
        let jar = CookieJar::new().add(Cookie::new("hub-token", "garbage"));

        let (resolved, updated_jar) = session
            .resolve(&axum::http::HeaderMap::new(), &jar)
            .await
            .unwrap();
        assert!(resolved.is_none());
        assert!(updated_jar.unwrap().get("hub-token").is_none());
    }

    #[tokio::test]
    async fn anonymous_when_nothing_presented() {
        let session = test_session().await;
        let (resolved, updated) = session
            .resolve(&axum::http::HeaderMap::new(), &CookieJar::new())
            .await
            .unwrap();
        assert!(resolved.is_none());
        assert!(updated.is_none());
    }

    #[tokio::test]
    async fn hub_cookie_validity_requires_a_store_backed_token() {
        let session = test_session().await;
        let user = session.store.get_or_create_user("gina").await.unwrap();

        let garbage = CookieJar::new().add(Cookie::new("hub-token", "garbage"));
        assert!(!session.has_valid_hub_cookie(&garbage).await.unwrap());

        let token = session.store.mint_cookie_token(user.id).await.unwrap();
        let real = CookieJar::new().add(Cookie::new("hub-token", token));
        assert!(session.has_valid_hub_cookie(&real).await.unwrap());

        assert!(!session.has_valid_hub_cookie(&CookieJar::new()).await.unwrap());
    }
}
