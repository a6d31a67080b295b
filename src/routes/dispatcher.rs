//! §4.7: the three URL-contract operations, plus the prefix-wide
//! 404/redirect fallback every other path gets.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Json, Redirect, Response};
use axum_extra::extract::CookieJar;
use serde::Deserialize;
use serde_json::json;

use crate::auth::{Authenticator, Credential};
use crate::error::HubError;
use crate::session::{ResolvedUser, SessionManager};
use crate::spawn_controller::SpawnController;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub session: SessionManager,
    pub controller: Arc<SpawnController>,
    pub authenticator: Arc<dyn Authenticator>,
    pub hub_base_url: String,
}

impl axum::extract::FromRef<AppState> for SessionManager {
    fn from_ref(state: &AppState) -> Self {
        state.session.clone()
    }
}

fn login_url(state: &AppState, next: &str) -> String {
    format!(
        "{}/login?next={}",
        state.hub_base_url.trim_end_matches('/'),
        urlencoding_path(next)
    )
}

/// Minimal query-component escaping; the only untrusted input is the
/// original request path, which never contains characters requiring more
/// than `%20`/`%25`/`%26` handling for this internal redirect.
fn urlencoding_path(path: &str) -> String {
    path.replace('%', "%25").replace(' ', "%20").replace('&', "%26")
}

#[derive(Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct NextQuery {
    #[serde(default)]
    pub next: Option<String>,
}

/// `POST /login` — one of the dispatcher's three core operations: runs the
/// configured `Authenticator`, then issues login cookies on success.
pub async fn login(
    State(state): State<AppState>,
    Query(query): Query<NextQuery>,
    jar: CookieJar,
    axum::Form(form): axum::Form<LoginForm>,
) -> Result<(CookieJar, Redirect), HubError> {
    let credential = Credential {
        username: form.username,
        password: form.password,
    };

    let Some(username) = state.authenticator.authenticate(&credential).await else {
        let target = login_url(&state, query.next.as_deref().unwrap_or("/"));
        return Ok((jar, Redirect::to(&target)));
    };

    let user = state.store.get_or_create_user(&username).await?;
    let has_valid_hub_cookie = state.session.has_valid_hub_cookie(&jar).await?;
    let jar = state
        .session
        .set_login_cookie(&user, jar, has_valid_hub_cookie)
        .await?;

    let target = query
        .next
        .unwrap_or_else(|| format!("{}/user/{}", state.hub_base_url.trim_end_matches('/'), user.name));
    Ok((jar, Redirect::to(&target)))
}

/// `GET /user/{name}`.
pub async fn user_route(
    State(state): State<AppState>,
    Path(name): Path<String>,
    ResolvedUser(resolved): ResolvedUser,
    jar: CookieJar,
    uri: Uri,
) -> Result<(CookieJar, Redirect), HubError> {
    let matches_requested_user = resolved.as_ref().is_some_and(|u| u.name == name);
    if !matches_requested_user {
        let jar = state.session.clear_login_cookie(resolved.as_ref(), jar).await?;
        let target = login_url(&state, uri.path());
        return Ok((jar, Redirect::to(&target)));
    }
    let resolved = resolved.expect("matches_requested_user implies Some");

    let hub = state
        .store
        .get_hub()
        .await?
        .ok_or_else(|| HubError::StoreError("hub not configured".to_string()))?;

    state.controller.ensure_running(&resolved, &hub).await?;

    let has_valid_hub_cookie = state.session.has_valid_hub_cookie(&jar).await?;
    let jar = state
        .session
        .set_login_cookie(&resolved, jar, has_valid_hub_cookie)
        .await?;

    let target = format!("{}/user/{}", state.hub_base_url.trim_end_matches('/'), name);
    Ok((jar, Redirect::to(&target)))
}

/// `GET /api/authorizations/{token}` — validates a browser cookie on behalf
/// of a single-user server. Requires the caller's own bearer API token; a
/// browser cookie never satisfies this endpoint.
pub async fn authorize_cookie(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: axum::http::HeaderMap,
) -> Result<Json<serde_json::Value>, HubError> {
    if state.session.resolve_bearer(&headers).await?.is_none() {
        return Err(HubError::AuthFailed);
    }

    let cookie_token = state
        .store
        .find_cookie_token(&token)
        .await?
        .ok_or(HubError::NotFound)?;

    let user = state.store.get_user_by_id(cookie_token.user_id).await?;
    Ok(Json(json!({ "user": user.name })))
}

/// Fallback for anything not matched above: 404 under the Hub's own prefix,
/// 302 to the same path under the Hub's base URL otherwise.
pub async fn fallback(State(state): State<AppState>, uri: Uri) -> Response {
    let path = uri.path();
    if path.starts_with(&state.hub_base_url) {
        (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" }))).into_response()
    } else {
        let target = format!("{}{}", state.hub_base_url.trim_end_matches('/'), path);
        Redirect::to(&target).into_response()
    }
}
