use std::net::{IpAddr, SocketAddr};

use axum::{
    Form, Json,
    extract::{ConnectInfo, State},
    http::{
        Extensions, HeaderMap, HeaderValue,
        header::{COOKIE, SET_COOKIE},
    },
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::infra::{
    app_state::AppState,
    errors::{AppError, AppResult},
};

pub const SESSION_COOKIE: &str = "session";
const REMEMBER_MAX_AGE_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default, alias = "check")]
    pub remember: Option<String>,
}

impl LoginForm {
    fn remember(&self) -> bool {
        matches!(self.remember.as_deref(), Some("on" | "true" | "1"))
    }
}

/// Value of the session cookie, if the request carries one.
pub fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

/// Session token of an authenticated request.
pub fn require_session(state: &AppState, headers: &HeaderMap) -> AppResult<String> {
    session_cookie(headers)
        .filter(|token| state.hub.store().session_privilege(token).is_some())
        .ok_or_else(|| AppError::unauthorized("Unauthorized"))
}

pub async fn login_handler(
    State(state): State<AppState>,
    extensions: Extensions,
    Form(form): Form<LoginForm>,
) -> AppResult<Response> {
    if let Some(ip) = peer_ip(&extensions)
        && !state.admit_login(ip)
    {
        warn!(%ip, "login attempt throttled");
        return Err(AppError::rate_limited("Too many login attempts"));
    }

    if !state.hub.store().verify_user(&form.username, &form.password) {
        info!(user = %form.username, "login rejected");
        return Ok(Json("NOK").into_response());
    }

    let token = state
        .hub
        .store()
        .create_session(&form.username, form.remember())
        .await?;
    info!(user = %form.username, "user authenticated");
    session_response(&token, form.remember())
}

/// First-run account creation. Only available while no users exist.
pub async fn adduser_handler(
    State(state): State<AppState>,
    Form(form): Form<LoginForm>,
) -> AppResult<Response> {
    let store = state.hub.store();
    if store.has_users() {
        return Err(AppError::forbidden("Users already configured"));
    }
    if form.username.is_empty() || form.password.is_empty() {
        return Ok(Json("NOK").into_response());
    }

    store
        .add_or_update_user(&form.username, &form.password, true)
        .await?;
    let token = store.create_session(&form.username, form.remember()).await?;
    info!(user = %form.username, "initial admin created");
    session_response(&token, form.remember())
}

fn session_response(token: &str, remember: bool) -> AppResult<Response> {
    let mut cookie = format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax");
    if remember {
        cookie.push_str(&format!("; Max-Age={REMEMBER_MAX_AGE_SECS}"));
    }
    let cookie = HeaderValue::from_str(&cookie)
        .map_err(|err| AppError::internal(format!("invalid session cookie: {err}")))?;

    let mut response = Json("OK").into_response();
    response.headers_mut().insert(SET_COOKIE, cookie);
    Ok(response)
}

fn peer_ip(extensions: &Extensions) -> Option<IpAddr> {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_session_among_other_cookies() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("theme=dark; session=abc-123; lang=en"));
        assert_eq!(session_cookie(&headers).as_deref(), Some("abc-123"));
    }

    #[test]
    fn missing_or_empty_session_cookie() {
        let mut headers = HeaderMap::new();
        assert!(session_cookie(&headers).is_none());
        headers.insert(COOKIE, HeaderValue::from_static("session="));
        assert!(session_cookie(&headers).is_none());
        headers.insert(COOKIE, HeaderValue::from_static("sessionid=zzz"));
        assert!(session_cookie(&headers).is_none());
    }
}
