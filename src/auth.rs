//! Authentication flows feeding the session layer.
//!
//! Flows are registered under a name and populate the virtual user's token
//! slots; [`crate::session::SessionManager::prepare_request_headers`] then
//! emits the matching headers on later requests. Built-ins: basic, bearer
//! (direct or token endpoint), API key, form login, OAuth2 authorization
//! code, plus user callbacks.

use crate::engine::Engine;
use crate::errors::EngineError;
use crate::request::RequestDescriptor;
use crate::session::{SessionManager, TOKEN_API_KEY, TOKEN_BASIC, TOKEN_BEARER};
use async_trait::async_trait;
use base64::Engine as _;
use futures_util::future::BoxFuture;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Outcome of an authentication attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResult {
    pub success: bool,
    pub auth_type: String,
    pub message: String,
    pub token: Option<String>,
}

impl AuthResult {
    fn ok(auth_type: &str, message: impl Into<String>, token: Option<String>) -> Self {
        Self {
            success: true,
            auth_type: auth_type.to_string(),
            message: message.into(),
            token,
        }
    }

    fn failed(auth_type: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            auth_type: auth_type.to_string(),
            message: message.into(),
            token: None,
        }
    }
}

fn now_unix_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn require<'a>(
    params: &'a HashMap<String, String>,
    key: &str,
) -> Result<&'a str, EngineError> {
    params
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| EngineError::InvalidArgument(format!("missing auth parameter '{key}'")))
}

/// A named authentication flow.
#[async_trait]
pub trait AuthFlow: Send + Sync {
    fn name(&self) -> &str;

    /// Token slot this flow fills; `None` for cookie-based flows.
    fn token_type(&self) -> Option<&'static str> {
        Some(TOKEN_BEARER)
    }

    async fn authenticate(
        &self,
        engine: &Engine,
        user_id: &str,
        params: &HashMap<String, String>,
    ) -> Result<AuthResult, EngineError>;
}

/// `Authorization: Basic base64(user:pass)`, precomputed into the session.
pub struct BasicAuthFlow;

#[async_trait]
impl AuthFlow for BasicAuthFlow {
    fn name(&self) -> &str {
        "basic"
    }

    fn token_type(&self) -> Option<&'static str> {
        Some(TOKEN_BASIC)
    }

    async fn authenticate(
        &self,
        engine: &Engine,
        user_id: &str,
        params: &HashMap<String, String>,
    ) -> Result<AuthResult, EngineError> {
        let username = require(params, "username")?;
        let password = require(params, "password")?;

        let encoded = base64::engine::general_purpose::STANDARD
            .encode(format!("{username}:{password}"));
        let header_value = format!("Basic {encoded}");
        engine
            .sessions()
            .set_token(user_id, TOKEN_BASIC, &header_value, None);

        debug!(user_id, "Stored basic credentials");
        Ok(AuthResult::ok("basic", "credentials stored", Some(header_value)))
    }
}

/// Bearer token: direct (`token` param) or fetched from a token endpoint
/// with client credentials (`token_url`, `client_id`, `client_secret`).
pub struct BearerAuthFlow;

#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    expires_in: Option<u64>,
}

impl BearerAuthFlow {
    async fn fetch_token(
        engine: &Engine,
        params: &HashMap<String, String>,
    ) -> Result<TokenEndpointResponse, EngineError> {
        let token_url = require(params, "token_url")?;
        let client_id = require(params, "client_id")?;
        let client_secret = params.get("client_secret").map(String::as_str).unwrap_or("");

        let body = {
            let mut form = url::form_urlencoded::Serializer::new(String::new());
            form.append_pair("grant_type", "client_credentials");
            form.append_pair("client_id", client_id);
            if !client_secret.is_empty() {
                form.append_pair("client_secret", client_secret);
            }
            form.finish()
        };

        let request = RequestDescriptor::post(token_url, body)
            .with_headers("Content-Type: application/x-www-form-urlencoded");
        let response = engine.execute(&request).await?;

        if !response.success {
            return Err(EngineError::TransportFailed(format!(
                "token endpoint returned {}: {}",
                response.status_code, response.error_message
            )));
        }

        serde_json::from_str(&response.body).map_err(|e| {
            EngineError::ProtocolError(format!("token endpoint response is not valid JSON: {e}"))
        })
    }
}

#[async_trait]
impl AuthFlow for BearerAuthFlow {
    fn name(&self) -> &str {
        "bearer"
    }

    async fn authenticate(
        &self,
        engine: &Engine,
        user_id: &str,
        params: &HashMap<String, String>,
    ) -> Result<AuthResult, EngineError> {
        // Direct token takes precedence; otherwise hit the token endpoint.
        if let Some(token) = params.get("token").filter(|t| !t.is_empty()) {
            engine
                .sessions()
                .set_token(user_id, TOKEN_BEARER, token, None);
            return Ok(AuthResult::ok("bearer", "token stored", Some(token.clone())));
        }

        let issued = Self::fetch_token(engine, params).await?;
        let expires_at = issued.expires_in.map(|secs| now_unix_s() + secs);
        engine
            .sessions()
            .set_token(user_id, TOKEN_BEARER, &issued.access_token, expires_at);

        info!(user_id, "Bearer token issued from endpoint");
        Ok(AuthResult::ok(
            "bearer",
            "token issued",
            Some(issued.access_token),
        ))
    }
}

/// API key stored with its carrying header; emitted as a plain header,
/// never `Authorization`.
pub struct ApiKeyAuthFlow;

#[async_trait]
impl AuthFlow for ApiKeyAuthFlow {
    fn name(&self) -> &str {
        "api_key"
    }

    fn token_type(&self) -> Option<&'static str> {
        Some(TOKEN_API_KEY)
    }

    async fn authenticate(
        &self,
        engine: &Engine,
        user_id: &str,
        params: &HashMap<String, String>,
    ) -> Result<AuthResult, EngineError> {
        let key = require(params, "key")?;
        let header = params
            .get("header")
            .map(String::as_str)
            .filter(|h| !h.is_empty())
            .unwrap_or("X-API-Key");

        engine.sessions().set_api_key(user_id, header, key);
        Ok(AuthResult::ok("api_key", format!("key stored under {header}"), None))
    }
}

/// Form login: POST the form fields, succeed when the response body
/// contains the configured indicator. Session cookies are auto-handled.
pub struct FormAuthFlow;

#[async_trait]
impl AuthFlow for FormAuthFlow {
    fn name(&self) -> &str {
        "form"
    }

    fn token_type(&self) -> Option<&'static str> {
        None
    }

    async fn authenticate(
        &self,
        engine: &Engine,
        user_id: &str,
        params: &HashMap<String, String>,
    ) -> Result<AuthResult, EngineError> {
        let login_url = require(params, "login_url")?;
        let indicator = require(params, "success_indicator")?;

        // Every parameter that is not flow configuration is a form field.
        let body = {
            let mut form = url::form_urlencoded::Serializer::new(String::new());
            for (name, value) in params {
                if name != "login_url" && name != "success_indicator" {
                    form.append_pair(name, value);
                }
            }
            form.finish()
        };

        let request = RequestDescriptor::post(login_url, body)
            .with_headers("Content-Type: application/x-www-form-urlencoded");
        let response = engine.execute(&request).await?;
        engine.sessions().auto_handle_cookies(user_id, &response);

        if response.success && response.body.contains(indicator) {
            info!(user_id, "Form login succeeded");
            Ok(AuthResult::ok("form", "login succeeded", None))
        } else {
            warn!(user_id, status = response.status_code, "Form login failed");
            Ok(AuthResult::failed(
                "form",
                format!(
                    "login response missing success indicator (status {})",
                    response.status_code
                ),
            ))
        }
    }
}

/// OAuth2 authorization-code flow.
///
/// Advisory: the first phase only builds the authorization URL — visiting
/// it is a manual browser step, so the flow is exposed but not selected by
/// any automation. The second phase (with an `authorization_code` param)
/// exchanges the code at the token endpoint like the bearer flow.
pub struct OAuth2CodeFlow;

#[async_trait]
impl AuthFlow for OAuth2CodeFlow {
    fn name(&self) -> &str {
        "oauth2_code"
    }

    async fn authenticate(
        &self,
        engine: &Engine,
        user_id: &str,
        params: &HashMap<String, String>,
    ) -> Result<AuthResult, EngineError> {
        let client_id = require(params, "client_id")?;

        match params.get("authorization_code").filter(|c| !c.is_empty()) {
            None => {
                let authorize_url = require(params, "authorize_url")?;
                let redirect_uri = require(params, "redirect_uri")?;

                let state: String = rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .take(24)
                    .map(char::from)
                    .collect();
                engine
                    .sessions()
                    .set(user_id, "oauth2_state", serde_json::Value::String(state.clone()));

                let mut url = url::Url::parse(authorize_url).map_err(|e| {
                    EngineError::InvalidArgument(format!("bad authorize_url: {e}"))
                })?;
                url.query_pairs_mut()
                    .append_pair("response_type", "code")
                    .append_pair("client_id", client_id)
                    .append_pair("redirect_uri", redirect_uri)
                    .append_pair("state", &state);

                Ok(AuthResult::ok("oauth2_code", url.to_string(), None))
            }
            Some(code) => {
                let token_url = require(params, "token_url")?;
                let redirect_uri = require(params, "redirect_uri")?;

                let body = {
                    let mut form = url::form_urlencoded::Serializer::new(String::new());
                    form.append_pair("grant_type", "authorization_code");
                    form.append_pair("code", code);
                    form.append_pair("client_id", client_id);
                    form.append_pair("redirect_uri", redirect_uri);
                    if let Some(secret) = params.get("client_secret").filter(|s| !s.is_empty()) {
                        form.append_pair("client_secret", secret);
                    }
                    form.finish()
                };

                let request = RequestDescriptor::post(token_url, body)
                    .with_headers("Content-Type: application/x-www-form-urlencoded");
                let response = engine.execute(&request).await?;
                if !response.success {
                    return Ok(AuthResult::failed(
                        "oauth2_code",
                        format!("token exchange failed (status {})", response.status_code),
                    ));
                }

                let issued: TokenEndpointResponse =
                    serde_json::from_str(&response.body).map_err(|e| {
                        EngineError::ProtocolError(format!(
                            "token endpoint response is not valid JSON: {e}"
                        ))
                    })?;
                let expires_at = issued.expires_in.map(|secs| now_unix_s() + secs);
                engine
                    .sessions()
                    .set_token(user_id, TOKEN_BEARER, &issued.access_token, expires_at);

                info!(user_id, "OAuth2 code exchanged for bearer token");
                Ok(AuthResult::ok(
                    "oauth2_code",
                    "token issued",
                    Some(issued.access_token),
                ))
            }
        }
    }
}

/// User-supplied flow callback.
pub type CustomAuthFn = Arc<
    dyn for<'a> Fn(
            &'a Engine,
            &'a str,
            &'a SessionManager,
            &'a HashMap<String, String>,
        ) -> BoxFuture<'a, Result<AuthResult, EngineError>>
        + Send
        + Sync,
>;

/// A flow delegating entirely to a callback.
pub struct CustomAuthFlow {
    name: String,
    callback: CustomAuthFn,
}

impl CustomAuthFlow {
    pub fn new(name: impl Into<String>, callback: CustomAuthFn) -> Self {
        Self {
            name: name.into(),
            callback,
        }
    }
}

#[async_trait]
impl AuthFlow for CustomAuthFlow {
    fn name(&self) -> &str {
        &self.name
    }

    async fn authenticate(
        &self,
        engine: &Engine,
        user_id: &str,
        params: &HashMap<String, String>,
    ) -> Result<AuthResult, EngineError> {
        (self.callback)(engine, user_id, engine.sessions(), params).await
    }
}

/// Name-indexed flow registry.
pub struct AuthManager {
    flows: Mutex<HashMap<String, Arc<dyn AuthFlow>>>,
}

impl AuthManager {
    /// Manager preloaded with the built-in flows.
    pub fn new() -> Self {
        let manager = Self {
            flows: Mutex::new(HashMap::new()),
        };
        manager.register(Arc::new(BasicAuthFlow));
        manager.register(Arc::new(BearerAuthFlow));
        manager.register(Arc::new(ApiKeyAuthFlow));
        manager.register(Arc::new(FormAuthFlow));
        manager.register(Arc::new(OAuth2CodeFlow));
        manager
    }

    /// Register (or replace) a flow under its name.
    pub fn register(&self, flow: Arc<dyn AuthFlow>) {
        self.flows
            .lock()
            .unwrap()
            .insert(flow.name().to_string(), flow);
    }

    pub fn flow_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.flows.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    fn flow(&self, name: &str) -> Result<Arc<dyn AuthFlow>, EngineError> {
        self.flows
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::InvalidArgument(format!("unknown auth flow '{name}'")))
    }

    /// Run a flow for a virtual user.
    pub async fn authenticate(
        &self,
        engine: &Engine,
        flow_name: &str,
        user_id: &str,
        params: &HashMap<String, String>,
    ) -> Result<AuthResult, EngineError> {
        let flow = self.flow(flow_name)?;
        flow.authenticate(engine, user_id, params).await
    }

    /// Whether the user holds live credentials, for one flow or any.
    pub fn is_authenticated(
        &self,
        engine: &Engine,
        user_id: &str,
        flow_name: Option<&str>,
    ) -> bool {
        let sessions = engine.sessions();
        match flow_name {
            Some(name) => match self.flow(name) {
                Ok(flow) => match flow.token_type() {
                    Some(token_type) => sessions.get_token(user_id, token_type).is_some(),
                    None => sessions.has_cookies(user_id),
                },
                Err(_) => false,
            },
            None => {
                [TOKEN_BEARER, TOKEN_API_KEY, TOKEN_BASIC]
                    .iter()
                    .any(|t| sessions.get_token(user_id, t).is_some())
                    || sessions.has_cookies(user_id)
            }
        }
    }

    /// Clear credentials for one flow, or every flow when `None`.
    pub fn logout(&self, engine: &Engine, user_id: &str, flow_name: Option<&str>) {
        let sessions = engine.sessions();
        match flow_name {
            Some(name) => {
                if let Ok(flow) = self.flow(name) {
                    match flow.token_type() {
                        Some(token_type) => sessions.clear_tokens(user_id, Some(token_type)),
                        None => sessions.clear_cookies(user_id),
                    }
                }
            }
            None => {
                sessions.clear_tokens(user_id, None);
                sessions.clear_cookies(user_id);
            }
        }
        debug!(user_id, flow = flow_name.unwrap_or("all"), "Logged out");
    }
}

impl Default for AuthManager {
    fn default() -> Self {
        Self::new()
    }
}
