//! Per-virtual-user session state.
//!
//! Each user id owns a disjoint store of variables, cookies and tokens.
//! Stores are created on first touch and destroyed explicitly at teardown.
//! The manager's map and every individual store are mutually exclusive;
//! no lock is ever held across I/O.

use crate::extractor::{extract_variables, ExtractRule};
use crate::request::parse_header_blob;
use crate::response::ResponseRecord;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Token slot types used by the built-in auth flows.
pub const TOKEN_BEARER: &str = "bearer";
pub const TOKEN_API_KEY: &str = "api_key";
pub const TOKEN_BASIC: &str = "basic";

/// A stored cookie.
#[derive(Debug, Clone, Default)]
pub struct Cookie {
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
}

/// A stored credential.
#[derive(Debug, Clone)]
pub struct Token {
    pub value: String,
    /// Unix-seconds expiry; `None` never expires.
    pub expires_at: Option<u64>,
    /// Header the credential is emitted under. `None` means
    /// `Authorization`.
    pub header_name: Option<String>,
}

impl Token {
    fn is_expired(&self, now_unix_s: u64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now_unix_s)
    }
}

/// One virtual user's state.
#[derive(Debug, Default)]
pub struct UserSession {
    variables: HashMap<String, Value>,
    cookies: HashMap<String, Cookie>,
    tokens: HashMap<String, Token>,
}

fn now_unix_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Thread-safe manager of per-user sessions.
#[derive(Clone, Default)]
pub struct SessionManager {
    users: Arc<Mutex<HashMap<String, Arc<Mutex<UserSession>>>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn session(&self, user_id: &str) -> Arc<Mutex<UserSession>> {
        let mut users = self.users.lock().unwrap();
        users
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(UserSession::default())))
            .clone()
    }

    /// Bind an arbitrary value under `key`.
    pub fn set(&self, user_id: &str, key: &str, value: Value) {
        let session = self.session(user_id);
        let mut session = session.lock().unwrap();
        session.variables.insert(key.to_string(), value);
    }

    /// Read a previously bound value.
    pub fn get(&self, user_id: &str, key: &str) -> Option<Value> {
        let session = self.session(user_id);
        let session = session.lock().unwrap();
        session.variables.get(key).cloned()
    }

    /// Consistent copy of the user's variables.
    pub fn variables_snapshot(&self, user_id: &str) -> HashMap<String, Value> {
        let session = self.session(user_id);
        let session = session.lock().unwrap();
        session.variables.clone()
    }

    /// Store a credential under a token type slot.
    pub fn set_token(&self, user_id: &str, token_type: &str, value: &str, expires_at: Option<u64>) {
        let session = self.session(user_id);
        let mut session = session.lock().unwrap();
        session.tokens.insert(
            token_type.to_string(),
            Token {
                value: value.to_string(),
                expires_at,
                header_name: None,
            },
        );
    }

    /// Store an API-key credential with its carrying header.
    pub fn set_api_key(&self, user_id: &str, header_name: &str, value: &str) {
        let session = self.session(user_id);
        let mut session = session.lock().unwrap();
        session.tokens.insert(
            TOKEN_API_KEY.to_string(),
            Token {
                value: value.to_string(),
                expires_at: None,
                header_name: Some(header_name.to_string()),
            },
        );
    }

    /// Read a credential; expired tokens read as absent.
    pub fn get_token(&self, user_id: &str, token_type: &str) -> Option<String> {
        let session = self.session(user_id);
        let session = session.lock().unwrap();
        let token = session.tokens.get(token_type)?;
        if token.is_expired(now_unix_s()) {
            debug!(user_id, token_type, "Token expired");
            return None;
        }
        Some(token.value.clone())
    }

    /// Remove one token type, or all tokens when `token_type` is `None`.
    pub fn clear_tokens(&self, user_id: &str, token_type: Option<&str>) {
        let session = self.session(user_id);
        let mut session = session.lock().unwrap();
        match token_type {
            Some(t) => {
                session.tokens.remove(t);
            }
            None => session.tokens.clear(),
        }
    }

    pub fn set_cookie(
        &self,
        user_id: &str,
        name: &str,
        value: &str,
        domain: Option<&str>,
        path: Option<&str>,
    ) {
        let session = self.session(user_id);
        let mut session = session.lock().unwrap();
        session.cookies.insert(
            name.to_string(),
            Cookie {
                value: value.to_string(),
                domain: domain.map(str::to_string),
                path: path.map(str::to_string),
            },
        );
    }

    pub fn get_cookie(&self, user_id: &str, name: &str) -> Option<Cookie> {
        let session = self.session(user_id);
        let session = session.lock().unwrap();
        session.cookies.get(name).cloned()
    }

    pub fn has_cookies(&self, user_id: &str) -> bool {
        let session = self.session(user_id);
        let session = session.lock().unwrap();
        !session.cookies.is_empty()
    }

    pub fn clear_cookies(&self, user_id: &str) {
        let session = self.session(user_id);
        let mut session = session.lock().unwrap();
        session.cookies.clear();
    }

    /// Parse every `Set-Cookie` line in the response's header blob into the
    /// user's cookie jar. Only `name=value` plus the `Domain`/`Path`
    /// attributes are honoured; all other attributes are ignored.
    pub fn auto_handle_cookies(&self, user_id: &str, response: &ResponseRecord) {
        for (name, value) in parse_header_blob(&response.headers) {
            if !name.eq_ignore_ascii_case("set-cookie") {
                continue;
            }

            let mut parts = value.split(';');
            let Some((cookie_name, cookie_value)) =
                parts.next().and_then(|pair| pair.split_once('='))
            else {
                warn!(user_id, header = %value, "Unparseable Set-Cookie header");
                continue;
            };

            let mut domain = None;
            let mut path = None;
            for attr in parts {
                if let Some((attr_name, attr_value)) = attr.split_once('=') {
                    match attr_name.trim().to_ascii_lowercase().as_str() {
                        "domain" => domain = Some(attr_value.trim().to_string()),
                        "path" => path = Some(attr_value.trim().to_string()),
                        _ => {}
                    }
                }
            }

            debug!(user_id, cookie = cookie_name.trim(), "Stored cookie from response");
            self.set_cookie(
                user_id,
                cookie_name.trim(),
                cookie_value.trim(),
                domain.as_deref(),
                path.as_deref(),
            );
        }
    }

    /// Promote a top-level `access_token` in a JSON response body into the
    /// user's bearer slot, honouring a sibling `expires_in`.
    ///
    /// This is what lets a plain login step feed the auth header of every
    /// later step without an explicit flow.
    pub fn auto_capture_bearer(&self, user_id: &str, response: &ResponseRecord) {
        let Ok(json) = serde_json::from_str::<Value>(&response.body) else {
            return;
        };
        let Some(token) = json.get("access_token").and_then(Value::as_str) else {
            return;
        };
        let expires_at = json
            .get("expires_in")
            .and_then(Value::as_u64)
            .map(|secs| now_unix_s() + secs);

        debug!(user_id, "Captured bearer token from response body");
        self.set_token(user_id, TOKEN_BEARER, token, expires_at);
    }

    /// Apply extraction rules to a response and bind the results.
    pub fn process_response(
        &self,
        user_id: &str,
        response: &ResponseRecord,
        rules: &[ExtractRule],
    ) {
        if rules.is_empty() {
            return;
        }
        let extracted = extract_variables(rules, response);
        let session = self.session(user_id);
        let mut session = session.lock().unwrap();
        for (name, value) in extracted {
            session.variables.insert(name, value);
        }
    }

    /// Augment a header blob with the user's cookies and preferred
    /// credential.
    ///
    /// Preference when several tokens are present: bearer, then api-key,
    /// then basic. Expired tokens are skipped.
    pub fn prepare_request_headers(&self, user_id: &str, base_headers: &str) -> String {
        let session = self.session(user_id);
        let session = session.lock().unwrap();

        let mut headers = base_headers.trim_end().to_string();
        if !headers.is_empty() {
            headers.push('\n');
        }

        if !session.cookies.is_empty() {
            let mut pairs: Vec<String> = session
                .cookies
                .iter()
                .map(|(name, cookie)| format!("{}={}", name, cookie.value))
                .collect();
            pairs.sort();
            headers.push_str(&format!("Cookie: {}\n", pairs.join("; ")));
        }

        let now = now_unix_s();
        let live = |t: &str| {
            session
                .tokens
                .get(t)
                .filter(|token| !token.is_expired(now))
        };

        if let Some(token) = live(TOKEN_BEARER) {
            headers.push_str(&format!("Authorization: Bearer {}\n", token.value));
        } else if let Some(token) = live(TOKEN_API_KEY) {
            let header = token.header_name.as_deref().unwrap_or("X-API-Key");
            headers.push_str(&format!("{}: {}\n", header, token.value));
        } else if let Some(token) = live(TOKEN_BASIC) {
            headers.push_str(&format!("Authorization: {}\n", token.value));
        }

        headers
    }

    /// Destroy one user's session. Idempotent.
    pub fn remove_session(&self, user_id: &str) {
        self.users.lock().unwrap().remove(user_id);
    }

    /// Destroy every session. Teardown only.
    pub fn clear(&self) {
        self.users.lock().unwrap().clear();
    }

    pub fn session_count(&self) -> usize {
        self.users.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Protocol;
    use serde_json::json;

    #[test]
    fn test_variables_round_trip() {
        let sessions = SessionManager::new();
        sessions.set("u1", "uid", json!(42));

        assert_eq!(sessions.get("u1", "uid"), Some(json!(42)));
        assert_eq!(sessions.get("u1", "missing"), None);
    }

    #[test]
    fn test_sessions_are_isolated_per_user() {
        let sessions = SessionManager::new();
        sessions.set("alice", "secret", json!("a"));
        sessions.set_cookie("alice", "sid", "s-alice", None, None);

        assert_eq!(sessions.get("bob", "secret"), None);
        assert!(sessions.get_cookie("bob", "sid").is_none());
    }

    #[test]
    fn test_token_expiry() {
        let sessions = SessionManager::new();
        sessions.set_token("u1", TOKEN_BEARER, "live", Some(now_unix_s() + 3600));
        sessions.set_token("u2", TOKEN_BEARER, "dead", Some(now_unix_s().saturating_sub(1)));

        assert_eq!(sessions.get_token("u1", TOKEN_BEARER), Some("live".to_string()));
        assert_eq!(sessions.get_token("u2", TOKEN_BEARER), None);
    }

    #[test]
    fn test_auto_handle_cookies() {
        let sessions = SessionManager::new();
        let response = ResponseRecord::ok(Protocol::Http, 200, 100)
            .with_headers("Set-Cookie: sid=abc; Path=/api; HttpOnly\nContent-Type: text/html\n");

        sessions.auto_handle_cookies("u1", &response);

        let cookie = sessions.get_cookie("u1", "sid").unwrap();
        assert_eq!(cookie.value, "abc");
        assert_eq!(cookie.path.as_deref(), Some("/api"));
    }

    #[test]
    fn test_prepare_headers_emits_cookie_header() {
        let sessions = SessionManager::new();
        sessions.set_cookie("u1", "sid", "abc", None, None);

        let headers = sessions.prepare_request_headers("u1", "Accept: */*");
        assert!(headers.contains("Accept: */*\n"));
        assert!(headers.contains("Cookie: sid=abc\n"));
    }

    #[test]
    fn test_prepare_headers_token_preference() {
        let sessions = SessionManager::new();
        sessions.set_token("u1", TOKEN_BASIC, "Basic dXNlcjpwdw==", None);
        sessions.set_api_key("u1", "X-Api-Key", "k-1");
        sessions.set_token("u1", TOKEN_BEARER, "T", None);

        let headers = sessions.prepare_request_headers("u1", "");
        assert!(headers.contains("Authorization: Bearer T\n"));
        assert!(!headers.contains("X-Api-Key"));
        assert!(!headers.contains("Basic"));
    }

    #[test]
    fn test_prepare_headers_api_key_over_basic() {
        let sessions = SessionManager::new();
        sessions.set_token("u1", TOKEN_BASIC, "Basic Zm9v", None);
        sessions.set_api_key("u1", "X-Api-Key", "k-1");

        let headers = sessions.prepare_request_headers("u1", "");
        assert!(headers.contains("X-Api-Key: k-1\n"));
        assert!(!headers.contains("Authorization"));
    }

    #[test]
    fn test_expired_bearer_falls_back() {
        let sessions = SessionManager::new();
        sessions.set_token("u1", TOKEN_BEARER, "old", Some(now_unix_s().saturating_sub(5)));
        sessions.set_token("u1", TOKEN_BASIC, "Basic Zm9v", None);

        let headers = sessions.prepare_request_headers("u1", "");
        assert!(headers.contains("Authorization: Basic Zm9v\n"));
        assert!(!headers.contains("Bearer"));
    }

    #[test]
    fn test_process_response_binds_variables() {
        let sessions = SessionManager::new();
        let mut response = ResponseRecord::ok(Protocol::Http, 200, 100);
        response.body = r#"{"user": {"id": 42}}"#.to_string();

        let rules = vec![crate::extractor::ExtractRule {
            source: crate::extractor::ExtractSource::JsonPath,
            key: "user.id".to_string(),
            variable: "uid".to_string(),
        }];
        sessions.process_response("u1", &response, &rules);

        assert_eq!(sessions.get("u1", "uid"), Some(json!(42)));
    }

    #[test]
    fn test_remove_session_is_explicit_and_idempotent() {
        let sessions = SessionManager::new();
        sessions.set("u1", "k", json!(1));
        assert_eq!(sessions.session_count(), 1);

        sessions.remove_session("u1");
        sessions.remove_session("u1");
        assert_eq!(sessions.session_count(), 0);
        assert_eq!(sessions.get("u1", "k"), None);
    }
}
