//! HTTP Basic Authentication (RFC 7617)

use crate::{plain_response, AuthResult, HttpAuthProvider};
use backhaul_proto::BasicAuthConfig;
use base64::Engine;
use tracing::debug;

/// Single-user Basic-Auth check
pub struct BasicAuthProvider {
    username: String,
    password: String,
    realm: String,
}

impl BasicAuthProvider {
    pub fn new(username: impl Into<String>, password: impl Into<String>, realm: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            realm: realm.into(),
        }
    }

    pub fn from_config(config: &BasicAuthConfig) -> Self {
        Self::new(&config.username, &config.password, &config.realm)
    }

    /// `user:password` out of an `Authorization` value
    fn decode(value: &str) -> Option<(String, String)> {
        let (scheme, encoded) = value.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, password) = decoded.split_once(':')?;
        Some((user.to_string(), password.to_string()))
    }

    fn matches(&self, user: &str, password: &str) -> bool {
        // Both halves are always compared
        let user_ok = constant_time_eq(user.as_bytes(), self.username.as_bytes());
        let password_ok = constant_time_eq(password.as_bytes(), self.password.as_bytes());
        user_ok & password_ok
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl HttpAuthProvider for BasicAuthProvider {
    fn authenticate(&self, headers: &[(String, String)]) -> AuthResult {
        let credentials = headers
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case("authorization"))
            .find_map(|(_, value)| Self::decode(value));

        match credentials {
            Some((user, password)) if self.matches(&user, &password) => AuthResult::Authenticated,
            Some((user, _)) => {
                debug!("Basic auth rejected for user '{}'", user);
                AuthResult::Unauthorized(self.unauthorized_response())
            }
            None => {
                debug!("Basic auth: no usable Authorization header");
                AuthResult::Unauthorized(self.unauthorized_response())
            }
        }
    }

    fn unauthorized_response(&self) -> Vec<u8> {
        let challenge = format!("Basic realm=\"{}\"", self.realm.replace('"', "\\\""));
        plain_response(
            "401 Unauthorized",
            &[("WWW-Authenticate", challenge)],
            "Authentication required",
        )
    }

    fn auth_type(&self) -> &'static str {
        "basic"
    }
}
