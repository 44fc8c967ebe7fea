//! HTTP authentication for tunnels
//!
//! A tunnel opts in through its request extras (`enableBasicAuth`,
//! `basicAuthRealm`, `basicAuthUsername`, `basicAuthPassword`); requests on
//! that virtual host must then carry matching `Authorization: Basic` credentials.
//!
//! ```ignore
//! use backhaul_http_auth::{AuthResult, HttpAuthenticator};
//!
//! if let Some(auth) = HttpAuthenticator::for_request(&tunnel_request) {
//!     if let AuthResult::Unauthorized(response) = auth.authenticate(&headers) {
//!         // write `response` to the public socket and stop
//!     }
//! }
//! ```

mod basic;

pub use basic::BasicAuthProvider;

use backhaul_proto::TunnelRequest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    Authenticated,
    /// Raw HTTP response to send back instead of forwarding
    Unauthorized(Vec<u8>),
}

/// One authentication scheme
pub trait HttpAuthProvider: Send + Sync {
    fn authenticate(&self, headers: &[(String, String)]) -> AuthResult;

    fn unauthorized_response(&self) -> Vec<u8>;

    /// Scheme name for logs
    fn auth_type(&self) -> &'static str;
}

pub struct HttpAuthenticator {
    provider: Box<dyn HttpAuthProvider>,
}

impl HttpAuthenticator {
    /// Authenticator demanded by the tunnel's extras, if any
    pub fn for_request(request: &TunnelRequest) -> Option<Self> {
        request.basic_auth().map(|config| Self {
            provider: Box::new(BasicAuthProvider::from_config(&config)),
        })
    }

    pub fn with_provider(provider: Box<dyn HttpAuthProvider>) -> Self {
        Self { provider }
    }

    pub fn authenticate(&self, headers: &[(String, String)]) -> AuthResult {
        self.provider.authenticate(headers)
    }

    pub fn auth_type(&self) -> &'static str {
        self.provider.auth_type()
    }
}

/// Build a raw `HTTP/1.1` response with a plain-text body
pub(crate) fn plain_response(status: &str, extra_headers: &[(&str, String)], body: &str) -> Vec<u8> {
    let mut response = format!("HTTP/1.1 {}\r\n", status);
    for (name, value) in extra_headers {
        response.push_str(&format!("{}: {}\r\n", name, value));
    }
    response.push_str(&format!(
        "Content-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    ));
    response.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use backhaul_proto::extras;

    #[test]
    fn test_no_authenticator_without_opt_in() {
        let request = TunnelRequest::http("127.0.0.1", 3000, "t1.tunnel.lo");
        assert!(HttpAuthenticator::for_request(&request).is_none());
    }

    #[test]
    fn test_authenticator_from_extras() {
        let request = TunnelRequest::http("127.0.0.1", 3000, "t1.tunnel.lo")
            .with_extra(extras::ENABLE_BASIC_AUTH, "true")
            .with_extra(extras::BASIC_AUTH_USERNAME, "tp")
            .with_extra(extras::BASIC_AUTH_PASSWORD, "s3cret");

        let auth = HttpAuthenticator::for_request(&request).unwrap();
        assert_eq!(auth.auth_type(), "basic");
        assert!(matches!(auth.authenticate(&[]), AuthResult::Unauthorized(_)));
    }

    #[test]
    fn test_plain_response_content_length() {
        let response = plain_response("404 Not Found", &[], "no tunnel");
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Content-Length: 9\r\n"));
        assert!(text.ends_with("\r\n\r\nno tunnel"));
    }
}
