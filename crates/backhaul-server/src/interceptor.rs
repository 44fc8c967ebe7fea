//! Admission and HTTP request hooks

use crate::config::ServerConfig;
use crate::error::AdmissionError;
use crate::http::HttpRequestHead;
use async_trait::async_trait;
use backhaul_http_auth::{AuthResult, HttpAuthenticator};
use backhaul_proto::{TunnelRequest, TunnelType};
use backhaul_router::{is_port_available, PortRange, TcpRegistry};
use std::sync::Arc;
use tracing::debug;

/// Runs during the handshake, before a tunnel is registered
///
/// Returns the request to register, possibly modified (e.g. with an allocated
/// port), or the reason to refuse it.
pub trait TunnelRequestInterceptor: Send + Sync {
    fn intercept(&self, request: TunnelRequest) -> Result<TunnelRequest, AdmissionError>;
}

impl<F> TunnelRequestInterceptor for F
where
    F: Fn(TunnelRequest) -> Result<TunnelRequest, AdmissionError> + Send + Sync,
{
    fn intercept(&self, request: TunnelRequest) -> Result<TunnelRequest, AdmissionError> {
        self(request)
    }
}

/// Built-in admission policy: tunnel type, auth token and TCP port policy
pub struct DefaultTunnelRequestInterceptor {
    auth_token: Option<String>,
    port_range: PortRange,
    allowed_ports: Vec<u16>,
    http_enabled: bool,
    https_enabled: bool,
    tcp_registry: Arc<TcpRegistry>,
}

impl DefaultTunnelRequestInterceptor {
    pub fn new(config: &ServerConfig, tcp_registry: Arc<TcpRegistry>) -> Self {
        Self {
            auth_token: config.auth_token.clone(),
            port_range: config.port_range,
            allowed_ports: config.allowed_ports.clone(),
            http_enabled: config.http_addr.is_some(),
            https_enabled: config.https_addr.is_some(),
            tcp_registry,
        }
    }

    fn check_token(&self, request: &TunnelRequest) -> Result<(), AdmissionError> {
        match &self.auth_token {
            Some(expected) if request.auth_token() != Some(expected.as_str()) => {
                Err(AdmissionError::BadAuthToken)
            }
            _ => Ok(()),
        }
    }

    fn port_allowed(&self, port: u16) -> bool {
        if self.allowed_ports.is_empty() {
            self.port_range.contains(port)
        } else {
            self.allowed_ports.contains(&port)
        }
    }

    /// Random free port from the allow-list, or from the range without one
    ///
    /// Checks ports with blocking binds; the handshake runs interceptors off
    /// the async workers.
    fn allocate_port(&self) -> Result<u16, AdmissionError> {
        let host = self.tcp_registry.bind_host();
        let is_free = |port: &u16| !self.tcp_registry.contains(port) && is_port_available(host, *port);

        let found = if self.allowed_ports.is_empty() {
            self.port_range.scan_from_random().find(is_free)
        } else {
            let offset = rand::random::<usize>() % self.allowed_ports.len();
            let (head, tail) = self.allowed_ports.split_at(offset);
            tail.iter().chain(head).copied().find(is_free)
        };

        found.ok_or_else(|| AdmissionError::NoFreePort(self.port_pool()))
    }

    fn port_pool(&self) -> String {
        if self.allowed_ports.is_empty() {
            return self.port_range.to_string();
        }
        let ports: Vec<String> = self.allowed_ports.iter().map(u16::to_string).collect();
        format!("allowed ports {}", ports.join(","))
    }
}

impl TunnelRequestInterceptor for DefaultTunnelRequestInterceptor {
    fn intercept(&self, request: TunnelRequest) -> Result<TunnelRequest, AdmissionError> {
        if request.tunnel_type == TunnelType::Unknown {
            return Err(AdmissionError::UnknownTunnelType);
        }
        self.check_token(&request)?;

        match request.tunnel_type {
            TunnelType::Tcp if request.remote_port == 0 => {
                let port = self.allocate_port()?;
                debug!("Allocated port {} for {}", port, request.local_target());
                Ok(request.with_remote_port(port))
            }
            TunnelType::Tcp => {
                if !self.port_allowed(request.remote_port) {
                    return Err(AdmissionError::PortNotAllowed(request.remote_port));
                }
                Ok(request)
            }
            TunnelType::Http | TunnelType::Https => {
                let enabled = match request.tunnel_type {
                    TunnelType::Http => self.http_enabled,
                    _ => self.https_enabled,
                };
                if !enabled {
                    return Err(AdmissionError::SchemeDisabled(request.tunnel_type));
                }
                if request.normalized_vhost().is_none() {
                    return Err(AdmissionError::MissingVirtualHost);
                }
                Ok(request)
            }
            TunnelType::Unknown => Err(AdmissionError::UnknownTunnelType),
        }
    }
}

/// Hook on every public HTTP request before it enters its tunnel
///
/// Returning a raw response short-circuits forwarding; the response is
/// written to the public socket and the connection closed.
#[async_trait]
pub trait HttpRequestInterceptor: Send + Sync {
    async fn handle(&self, head: &mut HttpRequestHead, tunnel: &TunnelRequest) -> Option<Vec<u8>>;
}

/// Basic-Auth challenge for tunnels with `enableBasicAuth`
pub struct BasicAuthInterceptor;

#[async_trait]
impl HttpRequestInterceptor for BasicAuthInterceptor {
    async fn handle(&self, head: &mut HttpRequestHead, tunnel: &TunnelRequest) -> Option<Vec<u8>> {
        let authenticator = HttpAuthenticator::for_request(tunnel)?;
        match authenticator.authenticate(&head.headers) {
            AuthResult::Authenticated => {
                // Credentials are for the relay, not the local service
                head.remove_header("Authorization");
                None
            }
            AuthResult::Unauthorized(response) => {
                debug!("Basic auth failed for {} from {}", head.path, head.peer_addr);
                Some(response)
            }
        }
    }
}

/// Applies the tunnel's `rewriteHeaders` and `addHeaders` extras
pub struct HeaderRulesInterceptor;

#[async_trait]
impl HttpRequestInterceptor for HeaderRulesInterceptor {
    async fn handle(&self, head: &mut HttpRequestHead, tunnel: &TunnelRequest) -> Option<Vec<u8>> {
        for (name, value) in tunnel.rewrite_headers() {
            if head.header(&name).is_some() {
                head.set_header(&name, &value);
            }
        }
        for (name, value) in tunnel.add_headers() {
            head.append_header(&name, &value);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backhaul_proto::extras;

    fn interceptor(config: ServerConfig) -> DefaultTunnelRequestInterceptor {
        let registry = Arc::new(TcpRegistry::new("127.0.0.1".parse().unwrap()));
        DefaultTunnelRequestInterceptor::new(&config, registry)
    }

    fn http_config() -> ServerConfig {
        ServerConfig {
            http_addr: Some("127.0.0.1:0".parse().unwrap()),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut request = TunnelRequest::tcp("127.0.0.1", 22, 0);
        request.tunnel_type = TunnelType::Unknown;
        assert_eq!(
            interceptor(ServerConfig::default()).intercept(request),
            Err(AdmissionError::UnknownTunnelType)
        );
    }

    #[test]
    fn test_auth_token() {
        let policy = interceptor(ServerConfig {
            auth_token: Some("tok1".to_string()),
            ..ServerConfig::default()
        });

        let missing = TunnelRequest::tcp("127.0.0.1", 22, 0);
        assert_eq!(policy.intercept(missing), Err(AdmissionError::BadAuthToken));

        let wrong = TunnelRequest::tcp("127.0.0.1", 22, 0).with_extra(extras::AUTH_TOKEN, "tok2");
        assert_eq!(policy.intercept(wrong), Err(AdmissionError::BadAuthToken));

        let right = TunnelRequest::tcp("127.0.0.1", 22, 0).with_extra(extras::AUTH_TOKEN, "tok1");
        assert!(policy.intercept(right).is_ok());
    }

    #[test]
    fn test_port_zero_allocates_within_range() {
        let policy = interceptor(ServerConfig {
            port_range: PortRange::new(42000, 42100).unwrap(),
            ..ServerConfig::default()
        });

        let original = TunnelRequest::tcp("127.0.0.1", 22, 0);
        let assigned = policy.intercept(original.clone()).unwrap();
        assert!((42000..=42100).contains(&assigned.remote_port));
        assert_eq!(original.remote_port, 0);
    }

    #[test]
    fn test_allocation_skips_busy_ports() {
        let busy = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let busy_port = busy.local_addr().unwrap().port();
        let free_port = {
            let scratch = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            scratch.local_addr().unwrap().port()
        };

        let policy = interceptor(ServerConfig {
            allowed_ports: vec![busy_port, free_port],
            ..ServerConfig::default()
        });
        for _ in 0..10 {
            let assigned = policy.intercept(TunnelRequest::tcp("127.0.0.1", 22, 0)).unwrap();
            assert_eq!(assigned.remote_port, free_port);
        }
        drop(busy);
    }

    #[test]
    fn test_no_free_port() {
        let busy = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = busy.local_addr().unwrap().port();
        let policy = interceptor(ServerConfig {
            port_range: PortRange::new(port, port).unwrap(),
            ..ServerConfig::default()
        });
        assert_eq!(
            policy.intercept(TunnelRequest::tcp("127.0.0.1", 22, 0)),
            Err(AdmissionError::NoFreePort(format!("{}-{}", port, port)))
        );
    }

    #[test]
    fn test_no_free_port_names_allow_list() {
        let busy = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = busy.local_addr().unwrap().port();
        let policy = interceptor(ServerConfig {
            allowed_ports: vec![port],
            ..ServerConfig::default()
        });

        let refused = policy
            .intercept(TunnelRequest::tcp("127.0.0.1", 22, 0))
            .unwrap_err();
        assert_eq!(refused.to_string(), format!("no free port in allowed ports {}", port));
    }

    #[test]
    fn test_requested_port_policy() {
        let policy = interceptor(ServerConfig {
            port_range: PortRange::new(30000, 30010).unwrap(),
            ..ServerConfig::default()
        });
        assert!(policy.intercept(TunnelRequest::tcp("127.0.0.1", 22, 30005)).is_ok());
        assert_eq!(
            policy.intercept(TunnelRequest::tcp("127.0.0.1", 22, 80)),
            Err(AdmissionError::PortNotAllowed(80))
        );

        let allow_list = interceptor(ServerConfig {
            allowed_ports: vec![2222],
            ..ServerConfig::default()
        });
        assert!(allow_list.intercept(TunnelRequest::tcp("127.0.0.1", 22, 2222)).is_ok());
        assert_eq!(
            allow_list.intercept(TunnelRequest::tcp("127.0.0.1", 22, 2223)),
            Err(AdmissionError::PortNotAllowed(2223))
        );
    }

    #[test]
    fn test_http_needs_listener_and_vhost() {
        let request = TunnelRequest::http("127.0.0.1", 3000, "t1.tunnel.lo");
        assert_eq!(
            interceptor(ServerConfig::default()).intercept(request.clone()),
            Err(AdmissionError::SchemeDisabled(TunnelType::Http))
        );
        assert!(interceptor(http_config()).intercept(request).is_ok());

        let blank = TunnelRequest::http("127.0.0.1", 3000, "  ");
        assert_eq!(
            interceptor(http_config()).intercept(blank),
            Err(AdmissionError::MissingVirtualHost)
        );
    }

    #[test]
    fn test_closure_interceptor() {
        let deny_ssh = |request: TunnelRequest| {
            if request.local_port == 22 {
                Err(AdmissionError::Rejected("ssh not allowed".to_string()))
            } else {
                Ok(request)
            }
        };
        assert!(deny_ssh.intercept(TunnelRequest::tcp("127.0.0.1", 22, 0)).is_err());
        assert!(deny_ssh.intercept(TunnelRequest::tcp("127.0.0.1", 80, 0)).is_ok());
    }

    fn head(headers: &[(&str, &str)]) -> HttpRequestHead {
        HttpRequestHead {
            method: "GET".to_string(),
            path: "/".to_string(),
            version: 1,
            headers: headers
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
            peer_addr: "127.0.0.1:40000".parse().unwrap(),
            https: false,
        }
    }

    #[tokio::test]
    async fn test_header_rules() {
        let tunnel = TunnelRequest::http("127.0.0.1", 3000, "t1.tunnel.lo")
            .with_extra(extras::REWRITE_HEADERS, r#"{"host":"localhost:3000","X-Absent":"x"}"#)
            .with_extra(extras::ADD_HEADERS, r#"{"X-Forwarded-Proto":"http"}"#);
        let mut head = head(&[("Host", "t1.tunnel.lo")]);

        assert!(HeaderRulesInterceptor.handle(&mut head, &tunnel).await.is_none());
        assert_eq!(head.header("Host"), Some("localhost:3000"));
        assert_eq!(head.header("X-Forwarded-Proto"), Some("http"));
        assert_eq!(head.header("X-Absent"), None);
    }

    #[tokio::test]
    async fn test_basic_auth_interceptor_strips_credentials() {
        let tunnel = TunnelRequest::http("127.0.0.1", 3000, "t1.tunnel.lo")
            .with_extra(extras::ENABLE_BASIC_AUTH, "true")
            .with_extra(extras::BASIC_AUTH_USERNAME, "tp")
            .with_extra(extras::BASIC_AUTH_PASSWORD, "s3cret");

        let mut anonymous = head(&[("Host", "t1.tunnel.lo")]);
        let challenge = BasicAuthInterceptor.handle(&mut anonymous, &tunnel).await.unwrap();
        assert!(String::from_utf8(challenge).unwrap().contains("WWW-Authenticate: Basic"));

        // "tp:s3cret"
        let mut authed = head(&[("Host", "t1.tunnel.lo"), ("Authorization", "Basic dHA6czNjcmV0")]);
        assert!(BasicAuthInterceptor.handle(&mut authed, &tunnel).await.is_none());
        assert_eq!(authed.header("Authorization"), None);
    }
}
