//! Protocol plugin registry and URL-based factory resolution.
//!
//! Front-end (server) and back-end (client) protocols are selected at runtime
//! by the scheme of a configuration URL. Protocols register a factory under
//! their scheme; resolution parses the URL, looks the scheme up and hands the
//! parsed URL to the factory. Resolution itself performs no network I/O.

pub mod direct;
pub mod socks5;

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use url::Url;

use crate::address::TargetAddr;
use crate::error::{Error, Result};

/// Duplex byte stream produced by a protocol handshake.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type ProxyStream = Pin<Box<dyn AsyncStream>>;

/// Front-end protocol: spoken with the inbound client connecting to this
/// gateway. The handshake yields the wrapped stream plus the destination the
/// client asked for.
#[async_trait]
pub trait ProxyServer: Send + Sync {
    fn name(&self) -> &str;

    /// Bind address for the listener.
    fn addr(&self) -> &str;

    async fn handshake(&self, conn: TcpStream) -> anyhow::Result<(ProxyStream, TargetAddr)>;

    /// Release listening resources. Most protocols hold none beyond the
    /// listener the dispatcher owns, so the default is a no-op.
    fn stop(&self) {}
}

/// Back-end protocol: spoken when relaying toward the final destination,
/// either directly or through a remote proxy.
#[async_trait]
pub trait ProxyClient: Send + Sync {
    fn name(&self) -> &str;

    /// The proxy's own dial endpoint. Empty for protocols that dial the
    /// target itself (the dispatcher then dials the target address).
    fn addr(&self) -> &str;

    async fn handshake(&self, conn: TcpStream, target: &TargetAddr) -> anyhow::Result<ProxyStream>;
}

impl std::fmt::Debug for dyn ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("name", &self.name())
            .field("addr", &self.addr())
            .finish()
    }
}

impl std::fmt::Debug for dyn ProxyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyClient")
            .field("name", &self.name())
            .field("addr", &self.addr())
            .finish()
    }
}

pub type ServerFactory =
    Box<dyn Fn(&Url) -> anyhow::Result<std::sync::Arc<dyn ProxyServer>> + Send + Sync>;
pub type ClientFactory =
    Box<dyn Fn(&Url) -> anyhow::Result<std::sync::Arc<dyn ProxyClient>> + Send + Sync>;

/// Scheme-to-factory mappings, populated once during startup and read-only
/// afterwards. Registering the same scheme twice keeps the later factory.
#[derive(Default)]
pub struct Registry {
    servers: HashMap<String, ServerFactory>,
    clients: HashMap<String, ClientFactory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with every built-in protocol. This is the single
    /// deterministic registration step run at process start.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        direct::register(&mut registry);
        socks5::register(&mut registry);
        registry
    }

    pub fn register_server(&mut self, scheme: &str, factory: ServerFactory) {
        self.servers.insert(scheme.to_lowercase(), factory);
    }

    pub fn register_client(&mut self, scheme: &str, factory: ClientFactory) {
        self.clients.insert(scheme.to_lowercase(), factory);
    }

    /// Resolve a front-end protocol from a configuration URL.
    pub fn server_from_url(&self, url_str: &str) -> Result<std::sync::Arc<dyn ProxyServer>> {
        let url = parse_url(url_str)?;
        let scheme = url.scheme().to_lowercase();
        let factory = self
            .servers
            .get(&scheme)
            .ok_or_else(|| Error::UnknownScheme {
                kind: "server",
                scheme: scheme.clone(),
            })?;
        factory(&url).map_err(|cause| Error::Factory { scheme, cause })
    }

    /// Resolve a back-end protocol from a configuration URL.
    pub fn client_from_url(&self, url_str: &str) -> Result<std::sync::Arc<dyn ProxyClient>> {
        let url = parse_url(url_str)?;
        let scheme = url.scheme().to_lowercase();
        let factory = self
            .clients
            .get(&scheme)
            .ok_or_else(|| Error::UnknownScheme {
                kind: "client",
                scheme: scheme.clone(),
            })?;
        factory(&url).map_err(|cause| Error::Factory { scheme, cause })
    }
}

fn parse_url(url_str: &str) -> Result<Url> {
    Url::parse(url_str).map_err(|source| Error::MalformedUrl {
        url: url_str.to_string(),
        source,
    })
}

/// `host:port` from a configuration URL, the shape factories usually need
/// for a bind or dial endpoint.
pub fn url_endpoint(url: &Url) -> anyhow::Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("URL has no host"))?;
    let port = url
        .port()
        .ok_or_else(|| anyhow::anyhow!("URL has no port"))?;
    Ok(format!("{}:{}", host, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct NamedClient(&'static str);

    #[async_trait]
    impl ProxyClient for NamedClient {
        fn name(&self) -> &str {
            self.0
        }
        fn addr(&self) -> &str {
            ""
        }
        async fn handshake(
            &self,
            conn: TcpStream,
            _target: &TargetAddr,
        ) -> anyhow::Result<ProxyStream> {
            Ok(Box::pin(conn))
        }
    }

    #[test]
    fn test_unknown_scheme() {
        let registry = Registry::new();
        let err = registry.client_from_url("nosuch://127.0.0.1:1080").unwrap_err();
        assert!(matches!(
            err,
            Error::UnknownScheme { kind: "client", .. }
        ));

        let err = registry.server_from_url("nosuch://127.0.0.1:1080").unwrap_err();
        assert!(matches!(
            err,
            Error::UnknownScheme { kind: "server", .. }
        ));
    }

    #[test]
    fn test_malformed_url() {
        let registry = Registry::new();
        let err = registry.client_from_url("http://[").unwrap_err();
        assert!(matches!(err, Error::MalformedUrl { .. }));
    }

    #[test]
    fn test_scheme_lookup_is_case_insensitive() {
        let mut registry = Registry::new();
        registry.register_client(
            "test",
            Box::new(|_| Ok(Arc::new(NamedClient("test")) as Arc<dyn ProxyClient>)),
        );
        let client = registry.client_from_url("TEST://127.0.0.1:1080").unwrap();
        assert_eq!(client.name(), "test");
    }

    #[test]
    fn test_later_registration_wins() {
        let mut registry = Registry::new();
        registry.register_client(
            "test",
            Box::new(|_| Ok(Arc::new(NamedClient("first")) as Arc<dyn ProxyClient>)),
        );
        registry.register_client(
            "test",
            Box::new(|_| Ok(Arc::new(NamedClient("second")) as Arc<dyn ProxyClient>)),
        );
        let client = registry.client_from_url("test://127.0.0.1:1080").unwrap();
        assert_eq!(client.name(), "second");
    }

    #[test]
    fn test_factory_error_is_wrapped() {
        let mut registry = Registry::new();
        registry.register_client("bad", Box::new(|_| anyhow::bail!("rejected by factory")));
        let err = registry.client_from_url("bad://127.0.0.1:1080").unwrap_err();
        match err {
            Error::Factory { scheme, cause } => {
                assert_eq!(scheme, "bad");
                assert!(cause.to_string().contains("rejected by factory"));
            }
            other => panic!("expected Factory error, got {:?}", other),
        }
    }

    #[test]
    fn test_builtin_registration() {
        let registry = Registry::with_builtin();
        assert!(registry.client_from_url("direct://").is_ok());
        assert!(registry.server_from_url("socks5://127.0.0.1:1080").is_ok());
        // direct has no server side, socks5 has no client side
        assert!(registry.server_from_url("direct://").is_err());
        assert!(registry.client_from_url("socks5://127.0.0.1:1080").is_err());
    }

    #[test]
    fn test_url_endpoint() {
        let url = Url::parse("socks5://127.0.0.1:1080?foo=bar").unwrap();
        assert_eq!(url_endpoint(&url).unwrap(), "127.0.0.1:1080");

        let url = Url::parse("direct://").unwrap();
        assert!(url_endpoint(&url).is_err());
    }
}
