use std::net::IpAddr;

/// Destination requested by a front-end handshake.
///
/// Either a named host, a literal IP, or both (a protocol may carry the name
/// and have already resolved it). Constructors guarantee at least one of the
/// two is present; when both are, the IP literal wins for rendering and
/// dialing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddr {
    name: Option<String>,
    ip: Option<IpAddr>,
    port: u16,
}

impl TargetAddr {
    pub fn from_ip(ip: IpAddr, port: u16) -> Self {
        Self {
            name: None,
            ip: Some(ip),
            port,
        }
    }

    pub fn from_name(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: Some(name.into()),
            ip: None,
            port,
        }
    }

    /// Classify a host string: IP literals become `ip`, anything else `name`.
    pub fn from_host(host: &str, port: u16) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => Self::from_ip(ip, port),
            Err(_) => Self::from_name(host, port),
        }
    }

    /// Host half of the endpoint, without the port.
    pub fn host(&self) -> String {
        match self.ip {
            Some(ip) => ip.to_string(),
            // The constructor invariant means name must be set here.
            None => self.name.clone().unwrap_or_default(),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `"host:port"` endpoint string, IPv6 literals bracketed.
    pub fn endpoint(&self) -> String {
        match self.ip {
            Some(IpAddr::V6(ip)) => format!("[{}]:{}", ip, self.port),
            Some(IpAddr::V4(ip)) => format!("{}:{}", ip, self.port),
            None => format!("{}:{}", self.name.as_deref().unwrap_or_default(), self.port),
        }
    }

    /// Resolve to a dialable socket address. Named hosts go through DNS.
    pub async fn to_socket_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        if let Some(ip) = self.ip {
            return Ok(std::net::SocketAddr::new(ip, self.port));
        }
        let host = self.name.as_deref().unwrap_or_default();
        tokio::net::lookup_host((host, self.port))
            .await?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no address found for {}", host),
                )
            })
    }

}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.endpoint())
    }
}
