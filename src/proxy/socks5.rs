//! Minimal SOCKS5 front-end protocol (RFC 1928).
//!
//! Supports the no-authentication method and the CONNECT command, which is
//! all the gateway needs from a local front end. BIND and UDP ASSOCIATE are
//! refused with reply 0x07 (command not supported).

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use url::Url;

use super::{url_endpoint, ProxyServer, ProxyStream, Registry};
use crate::address::TargetAddr;

pub const SCHEME: &str = "socks5";

const VERSION: u8 = 5;
const METHOD_NO_AUTH: u8 = 0;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 1;
const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_IPV6: u8 = 4;
const REP_SUCCESS: u8 = 0;
const REP_CMD_NOT_SUPPORTED: u8 = 7;

pub struct Socks5Server {
    addr: String,
}

impl Socks5Server {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl ProxyServer for Socks5Server {
    fn name(&self) -> &str {
        SCHEME
    }

    fn addr(&self) -> &str {
        &self.addr
    }

    async fn handshake(&self, mut conn: TcpStream) -> anyhow::Result<(ProxyStream, TargetAddr)> {
        // Method negotiation: VER NMETHODS METHODS...
        let mut head = [0u8; 2];
        conn.read_exact(&mut head).await?;
        if head[0] != VERSION {
            anyhow::bail!("unsupported SOCKS version {}", head[0]);
        }
        let mut methods = vec![0u8; head[1] as usize];
        conn.read_exact(&mut methods).await?;
        if !methods.contains(&METHOD_NO_AUTH) {
            conn.write_all(&[VERSION, METHOD_NONE_ACCEPTABLE]).await?;
            anyhow::bail!("client offers no acceptable auth method");
        }
        conn.write_all(&[VERSION, METHOD_NO_AUTH]).await?;

        // Request: VER CMD RSV ATYP ADDR PORT
        let mut req = [0u8; 4];
        conn.read_exact(&mut req).await?;
        if req[0] != VERSION {
            anyhow::bail!("unsupported SOCKS version {} in request", req[0]);
        }
        if req[1] != CMD_CONNECT {
            reply(&mut conn, REP_CMD_NOT_SUPPORTED).await?;
            anyhow::bail!("unsupported SOCKS command {}", req[1]);
        }

        let target = match req[3] {
            ATYP_IPV4 => {
                let mut buf = [0u8; 6];
                conn.read_exact(&mut buf).await?;
                let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
                let port = u16::from_be_bytes([buf[4], buf[5]]);
                TargetAddr::from_ip(IpAddr::V4(ip), port)
            }
            ATYP_IPV6 => {
                let mut buf = [0u8; 18];
                conn.read_exact(&mut buf).await?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[..16]);
                let port = u16::from_be_bytes([buf[16], buf[17]]);
                TargetAddr::from_ip(IpAddr::V6(Ipv6Addr::from(octets)), port)
            }
            ATYP_DOMAIN => {
                let len = conn.read_u8().await? as usize;
                let mut buf = vec![0u8; len + 2];
                conn.read_exact(&mut buf).await?;
                let name = std::str::from_utf8(&buf[..len])
                    .map_err(|_| anyhow::anyhow!("invalid domain encoding"))?;
                let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
                TargetAddr::from_host(name, port)
            }
            atyp => anyhow::bail!("unsupported SOCKS address type {}", atyp),
        };

        reply(&mut conn, REP_SUCCESS).await?;
        Ok((Box::pin(conn) as ProxyStream, target))
    }
}

/// VER REP RSV ATYP=IPv4 BND.ADDR=0.0.0.0 BND.PORT=0
async fn reply(conn: &mut TcpStream, rep: u8) -> std::io::Result<()> {
    let mut buf = BytesMut::with_capacity(10);
    buf.put_u8(VERSION);
    buf.put_u8(rep);
    buf.put_u8(0);
    buf.put_u8(ATYP_IPV4);
    buf.put_slice(&[0, 0, 0, 0]);
    buf.put_u16(0);
    conn.write_all(&buf).await
}

pub fn register(registry: &mut Registry) {
    registry.register_server(
        SCHEME,
        Box::new(|url: &Url| {
            let addr = url_endpoint(url)?;
            Ok(Arc::new(Socks5Server::new(addr)) as Arc<dyn ProxyServer>)
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    async fn client_greeting(client: &mut TcpStream) {
        client.write_all(&[5, 1, 0]).await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [5, 0]);
    }

    async fn read_reply(client: &mut TcpStream) -> u8 {
        let mut buf = [0u8; 10];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[0], 5);
        buf[1]
    }

    #[tokio::test]
    async fn test_connect_domain_target() {
        let (mut client, server_conn) = connected_pair().await;
        let server = Socks5Server::new("127.0.0.1:0");

        let handshake = tokio::spawn(async move { server.handshake(server_conn).await });

        client_greeting(&mut client).await;
        // CONNECT example.com:443
        let mut req = vec![5, 1, 0, 3, 11];
        req.extend_from_slice(b"example.com");
        req.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&req).await.unwrap();
        assert_eq!(read_reply(&mut client).await, 0);

        let (_stream, target) = handshake.await.unwrap().unwrap();
        assert_eq!(target.host(), "example.com");
        assert_eq!(target.port(), 443);
    }

    #[tokio::test]
    async fn test_connect_ipv4_target() {
        let (mut client, server_conn) = connected_pair().await;
        let server = Socks5Server::new("127.0.0.1:0");

        let handshake = tokio::spawn(async move { server.handshake(server_conn).await });

        client_greeting(&mut client).await;
        client
            .write_all(&[5, 1, 0, 1, 1, 2, 3, 4, 0, 80])
            .await
            .unwrap();
        assert_eq!(read_reply(&mut client).await, 0);

        let (_stream, target) = handshake.await.unwrap().unwrap();
        assert_eq!(target.endpoint(), "1.2.3.4:80");
    }

    #[tokio::test]
    async fn test_connect_ipv6_target() {
        let (mut client, server_conn) = connected_pair().await;
        let server = Socks5Server::new("127.0.0.1:0");

        let handshake = tokio::spawn(async move { server.handshake(server_conn).await });

        client_greeting(&mut client).await;
        let mut req = vec![5, 1, 0, 4];
        req.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        req.extend_from_slice(&8080u16.to_be_bytes());
        client.write_all(&req).await.unwrap();
        assert_eq!(read_reply(&mut client).await, 0);

        let (_stream, target) = handshake.await.unwrap().unwrap();
        assert_eq!(target.endpoint(), "[::1]:8080");
    }

    #[tokio::test]
    async fn test_rejects_non_connect_command() {
        let (mut client, server_conn) = connected_pair().await;
        let server = Socks5Server::new("127.0.0.1:0");

        let handshake = tokio::spawn(async move { server.handshake(server_conn).await });

        client_greeting(&mut client).await;
        // UDP ASSOCIATE
        client
            .write_all(&[5, 3, 0, 1, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        assert_eq!(read_reply(&mut client).await, REP_CMD_NOT_SUPPORTED);
        assert!(handshake.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_rejects_wrong_version() {
        let (mut client, server_conn) = connected_pair().await;
        let server = Socks5Server::new("127.0.0.1:0");

        let handshake = tokio::spawn(async move { server.handshake(server_conn).await });

        client.write_all(&[4, 1, 0]).await.unwrap();
        assert!(handshake.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_rejects_when_no_auth_not_offered() {
        let (mut client, server_conn) = connected_pair().await;
        let server = Socks5Server::new("127.0.0.1:0");

        let handshake = tokio::spawn(async move { server.handshake(server_conn).await });

        // Only username/password offered
        client.write_all(&[5, 1, 2]).await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [5, 0xff]);
        assert!(handshake.await.unwrap().is_err());
    }
}
