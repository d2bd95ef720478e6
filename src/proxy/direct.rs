//! Direct (pass-through) back-end protocol.
//!
//! The dispatcher selects this client when the route decision bypasses the
//! remote proxy: the raw outbound connection already points at the final
//! target, so the handshake has nothing to negotiate.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::net::TcpStream;
use url::Url;

use super::{ProxyClient, ProxyStream, Registry};
use crate::address::TargetAddr;

pub const SCHEME: &str = "direct";

pub struct Direct;

#[async_trait]
impl ProxyClient for Direct {
    fn name(&self) -> &str {
        SCHEME
    }

    /// Empty: the dispatcher dials the target address itself.
    fn addr(&self) -> &str {
        ""
    }

    async fn handshake(&self, conn: TcpStream, _target: &TargetAddr) -> anyhow::Result<ProxyStream> {
        Ok(Box::pin(conn))
    }
}

pub fn register(registry: &mut Registry) {
    registry.register_client(
        SCHEME,
        Box::new(|_url: &Url| Ok(Arc::new(Direct) as Arc<dyn ProxyClient>)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_has_no_dial_endpoint() {
        let direct = Direct;
        assert_eq!(direct.name(), "direct");
        assert!(direct.addr().is_empty());
    }

    #[tokio::test]
    async fn test_handshake_is_pass_through() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            sock.write_all(b"world").await.unwrap();
        });

        let conn = TcpStream::connect(addr).await.unwrap();
        let target = TargetAddr::from_host("127.0.0.1", addr.port());
        let mut stream = Direct.handshake(conn, &target).await.unwrap();

        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        server.await.unwrap();
    }
}
