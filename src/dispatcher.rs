//! Connection dispatch and routing engine.
//!
//! Owns the front-end listener and runs the per-connection state machine:
//! accept, local handshake, route decision, dial, remote handshake, forward.
//! Every accepted connection lives on its own task; a failure in any stage
//! tears that connection down and never disturbs the accept loop.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::config::RouteMode;
use crate::error::{Error, Result};
use crate::logger::log;
use crate::matcher::RouteMatcher;
use crate::proxy::{ProxyClient, ProxyServer};
use crate::relay::relay;

/// Backoff after an accept failure caused by fd exhaustion.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(500);

const TCP_BACKLOG: i32 = 1024;

/// Which back-end path a connection takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutePath {
    /// Dial the configured remote proxy and ask it to reach the target.
    Proxy,
    /// Dial the target address without going through the remote proxy.
    Direct,
}

/// Pure route decision, made exactly once per connection.
pub fn decide_route(mode: RouteMode, matcher: &RouteMatcher, host: &str) -> RoutePath {
    match mode {
        RouteMode::None => RoutePath::Proxy,
        RouteMode::Whitelist => {
            if matcher.check(host) {
                RoutePath::Direct
            } else {
                RoutePath::Proxy
            }
        }
        RouteMode::Blacklist => {
            if matcher.check(host) {
                RoutePath::Proxy
            } else {
                RoutePath::Direct
            }
        }
    }
}

/// The assembled forwarding engine. Built once at startup from resolved
/// protocol handles; read-only while serving.
pub struct Gateway {
    local: Arc<dyn ProxyServer>,
    remote: Arc<dyn ProxyClient>,
    direct: Arc<dyn ProxyClient>,
    matcher: Arc<RouteMatcher>,
    mode: RouteMode,
}

impl Gateway {
    pub fn new(
        local: Arc<dyn ProxyServer>,
        remote: Arc<dyn ProxyClient>,
        direct: Arc<dyn ProxyClient>,
        matcher: Arc<RouteMatcher>,
        mode: RouteMode,
    ) -> Self {
        Self {
            local,
            remote,
            direct,
            matcher,
            mode,
        }
    }

    /// Bind the front-end listener with SO_REUSEADDR so restarts don't trip
    /// over TIME_WAIT. Hostname bind addresses are resolved; the first
    /// resolution result is used.
    pub fn bind(&self) -> Result<TcpListener> {
        let addr = self.local.addr().to_string();
        let socket_addr: SocketAddr = addr
            .to_socket_addrs()
            .map_err(|source| Error::Listen {
                addr: addr.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| Error::Listen {
                addr: addr.clone(),
                source: io::Error::new(
                    io::ErrorKind::NotFound,
                    "listen address resolves to no socket address",
                ),
            })?;

        let listen = || -> io::Result<TcpListener> {
            let socket = socket2::Socket::new(
                match socket_addr {
                    SocketAddr::V4(_) => socket2::Domain::IPV4,
                    SocketAddr::V6(_) => socket2::Domain::IPV6,
                },
                socket2::Type::STREAM,
                Some(socket2::Protocol::TCP),
            )?;
            socket.set_reuse_address(true)?;
            socket.set_nonblocking(true)?;
            socket.bind(&socket_addr.into())?;
            socket.listen(TCP_BACKLOG)?;
            TcpListener::from_std(socket.into())
        };

        listen().map_err(|source| Error::Listen { addr, source })
    }

    /// Accept loop. Runs until the cancellation token fires, which is the
    /// graceful-shutdown path: the listener is released on every exit of this
    /// function, while connections already forwarding keep running.
    pub async fn run(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        let local_addr = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| self.local.addr().to_string());
        log::info!(
            protocol = self.local.name(),
            address = %local_addr,
            route = self.mode.as_str(),
            "Listening"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!(address = %local_addr, "Listener closing");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((conn, peer)) => {
                            let gateway = Arc::clone(&self);
                            tokio::spawn(async move {
                                let peer_str = peer.to_string();
                                log::connection(&peer_str, "new");
                                if let Err(e) = gateway.handle_connection(conn, peer).await {
                                    log::warn!(
                                        peer = %peer_str,
                                        stage = e.stage(),
                                        error = %e,
                                        "Connection failed"
                                    );
                                }
                                log::connection(&peer_str, "closed");
                            });
                        }
                        Err(e) if is_resource_exhaustion(&e) => {
                            log::error!(error = %e, "Accept failed, out of descriptors, backing off");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                        Err(e) => {
                            log::error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        self.local.stop();
    }

    /// Per-connection state machine: local handshake, route decision, dial,
    /// remote handshake, forward. All resources are owned by this task and
    /// dropped on every exit path.
    async fn handle_connection(&self, conn: TcpStream, peer: SocketAddr) -> Result<()> {
        let (local_stream, target) =
            self.local
                .handshake(conn)
                .await
                .map_err(|cause| Error::Handshake {
                    side: "local",
                    peer: peer.to_string(),
                    cause,
                })?;

        let path = decide_route(self.mode, &self.matcher, &target.host());
        let client = match path {
            RoutePath::Proxy => &self.remote,
            RoutePath::Direct => &self.direct,
        };

        // A client without its own endpoint dials the target itself.
        let dial_addr = if client.addr().is_empty() {
            target.endpoint()
        } else {
            client.addr().to_string()
        };

        log::info!(
            peer = %peer,
            client = client.name(),
            target = %target,
            dial = %dial_addr,
            "Forwarding"
        );

        let outbound = TcpStream::connect(&dial_addr)
            .await
            .map_err(|source| Error::Dial {
                addr: dial_addr.clone(),
                source,
            })?;

        let remote_stream =
            client
                .handshake(outbound, &target)
                .await
                .map_err(|cause| Error::Handshake {
                    side: "remote",
                    peer: dial_addr,
                    cause,
                })?;

        // Relay errors are normal termination, not faults.
        let result = relay(local_stream, remote_stream).await;
        log::debug!(
            peer = %peer,
            target = %target,
            up = result.a_to_b,
            down = result.b_to_a,
            "Relay finished"
        );
        Ok(())
    }
}

/// ENFILE (23) / EMFILE (24): the process or system is out of descriptors.
/// Retrying immediately would spin, so these get a backoff instead.
fn is_resource_exhaustion(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(23) | Some(24))
}
