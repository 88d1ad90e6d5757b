//! Loopback UDP listeners for the login, zone, and ping servers.
//!
//! Sockets are built with `socket2` so buffer sizes and the low-delay TOS
//! byte are applied before binding, then handed to tokio.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::engine::Transmit;
use crate::session::ClientServer;

/// Largest datagram the receive loops accept.
const RECV_BUFFER_LEN: usize = 16 * 1024;

/// Socket options applied to every listener.
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// `SO_RCVBUF` in bytes. Default: 64 KiB.
    pub recv_buffer_size: usize,
    /// `SO_SNDBUF` in bytes. Default: 64 KiB.
    pub send_buffer_size: usize,
    /// IP type-of-service byte. Default: `0x10` (low delay).
    pub tos: u32,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: 64 * 1024,
            send_buffer_size: 64 * 1024,
            tos: 0x10,
        }
    }
}

/// One datagram read from a listener.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub server: ClientServer,
    pub source: SocketAddr,
    pub bytes: Vec<u8>,
}

/// Create a configured, non-blocking UDP socket bound to `addr`.
pub async fn bind_udp(addr: SocketAddr, config: &UdpConfig) -> io::Result<UdpSocket> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    socket.set_reuse_address(false)?;
    socket.set_broadcast(false)?;
    socket.set_recv_buffer_size(config.recv_buffer_size)?;
    socket.set_send_buffer_size(config.send_buffer_size)?;
    if addr.is_ipv4()
        && let Err(e) = socket.set_tos(config.tos)
    {
        tracing::warn!("Could not set TOS 0x{:02X} on {addr}: {e}", config.tos);
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

/// The three bound listeners.
pub struct UdpListeners {
    login: Arc<UdpSocket>,
    zone: Arc<UdpSocket>,
    ping: Arc<UdpSocket>,
}

impl UdpListeners {
    /// Bind all three listeners on `ip`. A port of 0 lets the OS choose.
    pub async fn bind(
        ip: IpAddr,
        login_port: u16,
        zone_port: u16,
        ping_port: u16,
        config: &UdpConfig,
    ) -> io::Result<Self> {
        let login = bind_udp(SocketAddr::new(ip, login_port), config).await?;
        let zone = bind_udp(SocketAddr::new(ip, zone_port), config).await?;
        let ping = bind_udp(SocketAddr::new(ip, ping_port), config).await?;
        let listeners = Self {
            login: Arc::new(login),
            zone: Arc::new(zone),
            ping: Arc::new(ping),
        };
        tracing::info!(
            "Bound login ({}), zone ({}), and ping ({}) listeners",
            listeners.local_port(ClientServer::Login)?,
            listeners.local_port(ClientServer::Zone)?,
            listeners.local_port(ClientServer::Ping)?
        );
        Ok(listeners)
    }

    /// Socket serving `server`.
    pub fn socket(&self, server: ClientServer) -> &Arc<UdpSocket> {
        match server {
            ClientServer::Login => &self.login,
            ClientServer::Zone => &self.zone,
            ClientServer::Ping => &self.ping,
        }
    }

    /// Actual bound port of `server`'s listener.
    pub fn local_port(&self, server: ClientServer) -> io::Result<u16> {
        Ok(self.socket(server).local_addr()?.port())
    }

    /// Fire-and-forget send; failures are logged and dropped.
    pub async fn send(&self, transmit: &Transmit) {
        let socket = self.socket(transmit.server);
        if let Err(e) = socket.send_to(&transmit.bytes, transmit.destination).await {
            tracing::warn!(
                "Failed to send {} bytes to {} on {}: {e}",
                transmit.bytes.len(),
                transmit.destination,
                transmit.server
            );
        }
    }

    /// Spawn one receive loop per listener feeding `tx`.
    pub fn spawn_receivers(
        &self,
        tx: mpsc::UnboundedSender<Datagram>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        [ClientServer::Login, ClientServer::Zone, ClientServer::Ping]
            .into_iter()
            .map(|server| {
                let socket = Arc::clone(self.socket(server));
                let tx = tx.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    recv_loop(&socket, server, &tx, &mut shutdown).await;
                })
            })
            .collect()
    }
}

/// Read datagrams until shutdown is signalled or the consumer goes away.
pub async fn recv_loop(
    socket: &UdpSocket,
    server: ClientServer,
    tx: &mpsc::UnboundedSender<Datagram>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; RECV_BUFFER_LEN];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((n, source)) => {
                        let datagram = Datagram {
                            server,
                            source,
                            bytes: buf[..n].to_vec(),
                        };
                        if tx.send(datagram).is_err() {
                            break;
                        }
                    }
                    // ICMP port-unreachable surfaces here on some platforms.
                    Err(e) => tracing::debug!("{server} receive error: {e}"),
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("{server} receive loop stopped");
}
