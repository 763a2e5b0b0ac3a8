//! Transport datagramme SSDP : construction du socket multicast, boucle de
//! réception et remise des paquets décodés aux couches supérieures.
//!
//! Le client et le serveur SSDP peuvent cohabiter sur le port 1900 grâce à
//! SO_REUSEADDR/SO_REUSEPORT, mais le noyau répartit alors les datagrammes
//! entre les sockets : chaque listener garde donc son propre socket joint
//! au groupe multicast.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::BoxFuture;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::errors::SsdpError;
use crate::headers::SsdpHeaders;
use crate::packet::{decode_packet, is_valid_packet};

/// TTL / hop limit des datagrammes SSDP, fixé par la spécification UPnP.
const SSDP_MULTICAST_TTL: u32 = 2;

/// Taille de réception ; les descriptions SSDP tiennent largement dedans.
const RECV_BUFFER_SIZE: usize = 8192;

/// Callback invoqué une fois le transport prêt.
pub type ConnectCallback =
    Box<dyn FnOnce(Arc<SsdpTransport>) -> BoxFuture<'static, ()> + Send>;

/// Callback invoqué pour chaque datagramme SSDP valide.
pub type DataCallback =
    Arc<dyn Fn(String, SsdpHeaders) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callback invoqué pour chaque jeu d'en-têtes retenu par un listener.
pub type HeadersCallback = Arc<dyn Fn(SsdpHeaders) -> BoxFuture<'static, ()> + Send + Sync>;

/// Socket UDP lié pour une paire (source, cible) SSDP.
///
/// La boucle de réception valide chaque datagramme avec
/// [`is_valid_packet`] avant décodage ; le trafic étranger partageant le
/// port est éliminé silencieusement. Les erreurs socket sont journalisées
/// sans interrompre l'écoute.
pub struct SsdpTransport {
    socket: Arc<UdpSocket>,
    shutdown: CancellationToken,
}

impl SsdpTransport {
    /// Crée le socket, démarre la boucle de réception et signale la
    /// disponibilité via `on_connect`.
    ///
    /// Les erreurs de création/bind remontent au caller : un échec au
    /// démarrage est un problème de configuration, pas un aléa réseau.
    pub async fn start(
        source: &SocketAddr,
        target: &SocketAddr,
        on_connect: Option<ConnectCallback>,
        on_data: DataCallback,
    ) -> Result<Arc<Self>, SsdpError> {
        let std_socket = new_ssdp_socket(source, target)?;
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);
        let local_addr = socket.local_addr()?;

        let transport = Arc::new(Self {
            socket: socket.clone(),
            shutdown: CancellationToken::new(),
        });

        info!("✅ SSDP transport ready on {} (target {})", local_addr, target);

        let shutdown = transport.shutdown.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((len, remote_addr)) => {
                            let data = &buf[..len];
                            trace!(
                                "📥 Received packet from {}:\n{}",
                                remote_addr,
                                String::from_utf8_lossy(data)
                            );
                            if !is_valid_packet(data) {
                                trace!("Dropping non-SSDP packet from {}", remote_addr);
                                continue;
                            }
                            match decode_packet(data, &local_addr, &remote_addr) {
                                Ok((request_line, headers)) => {
                                    on_data(request_line, headers).await;
                                }
                                Err(err) => {
                                    debug!("Dropping undecodable packet from {}: {}", remote_addr, err);
                                }
                            }
                        }
                        Err(err) => {
                            warn!("❌ SSDP socket read error: {}", err);
                        }
                    }
                }
            }
            debug!("SSDP receive loop on {} terminated", local_addr);
        });

        if let Some(on_connect) = on_connect {
            let connected = transport.clone();
            tokio::spawn(async move {
                on_connect(connected).await;
            });
        }

        Ok(transport)
    }

    /// Envoie un datagramme vers `target`.
    pub async fn send_to(&self, data: &[u8], target: &SocketAddr) -> Result<(), SsdpError> {
        self.socket.send_to(data, target).await?;
        Ok(())
    }

    /// Adresse locale du socket.
    pub fn local_addr(&self) -> Result<SocketAddr, SsdpError> {
        Ok(self.socket.local_addr()?)
    }

    /// Arrête la boucle de réception. Un callback déjà engagé se termine,
    /// aucun nouveau datagramme n'est traité ensuite. Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for SsdpTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Adresse de bind du socket SSDP.
///
/// Divergence de plateforme héritée des piles systèmes : Windows exige un
/// bind sur l'adresse source, les systèmes POSIX un bind sur l'adresse
/// multicast cible pour recevoir le groupe.
#[cfg(windows)]
fn bind_address(source: &SocketAddr, _target: &SocketAddr) -> SocketAddr {
    *source
}

#[cfg(not(windows))]
fn bind_address(source: &SocketAddr, target: &SocketAddr) -> SocketAddr {
    if target.ip().is_multicast() {
        *target
    } else {
        *source
    }
}

/// Construit le socket UDP non bloquant pour la paire (source, cible).
fn new_ssdp_socket(
    source: &SocketAddr,
    target: &SocketAddr,
) -> Result<std::net::UdpSocket, SsdpError> {
    let domain = if source.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    if source.is_ipv4() {
        socket.set_broadcast(true)?;
    }

    if target.ip().is_multicast() {
        configure_multicast(&socket, source, target)?;
    }

    let bind_addr = bind_address(source, target);
    socket.bind(&bind_addr.into())?;

    Ok(socket.into())
}

/// Options multicast : jonction au groupe, interface d'émission, TTL 2 et
/// loopback actif (les devices locaux doivent se voir).
fn configure_multicast(
    socket: &Socket,
    source: &SocketAddr,
    target: &SocketAddr,
) -> Result<(), SsdpError> {
    match (source, target) {
        (SocketAddr::V4(source), SocketAddr::V4(target)) => {
            let mut joined = 0;
            for iface in get_if_addrs::get_if_addrs()? {
                if let std::net::IpAddr::V4(ip) = iface.ip() {
                    if ip.is_loopback() {
                        continue;
                    }
                    match socket.join_multicast_v4(target.ip(), &ip) {
                        Ok(()) => {
                            debug!("SSDP: joined {} on {}", target.ip(), ip);
                            joined += 1;
                        }
                        Err(err) => {
                            warn!("SSDP: failed to join {} on {}: {}", target.ip(), ip, err);
                        }
                    }
                }
            }
            if joined == 0 {
                // Aucune interface candidate, le noyau choisit
                socket.join_multicast_v4(target.ip(), &std::net::Ipv4Addr::UNSPECIFIED)?;
            }
            if !source.ip().is_unspecified() {
                socket.set_multicast_if_v4(source.ip())?;
            }
            socket.set_multicast_ttl_v4(SSDP_MULTICAST_TTL)?;
            socket.set_multicast_loop_v4(true)?;
        }
        (SocketAddr::V6(source), SocketAddr::V6(target)) => {
            let scope_id = if target.scope_id() != 0 {
                target.scope_id()
            } else {
                source.scope_id()
            };
            socket.join_multicast_v6(target.ip(), scope_id)?;
            if scope_id != 0 {
                socket.set_multicast_if_v6(scope_id)?;
            } else {
                // Sans zone, laisser le système choisir l'interface
                debug!("SSDP: no scope id available, skipping multicast interface selection");
            }
            socket.set_multicast_hops_v6(SSDP_MULTICAST_TTL)?;
            socket.set_multicast_loop_v6(true)?;
        }
        _ => {
            return Err(SsdpError::Socket(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "source and target address families differ",
            )));
        }
    }
    Ok(())
}
