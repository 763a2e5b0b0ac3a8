//! Détection de l'adresse IP source à utiliser pour joindre une cible.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6, UdpSocket};

use tracing::debug;

/// Adresse externe utilisée pour deviner l'interface de sortie IPv4.
const EXTERNAL_IP_V4: IpAddr = IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1));

/// Port arbitraire pour la connexion factice.
const EXTERNAL_PORT: u16 = 80;

/// Devine l'adresse IP locale utilisée pour joindre `target`.
///
/// Crée un socket UDP lié à l'adresse non spécifiée de la bonne famille,
/// le « connecte » vers la cible (aucun trafic réel n'est émis : UDP est
/// sans connexion), puis relit l'adresse locale que le système a choisie
/// pour cette route.
///
/// # Returns
///
/// L'adresse IP locale, ou l'adresse de loopback de la famille demandée
/// si la détection échoue.
pub fn guess_local_ip(target: Option<IpAddr>) -> IpAddr {
    let probe = match target {
        Some(ip) => SocketAddr::new(ip, EXTERNAL_PORT),
        None => SocketAddr::new(EXTERNAL_IP_V4, EXTERNAL_PORT),
    };
    let bind: SocketAddr = if probe.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    match UdpSocket::bind(bind) {
        Ok(socket) => {
            if socket.connect(probe).is_ok() {
                if let Ok(local_addr) = socket.local_addr() {
                    return local_addr.ip();
                }
            }
            debug!("Could not guess local IP towards {}, using loopback", probe);
            fallback_ip(&probe)
        }
        Err(_) => fallback_ip(&probe),
    }
}

fn fallback_ip(probe: &SocketAddr) -> IpAddr {
    if probe.is_ipv4() {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        IpAddr::V6(Ipv6Addr::LOCALHOST)
    }
}

/// Calcule l'adresse source à utiliser pour émettre vers `target`.
///
/// Si `source` est fournie, elle est retournée telle quelle. Sinon
/// l'adresse locale est devinée via [`guess_local_ip`] ; pour une cible
/// IPv6, le zone id de la cible est reporté sur la source afin que le
/// socket sélectionne la bonne interface de sortie.
pub fn get_source_address(target: &SocketAddr, source: Option<SocketAddr>) -> SocketAddr {
    if let Some(source) = source {
        return source;
    }

    match target {
        SocketAddr::V4(v4) => {
            let ip = guess_local_ip(Some(IpAddr::V4(*v4.ip())));
            SocketAddr::new(ip, 0)
        }
        SocketAddr::V6(v6) => {
            let ip = match guess_local_ip(Some(IpAddr::V6(*v6.ip()))) {
                IpAddr::V6(ip) => ip,
                IpAddr::V4(_) => Ipv6Addr::UNSPECIFIED,
            };
            SocketAddr::V6(SocketAddrV6::new(ip, 0, 0, v6.scope_id()))
        }
    }
}
