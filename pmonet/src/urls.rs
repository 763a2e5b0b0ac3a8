//! Formatage des adresses et ajustement des URLs pour les zones IPv6
//! lien-local.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use thiserror::Error;
use url::Url;

/// Erreurs de manipulation d'URL.
#[derive(Error, Debug)]
pub enum UrlError {
    /// URL non analysable
    #[error("Invalid URL '{0}': {1}")]
    Invalid(String, url::ParseError),
}

/// Retourne l'hôte d'une adresse, zone id incluse pour l'IPv6 scopé.
///
/// `fe80::1` avec un zone id 3 devient `fe80::1%3` ; les adresses IPv4 et
/// les IPv6 sans zone sont restituées telles quelles.
pub fn get_host_string(addr: &SocketAddr) -> String {
    match addr {
        SocketAddr::V4(v4) => v4.ip().to_string(),
        SocketAddr::V6(v6) if v6.scope_id() != 0 => {
            format!("{}%{}", v6.ip(), v6.scope_id())
        }
        SocketAddr::V6(v6) => v6.ip().to_string(),
    }
}

/// Retourne une paire `hôte:port` correctement échappée.
///
/// Les hôtes IPv6 sont entourés de crochets comme dans une URL.
pub fn get_host_port_string(addr: &SocketAddr) -> String {
    let host = get_host_string(addr);
    if host.contains(':') {
        format!("[{}]:{}", host, addr.port())
    } else {
        format!("{}:{}", host, addr.port())
    }
}

/// Ajuste une URL pour refléter la zone lien-local de l'expéditeur.
///
/// Un device IPv6 lien-local annonce une URL du type `http://[fe80::1]/...`
/// qui n'est joignable qu'au travers de l'interface sur laquelle le paquet
/// est arrivé. Si `addr` porte un zone id non nul et que l'hôte de l'URL
/// est lien-local, l'hôte est réécrit en `fe80::1%zone`. Dans tous les
/// autres cas l'URL est retournée inchangée.
pub fn get_adjusted_url(url: &str, addr: &SocketAddr) -> String {
    let SocketAddr::V6(v6) = addr else {
        return url.to_string();
    };
    if v6.scope_id() == 0 {
        return url.to_string();
    }

    let Ok(parsed) = Url::parse(url) else {
        return url.to_string();
    };
    let Some(host) = parsed.host_str() else {
        return url.to_string();
    };

    let bare = host.trim_start_matches('[').trim_end_matches(']');
    let Ok(IpAddr::V6(ip)) = bare.parse::<IpAddr>() else {
        return url.to_string();
    };
    if !is_link_local_v6(&ip) {
        return url.to_string();
    }

    // Le crate url refuse un zone id dans l'hôte, l'URL est reconstruite
    // manuellement.
    let netloc = match parsed.port() {
        Some(port) => format!("[{}%{}]:{}", ip, v6.scope_id(), port),
        None => format!("[{}%{}]", ip, v6.scope_id()),
    };
    let mut adjusted = format!("{}://{}{}", parsed.scheme(), netloc, parsed.path());
    if let Some(query) = parsed.query() {
        adjusted.push('?');
        adjusted.push_str(query);
    }
    if let Some(fragment) = parsed.fragment() {
        adjusted.push('#');
        adjusted.push_str(fragment);
    }
    adjusted
}

/// fe80::/10
fn is_link_local_v6(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

/// Résout une URL relative par rapport à l'URL de description du device.
///
/// Si `url` est déjà absolue (commence par `http:`/`https:`), elle est
/// retournée telle quelle.
pub fn absolute_url(device_url: &str, url: &str) -> Result<String, UrlError> {
    if url.starts_with("http:") || url.starts_with("https:") {
        return Ok(url.to_string());
    }

    let base = Url::parse(device_url)
        .map_err(|err| UrlError::Invalid(device_url.to_string(), err))?;
    let joined = base
        .join(url)
        .map_err(|err| UrlError::Invalid(url.to_string(), err))?;
    Ok(joined.to_string())
}
