//! Codec des datagrammes SSDP : requêtes M-SEARCH, annonces NOTIFY et
//! réponses de recherche `HTTP/1.1 200 OK`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};

use chrono::Utc;
use tracing::trace;

use pmonet::{get_adjusted_url, get_host_port_string, get_host_string};

use crate::errors::SsdpError;
use crate::headers::{CaseInsensitiveMap, SsdpHeaders, SsdpMeta, SsdpSource};

/// Adresse multicast SSDP IPv4
pub const SSDP_IP_V4: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);

/// Adresse multicast SSDP IPv6 lien-local
pub const SSDP_IP_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xc);

/// Port SSDP
pub const SSDP_PORT: u16 = 1900;

/// Fenêtre de réponse M-SEARCH par défaut (secondes)
pub const SSDP_MX: u32 = 4;

/// Cible de recherche « tout device »
pub const SSDP_ST_ALL: &str = "ssdp:all";

/// Cible de recherche « root devices »
pub const SSDP_ST_ROOTDEVICE: &str = "upnp:rootdevice";

const REQUEST_LINE_NOTIFY: &[u8] = b"NOTIFY * HTTP/1.1";
const REQUEST_LINE_MSEARCH: &[u8] = b"M-SEARCH * HTTP/1.1";
const STATUS_LINE_OK: &[u8] = b"HTTP/1.1 200 OK";

/// Cible SSDP par défaut pour une source donnée : multicast IPv4, ou
/// `FF02::C` avec la zone de la source pour une source IPv6.
pub fn default_target(source: Option<&SocketAddr>) -> SocketAddr {
    match source {
        Some(SocketAddr::V6(v6)) => {
            SocketAddr::V6(SocketAddrV6::new(SSDP_IP_V6, SSDP_PORT, 0, v6.scope_id()))
        }
        _ => SocketAddr::new(IpAddr::V4(SSDP_IP_V4), SSDP_PORT),
    }
}

/// Sérialise une ligne de statut et des en-têtes en un datagramme SSDP.
///
/// Aucun corps n'est encodé : un message SSDP se termine par une ligne
/// vide.
pub fn encode_packet(status_line: &str, headers: &CaseInsensitiveMap) -> Vec<u8> {
    let mut packet = String::with_capacity(128);
    packet.push_str(status_line);
    packet.push_str("\r\n");
    for (key, value) in headers.iter() {
        packet.push_str(key);
        packet.push(':');
        packet.push_str(value);
        packet.push_str("\r\n");
    }
    packet.push_str("\r\n");
    packet.into_bytes()
}

/// Construit une requête M-SEARCH vers `target`.
pub fn build_search_packet(target: &SocketAddr, mx: u32, search_target: &str) -> Vec<u8> {
    let headers = CaseInsensitiveMap::from([
        ("HOST", get_host_port_string(target).as_str()),
        ("MAN", "\"ssdp:discover\""),
        ("MX", mx.to_string().as_str()),
        ("ST", search_target),
    ]);
    encode_packet("M-SEARCH * HTTP/1.1", &headers)
}

/// Vrai si `data` ressemble à un message SSDP décodable.
///
/// Le port 1900 charrie du trafic multicast étranger (mDNS mal routé,
/// scanners) ; tout ce qui ne commence pas par une ligne SSDP connue est
/// éliminé ici sans bruit.
pub fn is_valid_packet(data: &[u8]) -> bool {
    !data.is_empty()
        && data.contains(&b'\n')
        && (data.starts_with(REQUEST_LINE_NOTIFY)
            || data.starts_with(REQUEST_LINE_MSEARCH)
            || data.starts_with(STATUS_LINE_OK))
}

/// Extrait l'UDN d'un en-tête USN.
///
/// Seuls les USN commençant par `uuid:` sont acceptés : le port 1900
/// partagé voit passer des USN fantaisistes qui ne doivent pas devenir
/// des identités de device.
pub fn udn_from_usn(usn: &str) -> Option<String> {
    if !usn.starts_with("uuid:") {
        return None;
    }
    let udn = usn.split("::").next().unwrap_or(usn);
    Some(udn.to_string())
}

/// Décode un datagramme SSDP en ligne de requête + en-têtes enrichis.
///
/// La première ligne est conservée telle quelle ; les suivantes sont
/// analysées comme des paires `clé: valeur` (casse préservée, stockage
/// insensible à la casse). L'en-tête LOCATION est ajusté pour la zone
/// IPv6 lien-local de l'expéditeur, l'original étant conservé dans les
/// métadonnées. Une ligne d'en-tête non terminée est tolérée.
pub fn decode_packet(
    data: &[u8],
    local_addr: &SocketAddr,
    remote_addr: &SocketAddr,
) -> Result<(String, SsdpHeaders), SsdpError> {
    let text = std::str::from_utf8(data).map_err(|err| SsdpError::Decode(err.to_string()))?;

    let mut lines = text.split('\n');
    let request_line = lines
        .next()
        .ok_or(SsdpError::InvalidPacket)?
        .trim_end_matches('\r')
        .trim()
        .to_string();

    let mut fields = CaseInsensitiveMap::new();
    for line in lines {
        let line = line.trim_end_matches('\r').trim();
        if line.is_empty() {
            break;
        }
        let Some((key, value)) = line.split_once(':') else {
            trace!("Skipping header line without colon: '{}'", line);
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            trace!("Skipping malformed header line: '{}'", line);
            continue;
        }
        fields.insert(key, value.trim());
    }

    let source = if data.starts_with(REQUEST_LINE_NOTIFY) || data.starts_with(REQUEST_LINE_MSEARCH)
    {
        SsdpSource::Advertisement
    } else {
        SsdpSource::Search
    };

    let mut meta = SsdpMeta {
        timestamp: Utc::now(),
        local_addr: *local_addr,
        remote_addr: *remote_addr,
        host: get_host_string(remote_addr),
        port: remote_addr.port(),
        udn: None,
        source,
        location_original: None,
    };

    if let Some(location) = fields.get("location").map(str::to_string) {
        let adjusted = get_adjusted_url(&location, remote_addr);
        if adjusted != location {
            fields.insert("location", adjusted);
        }
        meta.location_original = Some(location);
    }

    if let Some(usn) = fields.get("usn") {
        meta.udn = udn_from_usn(usn);
    }

    Ok((request_line, SsdpHeaders::new(fields, meta)))
}
