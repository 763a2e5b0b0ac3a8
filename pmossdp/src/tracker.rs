//! Suivi des devices SSDP vus au travers des recherches et des annonces.
//!
//! Le tracker fusionne les deux canaux par device et par type de device ou
//! de service, décide si un événement mérite d'être propagé à
//! l'application, et fait expirer les devices selon leur CACHE-CONTROL.

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::headers::{CaseInsensitiveMap, NotificationSubType, SsdpHeaders, SsdpSource};

/// Durée de validité par défaut quand CACHE-CONTROL est absent ou
/// illisible (secondes).
pub const DEFAULT_MAX_AGE: i64 = 900;

/// En-têtes ignorés par la détection de changement : ils varient à chaque
/// message ou sont traités séparément (LOCATION a sa propre détection).
const IGNORED_HEADERS: [&str; 4] = ["date", "cache-control", "server", "location"];

/// Identité stable d'un device (`uuid:...`).
pub type UniqueDeviceName = String;

/// Type de device ou de service (valeur d'un ST ou d'un NT).
pub type DeviceOrServiceType = String;

/// Famille IP d'une URL de location, pour la comparaison inter-familles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IpVersion {
    V4,
    V6,
}

/// Un root device UPnP tel que vu sur le réseau.
///
/// Les instantanés d'en-têtes sont conservés séparément par canal : une
/// réponse de recherche et une annonce peuvent porter des champs
/// différents pour le même type.
#[derive(Debug, Clone)]
pub struct SsdpDevice {
    udn: UniqueDeviceName,
    valid_to: DateTime<Utc>,
    /// URL de description -> expiration propre de cette location
    locations: HashMap<String, DateTime<Utc>>,
    last_seen: Option<DateTime<Utc>>,
    search_headers: HashMap<DeviceOrServiceType, CaseInsensitiveMap>,
    advertisement_headers: HashMap<DeviceOrServiceType, CaseInsensitiveMap>,
}

impl SsdpDevice {
    fn new(udn: UniqueDeviceName, valid_to: DateTime<Utc>) -> Self {
        Self {
            udn,
            valid_to,
            locations: HashMap::new(),
            last_seen: None,
            search_headers: HashMap::new(),
            advertisement_headers: HashMap::new(),
        }
    }

    pub fn udn(&self) -> &str {
        &self.udn
    }

    pub fn valid_to(&self) -> DateTime<Utc> {
        self.valid_to
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen
    }

    /// URLs de description connues et non expirées.
    pub fn locations(&self) -> Vec<&str> {
        let now = Utc::now();
        self.locations
            .iter()
            .filter(|(_, valid_to)| **valid_to > now)
            .map(|(location, _)| location.as_str())
            .collect()
    }

    /// Une URL de description utilisable, la plus récemment confirmée.
    pub fn location(&self) -> Option<&str> {
        let now = Utc::now();
        self.locations
            .iter()
            .filter(|(_, valid_to)| **valid_to > now)
            .max_by_key(|(_, valid_to)| **valid_to)
            .map(|(location, _)| location.as_str())
    }

    /// En-têtes fusionnés des deux canaux pour un type donné, les valeurs
    /// d'annonce prenant le pas sur celles de recherche.
    pub fn combined_headers(&self, device_or_service_type: &str) -> CaseInsensitiveMap {
        match (
            self.search_headers.get(device_or_service_type),
            self.advertisement_headers.get(device_or_service_type),
        ) {
            (Some(search), Some(advertisement)) => {
                CaseInsensitiveMap::merged(search, advertisement)
            }
            (Some(search), None) => search.clone(),
            (None, Some(advertisement)) => advertisement.clone(),
            (None, None) => CaseInsensitiveMap::new(),
        }
    }

    /// En-têtes fusionnés pour tous les types connus de ce device.
    pub fn all_combined_headers(&self) -> HashMap<DeviceOrServiceType, CaseInsensitiveMap> {
        self.search_headers
            .keys()
            .chain(self.advertisement_headers.keys())
            .map(|dst| (dst.clone(), self.combined_headers(dst)))
            .collect()
    }

    fn add_location(&mut self, location: String, valid_to: DateTime<Utc>) {
        self.locations.insert(location, valid_to);
    }

    fn purge_locations(&mut self, now: DateTime<Utc>) {
        self.locations.retain(|_, valid_to| *valid_to > now);
    }

    /// Vrai si `new_location` constitue un changement par rapport aux
    /// locations connues.
    ///
    /// Seules les locations de même famille IP sont comparées : un device
    /// joignable à la fois en IPv4 et en IPv6 ne « change » pas parce que
    /// la famille diffère d'un message à l'autre.
    fn location_changed(&self, new_location: &str) -> bool {
        if self.locations.is_empty() {
            return true;
        }
        if self.locations.contains_key(new_location) {
            return false;
        }
        let new_version = location_ip_version(new_location);
        self.locations
            .keys()
            .any(|known| location_ip_version(known) == new_version)
    }
}

/// Événement prêt à être propagé à l'application.
#[derive(Debug, Clone)]
pub struct DeviceEvent {
    /// Instantané du device au moment de l'événement
    pub device: SsdpDevice,
    /// ST ou NT auquel l'événement se rapporte
    pub device_or_service_type: DeviceOrServiceType,
    pub source: SsdpSource,
}

/// État du tracker, manipulé sous le verrou de [`SsdpDeviceTracker`].
#[derive(Debug, Default)]
pub struct TrackerState {
    devices: HashMap<UniqueDeviceName, SsdpDevice>,
    /// Expiration la plus proche parmi les devices suivis ; évite de
    /// balayer la table à chaque sighting.
    next_valid_to: Option<DateTime<Utc>>,
}

impl TrackerState {
    /// Devices actuellement suivis.
    pub fn devices(&self) -> &HashMap<UniqueDeviceName, SsdpDevice> {
        &self.devices
    }

    /// Voit un device au travers d'une réponse de recherche.
    ///
    /// Retourne `None` si les en-têtes sont inutilisables. Sinon
    /// l'événement est toujours propagé : `source` vaut `SearchChanged`
    /// au premier sighting ou sur changement observé, `SearchAlive`
    /// sinon. Le caller décide si les événements sans changement
    /// l'intéressent.
    pub fn see_search(&mut self, headers: &SsdpHeaders) -> Option<DeviceEvent> {
        if !valid_search_headers(headers) {
            debug!("Received invalid search headers from {}", headers.meta.remote_addr);
            return None;
        }

        let udn = headers.meta.udn.clone()?;
        let search_target = headers.fields.get("st")?.to_string();
        let is_new_device = !self.devices.contains_key(&udn);

        let location_changed = self.see_device(headers)?;
        let device = self.devices.get_mut(&udn)?;

        let is_new_service = !device.search_headers.contains_key(&search_target)
            && !device.advertisement_headers.contains_key(&search_target);
        if is_new_service {
            debug!("See new service: {}, type: {}", udn, search_target);
        }

        let changed = is_new_device
            || is_new_service
            || location_changed
            || headers_differ_from(&device.search_headers, &search_target, &headers.fields)
            || headers_differ_from(&device.advertisement_headers, &search_target, &headers.fields);
        let source = if changed {
            SsdpSource::SearchChanged
        } else {
            SsdpSource::SearchAlive
        };

        device
            .search_headers
            .entry(search_target.clone())
            .or_default()
            .update_from(&headers.fields);

        Some(DeviceEvent {
            device: device.clone(),
            device_or_service_type: search_target,
            source,
        })
    }

    /// Voit un device au travers d'une annonce `ssdp:alive` ou
    /// `ssdp:update`.
    ///
    /// Retourne `None` quand rien ne mérite propagation. Un
    /// `ssdp:update` est toujours propagé : il transporte de nouveaux
    /// BOOTID/CONFIGID que l'application doit voir même si le reste des
    /// en-têtes est identique.
    pub fn see_advertisement(&mut self, headers: &SsdpHeaders) -> Option<DeviceEvent> {
        if !valid_advertisement_headers(headers) {
            debug!(
                "Received invalid advertisement headers from {}",
                headers.meta.remote_addr
            );
            return None;
        }

        let udn = headers.meta.udn.clone()?;
        let notification_type = headers.fields.get("nt")?.to_string();
        let sub_type = NotificationSubType::parse(headers.fields.get("nts")?)?;
        let is_new_device = !self.devices.contains_key(&udn);

        let location_changed = self.see_device(headers)?;
        let device = self.devices.get_mut(&udn)?;

        let is_new_service = !device.search_headers.contains_key(&notification_type)
            && !device.advertisement_headers.contains_key(&notification_type);
        if is_new_service {
            debug!("See new service: {}, type: {}", udn, notification_type);
        }

        let propagate = sub_type == NotificationSubType::Update
            || is_new_device
            || is_new_service
            || location_changed
            || headers_differ_from(&device.advertisement_headers, &notification_type, &headers.fields)
            || headers_differ_from(&device.search_headers, &notification_type, &headers.fields);

        device
            .advertisement_headers
            .entry(notification_type.clone())
            .or_default()
            .update_from(&headers.fields);

        if !propagate {
            return None;
        }

        let source = match sub_type {
            NotificationSubType::Alive => SsdpSource::AdvertisementAlive,
            NotificationSubType::Update => SsdpSource::AdvertisementUpdate,
            NotificationSubType::Byebye => SsdpSource::AdvertisementByebye,
        };

        Some(DeviceEvent {
            device: device.clone(),
            device_or_service_type: notification_type,
            source,
        })
    }

    /// Retire un device suite à une annonce `ssdp:byebye`.
    ///
    /// Un byebye ne porte pas de LOCATION ; seuls UDN, NT et NTS sont
    /// exigés. Un byebye pour un device connu est toujours propagé ; un
    /// second byebye pour le même UDN ne l'est pas, le device ayant déjà
    /// disparu.
    pub fn unsee_advertisement(&mut self, headers: &SsdpHeaders) -> Option<DeviceEvent> {
        let udn = headers.meta.udn.clone()?;
        let notification_type = headers.fields.get("nt")?.to_string();
        headers.fields.get("nts")?;

        let mut device = self.devices.remove(&udn)?;

        // L'instantané reflète le byebye pour le diagnostic en aval
        device
            .advertisement_headers
            .entry(notification_type.clone())
            .or_default()
            .update_from(&headers.fields);

        Some(DeviceEvent {
            device,
            device_or_service_type: notification_type,
            source: SsdpSource::AdvertisementByebye,
        })
    }

    /// Retrouve un device à partir des en-têtes d'un message.
    pub fn get_device(&self, headers: &SsdpHeaders) -> Option<&SsdpDevice> {
        let udn = headers.meta.udn.as_deref()?;
        self.devices.get(udn)
    }

    /// Mise à jour commune aux deux canaux : purge, création ou
    /// rafraîchissement du device, gestion des locations.
    ///
    /// Retourne l'indicateur de changement de location, calculé avant
    /// l'enregistrement de la nouvelle URL.
    fn see_device(&mut self, headers: &SsdpHeaders) -> Option<bool> {
        self.purge_devices(None);

        let udn = headers.meta.udn.as_deref()?.to_string();
        let location = headers.fields.get("location")?.to_string();
        let valid_to = extract_valid_to(headers);

        let device = self.devices.entry(udn.clone()).or_insert_with(|| {
            debug!("See new device: {}", udn);
            SsdpDevice::new(udn.clone(), valid_to)
        });
        device.valid_to = valid_to;

        let location_changed = device.location_changed(&location);
        device.add_location(location, valid_to);
        device.purge_locations(headers.meta.timestamp);
        device.last_seen = Some(headers.meta.timestamp);

        if self.next_valid_to.is_none_or(|next| next > device.valid_to) {
            self.next_valid_to = Some(device.valid_to);
        }

        Some(location_changed)
    }

    /// Fait expirer les devices dont le CACHE-CONTROL est dépassé.
    ///
    /// Tant que `next_valid_to` est dans le futur, rien n'expire et le
    /// balayage est court-circuité. Un device sans plus aucune location
    /// valide est retiré même si son `valid_to` global tient encore.
    pub fn purge_devices(&mut self, override_now: Option<DateTime<Utc>>) {
        let now = override_now.unwrap_or_else(Utc::now);
        if let Some(next) = self.next_valid_to {
            if next > now {
                return;
            }
        }
        self.next_valid_to = None;

        let mut to_remove = Vec::new();
        for (udn, device) in self.devices.iter_mut() {
            device.purge_locations(now);
            if now > device.valid_to || device.locations.is_empty() {
                to_remove.push(udn.clone());
            } else if self
                .next_valid_to
                .is_none_or(|next| device.valid_to < next)
            {
                self.next_valid_to = Some(device.valid_to);
            }
        }
        for udn in to_remove {
            debug!("Purging device, UDN: {}", udn);
            self.devices.remove(&udn);
        }
    }
}

/// Tracker partageable entre plusieurs listeners.
///
/// Les mutations venant de callbacks concurrents (listeners IPv4 et IPv6
/// sur le même tracker) sont linéarisées par un verrou async à
/// acquisition équitable ; le guard borne la section critique et relâche
/// le verrou même si un callback échoue.
#[derive(Debug, Default)]
pub struct SsdpDeviceTracker {
    state: Mutex<TrackerState>,
}

impl SsdpDeviceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prend le verrou du tracker. Les séquences voir-puis-propager
    /// doivent se dérouler sous un même guard.
    pub async fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().await
    }

    /// Instantané des devices suivis.
    pub async fn devices(&self) -> HashMap<UniqueDeviceName, SsdpDevice> {
        self.state.lock().await.devices.clone()
    }
}

/// Valide les en-têtes d'une réponse de recherche.
fn valid_search_headers(headers: &SsdpHeaders) -> bool {
    headers.meta.udn.is_some()
        && headers.fields.get("st").is_some_and(|st| !st.is_empty())
        && usable_location(headers.fields.get("location"))
}

/// Valide les en-têtes d'une annonce alive/update.
fn valid_advertisement_headers(headers: &SsdpHeaders) -> bool {
    headers.meta.udn.is_some()
        && headers.fields.get("nt").is_some_and(|nt| !nt.is_empty())
        && headers.fields.get("nts").is_some_and(|nts| !nts.is_empty())
        && usable_location(headers.fields.get("location"))
}

/// Une location est utilisable si elle est HTTP et ne pointe ni vers la
/// loopback ni vers une adresse IPv4 link-local : ces valeurs trahissent
/// un device mal configuré (ou nos propres paquets rebouclés).
fn usable_location(location: Option<&str>) -> bool {
    let Some(location) = location else {
        return false;
    };
    location.starts_with("http")
        && !location.contains("://127.0.0.1")
        && !location.contains("://[::1]")
        && !location.contains("://169.254.")
}

/// Expiration portée par un message, depuis CACHE-CONTROL `max-age`.
fn extract_valid_to(headers: &SsdpHeaders) -> DateTime<Utc> {
    let max_age = parse_max_age(headers.fields.get("cache-control"));
    headers.meta.timestamp + Duration::seconds(max_age)
}

/// Extrait `max-age=N` d'une valeur CACHE-CONTROL, avec tolérance sur les
/// espaces autour du `=`. Retourne [`DEFAULT_MAX_AGE`] si illisible.
pub(crate) fn parse_max_age(value: Option<&str>) -> i64 {
    if let Some(value) = value {
        let lower = value.to_ascii_lowercase();
        if let Some(index) = lower.find("max-age") {
            let after_key = &value[index + "max-age".len()..];
            let after_eq = after_key.trim_start().trim_start_matches('=').trim_start();
            let digits: String = after_eq
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if let Ok(age) = digits.parse::<i64>() {
                return age;
            }
        }
        debug!("Could not parse max-age from CACHE-CONTROL: '{}'", value);
    }
    DEFAULT_MAX_AGE
}

/// Compare le nouvel instantané aux en-têtes déjà connus pour un type.
fn headers_differ_from(
    known: &HashMap<DeviceOrServiceType, CaseInsensitiveMap>,
    device_or_service_type: &str,
    new_headers: &CaseInsensitiveMap,
) -> bool {
    match known.get(device_or_service_type) {
        Some(current) => same_headers_differ(current, new_headers),
        None => false,
    }
}

/// Vrai si un en-tête présent des deux côtés a changé de valeur.
///
/// Les en-têtes de l'ensemble ignoré ne comptent pas, et un en-tête
/// présent dans `current` mais absent de `new` ne compte pas non plus :
/// un NOTIFY partiel ne doit pas déclencher de fausse notification de
/// changement. Conséquence assumée : un champ qui disparaît
/// définitivement des annonces ne sera jamais signalé.
pub fn same_headers_differ(current: &CaseInsensitiveMap, new: &CaseInsensitiveMap) -> bool {
    for (key, current_value) in current.iter() {
        if IGNORED_HEADERS.contains(&key.to_ascii_lowercase().as_str()) {
            continue;
        }
        let Some(new_value) = new.get(key) else {
            continue;
        };
        if new_value != current_value {
            debug!(
                "Header {} changed from {} to {}",
                key, current_value, new_value
            );
            return true;
        }
    }
    false
}

/// Famille IP de l'hôte d'une URL de location, zone IPv6 tolérée.
fn location_ip_version(location: &str) -> Option<IpVersion> {
    let host = location_host(location)?;
    let host = host.split('%').next().unwrap_or(host);
    match host.parse::<IpAddr>().ok()? {
        IpAddr::V4(_) => Some(IpVersion::V4),
        IpAddr::V6(_) => Some(IpVersion::V6),
    }
}

/// Hôte d'une URL, extrait sans passer par le crate url : une location
/// ajustée peut contenir un zone id (`[fe80::1%4]`) qu'un parseur URL
/// strict refuse.
fn location_host(location: &str) -> Option<&str> {
    let rest = location.split("://").nth(1)?;
    let end = rest.find('/').unwrap_or(rest.len());
    let authority = &rest[..end];
    if let Some(bracketed) = authority.strip_prefix('[') {
        let close = bracketed.find(']')?;
        Some(&bracketed[..close])
    } else {
        authority.split(':').next()
    }
}
