//! En-têtes SSDP : table insensible à la casse préservant l'ordre
//! d'insertion, et métadonnées de réception associées à chaque message.

use std::collections::HashMap;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};

use pmonet::get_host_string;

/// Canal par lequel un message SSDP a été vu.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SsdpSource {
    /// Annonce multicast (canal brut, avant classification)
    Advertisement,
    /// Annonce `ssdp:alive`
    AdvertisementAlive,
    /// Annonce `ssdp:byebye`
    AdvertisementByebye,
    /// Annonce `ssdp:update`
    AdvertisementUpdate,
    /// Réponse de recherche (canal brut, avant comparaison)
    Search,
    /// Réponse de recherche sans changement observé
    SearchAlive,
    /// Réponse de recherche avec changement observé
    SearchChanged,
}

/// Sous-type de notification porté par l'en-tête NTS d'un NOTIFY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationSubType {
    Alive,
    Byebye,
    Update,
}

impl NotificationSubType {
    /// Analyse la valeur d'un en-tête NTS.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ssdp:alive" => Some(Self::Alive),
            "ssdp:byebye" => Some(Self::Byebye),
            "ssdp:update" => Some(Self::Update),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alive => "ssdp:alive",
            Self::Byebye => "ssdp:byebye",
            Self::Update => "ssdp:update",
        }
    }
}

/// Dictionnaire insensible à la casse préservant l'ordre d'insertion.
///
/// Les valeurs sont indexées par la clé en minuscules ; la dernière casse
/// écrite devient la casse canonique restituée à l'itération. L'égalité
/// compare les clés sans tenir compte de la casse, y compris face à une
/// `HashMap` ordinaire.
#[derive(Debug, Clone, Default)]
pub struct CaseInsensitiveMap {
    /// clé minuscule -> (clé canonique, valeur)
    data: HashMap<String, (String, String)>,
    /// clés minuscules dans l'ordre d'insertion
    order: Vec<String>,
}

impl CaseInsensitiveMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insère ou remplace une valeur. La casse de `key` devient canonique.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let lower = key.to_ascii_lowercase();
        if self.data.insert(lower.clone(), (key, value.into())).is_none() {
            self.order.push(lower);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data
            .get(&key.to_ascii_lowercase())
            .map(|(_, value)| value.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(&key.to_ascii_lowercase())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let lower = key.to_ascii_lowercase();
        let removed = self.data.remove(&lower);
        if removed.is_some() {
            self.order.retain(|entry| entry != &lower);
        }
        removed.map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Itère sur les paires `(clé canonique, valeur)` dans l'ordre
    /// d'insertion.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.order.iter().filter_map(|lower| {
            self.data
                .get(lower)
                .map(|(key, value)| (key.as_str(), value.as_str()))
        })
    }

    /// Met à jour champ par champ depuis `other`, sans effacer les clés
    /// absentes de `other`.
    pub fn update_from(&mut self, other: &CaseInsensitiveMap) {
        for (key, value) in other.iter() {
            self.insert(key, value);
        }
    }

    /// Fusionne deux tables, les valeurs de `overlay` prenant le pas sur
    /// celles de `base`.
    pub fn merged(base: &CaseInsensitiveMap, overlay: &CaseInsensitiveMap) -> CaseInsensitiveMap {
        let mut result = base.clone();
        result.update_from(overlay);
        result
    }
}

impl PartialEq for CaseInsensitiveMap {
    fn eq(&self, other: &Self) -> bool {
        self.data.len() == other.data.len()
            && self
                .data
                .iter()
                .all(|(lower, (_, value))| other.get(lower) == Some(value.as_str()))
    }
}

impl Eq for CaseInsensitiveMap {}

impl PartialEq<HashMap<String, String>> for CaseInsensitiveMap {
    fn eq(&self, other: &HashMap<String, String>) -> bool {
        if self.data.len() != other.len() {
            return false;
        }
        other.iter().all(|(key, value)| {
            self.data
                .get(&key.to_ascii_lowercase())
                .map(|(_, stored)| stored == value)
                .unwrap_or(false)
        })
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for CaseInsensitiveMap {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut map = Self::new();
        for (key, value) in iter {
            map.insert(key, value);
        }
        map
    }
}

impl<const N: usize> From<[(&str, &str); N]> for CaseInsensitiveMap {
    fn from(entries: [(&str, &str); N]) -> Self {
        entries.into_iter().collect()
    }
}

/// Métadonnées de réception d'un message SSDP.
///
/// L'implémentation d'origine les rangeait dans la table d'en-têtes sous
/// des clés préfixées par `_` ; elles sont portées ici par des champs
/// typés.
#[derive(Debug, Clone)]
pub struct SsdpMeta {
    /// Heure de réception
    pub timestamp: DateTime<Utc>,
    /// Adresse locale du socket récepteur
    pub local_addr: SocketAddr,
    /// Adresse de l'expéditeur
    pub remote_addr: SocketAddr,
    /// Hôte de l'expéditeur, zone IPv6 incluse le cas échéant
    pub host: String,
    /// Port de l'expéditeur
    pub port: u16,
    /// UDN extrait de l'en-tête USN, si analysable
    pub udn: Option<String>,
    /// Canal de réception
    pub source: SsdpSource,
    /// Valeur d'origine de LOCATION avant ajustement de zone
    pub location_original: Option<String>,
}

impl SsdpMeta {
    /// Construit des métadonnées pour un message reçu maintenant.
    pub fn new(local_addr: SocketAddr, remote_addr: SocketAddr, source: SsdpSource) -> Self {
        Self {
            timestamp: Utc::now(),
            local_addr,
            remote_addr,
            host: get_host_string(&remote_addr),
            port: remote_addr.port(),
            udn: None,
            source,
            location_original: None,
        }
    }
}

/// En-têtes d'un message SSDP accompagnés de leurs métadonnées.
#[derive(Debug, Clone)]
pub struct SsdpHeaders {
    pub fields: CaseInsensitiveMap,
    pub meta: SsdpMeta,
}

impl SsdpHeaders {
    pub fn new(fields: CaseInsensitiveMap, meta: SsdpMeta) -> Self {
        Self { fields, meta }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key)
    }

    pub fn udn(&self) -> Option<&str> {
        self.meta.udn.as_deref()
    }

    pub fn location(&self) -> Option<&str> {
        self.fields.get("location")
    }
}
