//! # pmossdp : découverte UPnP côté control point
//!
//! Pile SSDP complète pour un control point : émission de M-SEARCH,
//! écoute des annonces NOTIFY multicast, et suivi des devices avec
//! expiration par CACHE-CONTROL.
//!
//! ## Architecture
//!
//! - [`packet`] : codec des datagrammes SSDP
//! - [`protocol`] : socket multicast et boucle de réception
//! - [`search`] / [`advertisement`] : les deux canaux de découverte
//! - [`tracker`] : fusion des deux canaux et cycle de vie des devices
//! - [`listener`] : orchestrateur exposé à l'application
//! - [`requester`] / [`description_cache`] : interfaces consommées vers la
//!   couche description/SOAP
//!
//! ## Constantes SSDP
//!
//! - **Multicast IPv4** : 239.255.255.250:1900
//! - **Multicast IPv6 lien-local** : [FF02::C]:1900
//! - **Max-Age par défaut** : 900 secondes

pub mod advertisement;
pub mod description_cache;
pub mod errors;
pub mod headers;
pub mod listener;
pub mod packet;
pub mod protocol;
pub mod requester;
pub mod search;
pub mod tracker;

pub use advertisement::{AdvertisementCallbacks, SsdpAdvertisementListener};
pub use description_cache::DescriptionCache;
pub use errors::SsdpError;
pub use headers::{
    CaseInsensitiveMap, NotificationSubType, SsdpHeaders, SsdpMeta, SsdpSource,
};
pub use listener::{DeviceCallback, SsdpConfig, SsdpListener};
pub use packet::{
    SSDP_IP_V4, SSDP_IP_V6, SSDP_MX, SSDP_PORT, SSDP_ST_ALL, SSDP_ST_ROOTDEVICE,
};
pub use protocol::{HeadersCallback, SsdpTransport};
pub use requester::{HttpResponse, ReqwestRequester, UpnpRequester};
pub use search::{search, search_all, SearchOptions, SsdpSearchListener};
pub use tracker::{
    DeviceEvent, DeviceOrServiceType, SsdpDevice, SsdpDeviceTracker, UniqueDeviceName,
    DEFAULT_MAX_AGE,
};
