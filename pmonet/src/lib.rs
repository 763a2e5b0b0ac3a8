//! Utilitaires réseau partagés par la pile SSDP : détection de l'adresse
//! locale, formatage des adresses IPv6 avec zone et ajustement des URLs
//! lien-local.

pub mod ip_utils;
pub mod urls;

pub use ip_utils::{get_source_address, guess_local_ip};
pub use urls::{
    absolute_url, get_adjusted_url, get_host_port_string, get_host_string, UrlError,
};
