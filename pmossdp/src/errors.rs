//! Erreurs de la pile SSDP.

use thiserror::Error;

/// Erreurs relatives au décodage et au transport SSDP.
#[derive(Error, Debug)]
pub enum SsdpError {
    /// Paquet au format inattendu
    #[error("Invalid SSDP packet")]
    InvalidPacket,

    /// En-têtes non décodables
    #[error("Failed to decode SSDP packet: {0}")]
    Decode(String),

    /// Opération demandée avant start()
    #[error("Listener is not started")]
    NotStarted,

    /// Erreur de la couche socket
    #[error("Socket error: {0}")]
    Socket(#[from] std::io::Error),
}
