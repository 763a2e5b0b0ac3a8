//! Orchestrateur : compose un listener d'annonces et un listener de
//! recherche autour d'un tracker partagé, derrière un unique callback
//! applicatif.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::advertisement::{AdvertisementCallbacks, SsdpAdvertisementListener};
use crate::errors::SsdpError;
use crate::headers::SsdpSource;
use crate::packet::SSDP_MX;
use crate::protocol::HeadersCallback;
use crate::search::{SearchOptions, SsdpSearchListener};
use crate::tracker::{
    DeviceOrServiceType, SsdpDevice, SsdpDeviceTracker, UniqueDeviceName,
};

/// Callback applicatif : un device, le type concerné et le canal.
pub type DeviceCallback =
    Arc<dyn Fn(SsdpDevice, DeviceOrServiceType, SsdpSource) -> BoxFuture<'static, ()> + Send + Sync>;

/// Configuration d'un [`SsdpListener`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SsdpConfig {
    /// Adresse source ; devinée si absente
    pub source: Option<SocketAddr>,
    /// Cible d'écoute/recherche ; multicast SSDP par défaut
    pub target: Option<SocketAddr>,
    /// Fenêtre MX des recherches (secondes)
    pub search_timeout: u32,
}

impl Default for SsdpConfig {
    fn default() -> Self {
        Self {
            source: None,
            target: None,
            search_timeout: SSDP_MX,
        }
    }
}

/// Listener SSDP complet : annonces + recherches + suivi des devices.
///
/// Le tracker peut être injecté pour partager l'état entre plusieurs
/// listeners, typiquement un listener IPv4 et un listener IPv6 alimentant
/// la même table de devices.
pub struct SsdpListener {
    callback: DeviceCallback,
    config: SsdpConfig,
    tracker: Arc<SsdpDeviceTracker>,
    advertisement_listener: Option<SsdpAdvertisementListener>,
    search_listener: Option<SsdpSearchListener>,
}

impl SsdpListener {
    /// Crée un listener avec son propre tracker.
    pub fn new(callback: DeviceCallback, config: SsdpConfig) -> Self {
        Self::with_tracker(callback, config, Arc::new(SsdpDeviceTracker::new()))
    }

    /// Crée un listener alimentant un tracker partagé.
    pub fn with_tracker(
        callback: DeviceCallback,
        config: SsdpConfig,
        tracker: Arc<SsdpDeviceTracker>,
    ) -> Self {
        Self {
            callback,
            config,
            tracker,
            advertisement_listener: None,
            search_listener: None,
        }
    }

    /// Démarre les deux listeners sous-jacents.
    pub async fn start(&mut self) -> Result<(), SsdpError> {
        let mut advertisement_listener = SsdpAdvertisementListener::new(
            AdvertisementCallbacks {
                on_alive: Some(self.on_alive_callback()),
                on_byebye: Some(self.on_byebye_callback()),
                on_update: Some(self.on_update_callback()),
            },
            self.config.source,
            self.config.target,
        );
        advertisement_listener.start().await?;
        self.advertisement_listener = Some(advertisement_listener);

        let mut search_listener = SsdpSearchListener::new(
            self.on_search_callback(),
            SearchOptions {
                source: self.config.source,
                target: self.config.target,
                mx: Some(self.config.search_timeout),
                search_target: None,
            },
        );
        search_listener.start().await?;
        self.search_listener = Some(search_listener);

        info!("✅ SSDP listener started");
        Ok(())
    }

    /// Arrête les listeners sous-jacents. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(mut listener) = self.advertisement_listener.take() {
            listener.stop();
        }
        if let Some(mut listener) = self.search_listener.take() {
            listener.stop();
        }
    }

    /// Émet une recherche, vers la cible configurée ou `override_target`.
    pub async fn search(&self, override_target: Option<SocketAddr>) -> Result<(), SsdpError> {
        let listener = self.search_listener.as_ref().ok_or(SsdpError::NotStarted)?;
        listener.search(override_target).await
    }

    /// Instantané des devices suivis.
    pub async fn devices(&self) -> HashMap<UniqueDeviceName, SsdpDevice> {
        self.tracker.devices().await
    }

    /// Tracker partagé par ce listener.
    pub fn tracker(&self) -> Arc<SsdpDeviceTracker> {
        self.tracker.clone()
    }

    fn on_search_callback(&self) -> HeadersCallback {
        let tracker = self.tracker.clone();
        let callback = self.callback.clone();
        Arc::new(move |headers| {
            let tracker = tracker.clone();
            let callback = callback.clone();
            Box::pin(async move {
                // Voir puis propager sous le même guard : les listeners
                // concurrents ne peuvent pas intercaler leurs mutations
                let mut state = tracker.lock().await;
                if let Some(event) = state.see_search(&headers) {
                    callback(event.device, event.device_or_service_type, event.source).await;
                }
            }) as BoxFuture<'static, ()>
        })
    }

    fn on_alive_callback(&self) -> HeadersCallback {
        let tracker = self.tracker.clone();
        let callback = self.callback.clone();
        Arc::new(move |headers| {
            let tracker = tracker.clone();
            let callback = callback.clone();
            Box::pin(async move {
                let mut state = tracker.lock().await;
                if let Some(event) = state.see_advertisement(&headers) {
                    callback(event.device, event.device_or_service_type, event.source).await;
                }
            }) as BoxFuture<'static, ()>
        })
    }

    fn on_byebye_callback(&self) -> HeadersCallback {
        let tracker = self.tracker.clone();
        let callback = self.callback.clone();
        Arc::new(move |headers| {
            let tracker = tracker.clone();
            let callback = callback.clone();
            Box::pin(async move {
                let mut state = tracker.lock().await;
                if let Some(event) = state.unsee_advertisement(&headers) {
                    callback(event.device, event.device_or_service_type, event.source).await;
                }
            }) as BoxFuture<'static, ()>
        })
    }

    fn on_update_callback(&self) -> HeadersCallback {
        let tracker = self.tracker.clone();
        let callback = self.callback.clone();
        Arc::new(move |headers| {
            let tracker = tracker.clone();
            let callback = callback.clone();
            Box::pin(async move {
                let mut state = tracker.lock().await;
                if let Some(event) = state.see_advertisement(&headers) {
                    callback(event.device, event.device_or_service_type, event.source).await;
                }
            }) as BoxFuture<'static, ()>
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = SsdpConfig::default();
        assert!(config.source.is_none());
        assert!(config.target.is_none());
        assert_eq!(config.search_timeout, SSDP_MX);
    }
}
