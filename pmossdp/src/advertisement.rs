//! Écoute passive des annonces NOTIFY multicast (alive, byebye, update).

use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, trace};

use pmonet::get_source_address;

use crate::errors::SsdpError;
use crate::headers::{NotificationSubType, SsdpSource};
use crate::packet::default_target;
use crate::protocol::{DataCallback, HeadersCallback, SsdpTransport};

/// Callbacks d'un listener d'annonces ; chaque sous-type NTS a le sien.
#[derive(Default, Clone)]
pub struct AdvertisementCallbacks {
    pub on_alive: Option<HeadersCallback>,
    pub on_byebye: Option<HeadersCallback>,
    pub on_update: Option<HeadersCallback>,
}

/// Listener d'annonces SSDP, en réception seule : il n'émet jamais de
/// M-SEARCH. Mêmes états que le listener de recherche.
pub struct SsdpAdvertisementListener {
    callbacks: AdvertisementCallbacks,
    source: SocketAddr,
    target: SocketAddr,
    transport: Option<Arc<SsdpTransport>>,
}

impl SsdpAdvertisementListener {
    pub fn new(
        callbacks: AdvertisementCallbacks,
        source: Option<SocketAddr>,
        target: Option<SocketAddr>,
    ) -> Self {
        let target = target.unwrap_or_else(|| default_target(source.as_ref()));
        let source = get_source_address(&target, source);
        Self {
            callbacks,
            source,
            target,
            transport: None,
        }
    }

    pub async fn start(&mut self) -> Result<(), SsdpError> {
        let transport = SsdpTransport::start(
            &self.source,
            &self.target,
            None,
            self.on_data_callback(),
        )
        .await?;
        self.transport = Some(transport);
        Ok(())
    }

    /// Ferme le socket. Idempotent.
    pub fn stop(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close();
            debug!("SSDP advertisement listener on {} stopped", self.target);
        }
    }

    fn on_data_callback(&self) -> DataCallback {
        let callbacks = self.callbacks.clone();
        Arc::new(move |_request_line, mut headers| {
            let callbacks = callbacks.clone();
            Box::pin(async move {
                // M-SEARCH égaré dans le groupe multicast partagé
                if headers
                    .fields
                    .get("man")
                    .is_some_and(|man| man.contains("ssdp:discover"))
                {
                    trace!("Ignoring discover request from {}", headers.meta.remote_addr);
                    return;
                }

                let Some(nts) = headers.fields.get("nts").map(str::to_string) else {
                    debug!(
                        "Ignoring packet without NTS from {}",
                        headers.meta.remote_addr
                    );
                    return;
                };

                let Some(sub_type) = NotificationSubType::parse(&nts) else {
                    debug!(
                        "Unknown NTS value '{}' from {}",
                        nts, headers.meta.remote_addr
                    );
                    return;
                };

                headers.meta.source = SsdpSource::Advertisement;

                let callback = match sub_type {
                    NotificationSubType::Alive => &callbacks.on_alive,
                    NotificationSubType::Byebye => &callbacks.on_byebye,
                    NotificationSubType::Update => &callbacks.on_update,
                };
                if let Some(callback) = callback {
                    callback(headers).await;
                }
            }) as BoxFuture<'static, ()>
        })
    }
}

impl Drop for SsdpAdvertisementListener {
    fn drop(&mut self) {
        self.stop();
    }
}
