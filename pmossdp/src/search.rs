//! Recherche active de devices : émission de M-SEARCH et collecte des
//! réponses unicast.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, info, trace};

use pmonet::get_source_address;

use crate::errors::SsdpError;
use crate::headers::{SsdpHeaders, SsdpSource};
use crate::packet::{build_search_packet, default_target, SSDP_MX, SSDP_ST_ALL};
use crate::protocol::{DataCallback, HeadersCallback, SsdpTransport};

/// Paramètres d'un listener de recherche.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Adresse source ; devinée depuis la cible si absente
    pub source: Option<SocketAddr>,
    /// Cible ; multicast SSDP de la famille de la source si absente
    pub target: Option<SocketAddr>,
    /// Fenêtre de réponse annoncée dans MX (secondes)
    pub mx: Option<u32>,
    /// ST émis dans les requêtes
    pub search_target: Option<String>,
}

/// Listener de recherche SSDP : lié une fois démarré, il peut émettre des
/// M-SEARCH et remet chaque réponse valide au callback.
///
/// États : créé → démarré (socket lié) → arrêté (socket fermé).
pub struct SsdpSearchListener {
    callback: HeadersCallback,
    source: SocketAddr,
    target: SocketAddr,
    mx: u32,
    search_target: String,
    transport: Option<Arc<SsdpTransport>>,
}

impl SsdpSearchListener {
    pub fn new(callback: HeadersCallback, options: SearchOptions) -> Self {
        let target = options
            .target
            .unwrap_or_else(|| default_target(options.source.as_ref()));
        let source = get_source_address(&target, options.source);
        Self {
            callback,
            source,
            target,
            mx: options.mx.unwrap_or(SSDP_MX),
            search_target: options
                .search_target
                .unwrap_or_else(|| SSDP_ST_ALL.to_string()),
            transport: None,
        }
    }

    /// Cible vers laquelle les recherches sont émises.
    pub fn target(&self) -> &SocketAddr {
        &self.target
    }

    /// Lie le socket ; le listener peut ensuite émettre et recevoir.
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

    /// Émet une requête M-SEARCH vers la cible configurée, ou vers
    /// `override_target` pour sonder directement un device connu en
    /// unicast.
    pub async fn search(&self, override_target: Option<SocketAddr>) -> Result<(), SsdpError> {
        let transport = self.transport.as_ref().ok_or(SsdpError::NotStarted)?;
        let effective_target = override_target.unwrap_or(self.target);

        // Le HOST annoncé reste la cible multicast canonique : beaucoup
        // de devices ignorent une requête unicast qui annonce autre chose.
        let host_target = if effective_target.ip().is_multicast() {
            effective_target
        } else {
            default_target(Some(&self.source))
        };

        let packet = build_search_packet(&host_target, self.mx, &self.search_target);
        transport.send_to(&packet, &effective_target).await?;
        info!(
            "📤 M-SEARCH sent to {} (ST={}, MX={})",
            effective_target, self.search_target, self.mx
        );
        Ok(())
    }

    /// Ferme le socket. Idempotent.
    pub fn stop(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close();
            debug!("SSDP search listener on {} stopped", self.target);
        }
    }

    fn on_data_callback(&self) -> DataCallback {
        let callback = self.callback.clone();
        let target = self.target;
        Arc::new(move |_request_line, mut headers| {
            let callback = callback.clone();
            Box::pin(async move {
                // Requête d'un autre control point, pas une réponse
                if headers
                    .fields
                    .get("man")
                    .is_some_and(|man| man.contains("ssdp:discover"))
                {
                    trace!("Ignoring discover request from {}", headers.meta.remote_addr);
                    return;
                }
                // Une annonce qui fuit dans le groupe partagé
                if headers.fields.contains_key("nts") {
                    trace!("Ignoring advertisement from {}", headers.meta.remote_addr);
                    return;
                }

                headers.meta.source = SsdpSource::Search;

                // En recherche unicast, seules les réponses de l'hôte
                // sondé comptent
                if !target.ip().is_multicast() && headers.meta.remote_addr.ip() != target.ip() {
                    debug!(
                        "Ignoring response from {} while probing {}",
                        headers.meta.remote_addr, target
                    );
                    return;
                }

                callback(headers).await;
            }) as BoxFuture<'static, ()>
        })
    }
}

impl Drop for SsdpSearchListener {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Recherche ponctuelle : démarre un listener, émet un M-SEARCH, collecte
/// les réponses pendant `timeout`, puis s'arrête.
///
/// La fenêtre de collecte est un simple délai : il n'existe pas de signal
/// de fin anticipée, les devices répondant n'importe quand dans la
/// fenêtre MX.
pub async fn search(
    callback: HeadersCallback,
    timeout: Duration,
    search_target: &str,
    source: Option<SocketAddr>,
    target: Option<SocketAddr>,
) -> Result<(), SsdpError> {
    let mx = timeout.as_secs().clamp(1, u64::from(u32::MAX)) as u32;
    let mut listener = SsdpSearchListener::new(
        callback,
        SearchOptions {
            source,
            target,
            mx: Some(mx),
            search_target: Some(search_target.to_string()),
        },
    );
    listener.start().await?;
    listener.search(None).await?;

    tokio::time::sleep(timeout).await;

    listener.stop();
    Ok(())
}

/// Variante de [`search`] couvrant tous les devices (`ssdp:all`).
pub async fn search_all(
    callback: HeadersCallback,
    timeout: Duration,
) -> Result<(), SsdpError> {
    search(callback, timeout, SSDP_ST_ALL, None, None).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_resolve_multicast_target() {
        let callback: HeadersCallback = Arc::new(|_| Box::pin(async {}));
        let listener = SsdpSearchListener::new(callback, SearchOptions::default());
        assert_eq!(
            *listener.target(),
            "239.255.255.250:1900".parse::<SocketAddr>().unwrap()
        );
        assert!(listener.source.is_ipv4());
    }

    #[test]
    fn test_unicast_target_is_kept() {
        let callback: HeadersCallback = Arc::new(|_| Box::pin(async {}));
        let target: SocketAddr = "192.168.1.1:1900".parse().unwrap();
        let listener = SsdpSearchListener::new(
            callback,
            SearchOptions {
                target: Some(target),
                ..SearchOptions::default()
            },
        );
        assert_eq!(*listener.target(), target);
    }
}
