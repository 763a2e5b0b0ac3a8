//! Cache des descriptions de devices, indexé par LOCATION.
//!
//! Le XML est conservé brut : la modélisation des descriptions appartient
//! aux couches supérieures. Les échecs sont eux aussi mis en cache pour ne
//! pas marteler un device injoignable.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};

use crate::requester::UpnpRequester;

type Entry = Arc<OnceCell<Option<Arc<String>>>>;

/// Cache de descriptions au-dessus d'un [`UpnpRequester`].
///
/// Les téléchargements concurrents d'une même location sont regroupés :
/// un seul fetch part, les autres appelants attendent son résultat.
pub struct DescriptionCache {
    requester: Arc<dyn UpnpRequester>,
    cache: Mutex<HashMap<String, Entry>>,
}

impl DescriptionCache {
    pub fn new(requester: Arc<dyn UpnpRequester>) -> Self {
        Self {
            requester,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Retourne la description XML de `location`, depuis le cache ou en la
    /// téléchargeant. `None` si le device ne répond pas correctement ; cet
    /// échec est mémorisé jusqu'à [`Self::uncache`].
    pub async fn get_description_xml(&self, location: &str) -> Option<Arc<String>> {
        let entry = {
            let mut cache = self.cache.lock().await;
            cache.entry(location.to_string()).or_default().clone()
        };
        entry
            .get_or_init(|| self.fetch_description(location))
            .await
            .clone()
    }

    /// Oublie la description de `location` ; le prochain accès refera un
    /// téléchargement.
    pub async fn uncache(&self, location: &str) {
        let mut cache = self.cache.lock().await;
        cache.remove(location);
    }

    async fn fetch_description(&self, location: &str) -> Option<Arc<String>> {
        // Deux tentatives : certains devices (Samsung) renvoient un corps
        // vide au premier GET
        for _ in 0..2 {
            match self.requester.http_request("GET", location, None, None).await {
                Ok(response) if response.status == 200 => {
                    if response.body.is_empty() {
                        debug!("Empty description from {}, retrying", location);
                        continue;
                    }
                    return Some(Arc::new(response.body));
                }
                Ok(response) => {
                    warn!(
                        "❌ Fetching description from {} failed with status {}",
                        location, response.status
                    );
                    return None;
                }
                Err(err) => {
                    debug!("Error fetching description from {}: {}", location, err);
                    return None;
                }
            }
        }
        None
    }
}
