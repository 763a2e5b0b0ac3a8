//! Abstraction du transport HTTP consommé au-dessus de la découverte :
//! récupération des descriptions et invocation d'actions passent par ce
//! trait injecté.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

/// Erreurs du transport HTTP.
#[derive(Error, Debug)]
pub enum RequesterError {
    /// La requête n'a pas abouti (connexion, timeout, méthode invalide)
    #[error("HTTP request to {url} failed: {message}")]
    RequestFailed { url: String, message: String },
}

/// Réponse HTTP brute.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Transport HTTP injectable : méthode, URL, en-têtes et corps en entrée ;
/// statut, en-têtes et corps en sortie.
#[async_trait]
pub trait UpnpRequester: Send + Sync {
    async fn http_request(
        &self,
        method: &str,
        url: &str,
        headers: Option<&HashMap<String, String>>,
        body: Option<&str>,
    ) -> Result<HttpResponse, RequesterError>;
}

/// Implémentation par défaut sur reqwest.
#[derive(Debug, Clone, Default)]
pub struct ReqwestRequester {
    client: reqwest::Client,
}

impl ReqwestRequester {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UpnpRequester for ReqwestRequester {
    async fn http_request(
        &self,
        method: &str,
        url: &str,
        headers: Option<&HashMap<String, String>>,
        body: Option<&str>,
    ) -> Result<HttpResponse, RequesterError> {
        let method = reqwest::Method::from_bytes(method.as_bytes()).map_err(|err| {
            RequesterError::RequestFailed {
                url: url.to_string(),
                message: err.to_string(),
            }
        })?;

        let mut request = self.client.request(method, url);
        if let Some(headers) = headers {
            for (name, value) in headers {
                request = request.header(name, value);
            }
        }
        if let Some(body) = body {
            request = request.body(body.to_string());
        }

        let response = request
            .send()
            .await
            .map_err(|err| RequesterError::RequestFailed {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.to_string(), value.to_string()))
            })
            .collect();
        let body = response
            .text()
            .await
            .map_err(|err| RequesterError::RequestFailed {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
