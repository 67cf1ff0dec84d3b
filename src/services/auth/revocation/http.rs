use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;

use super::{RevocationError, RevocationService};

#[derive(Debug, Deserialize)]
struct RevocationStatus {
    revoked: bool,
}

/// Asks a session service over HTTP: `GET {endpoint}/{session_id}` answering
/// `{"revoked": bool}`. A 404 means the service does not know the session as revoked.
#[derive(Debug, Clone)]
pub struct HttpRevocationService {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpRevocationService {
    pub fn new(endpoint: impl AsRef<str>, timeout: Duration) -> Result<Self, RevocationError> {
        let endpoint = Url::parse(endpoint.as_ref())
            .map_err(|e| RevocationError::Http(format!("invalid revocation endpoint: {e}")))?;
        if endpoint.cannot_be_a_base() {
            return Err(RevocationError::Http(format!(
                "revocation endpoint `{endpoint}` cannot carry a path"
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RevocationError::Http(e.to_string()))?;

        Ok(Self { client, endpoint })
    }

    pub fn url_for(&self, session_id: &str) -> Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(session_id);
        }
        url
    }
}

#[async_trait]
impl RevocationService for HttpRevocationService {
    async fn is_revoked(&self, session_id: &str) -> Result<bool, RevocationError> {
        let response = self
            .client
            .get(self.url_for(session_id))
            .send()
            .await
            .map_err(|e| RevocationError::Http(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => {
                let body: RevocationStatus = response
                    .json()
                    .await
                    .map_err(|e| RevocationError::Http(e.to_string()))?;
                Ok(body.revoked)
            }
            status => Err(RevocationError::Http(format!("unexpected status {status}"))),
        }
    }
}
