use crate::error::{ExchangeError, Result};
use crate::messages::{ExchangeInfo, PublicKeyResponse};
use reqwest::Client;

/// Client for the external registry directory: a simple read-only
/// lookup service returning exchange endpoints. Also fetches an
/// exchange's public key directly from the exchange itself, which is
/// necessarily unauthenticated since the facility has no trust yet.
#[derive(Clone)]
pub struct RegistryClient {
    endpoint: String,
    client: Client,
}

impl RegistryClient {
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            client: Client::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn list_exchanges(&self) -> Result<Vec<ExchangeInfo>> {
        let response = self
            .client
            .get(format!("{}/exchanges", self.endpoint))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    pub async fn get_exchange(&self, uid: &str) -> Result<ExchangeInfo> {
        let response = self
            .client
            .get(format!("{}/exchanges/{}", self.endpoint, uid))
            .send()
            .await?;

        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            Err(ExchangeError::PeerNotFound(uid.to_string()))
        }
    }

    pub async fn fetch_public_key(&self, exchange_endpoint: &str) -> Result<PublicKeyResponse> {
        let response = self
            .client
            .get(format!("{}/pubkey", exchange_endpoint))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}
